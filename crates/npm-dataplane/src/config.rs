//! Dataplane configuration.
//!
//! The backend is chosen by the [`PlatformConfig`] variant and never changes
//! after construction. Each platform carries only the options that make sense
//! for it: rule batching exists only on Linux (expensive iptables-restore
//! commits), set-apply batching and the endpoint fields only on Windows.

use npm_common::{BatchConfig, BatchConfigError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default period of the reconciliation loop.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default number of failed attempts before a pod update is dead-lettered.
pub const DEFAULT_POD_UPDATE_MAX_RETRIES: u32 = 10;

const MAX_VLAN_ID: u16 = 4094;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node name must not be empty")]
    EmptyNodeName,

    #[error("invalid {path} batching: {source}")]
    InvalidBatch {
        path: &'static str,
        #[source]
        source: BatchConfigError,
    },

    #[error("windows network name must not be empty")]
    EmptyNetworkName,

    #[error("vlan id {0} out of range 1-4094")]
    InvalidVlanId(u16),

    #[error("reconcile interval must be non-zero")]
    ZeroReconcileInterval,

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Platform-specific configuration, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum PlatformConfig {
    /// Immediate set apply; rules optionally committed in background batches.
    Linux {
        #[serde(default)]
        rule_batching: Option<BatchConfig>,
    },
    /// Endpoint-bound ACLs; set apply optionally deferred into batches.
    Windows {
        network_name: String,
        #[serde(default)]
        adapter_name: Option<String>,
        #[serde(default)]
        vlan_id: Option<u16>,
        #[serde(default)]
        apply_batching: Option<BatchConfig>,
    },
}

impl PlatformConfig {
    pub fn is_windows(&self) -> bool {
        matches!(self, PlatformConfig::Windows { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlatformConfig::Linux { .. } => "linux",
            PlatformConfig::Windows { .. } => "windows",
        }
    }

    /// Set-apply batching, if enabled.
    pub fn apply_batching(&self) -> Option<BatchConfig> {
        match self {
            PlatformConfig::Windows { apply_batching, .. } => *apply_batching,
            PlatformConfig::Linux { .. } => None,
        }
    }

    /// Rule-commit batching, if enabled.
    pub fn rule_batching(&self) -> Option<BatchConfig> {
        match self {
            PlatformConfig::Linux { rule_batching } => *rule_batching,
            PlatformConfig::Windows { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            PlatformConfig::Linux { rule_batching } => {
                if let Some(batching) = rule_batching {
                    batching.validate().map_err(|source| ConfigError::InvalidBatch {
                        path: "rule",
                        source,
                    })?;
                }
            }
            PlatformConfig::Windows {
                network_name,
                vlan_id,
                apply_batching,
                ..
            } => {
                if network_name.is_empty() {
                    return Err(ConfigError::EmptyNetworkName);
                }
                if let Some(vlan) = vlan_id {
                    if *vlan == 0 || *vlan > MAX_VLAN_ID {
                        return Err(ConfigError::InvalidVlanId(*vlan));
                    }
                }
                if let Some(batching) = apply_batching {
                    batching.validate().map_err(|source| ConfigError::InvalidBatch {
                        path: "apply",
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_reconcile_interval_ms() -> u64 {
    duration_ms(DEFAULT_RECONCILE_INTERVAL)
}

fn default_pod_update_max_retries() -> u32 {
    DEFAULT_POD_UPDATE_MAX_RETRIES
}

/// Construction-time configuration of the dataplane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    /// Name of the local node.
    pub node_name: String,
    /// Backend selection and platform options.
    pub platform: PlatformConfig,
    /// Period of the reconciliation loop, in milliseconds.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Failed attempts after which a queued pod update is dead-lettered.
    /// Zero retries forever.
    #[serde(default = "default_pod_update_max_retries")]
    pub pod_update_max_retries: u32,
}

impl DataPlaneConfig {
    pub fn linux(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            platform: PlatformConfig::Linux {
                rule_batching: None,
            },
            reconcile_interval_ms: default_reconcile_interval_ms(),
            pod_update_max_retries: DEFAULT_POD_UPDATE_MAX_RETRIES,
        }
    }

    pub fn windows(node_name: impl Into<String>, network_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            platform: PlatformConfig::Windows {
                network_name: network_name.into(),
                adapter_name: None,
                vlan_id: None,
                apply_batching: None,
            },
            reconcile_interval_ms: default_reconcile_interval_ms(),
            pod_update_max_retries: DEFAULT_POD_UPDATE_MAX_RETRIES,
        }
    }

    /// Enables background rule batching. Ignored on Windows.
    pub fn with_rule_batching(mut self, batching: BatchConfig) -> Self {
        if let PlatformConfig::Linux { rule_batching } = &mut self.platform {
            *rule_batching = Some(batching);
        }
        self
    }

    /// Enables background set-apply batching. Ignored on Linux.
    pub fn with_apply_batching(mut self, batching: BatchConfig) -> Self {
        if let PlatformConfig::Windows { apply_batching, .. } = &mut self.platform {
            *apply_batching = Some(batching);
        }
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_pod_update_max_retries(mut self, retries: u32) -> Self {
        self.pod_update_max_retries = retries;
        self
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Loads a JSON configuration file and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }
        if self.reconcile_interval_ms == 0 {
            return Err(ConfigError::ZeroReconcileInterval);
        }
        self.platform.validate()
    }
}
