//! Orchestrator error type.

use std::fmt;

use crate::config::ConfigError;
use crate::endpoint::EndpointError;
use crate::ipsets::IpSetError;
use crate::policies::PolicyError;

/// Step of the policy lifecycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyStage {
    SelectorReferences,
    RuleReferences,
    Apply,
    EndpointResolution,
    RuleInstall,
    RuleRemoval,
    RuleCommit,
}

impl fmt::Display for PolicyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyStage::SelectorReferences => "selector references",
            PolicyStage::RuleReferences => "rule references",
            PolicyStage::Apply => "apply",
            PolicyStage::EndpointResolution => "endpoint resolution",
            PolicyStage::RuleInstall => "rule install",
            PolicyStage::RuleRemoval => "rule removal",
            PolicyStage::RuleCommit => "rule commit",
        };
        f.write_str(name)
    }
}

/// Underlying cause of a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    IpSet(#[from] IpSetError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum DataPlaneError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Bootup failed: {0}")]
    Bootup(#[source] StageError),

    #[error("{op} failed: {source}")]
    Sets {
        op: &'static str,
        #[source]
        source: IpSetError,
    },

    #[error("Policy {key} failed at {stage}: {source}")]
    Policy {
        stage: PolicyStage,
        key: String,
        #[source]
        source: StageError,
    },

    #[error("[{context}] apply failed: {source}")]
    Apply {
        context: String,
        #[source]
        source: StageError,
    },
}

impl DataPlaneError {
    pub(crate) fn policy(stage: PolicyStage, key: &str, source: impl Into<StageError>) -> Self {
        DataPlaneError::Policy {
            stage,
            key: key.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn sets(op: &'static str, source: IpSetError) -> Self {
        DataPlaneError::Sets { op, source }
    }

    /// Failing stage, for policy errors.
    pub fn stage(&self) -> Option<PolicyStage> {
        match self {
            DataPlaneError::Policy { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, DataPlaneError>;
