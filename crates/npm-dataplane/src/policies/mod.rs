//! Network policy storage.
//!
//! A [`NetworkPolicy`] arrives fully translated: the address sets it selects
//! on, the sets its rules reference, and the ACLs to install. The
//! [`PolicyManager`] owns rule installation and the diff-based commit.

mod memory;

pub use memory::{InMemoryPolicyManager, PolicyManagerStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::ipsets::{IpSetMetadata, TranslatedIpSet};
use crate::types::PolicyKey;

/// Error type for policy operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Policy already exists: {0}")]
    PolicyAlreadyExists(String),

    #[error("Invalid policy {key}: {reason}")]
    InvalidPolicy { key: String, reason: String },

    #[error("Rule install failed for {key}: {reason}")]
    InstallFailed { key: String, reason: String },

    #[error("Rule commit failed: {0}")]
    CommitFailed(String),
}

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Traffic direction an ACL applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

/// Verdict of an ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Allowed,
    Dropped,
}

/// Address set used as a match condition of an ACL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetInfo {
    pub ip_set: IpSetMetadata,
    /// False for a negated match.
    pub included: bool,
}

/// One translated firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
    pub policy_id: String,
    pub target: Verdict,
    pub direction: Direction,
    #[serde(default)]
    pub src_list: Vec<SetInfo>,
    #[serde(default)]
    pub dst_list: Vec<SetInfo>,
    #[serde(default)]
    pub protocol: Option<String>,
    /// Inclusive destination port range.
    #[serde(default)]
    pub dst_ports: Option<(u16, u16)>,
}

impl AclPolicy {
    pub fn new(policy_id: impl Into<String>, target: Verdict, direction: Direction) -> Self {
        Self {
            policy_id: policy_id.into(),
            target,
            direction,
            src_list: Vec::new(),
            dst_list: Vec::new(),
            protocol: None,
            dst_ports: None,
        }
    }
}

/// A translated network policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// `namespace/name`.
    pub policy_key: PolicyKey,
    pub namespace: String,
    /// Sets implementing the policy's pod selector.
    #[serde(default)]
    pub pod_selector_ip_sets: Vec<TranslatedIpSet>,
    /// Member sets of nested selector sets.
    #[serde(default)]
    pub child_pod_selector_ip_sets: Vec<TranslatedIpSet>,
    /// Sets the rule bodies reference.
    #[serde(default)]
    pub rule_ip_sets: Vec<TranslatedIpSet>,
    #[serde(default)]
    pub acls: Vec<AclPolicy>,
    /// Pod address → endpoint identifier the rules were installed on.
    #[serde(default)]
    pub pod_endpoints: HashMap<String, String>,
}

impl NetworkPolicy {
    pub fn new(policy_key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            policy_key: policy_key.into(),
            namespace: namespace.into(),
            pod_selector_ip_sets: Vec::new(),
            child_pod_selector_ip_sets: Vec::new(),
            rule_ip_sets: Vec::new(),
            acls: Vec::new(),
            pod_endpoints: HashMap::new(),
        }
    }

    /// Selector sets plus their nested children; all take selector references.
    pub fn all_pod_selector_ip_sets(&self) -> Vec<TranslatedIpSet> {
        self.pod_selector_ip_sets
            .iter()
            .chain(self.child_pod_selector_ip_sets.iter())
            .cloned()
            .collect()
    }

    /// Prefixed names of the top-level selector sets.
    pub fn selector_set_names(&self) -> Vec<String> {
        self.pod_selector_ip_sets
            .iter()
            .map(|set| set.metadata.prefixed_name())
            .collect()
    }
}

/// Rule storage with diff-based commit.
#[async_trait]
pub trait PolicyManager: Send + Sync {
    /// Installs the policy's rules on the given endpoints (address → id).
    async fn add_policy(
        &self,
        policy: NetworkPolicy,
        endpoints: HashMap<String, String>,
    ) -> Result<()>;

    /// Removes the policy's rules. Unknown keys are a no-op.
    async fn remove_policy(&self, policy_key: &str) -> Result<()>;

    fn get_policy(&self, policy_key: &str) -> Option<Arc<NetworkPolicy>>;

    fn policy_exists(&self, policy_key: &str) -> bool;

    fn policy_count(&self) -> usize;

    fn list_policies(&self) -> Vec<Arc<NetworkPolicy>>;

    /// Commits pending rule changes. Idempotent.
    async fn reconcile_dirty_policies(&self) -> Result<()>;

    /// Periodic repair of installed rules.
    async fn reconcile(&self);

    /// Drops every rule this agent owns.
    async fn reset(&self) -> Result<()>;
}
