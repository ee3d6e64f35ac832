//! Identifiers shared by every dataplane module.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network policy key, `namespace/name`.
pub type PolicyKey = String;

/// Stable pod key, `namespace/name` or UID-derived.
pub type PodKey = String;

/// Pod identity as supplied by callers of the set-mutation API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodMetadata {
    pub pod_key: PodKey,
    pub pod_ip: String,
    /// Node owning the pod. Only pods of the local node get endpoint updates.
    pub node_name: String,
}

impl PodMetadata {
    pub fn new(
        pod_key: impl Into<String>,
        pod_ip: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            pod_key: pod_key.into(),
            pod_ip: pod_ip.into(),
            node_name: node_name.into(),
        }
    }
}

impl fmt::Display for PodMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.pod_key, self.pod_ip, self.node_name)
    }
}
