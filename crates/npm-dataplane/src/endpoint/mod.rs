//! Pod endpoints on the deferred-apply backend.
//!
//! On Windows, ACLs are bound to per-pod endpoints rather than evaluated
//! against a global ruleset. The [`EndpointProvider`] talks to the host
//! networking service; the [`EndpointCache`] remembers which policies the
//! orchestrator believes are bound where. The cache is a hint, never the
//! source of truth: a refresh may reset any entry.

mod cache;
mod static_provider;

pub use cache::{Endpoint, EndpointCache, RefreshSummary};
pub use static_provider::StaticEndpointProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::policies::NetworkPolicy;
use crate::types::{PodKey, PolicyKey};

/// Error type for endpoint operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("No endpoint for pod address {0}")]
    EndpointNotFound(String),

    #[error("Endpoint refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Binding policies on endpoint {endpoint_id} failed: {reason}")]
    BindFailed { endpoint_id: String, reason: String },
}

/// Result type for endpoint operations.
pub type Result<T> = std::result::Result<T, EndpointError>;

/// One endpoint as reported by the host networking service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointBinding {
    pub ip: String,
    pub endpoint_id: String,
    #[serde(default)]
    pub pod_key: Option<PodKey>,
}

impl EndpointBinding {
    pub fn new(ip: impl Into<String>, endpoint_id: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            endpoint_id: endpoint_id.into(),
            pod_key: None,
        }
    }

    pub fn with_pod_key(mut self, pod_key: impl Into<String>) -> Self {
        self.pod_key = Some(pod_key.into());
        self
    }
}

/// Access to the host's pod endpoints.
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    /// Lists the endpoints of the given pods; an empty slice lists all.
    async fn refresh_pod_endpoints(&self, pod_keys: &[PodKey]) -> Result<Vec<EndpointBinding>>;

    /// Binds the ACLs of `add` to an endpoint and unbinds the policies in
    /// `remove`.
    async fn bind_policies(
        &self,
        endpoint_id: &str,
        add: &[Arc<NetworkPolicy>],
        remove: &[PolicyKey],
    ) -> Result<()>;
}
