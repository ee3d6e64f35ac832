//! Endpoint provider backed by a fixed table.
//!
//! Used by the daemon in simulation mode and by tests. Bindings are
//! registered up front; bound policies are tracked per endpoint id so callers
//! can check what would have been programmed.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{EndpointBinding, EndpointError, EndpointProvider, Result};
use crate::policies::NetworkPolicy;
use crate::types::{PodKey, PolicyKey};

#[derive(Default)]
struct State {
    /// Pod address → binding.
    bindings: BTreeMap<String, EndpointBinding>,
    /// Endpoint id → bound policy keys.
    bound: BTreeMap<String, BTreeSet<PolicyKey>>,
}

/// [`EndpointProvider`] over an in-memory endpoint table.
#[derive(Default)]
pub struct StaticEndpointProvider {
    state: Mutex<State>,
}

impl StaticEndpointProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bindings(bindings: impl IntoIterator<Item = EndpointBinding>) -> Self {
        let provider = Self::new();
        for binding in bindings {
            provider.upsert(binding);
        }
        provider
    }

    /// Adds or replaces the endpoint of a pod address.
    pub fn upsert(&self, binding: EndpointBinding) {
        self.state.lock().bindings.insert(binding.ip.clone(), binding);
    }

    /// Drops the endpoint of a pod address along with its bound policies.
    pub fn remove(&self, ip: &str) {
        let mut state = self.state.lock();
        if let Some(binding) = state.bindings.remove(ip) {
            state.bound.remove(&binding.endpoint_id);
        }
    }

    /// Policies currently bound on an endpoint.
    pub fn bound_policies(&self, endpoint_id: &str) -> BTreeSet<PolicyKey> {
        self.state
            .lock()
            .bound
            .get(endpoint_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EndpointProvider for StaticEndpointProvider {
    async fn refresh_pod_endpoints(&self, pod_keys: &[PodKey]) -> Result<Vec<EndpointBinding>> {
        let state = self.state.lock();
        let bindings = state
            .bindings
            .values()
            .filter(|binding| {
                pod_keys.is_empty()
                    || binding
                        .pod_key
                        .as_ref()
                        .is_some_and(|key| pod_keys.contains(key))
            })
            .cloned()
            .collect();
        Ok(bindings)
    }

    async fn bind_policies(
        &self,
        endpoint_id: &str,
        add: &[Arc<NetworkPolicy>],
        remove: &[PolicyKey],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state
            .bindings
            .values()
            .any(|binding| binding.endpoint_id == endpoint_id)
        {
            return Err(EndpointError::BindFailed {
                endpoint_id: endpoint_id.to_string(),
                reason: "endpoint not found".to_string(),
            });
        }

        let bound = state.bound.entry(endpoint_id.to_string()).or_default();
        for key in remove {
            bound.remove(key);
        }
        for policy in add {
            bound.insert(policy.policy_key.clone());
        }
        debug!(
            "StaticEndpointProvider: endpoint {} now has {} policies",
            endpoint_id,
            bound.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_filters_by_pod_key() {
        let provider = StaticEndpointProvider::with_bindings([
            EndpointBinding::new("10.0.0.1", "ep-1").with_pod_key("a/p1"),
            EndpointBinding::new("10.0.0.2", "ep-2").with_pod_key("a/p2"),
        ]);

        assert_eq!(provider.refresh_pod_endpoints(&[]).await.unwrap().len(), 2);
        let only = provider
            .refresh_pod_endpoints(&["a/p2".to_string()])
            .await
            .unwrap();
        assert_eq!(only, vec![EndpointBinding::new("10.0.0.2", "ep-2").with_pod_key("a/p2")]);
    }

    #[tokio::test]
    async fn test_bind_unknown_endpoint_fails() {
        let provider = StaticEndpointProvider::new();
        let err = provider.bind_policies("ep-x", &[], &[]).await.unwrap_err();
        assert!(matches!(err, EndpointError::BindFailed { .. }));
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let provider =
            StaticEndpointProvider::with_bindings([EndpointBinding::new("10.0.0.1", "ep-1")]);
        let policy = Arc::new(NetworkPolicy::new("a/pol", "a"));

        provider.bind_policies("ep-1", &[policy], &[]).await.unwrap();
        assert!(provider.bound_policies("ep-1").contains("a/pol"));

        provider
            .bind_policies("ep-1", &[], &["a/pol".to_string()])
            .await
            .unwrap();
        assert!(provider.bound_policies("ep-1").is_empty());
    }
}
