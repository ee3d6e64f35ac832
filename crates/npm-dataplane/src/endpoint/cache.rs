//! Pod address → endpoint cache.

use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::EndpointBinding;
use crate::types::{PodKey, PolicyKey};

/// Cached view of one pod endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub endpoint_id: String,
    pub pod_key: Option<PodKey>,
    /// Policies believed to be bound on this endpoint.
    pub policy_refs: BTreeSet<PolicyKey>,
}

impl Endpoint {
    fn from_binding(binding: EndpointBinding) -> Self {
        Self {
            ip: binding.ip,
            endpoint_id: binding.endpoint_id,
            pod_key: binding.pod_key,
            policy_refs: BTreeSet::new(),
        }
    }
}

/// Outcome of merging a refresh into the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    /// Entries whose endpoint id changed; their policy refs were dropped.
    pub reset: usize,
    pub unchanged: usize,
    /// Entries missing from the refresh; evicted with their policy refs.
    pub removed: usize,
}

/// Locked map of pod address → [`Endpoint`].
///
/// The lock only ever guards map access; callers copy what they need out and
/// never hold it across a backend call.
#[derive(Debug, Default)]
pub struct EndpointCache {
    inner: Mutex<HashMap<String, Endpoint>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn get(&self, ip: &str) -> Option<Endpoint> {
        self.inner.lock().get(ip).cloned()
    }

    /// Merges a full refresh of the host's endpoints. Entries missing from
    /// `bindings` belong to endpoints that are gone and are evicted.
    pub fn apply_refresh(&self, bindings: Vec<EndpointBinding>) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut inner = self.inner.lock();

        let live: HashSet<&str> = bindings.iter().map(|b| b.ip.as_str()).collect();
        inner.retain(|ip, endpoint| {
            let keep = live.contains(ip.as_str());
            if !keep {
                debug!(
                    "EndpointCache: {} on endpoint {} is gone, evicting",
                    ip, endpoint.endpoint_id
                );
                summary.removed += 1;
            }
            keep
        });

        for binding in bindings {
            match inner.get_mut(&binding.ip) {
                None => {
                    summary.added += 1;
                    inner.insert(binding.ip.clone(), Endpoint::from_binding(binding));
                }
                Some(existing) if existing.endpoint_id != binding.endpoint_id => {
                    debug!(
                        "EndpointCache: {} moved from endpoint {} to {}",
                        binding.ip, existing.endpoint_id, binding.endpoint_id
                    );
                    summary.reset += 1;
                    *existing = Endpoint::from_binding(binding);
                }
                Some(existing) => {
                    if binding.pod_key.is_some() {
                        existing.pod_key = binding.pod_key;
                    }
                    summary.unchanged += 1;
                }
            }
        }
        summary
    }

    /// Maps the given addresses to endpoint ids and records `policy_key` on
    /// every entry found. Addresses without an endpoint are skipped.
    pub fn resolve<'a, I>(&self, ips: I, policy_key: &str) -> HashMap<String, String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut inner = self.inner.lock();
        let mut resolved = HashMap::new();
        for ip in ips {
            match inner.get_mut(ip) {
                Some(endpoint) => {
                    endpoint.policy_refs.insert(policy_key.to_string());
                    resolved.insert(ip.clone(), endpoint.endpoint_id.clone());
                }
                None => debug!("EndpointCache: no endpoint for {} yet", ip),
            }
        }
        resolved
    }

    /// Updates the policy refs of one entry after a successful bind.
    pub fn update_policy_refs(&self, ip: &str, added: &[PolicyKey], removed: &[PolicyKey]) {
        if let Some(endpoint) = self.inner.lock().get_mut(ip) {
            for key in removed {
                endpoint.policy_refs.remove(key);
            }
            endpoint.policy_refs.extend(added.iter().cloned());
        }
    }

    /// Drops `policy_key` from the given entries and evicts entries left
    /// with no policy. Returns the number of evicted entries.
    pub fn prune_policy<'a, I>(&self, policy_key: &str, ips: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        for ip in ips {
            let now_empty = match inner.get_mut(ip) {
                Some(endpoint) => {
                    endpoint.policy_refs.remove(policy_key);
                    endpoint.policy_refs.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.remove(ip);
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn binding(ip: &str, id: &str) -> EndpointBinding {
        EndpointBinding::new(ip, id)
    }

    #[test]
    fn test_refresh_resets_on_id_change() {
        let cache = EndpointCache::new();
        cache.apply_refresh(vec![binding("10.0.0.1", "ep-1")]);
        cache.resolve(&["10.0.0.1".to_string()], "a/pol");

        let summary = cache.apply_refresh(vec![
            binding("10.0.0.1", "ep-1"),
            binding("10.0.0.2", "ep-2"),
        ]);
        assert_eq!(
            summary,
            RefreshSummary {
                added: 1,
                reset: 0,
                unchanged: 1,
                removed: 0
            }
        );
        assert_eq!(cache.get("10.0.0.1").unwrap().policy_refs.len(), 1);

        let summary = cache.apply_refresh(vec![
            binding("10.0.0.1", "ep-9"),
            binding("10.0.0.2", "ep-2"),
        ]);
        assert_eq!(summary.reset, 1);
        let endpoint = cache.get("10.0.0.1").unwrap();
        assert_eq!(endpoint.endpoint_id, "ep-9");
        assert!(endpoint.policy_refs.is_empty());
    }

    #[test]
    fn test_refresh_evicts_departed_endpoints() {
        let cache = EndpointCache::new();
        cache.apply_refresh(vec![binding("10.0.0.1", "ep-1"), binding("10.0.0.2", "ep-2")]);
        cache.resolve(&["10.0.0.1".to_string()], "a/pol");

        let summary = cache.apply_refresh(vec![binding("10.0.0.2", "ep-2")]);
        assert_eq!(
            summary,
            RefreshSummary {
                added: 0,
                reset: 0,
                unchanged: 1,
                removed: 1
            }
        );
        assert!(cache.get("10.0.0.1").is_none());
        assert_eq!(cache.len(), 1);

        let summary = cache.apply_refresh(Vec::new());
        assert_eq!(summary.removed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_resolve_skips_unknown() {
        let cache = EndpointCache::new();
        cache.apply_refresh(vec![binding("10.0.0.1", "ep-1")]);

        let ips = vec!["10.0.0.1".to_string(), "10.0.0.7".to_string()];
        let resolved = cache.resolve(&ips, "a/pol");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.get("10.0.0.1").map(String::as_str), Some("ep-1"));
        assert!(cache.get("10.0.0.7").is_none());
    }

    #[test]
    fn test_prune_evicts_only_unreferenced() {
        let cache = EndpointCache::new();
        cache.apply_refresh(vec![binding("10.0.0.1", "ep-1"), binding("10.0.0.2", "ep-2")]);
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        cache.resolve(&ips, "a/p1");
        cache.resolve(&ips[1..], "a/p2");

        let evicted = cache.prune_policy("a/p1", &ips);
        assert_eq!(evicted, 1);
        assert!(cache.get("10.0.0.1").is_none());
        assert_eq!(
            cache.get("10.0.0.2").unwrap().policy_refs,
            BTreeSet::from(["a/p2".to_string()])
        );
    }

    #[test]
    fn test_update_policy_refs() {
        let cache = EndpointCache::new();
        cache.apply_refresh(vec![binding("10.0.0.1", "ep-1")]);
        cache.update_policy_refs("10.0.0.1", &["a/p1".to_string()], &[]);
        cache.update_policy_refs("10.0.0.1", &["a/p2".to_string()], &["a/p1".to_string()]);

        assert_eq!(
            cache.get("10.0.0.1").unwrap().policy_refs,
            BTreeSet::from(["a/p2".to_string()])
        );
    }
}
