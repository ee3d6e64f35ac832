//! In-memory [`PolicyManager`].

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::{NetworkPolicy, PolicyError, PolicyManager, Result};

/// Counters exposed for tests and the daemon's status log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyManagerStats {
    pub installs: u64,
    pub removals: u64,
    /// Rule commits pushed down (one per batch when batching).
    pub commits: u64,
    pub reconciles: u64,
}

#[derive(Default)]
struct State {
    policies: HashMap<String, Arc<NetworkPolicy>>,
    /// Policies added or removed since the last commit.
    dirty: BTreeSet<String>,
    stats: PolicyManagerStats,
}

/// Reference [`PolicyManager`] holding everything in process memory.
///
/// With `batch_commits` every add/remove only marks the policy dirty and the
/// commit happens in [`PolicyManager::reconcile_dirty_policies`]; without it
/// each add/remove commits immediately.
pub struct InMemoryPolicyManager {
    batch_commits: bool,
    state: Mutex<State>,
}

impl InMemoryPolicyManager {
    pub fn new(batch_commits: bool) -> Self {
        Self {
            batch_commits,
            state: Mutex::new(State::default()),
        }
    }

    pub fn stats(&self) -> PolicyManagerStats {
        self.state.lock().stats.clone()
    }

    /// Policy keys waiting for the next batched commit.
    pub fn dirty_policies(&self) -> Vec<String> {
        self.state.lock().dirty.iter().cloned().collect()
    }

    fn record_change(&self, state: &mut State, policy_key: &str) {
        if self.batch_commits {
            state.dirty.insert(policy_key.to_string());
        } else {
            state.stats.commits += 1;
        }
    }
}

#[async_trait]
impl PolicyManager for InMemoryPolicyManager {
    async fn add_policy(
        &self,
        mut policy: NetworkPolicy,
        endpoints: HashMap<String, String>,
    ) -> Result<()> {
        if policy.policy_key.is_empty() {
            return Err(PolicyError::InvalidPolicy {
                key: policy.policy_key,
                reason: "empty policy key".to_string(),
            });
        }

        let key = policy.policy_key.clone();
        debug!(
            "PolicyManager: installing {} acls of {} on {} endpoints",
            policy.acls.len(),
            key,
            endpoints.len()
        );
        policy.pod_endpoints = endpoints;

        let mut state = self.state.lock();
        if state.policies.insert(key.clone(), Arc::new(policy)).is_some() {
            debug!("PolicyManager: replaced existing policy {}", key);
        }
        state.stats.installs += 1;
        self.record_change(&mut state, &key);
        Ok(())
    }

    async fn remove_policy(&self, policy_key: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.policies.remove(policy_key).is_none() {
            debug!("PolicyManager: remove of unknown policy {} ignored", policy_key);
            return Ok(());
        }
        state.stats.removals += 1;
        self.record_change(&mut state, policy_key);
        Ok(())
    }

    fn get_policy(&self, policy_key: &str) -> Option<Arc<NetworkPolicy>> {
        self.state.lock().policies.get(policy_key).cloned()
    }

    fn policy_exists(&self, policy_key: &str) -> bool {
        self.state.lock().policies.contains_key(policy_key)
    }

    fn policy_count(&self) -> usize {
        self.state.lock().policies.len()
    }

    fn list_policies(&self) -> Vec<Arc<NetworkPolicy>> {
        self.state.lock().policies.values().cloned().collect()
    }

    async fn reconcile_dirty_policies(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.dirty.is_empty() {
            return Ok(());
        }
        let dirty = std::mem::take(&mut state.dirty);
        state.stats.commits += 1;
        debug!("PolicyManager: committed {} dirty policies", dirty.len());
        Ok(())
    }

    async fn reconcile(&self) {
        let mut state = self.state.lock();
        state.stats.reconciles += 1;
        debug!(
            "PolicyManager: reconcile over {} policies",
            state.policies.len()
        );
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.policies.is_empty() {
            info!("PolicyManager: reset dropped {} policies", state.policies.len());
        }
        state.policies.clear();
        state.dirty.clear();
        Ok(())
    }
}
