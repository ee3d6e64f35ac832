//! The dataplane orchestrator.
//!
//! `DataPlane` composes the set manager, the policy manager and (on Windows)
//! the endpoint provider behind one API. Watchers mutate sets and policies
//! through it; it decides when changes are pushed down.
//!
//! # Locks
//!
//! - endpoint cache: map access only, never held across an await
//! - update-pod queue: held by the drainer for a whole drain
//! - apply counter and rule batch: independent; the rule batch lock is held
//!   for the duration of a rule commit
//!
//! The set and policy managers lock internally and are never called with the
//! cache or queue lock held.

mod apply;
mod periodic;
mod policy;
mod queue;
mod update_pod;

pub use periodic::PeriodicTasks;
pub use queue::{QueuedPodUpdate, UpdatePodQueue, DEFAULT_DEAD_LETTER_LIMIT};

use log::{debug, info};
use npm_common::{BatchCounter, RetryBudget};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::DataPlaneConfig;
use crate::endpoint::{EndpointCache, EndpointProvider};
use crate::error::{DataPlaneError, Result, StageError};
use crate::ipsets::{IpSet, IpSetManager, IpSetMetadata, ReferenceType};
use crate::metrics::DataPlaneMetrics;
use crate::policies::PolicyManager;
use crate::types::{PodMetadata, PolicyKey};

/// What triggered a flush; carried into logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyContext {
    /// Periodic background flush.
    Background,
    /// Explicit `apply_data_plane` call.
    ApplyDataPlane,
    /// Forced apply inside `add_policy`.
    AddNetPol,
    /// Forced apply inside `remove_policy`.
    DelNetPol,
}

impl fmt::Display for ApplyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyContext::Background => write!(f, "BACKGROUND"),
            ApplyContext::ApplyDataPlane => write!(f, "APPLY-DP"),
            ApplyContext::AddNetPol => write!(f, "ADD-NETPOL"),
            ApplyContext::DelNetPol => write!(f, "DEL-NETPOL"),
        }
    }
}

/// Dirty-policy batch state: the counter plus the temporary references to
/// release after the next successful rule commit.
#[derive(Debug)]
pub(crate) struct RuleBatch {
    counter: BatchCounter,
    /// Prefixed set name → (policy, reference type) of each temporary
    /// reference held on it.
    pending_cleanup: BTreeMap<String, Vec<(PolicyKey, ReferenceType)>>,
}

impl RuleBatch {
    fn new(max_batches: usize) -> Self {
        Self {
            counter: BatchCounter::new(max_batches),
            pending_cleanup: BTreeMap::new(),
        }
    }
}

/// Node-local network policy dataplane.
pub struct DataPlane {
    config: DataPlaneConfig,
    ipset_mgr: Arc<dyn IpSetManager>,
    policy_mgr: Arc<dyn PolicyManager>,
    endpoints: Arc<dyn EndpointProvider>,
    metrics: Arc<DataPlaneMetrics>,
    endpoint_cache: EndpointCache,
    update_pod_queue: tokio::sync::Mutex<UpdatePodQueue>,
    /// Present when set applies are batched (Windows).
    apply_batch: Option<Mutex<BatchCounter>>,
    /// Present when rule commits are batched (Linux).
    rule_batch: Option<tokio::sync::Mutex<RuleBatch>>,
}

impl DataPlane {
    /// Validates the configuration and boots the dataplane up, resetting
    /// whatever a previous run left in both managers.
    pub async fn new(
        config: DataPlaneConfig,
        ipset_mgr: Arc<dyn IpSetManager>,
        policy_mgr: Arc<dyn PolicyManager>,
        endpoints: Arc<dyn EndpointProvider>,
        metrics: Arc<DataPlaneMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let apply_batching = config.platform.apply_batching();
        let rule_batching = config.platform.rule_batching();
        let queue_capacity = apply_batching.map(|b| b.max_batches).unwrap_or_default();
        let budget = RetryBudget::new(config.pod_update_max_retries);

        let dataplane = Self {
            apply_batch: apply_batching.map(|b| Mutex::new(BatchCounter::new(b.max_batches))),
            rule_batch: rule_batching.map(|b| tokio::sync::Mutex::new(RuleBatch::new(b.max_batches))),
            update_pod_queue: tokio::sync::Mutex::new(UpdatePodQueue::new(queue_capacity, budget)),
            endpoint_cache: EndpointCache::new(),
            config,
            ipset_mgr,
            policy_mgr,
            endpoints,
            metrics,
        };

        dataplane.bootup().await?;
        Ok(dataplane)
    }

    async fn bootup(&self) -> Result<()> {
        info!(
            "DataPlane: booting up on node {} ({} backend)",
            self.config.node_name,
            self.config.platform.name()
        );

        let result: std::result::Result<(), StageError> = match self.ipset_mgr.reset().await {
            Ok(()) => self.policy_mgr.reset().await.map_err(Into::into),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                audit_log!(AuditRecord::new(AuditCategory::Lifecycle, "DataPlane", "bootup")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(self.config.node_name.clone())
                    .with_details(serde_json::json!({
                        "platform": self.config.platform.name(),
                        "apply_batching": self.apply_batch.is_some(),
                        "rule_batching": self.rule_batch.is_some(),
                    })));
                Ok(())
            }
            Err(source) => {
                audit_log!(AuditRecord::new(AuditCategory::Lifecycle, "DataPlane", "bootup")
                    .with_object_id(self.config.node_name.clone())
                    .with_error(source.to_string()));
                Err(DataPlaneError::Bootup(source))
            }
        }
    }

    // ============ Accessors ============

    pub fn config(&self) -> &DataPlaneConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<DataPlaneMetrics> {
        &self.metrics
    }

    pub fn endpoint_cache(&self) -> &EndpointCache {
        &self.endpoint_cache
    }

    fn is_windows(&self) -> bool {
        self.config.platform.is_windows()
    }

    /// Snapshot of one set by prefixed name.
    pub fn get_ip_set(&self, name: &str) -> Option<IpSet> {
        self.ipset_mgr.get_set(name)
    }

    /// Prefixed name → backend identifier of every set.
    pub fn get_all_ip_sets(&self) -> HashMap<String, String> {
        self.ipset_mgr.list_all()
    }

    /// Keys of every installed policy.
    pub fn get_all_policies(&self) -> Vec<PolicyKey> {
        let mut keys: Vec<PolicyKey> = self
            .policy_mgr
            .list_policies()
            .iter()
            .map(|policy| policy.policy_key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn policy_count(&self) -> usize {
        self.policy_mgr.policy_count()
    }

    /// Number of pods waiting for an endpoint update.
    pub async fn pending_pod_updates(&self) -> usize {
        self.update_pod_queue.lock().await.len()
    }

    /// Most recent pod updates dropped after exhausting their retries.
    pub async fn dead_pod_updates(&self) -> Vec<QueuedPodUpdate> {
        self.update_pod_queue
            .lock()
            .await
            .dead_letters()
            .iter()
            .cloned()
            .collect()
    }

    // ============ Set and list mutation ============

    pub fn create_ip_sets(&self, sets: &[IpSetMetadata]) {
        self.ipset_mgr.create_sets(sets);
    }

    /// Deletes a set. Fails if the set is still referenced, unless `force`.
    pub fn delete_ip_set(&self, set: &IpSetMetadata, force: bool) -> Result<()> {
        self.ipset_mgr
            .delete_set(set, force)
            .map_err(|e| DataPlaneError::sets("DeleteSet", e))?;

        audit_log!(AuditRecord::new(AuditCategory::SetChange, "DataPlane", "delete_set")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(set.prefixed_name())
            .with_object_type("ip_set")
            .with_details(serde_json::json!({ "force": force })));
        Ok(())
    }

    /// Adds a pod to sets. On Windows, pods of this node are also queued for
    /// an endpoint update at the next flush.
    pub async fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<()> {
        self.ipset_mgr
            .add_to_sets(sets, pod)
            .map_err(|e| DataPlaneError::sets("AddToSets", e))?;

        if self.should_update_pod(pod) {
            debug!("DataPlane: queueing endpoint update for {}", pod);
            self.update_pod_queue.lock().await.enqueue_add(pod, sets);
        }
        Ok(())
    }

    /// Removes a pod from sets. Removing twice is fine.
    pub async fn remove_from_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<()> {
        self.ipset_mgr
            .remove_from_sets(sets, pod)
            .map_err(|e| DataPlaneError::sets("RemoveFromSets", e))?;

        if self.should_update_pod(pod) {
            debug!("DataPlane: queueing endpoint update for {}", pod);
            self.update_pod_queue.lock().await.enqueue_remove(pod, sets);
        }
        Ok(())
    }

    pub fn add_to_lists(&self, lists: &[IpSetMetadata], members: &[IpSetMetadata]) -> Result<()> {
        self.ipset_mgr
            .add_to_lists(lists, members)
            .map_err(|e| DataPlaneError::sets("AddToLists", e))
    }

    pub fn remove_from_list(&self, list: &IpSetMetadata, members: &[IpSetMetadata]) -> Result<()> {
        self.ipset_mgr
            .remove_from_list(list, members)
            .map_err(|e| DataPlaneError::sets("RemoveFromList", e))
    }

    fn should_update_pod(&self, pod: &PodMetadata) -> bool {
        self.is_windows() && pod.node_name == self.config.node_name
    }
}
