//! Integration tests for the dataplane against its collaborators
//!
//! These tests drive the public dataplane API end to end. The set manager and
//! endpoint provider are wrapped in recording mocks so the tests can count
//! backend calls and inject failures without a host packet filter.

use async_trait::async_trait;
use npm_dataplane::endpoint::{EndpointError, Result as EndpointResult};
use npm_dataplane::ipsets::{IpSetError, ReferenceOwner, Result as IpSetResult};
use npm_dataplane::{
    BatchConfig, DataPlane, DataPlaneConfig, DataPlaneError, DataPlaneMetrics, EndpointBinding,
    EndpointProvider, InMemoryIpSetManager, InMemoryPolicyManager, IpSet, IpSetManager,
    IpSetMetadata, NetworkPolicy, PodMetadata, PolicyKey, PolicyStage, ReferenceType, SetType,
    StaticEndpointProvider, TranslatedIpSet,
};
use pretty_assertions::assert_eq;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Set manager that records backend calls
///
/// Delegates to the in-memory manager and counts the calls that would reach
/// the packet filter. Applies can be made to fail on demand, or held open
/// after pushing so a test can act while a flush is in flight.
pub struct RecordingIpSetManager {
    inner: InMemoryIpSetManager,
    applies: AtomicUsize,
    resets: AtomicUsize,
    fail_applies: AtomicBool,
    hold_next_apply: AtomicBool,
    apply_held: Notify,
    release_apply: Notify,
}

impl RecordingIpSetManager {
    pub fn new() -> Self {
        Self {
            inner: InMemoryIpSetManager::new(),
            applies: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            fail_applies: AtomicBool::new(false),
            hold_next_apply: AtomicBool::new(false),
            apply_held: Notify::new(),
            release_apply: Notify::new(),
        }
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    /// Makes the next apply block after pushing until released.
    pub fn hold_next_apply(&self) {
        self.hold_next_apply.store(true, Ordering::SeqCst);
    }

    pub async fn wait_for_held_apply(&self) {
        self.apply_held.notified().await;
    }

    pub fn release_held_apply(&self) {
        self.release_apply.notify_one();
    }

    pub fn committed_name(&self, name: &str) -> Option<String> {
        self.inner.committed_name(name)
    }

    pub fn pending_changes(&self) -> usize {
        self.inner.pending_changes()
    }
}

#[async_trait]
impl IpSetManager for RecordingIpSetManager {
    fn create_sets(&self, sets: &[IpSetMetadata]) {
        self.inner.create_sets(sets)
    }

    fn get_set(&self, name: &str) -> Option<IpSet> {
        self.inner.get_set(name)
    }

    fn delete_set(&self, set: &IpSetMetadata, force: bool) -> IpSetResult<()> {
        self.inner.delete_set(set, force)
    }

    fn add_reference(
        &self,
        set: &IpSetMetadata,
        owner: ReferenceOwner,
        ref_type: ReferenceType,
    ) -> IpSetResult<()> {
        self.inner.add_reference(set, owner, ref_type)
    }

    fn delete_reference(
        &self,
        set_name: &str,
        owner: &ReferenceOwner,
        ref_type: ReferenceType,
    ) -> IpSetResult<()> {
        self.inner.delete_reference(set_name, owner, ref_type)
    }

    fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> IpSetResult<()> {
        self.inner.add_to_sets(sets, pod)
    }

    fn remove_from_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> IpSetResult<()> {
        self.inner.remove_from_sets(sets, pod)
    }

    fn add_to_lists(&self, lists: &[IpSetMetadata], members: &[IpSetMetadata]) -> IpSetResult<()> {
        self.inner.add_to_lists(lists, members)
    }

    fn remove_from_list(&self, list: &IpSetMetadata, members: &[IpSetMetadata]) -> IpSetResult<()> {
        self.inner.remove_from_list(list, members)
    }

    fn list_all(&self) -> HashMap<String, String> {
        self.inner.list_all()
    }

    fn get_ips_from_selector_sets(&self, set_names: &[String]) -> IpSetResult<BTreeSet<String>> {
        self.inner.get_ips_from_selector_sets(set_names)
    }

    async fn apply_sets(&self, context: &str) -> IpSetResult<()> {
        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(IpSetError::ApplyFailed(format!("injected failure in {}", context)));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.inner.apply_sets(context).await?;
        if self.hold_next_apply.swap(false, Ordering::SeqCst) {
            self.apply_held.notify_one();
            self.release_apply.notified().await;
        }
        Ok(())
    }

    async fn reconcile(&self) {
        self.inner.reconcile().await
    }

    async fn reset(&self) -> IpSetResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.inner.reset().await
    }
}

/// Endpoint provider whose binds always fail
pub struct FailingBindProvider {
    inner: StaticEndpointProvider,
    binds: AtomicUsize,
}

impl FailingBindProvider {
    pub fn new(bindings: Vec<EndpointBinding>) -> Self {
        Self {
            inner: StaticEndpointProvider::with_bindings(bindings),
            binds: AtomicUsize::new(0),
        }
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointProvider for FailingBindProvider {
    async fn refresh_pod_endpoints(&self, pod_keys: &[String]) -> EndpointResult<Vec<EndpointBinding>> {
        self.inner.refresh_pod_endpoints(pod_keys).await
    }

    async fn bind_policies(
        &self,
        endpoint_id: &str,
        _add: &[Arc<NetworkPolicy>],
        _remove: &[PolicyKey],
    ) -> EndpointResult<()> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        Err(EndpointError::BindFailed {
            endpoint_id: endpoint_id.to_string(),
            reason: "HNS unavailable".to_string(),
        })
    }
}

// ============ Fixtures ============

struct Harness {
    dp: DataPlane,
    sets: Arc<RecordingIpSetManager>,
}

async fn harness(config: DataPlaneConfig, endpoints: Arc<dyn EndpointProvider>) -> Harness {
    let sets = Arc::new(RecordingIpSetManager::new());
    let batch_commits = config.platform.rule_batching().is_some();
    let dp = DataPlane::new(
        config,
        sets.clone(),
        Arc::new(InMemoryPolicyManager::new(batch_commits)),
        endpoints,
        Arc::new(DataPlaneMetrics::new().unwrap()),
    )
    .await
    .unwrap();
    Harness { dp, sets }
}

async fn linux(config: DataPlaneConfig) -> Harness {
    harness(config, Arc::new(StaticEndpointProvider::new())).await
}

fn namespace_set(name: &str) -> IpSetMetadata {
    IpSetMetadata::new(name, SetType::Namespace)
}

fn web_label() -> IpSetMetadata {
    IpSetMetadata::new("app:web", SetType::KeyValueLabelOfPod)
}

fn web_pod() -> PodMetadata {
    PodMetadata::new("default/web-0", "10.0.0.1", "node1")
}

/// Policy selecting `default` pods, allowing traffic from a CIDR.
fn cidr_policy(key: &str) -> NetworkPolicy {
    let mut policy = NetworkPolicy::new(key, "default");
    policy
        .pod_selector_ip_sets
        .push(TranslatedIpSet::new(namespace_set("default")));
    policy.rule_ip_sets.push(
        TranslatedIpSet::new(IpSetMetadata::new("allow-office", SetType::CidrBlocks))
            .with_members(["10.1.0.0/16"]),
    );
    policy
}

/// Policy selecting pods labelled app=web.
fn web_policy(key: &str) -> NetworkPolicy {
    let mut policy = NetworkPolicy::new(key, "default");
    policy
        .pod_selector_ip_sets
        .push(TranslatedIpSet::new(web_label()));
    policy
}

fn ref_counts(dp: &DataPlane, name: &str) -> (usize, usize) {
    let set = dp.get_ip_set(name).unwrap();
    (
        set.reference_count(ReferenceType::Selector),
        set.reference_count(ReferenceType::NetPol),
    )
}

// ============ Set mutation ============

#[tokio::test]
async fn test_add_query_remove_members() {
    let h = linux(DataPlaneConfig::linux("node1")).await;
    let set = namespace_set("default");

    h.dp.add_to_sets(std::slice::from_ref(&set), &web_pod())
        .await
        .unwrap();
    assert_eq!(h.dp.get_ip_set("ns-default").unwrap().members(), vec!["10.0.0.1"]);
    assert!(h.dp.get_all_ip_sets().contains_key("ns-default"));

    h.dp.remove_from_sets(std::slice::from_ref(&set), &web_pod())
        .await
        .unwrap();
    h.dp.remove_from_sets(std::slice::from_ref(&set), &web_pod())
        .await
        .unwrap();
    assert!(h.dp.get_ip_set("ns-default").unwrap().members().is_empty());

    h.dp.delete_ip_set(&set, false).unwrap();
    h.dp.delete_ip_set(&set, false).unwrap();
    assert!(h.dp.get_ip_set("ns-default").is_none());
}

#[tokio::test]
async fn test_bootup_resets_managers() {
    let h = linux(DataPlaneConfig::linux("node1")).await;
    assert_eq!(h.sets.resets(), 1);
    assert_eq!(h.sets.applies(), 0);
    assert!(h.dp.get_all_policies().is_empty());
}

#[tokio::test]
async fn test_invalid_config_fails_fast() {
    let sets = Arc::new(RecordingIpSetManager::new());
    let result = DataPlane::new(
        DataPlaneConfig::linux(""),
        sets.clone(),
        Arc::new(InMemoryPolicyManager::new(false)),
        Arc::new(StaticEndpointProvider::new()),
        Arc::new(DataPlaneMetrics::new().unwrap()),
    )
    .await;

    assert!(matches!(result, Err(DataPlaneError::InvalidConfig(_))));
    assert_eq!(sets.resets(), 0);

    let result = DataPlane::new(
        DataPlaneConfig::windows("node1", ""),
        sets.clone(),
        Arc::new(InMemoryPolicyManager::new(false)),
        Arc::new(StaticEndpointProvider::new()),
        Arc::new(DataPlaneMetrics::new().unwrap()),
    )
    .await;
    assert!(matches!(result, Err(DataPlaneError::InvalidConfig(_))));
}

// ============ Policy lifecycle ============

#[tokio::test]
async fn test_policy_add_remove_cycle_releases_references() {
    let h = linux(DataPlaneConfig::linux("node1")).await;

    h.dp.add_policy(cidr_policy("default/allow-office"))
        .await
        .unwrap();
    assert_eq!(h.dp.get_all_policies(), vec!["default/allow-office".to_string()]);
    assert_eq!(ref_counts(&h.dp, "ns-default"), (1, 0));
    assert_eq!(ref_counts(&h.dp, "cidr-allow-office"), (0, 1));
    assert_eq!(
        h.dp.get_ip_set("cidr-allow-office").unwrap().members(),
        vec!["10.1.0.0/16"]
    );
    assert_eq!(h.sets.applies(), 1);

    h.dp.remove_policy("default/allow-office").await.unwrap();
    assert!(h.dp.get_all_policies().is_empty());
    assert_eq!(ref_counts(&h.dp, "ns-default"), (0, 0));
    assert_eq!(ref_counts(&h.dp, "cidr-allow-office"), (0, 0));
    assert!(h.dp.get_ip_set("cidr-allow-office").unwrap().members().is_empty());
    assert_eq!(h.sets.applies(), 2);

    h.dp.delete_ip_set(&namespace_set("default"), false).unwrap();

    // Unknown keys are fine.
    h.dp.remove_policy("default/allow-office").await.unwrap();
    assert_eq!(h.sets.applies(), 2);
}

#[tokio::test]
async fn test_shared_set_survives_one_policy_removal() {
    let h = linux(DataPlaneConfig::linux("node1")).await;

    h.dp.add_policy(cidr_policy("default/a")).await.unwrap();
    h.dp.add_policy(cidr_policy("default/b")).await.unwrap();
    assert_eq!(ref_counts(&h.dp, "ns-default"), (2, 0));

    h.dp.remove_policy("default/a").await.unwrap();
    assert_eq!(ref_counts(&h.dp, "ns-default"), (1, 0));

    let err = h.dp.delete_ip_set(&namespace_set("default"), false).unwrap_err();
    assert!(matches!(
        err,
        DataPlaneError::Sets {
            source: IpSetError::SetInUse { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_update_policy_swaps_rule_sets() {
    let h = linux(DataPlaneConfig::linux("node1")).await;

    // Unknown policy: update adds it.
    h.dp.update_policy(cidr_policy("default/p")).await.unwrap();
    assert_eq!(ref_counts(&h.dp, "cidr-allow-office"), (0, 1));

    let mut changed = cidr_policy("default/p");
    changed.rule_ip_sets = vec![TranslatedIpSet::new(namespace_set("backend"))];
    h.dp.update_policy(changed).await.unwrap();

    assert_eq!(h.dp.policy_count(), 1);
    assert_eq!(ref_counts(&h.dp, "cidr-allow-office"), (0, 0));
    assert_eq!(ref_counts(&h.dp, "ns-backend"), (0, 1));
    assert_eq!(ref_counts(&h.dp, "ns-default"), (1, 0));
}

#[tokio::test]
async fn test_reconcile_collects_released_sets() {
    let h = linux(DataPlaneConfig::linux("node1")).await;

    h.dp.add_policy(cidr_policy("default/p")).await.unwrap();
    h.dp.remove_policy("default/p").await.unwrap();
    assert!(h.dp.get_ip_set("ns-default").is_some());

    h.dp.reconcile_once().await;
    assert!(h.dp.get_ip_set("ns-default").is_none());
    assert!(h.dp.get_ip_set("cidr-allow-office").is_none());
    assert_eq!(h.dp.metrics().heartbeats_total.get(), 1);
}

#[tokio::test]
async fn test_failed_apply_reports_stage() {
    let h = linux(DataPlaneConfig::linux("node1")).await;
    h.sets.set_fail_applies(true);

    let err = h.dp.add_policy(cidr_policy("default/p")).await.unwrap_err();
    assert_eq!(err.stage(), Some(PolicyStage::Apply));
    assert!(h.dp.get_all_policies().is_empty());
    assert!(h.dp.metrics().error_log_count("DataPlane") >= 1);

    // References taken before the failure are reused by the retry.
    h.sets.set_fail_applies(false);
    h.dp.update_policy(cidr_policy("default/p")).await.unwrap();
    assert_eq!(ref_counts(&h.dp, "ns-default"), (1, 0));
    assert_eq!(h.dp.get_all_policies(), vec!["default/p".to_string()]);
}

// ============ Rule-commit batching ============

#[tokio::test]
async fn test_temporary_references_hold_sets_until_commit() {
    let config = DataPlaneConfig::linux("node1")
        .with_rule_batching(BatchConfig::new(10, Duration::from_secs(60)));
    let h = linux(config).await;

    h.dp.add_policy(cidr_policy("default/p")).await.unwrap();
    h.dp.remove_policy("default/p").await.unwrap();
    assert_eq!(h.dp.pending_policy_events().await, 2);

    let err = h.dp.delete_ip_set(&namespace_set("default"), false).unwrap_err();
    assert!(matches!(
        err,
        DataPlaneError::Sets {
            source: IpSetError::SetInUse { .. },
            ..
        }
    ));

    h.dp.flush_dirty_policies().await.unwrap();
    assert_eq!(h.dp.pending_policy_events().await, 0);
    assert_eq!(h.dp.metrics().rule_commits_total.get(), 1);

    h.dp.delete_ip_set(&namespace_set("default"), false).unwrap();
    h.dp.delete_ip_set(
        &IpSetMetadata::new("allow-office", SetType::CidrBlocks),
        false,
    )
    .unwrap();
}

#[tokio::test]
async fn test_rule_batch_commits_at_threshold() {
    let config = DataPlaneConfig::linux("node1")
        .with_rule_batching(BatchConfig::new(2, Duration::from_secs(60)));
    let h = linux(config).await;

    h.dp.add_policy(cidr_policy("default/a")).await.unwrap();
    assert_eq!(h.dp.pending_policy_events().await, 1);
    assert_eq!(h.dp.metrics().rule_commits_total.get(), 0);

    h.dp.add_policy(cidr_policy("default/b")).await.unwrap();
    assert_eq!(h.dp.pending_policy_events().await, 0);
    assert_eq!(h.dp.metrics().rule_commits_total.get(), 1);
}

// ============ Windows set-apply batching ============

#[tokio::test]
async fn test_apply_batch_flushes_exactly_at_threshold() {
    let config = DataPlaneConfig::windows("node1", "azure")
        .with_apply_batching(BatchConfig::new(3, Duration::from_secs(60)));
    let h = harness(config, Arc::new(StaticEndpointProvider::new())).await;

    h.dp.apply_data_plane().await;
    h.dp.apply_data_plane().await;
    assert_eq!(h.sets.applies(), 0);
    assert_eq!(h.dp.pending_applies(), 2);

    h.dp.apply_data_plane().await;
    assert_eq!(h.sets.applies(), 1);
    assert_eq!(h.dp.pending_applies(), 0);

    h.dp.apply_data_plane().await;
    assert_eq!(h.sets.applies(), 1);
    assert_eq!(h.dp.pending_applies(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_apply_counted_during_background_flush_is_kept() {
    let config = DataPlaneConfig::windows("node1", "azure")
        .with_apply_batching(BatchConfig::new(10, Duration::from_millis(50)));
    let sets = Arc::new(RecordingIpSetManager::new());
    let dp = Arc::new(
        DataPlane::new(
            config,
            sets.clone(),
            Arc::new(InMemoryPolicyManager::new(false)),
            Arc::new(StaticEndpointProvider::new()),
            Arc::new(DataPlaneMetrics::new().unwrap()),
        )
        .await
        .unwrap(),
    );
    // Pods of another node never reach the endpoint queue.
    let pod_a = PodMetadata::new("a/web-0", "10.0.1.1", "node2");
    let pod_b = PodMetadata::new("b/web-0", "10.0.2.1", "node2");

    dp.add_to_sets(&[namespace_set("a")], &pod_a).await.unwrap();
    dp.apply_data_plane().await;
    assert_eq!(dp.pending_applies(), 1);

    sets.hold_next_apply();
    let shutdown = CancellationToken::new();
    let tasks = dp.run_periodic_tasks(shutdown.clone());
    sets.wait_for_held_apply().await;
    assert!(sets.committed_name("ns-a").is_some());

    // The background flush has already pushed; this change misses it.
    dp.add_to_sets(&[namespace_set("b")], &pod_b).await.unwrap();
    dp.apply_data_plane().await;
    assert_eq!(dp.pending_applies(), 2);

    sets.release_held_apply();
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    tasks.join().await;

    assert_eq!(dp.pending_applies(), 0);
    assert!(sets.committed_name("ns-b").is_some());
    assert_eq!(sets.pending_changes(), 0);
    assert_eq!(sets.applies(), 2);
}

#[tokio::test]
async fn test_pod_updates_coalesce_per_pod() {
    let h = harness(
        DataPlaneConfig::windows("node1", "azure"),
        Arc::new(StaticEndpointProvider::new()),
    )
    .await;

    h.dp.add_to_sets(&[namespace_set("default")], &web_pod())
        .await
        .unwrap();
    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.add_to_sets(
        &[web_label()],
        &PodMetadata::new("default/web-1", "10.0.0.2", "node2"),
    )
    .await
    .unwrap();

    assert_eq!(h.dp.pending_pod_updates().await, 1);
}

#[tokio::test]
async fn test_failed_apply_keeps_pod_updates_queued() {
    let h = harness(
        DataPlaneConfig::windows("node1", "azure"),
        Arc::new(StaticEndpointProvider::new()),
    )
    .await;
    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();

    h.sets.set_fail_applies(true);
    h.dp.apply_data_plane().await;
    assert_eq!(h.dp.pending_pod_updates().await, 1);
    assert_eq!(h.dp.metrics().set_applies_total.get(), 0);

    // No endpoint exists for the pod yet, so the update fails and is requeued.
    h.sets.set_fail_applies(false);
    h.dp.apply_data_plane().await;
    assert_eq!(h.dp.metrics().set_applies_total.get(), 1);
    assert_eq!(h.dp.pending_pod_updates().await, 1);
    assert_eq!(h.dp.metrics().pod_update_requeues_total.get(), 1);
}

// ============ Windows endpoint binding ============

#[tokio::test]
async fn test_pod_updates_bind_and_unbind_policies() {
    let provider = Arc::new(StaticEndpointProvider::with_bindings([EndpointBinding::new(
        "10.0.0.1", "ep-1",
    )
    .with_pod_key("default/web-0")]));
    let h = harness(DataPlaneConfig::windows("node1", "azure"), provider.clone()).await;

    h.dp.add_policy(web_policy("default/web")).await.unwrap();
    assert!(provider.bound_policies("ep-1").is_empty());

    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.apply_data_plane().await;
    assert_eq!(h.dp.pending_pod_updates().await, 0);
    assert_eq!(
        provider.bound_policies("ep-1"),
        BTreeSet::from(["default/web".to_string()])
    );
    assert!(h
        .dp
        .endpoint_cache()
        .get("10.0.0.1")
        .unwrap()
        .policy_refs
        .contains("default/web"));

    h.dp.remove_from_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.apply_data_plane().await;
    assert!(provider.bound_policies("ep-1").is_empty());
    assert!(h
        .dp
        .endpoint_cache()
        .get("10.0.0.1")
        .unwrap()
        .policy_refs
        .is_empty());
}

#[tokio::test]
async fn test_departed_endpoint_is_evicted_on_drain() {
    let provider = Arc::new(StaticEndpointProvider::with_bindings([EndpointBinding::new(
        "10.0.0.1", "ep-1",
    )
    .with_pod_key("default/web-0")]));
    let h = harness(DataPlaneConfig::windows("node1", "azure"), provider.clone()).await;

    h.dp.add_policy(web_policy("default/web")).await.unwrap();
    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.apply_data_plane().await;
    assert!(h.dp.endpoint_cache().get("10.0.0.1").is_some());

    provider.remove("10.0.0.1");
    h.dp.remove_from_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.apply_data_plane().await;

    assert!(h.dp.endpoint_cache().get("10.0.0.1").is_none());
    assert_eq!(h.dp.pending_pod_updates().await, 0);
    assert!(h.dp.dead_pod_updates().await.is_empty());
    assert_eq!(h.dp.metrics().pod_update_requeues_total.get(), 0);
    assert_eq!(h.dp.metrics().error_log_count("DataPlane"), 0);
}

#[tokio::test]
async fn test_pod_moved_to_new_address_unbinds_old_endpoint() {
    let provider = Arc::new(StaticEndpointProvider::with_bindings([
        EndpointBinding::new("10.0.0.1", "ep-1").with_pod_key("default/web-0"),
        EndpointBinding::new("10.0.0.9", "ep-9").with_pod_key("default/web-0"),
    ]));
    let h = harness(DataPlaneConfig::windows("node1", "azure"), provider.clone()).await;
    let policies = BTreeSet::from(["default/web".to_string()]);

    h.dp.add_policy(web_policy("default/web")).await.unwrap();
    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.apply_data_plane().await;
    assert_eq!(provider.bound_policies("ep-1"), policies);

    // Same pod, re-created on a new address before the next flush.
    let moved = PodMetadata::new("default/web-0", "10.0.0.9", "node1");
    h.dp.remove_from_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.add_to_sets(&[web_label()], &moved).await.unwrap();
    assert_eq!(h.dp.pending_pod_updates().await, 2);

    h.dp.apply_data_plane().await;
    assert_eq!(h.dp.pending_pod_updates().await, 0);
    assert!(provider.bound_policies("ep-1").is_empty());
    assert_eq!(provider.bound_policies("ep-9"), policies);
    assert!(h
        .dp
        .endpoint_cache()
        .get("10.0.0.1")
        .unwrap()
        .policy_refs
        .is_empty());
}

#[tokio::test]
async fn test_policy_add_resolves_existing_endpoints() {
    let provider = Arc::new(StaticEndpointProvider::with_bindings([EndpointBinding::new(
        "10.0.0.1", "ep-1",
    )
    .with_pod_key("default/web-0")]));
    let h = harness(DataPlaneConfig::windows("node1", "azure"), provider.clone()).await;

    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();
    h.dp.add_policy(web_policy("default/web")).await.unwrap();

    let endpoint = h.dp.endpoint_cache().get("10.0.0.1").unwrap();
    assert!(endpoint.policy_refs.contains("default/web"));

    h.dp.remove_policy("default/web").await.unwrap();
    assert!(h
        .dp
        .endpoint_cache()
        .get("10.0.0.1")
        .map(|endpoint| endpoint.policy_refs.is_empty())
        .unwrap_or(true));
}

#[tokio::test]
async fn test_failing_binds_are_dead_lettered() {
    let provider = Arc::new(FailingBindProvider::new(vec![
        EndpointBinding::new("10.0.0.1", "ep-1").with_pod_key("default/web-0"),
    ]));
    let config = DataPlaneConfig::windows("node1", "azure").with_pod_update_max_retries(2);
    let h = harness(config, provider.clone()).await;

    h.dp.add_policy(web_policy("default/web")).await.unwrap();
    h.dp.add_to_sets(&[web_label()], &web_pod()).await.unwrap();

    h.dp.apply_data_plane().await;
    assert_eq!(provider.binds(), 1);
    assert_eq!(h.dp.pending_pod_updates().await, 1);
    assert_eq!(h.dp.metrics().pod_update_requeues_total.get(), 1);

    h.dp.apply_data_plane().await;
    assert_eq!(provider.binds(), 2);
    assert_eq!(h.dp.pending_pod_updates().await, 0);
    assert_eq!(h.dp.metrics().pod_update_dead_letters_total.get(), 1);

    let dead = h.dp.dead_pod_updates().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].pod.pod_key, "default/web-0");
    assert_eq!(dead[0].attempts, 2);

    // Nothing left to retry.
    h.dp.apply_data_plane().await;
    assert_eq!(provider.binds(), 2);
}
