//! Background tasks: reconciliation, set-apply flush and rule-commit flush.
//!
//! Each task runs on its own timer and stops when the shared cancellation
//! token fires. A pass already running is allowed to finish; no new one
//! starts after cancellation.

use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ApplyContext, DataPlane};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;

/// Handles of the running background tasks.
pub struct PeriodicTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl PeriodicTasks {
    /// Number of tasks started.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Names of the tasks started.
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Waits for every task to stop.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!("DataPlane: {} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// Runs `pass` every `period` (first run one period from now) until
/// `shutdown` fires.
fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("DataPlane: {} task started, every {:?}", name, period);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => pass().await,
            }
        }
        info!("DataPlane: {} task stopped", name);
    })
}

impl DataPlane {
    /// Starts the background tasks this configuration needs: always the
    /// reconcile loop, plus the set-apply flush when set applies are batched
    /// and the rule-commit flush when rule commits are batched.
    pub fn run_periodic_tasks(self: &Arc<Self>, shutdown: CancellationToken) -> PeriodicTasks {
        let mut handles = Vec::with_capacity(3);

        let dp = Arc::clone(self);
        handles.push((
            "reconcile",
            spawn_ticker(
                "reconcile",
                self.config.reconcile_interval(),
                shutdown.clone(),
                move || {
                    let dp = Arc::clone(&dp);
                    async move { dp.reconcile_once().await }
                },
            ),
        ));

        if let Some(batching) = self.config.platform.apply_batching() {
            let dp = Arc::clone(self);
            handles.push((
                "apply",
                spawn_ticker("apply", batching.interval(), shutdown.clone(), move || {
                    let dp = Arc::clone(&dp);
                    async move { dp.apply_pending_in_background().await }
                }),
            ));
        }

        if let Some(batching) = self.config.platform.rule_batching() {
            let dp = Arc::clone(self);
            handles.push((
                "rule-flush",
                spawn_ticker("rule-flush", batching.interval(), shutdown, move || {
                    let dp = Arc::clone(&dp);
                    async move {
                        // Errors are already logged and metriced.
                        if let Err(e) = dp.flush_dirty_policies_in(ApplyContext::Background).await {
                            debug!("DataPlane: background rule commit left pending: {}", e);
                        }
                    }
                }),
            ));
        }

        PeriodicTasks { handles }
    }

    /// One reconciliation pass: heartbeat, then both managers.
    pub async fn reconcile_once(&self) {
        let policies = self.policy_mgr.policy_count();
        self.metrics.send_heartbeat(policies);
        self.ipset_mgr.reconcile().await;
        self.policy_mgr.reconcile().await;

        let sets = self.ipset_mgr.list_all().len();
        debug!("DataPlane: reconcile pass done, {} policies, {} sets", policies, sets);
        audit_log!(reconcile_record(policies, sets));
    }
}

fn reconcile_record(policies: usize, sets: usize) -> AuditRecord {
    AuditRecord::new(AuditCategory::Reconcile, "DataPlane", "reconcile")
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({ "policies": policies, "ip_sets": sets }))
}
