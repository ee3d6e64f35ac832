//! Prometheus metrics for the dataplane.
//!
//! Everything here is fire-and-forget: recording a metric never fails and
//! never blocks the caller beyond an atomic update.

use log::error;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Kind of ACL operation against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Classifies one endpoint bind by what it changes.
    pub fn for_binding(adding: bool, removing: bool) -> Self {
        match (adding, removing) {
            (true, false) => OperationKind::Create,
            (false, true) => OperationKind::Delete,
            _ => OperationKind::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics of one dataplane instance, registered in their own registry.
#[derive(Clone)]
pub struct DataPlaneMetrics {
    // Counters
    pub acl_failures_total: IntCounterVec,
    pub error_logs_total: IntCounterVec,
    pub heartbeats_total: IntCounter,
    pub set_applies_total: IntCounter,
    pub rule_commits_total: IntCounter,
    pub pod_update_requeues_total: IntCounter,
    pub pod_update_dead_letters_total: IntCounter,

    // Gauges
    pub policies: IntGauge,

    // Histograms
    pub acl_latency_seconds: HistogramVec,

    pub registry: Arc<Registry>,
}

impl DataPlaneMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let acl_failures_total = IntCounterVec::new(
            Opts::new(
                "npm_acl_failures_total",
                "Failed ACL operations against pod endpoints",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(acl_failures_total.clone()))?;

        let error_logs_total = IntCounterVec::new(
            Opts::new("npm_error_logs_total", "Errors logged, by component"),
            &["component"],
        )?;
        registry.register(Box::new(error_logs_total.clone()))?;

        let heartbeats_total = IntCounter::with_opts(Opts::new(
            "npm_heartbeats_total",
            "Heartbeats sent by the reconcile loop",
        ))?;
        registry.register(Box::new(heartbeats_total.clone()))?;

        let set_applies_total = IntCounter::with_opts(Opts::new(
            "npm_set_applies_total",
            "Successful address set apply flushes",
        ))?;
        registry.register(Box::new(set_applies_total.clone()))?;

        let rule_commits_total = IntCounter::with_opts(Opts::new(
            "npm_rule_commits_total",
            "Successful batched rule commits",
        ))?;
        registry.register(Box::new(rule_commits_total.clone()))?;

        let pod_update_requeues_total = IntCounter::with_opts(Opts::new(
            "npm_pod_update_requeues_total",
            "Pod endpoint updates put back on the queue after a failure",
        ))?;
        registry.register(Box::new(pod_update_requeues_total.clone()))?;

        let pod_update_dead_letters_total = IntCounter::with_opts(Opts::new(
            "npm_pod_update_dead_letters_total",
            "Pod endpoint updates dropped after exhausting their retries",
        ))?;
        registry.register(Box::new(pod_update_dead_letters_total.clone()))?;

        let policies = IntGauge::with_opts(Opts::new(
            "npm_policies",
            "Network policies currently installed",
        ))?;
        registry.register(Box::new(policies.clone()))?;

        let acl_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "npm_acl_latency_seconds",
                "Latency of ACL operations against pod endpoints",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["operation"],
        )?;
        registry.register(Box::new(acl_latency_seconds.clone()))?;

        Ok(Self {
            acl_failures_total,
            error_logs_total,
            heartbeats_total,
            set_applies_total,
            rule_commits_total,
            pod_update_requeues_total,
            pod_update_dead_letters_total,
            policies,
            acl_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn record_acl_latency(&self, op: OperationKind, elapsed: Duration) {
        self.acl_latency_seconds
            .with_label_values(&[op.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_acl_failures(&self, op: OperationKind) {
        self.acl_failures_total.with_label_values(&[op.as_str()]).inc();
    }

    /// Logs at error level and counts it against `component`.
    pub fn send_error_log_and_metric(&self, component: &str, message: &str) {
        error!("{}: {}", component, message);
        self.error_logs_total.with_label_values(&[component]).inc();
    }

    /// Records a heartbeat carrying the current policy count.
    pub fn send_heartbeat(&self, policy_count: usize) {
        self.heartbeats_total.inc();
        self.policies.set(policy_count as i64);
    }

    pub fn error_log_count(&self, component: &str) -> u64 {
        self.error_logs_total.with_label_values(&[component]).get()
    }

    /// Text exposition of every registered metric.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
