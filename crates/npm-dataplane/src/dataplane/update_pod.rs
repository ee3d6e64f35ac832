//! Draining the pod update queue into endpoint ACL bindings.
//!
//! Which policies apply to a pod is decided from a snapshot of the policy
//! and set managers taken before the queue lock; while the queue is locked
//! only the endpoint provider and the endpoint cache are touched.

use log::debug;
use npm_common::RetryVerdict;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use super::{ApplyContext, DataPlane, QueuedPodUpdate};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::endpoint::EndpointError;
use crate::ipsets::IpSetMetadata;
use crate::metrics::OperationKind;
use crate::policies::NetworkPolicy;
use crate::types::PolicyKey;

/// One policy's selector, resolved at snapshot time.
struct PolicySelection {
    policy: Arc<NetworkPolicy>,
    /// Every selector set name, nested children included.
    selector_sets: BTreeSet<String>,
    /// Addresses currently matching the top-level selector.
    matching_ips: BTreeSet<String>,
}

impl PolicySelection {
    fn key(&self) -> &str {
        &self.policy.policy_key
    }

    fn touches(&self, sets: &BTreeMap<String, IpSetMetadata>) -> bool {
        sets.keys().any(|name| self.selector_sets.contains(name))
    }
}

impl DataPlane {
    pub(super) async fn update_pods(&self, context: ApplyContext) {
        if self.update_pod_queue.lock().await.is_empty() {
            return;
        }

        match self.endpoints.refresh_pod_endpoints(&[]).await {
            Ok(bindings) => {
                let summary = self.endpoint_cache.apply_refresh(bindings);
                debug!("DataPlane: [{}] endpoint refresh: {:?}", context, summary);
            }
            Err(e) => {
                self.metrics.send_error_log_and_metric(
                    "DataPlane",
                    &format!("[{}] failed to refresh endpoints: {}", context, e),
                );
                return;
            }
        }

        let selections = self.policy_selections();

        let mut queue = self.update_pod_queue.lock().await;
        let mut failed = Vec::new();
        let mut updated = 0usize;

        while !queue.is_empty() {
            let Some(update) = queue.dequeue() else {
                self.metrics.send_error_log_and_metric(
                    "DataPlane",
                    &format!("[{}] pod queue not empty but dequeue returned nothing", context),
                );
                break;
            };

            match self.update_pod(&update, &selections).await {
                Ok(()) => updated += 1,
                Err(e) => {
                    self.metrics.send_error_log_and_metric(
                        "DataPlane",
                        &format!("[{}] failed to update pod {}: {}", context, update.pod, e),
                    );
                    failed.push(update);
                }
            }
        }

        // Requeued after the loop so a persistently failing pod is tried once
        // per flush.
        for update in failed {
            let pod_key = update.pod.pod_key.clone();
            match queue.requeue(update) {
                RetryVerdict::Retry(attempts) => {
                    self.metrics.pod_update_requeues_total.inc();
                    debug!("DataPlane: requeued {} after {} failed attempts", pod_key, attempts);
                }
                RetryVerdict::Exhausted(attempts) => {
                    self.metrics.pod_update_dead_letters_total.inc();
                    audit_log!(AuditRecord::new(
                        AuditCategory::ErrorCondition,
                        "DataPlane",
                        "dead_letter_pod_update"
                    )
                    .with_outcome(AuditOutcome::Failure)
                    .with_object_id(pod_key)
                    .with_object_type("pod_update")
                    .with_details(serde_json::json!({ "attempts": attempts })));
                }
            }
        }

        debug!(
            "DataPlane: [{}] updated {} pods, {} pending",
            context,
            updated,
            queue.len()
        );
    }

    fn policy_selections(&self) -> Vec<PolicySelection> {
        self.policy_mgr
            .list_policies()
            .into_iter()
            .map(|policy| {
                let matching_ips = self
                    .ipset_mgr
                    .get_ips_from_selector_sets(&policy.selector_set_names())
                    .unwrap_or_else(|e| {
                        debug!(
                            "DataPlane: no selector addresses for {}: {}",
                            policy.policy_key, e
                        );
                        BTreeSet::new()
                    });
                let selector_sets = policy
                    .all_pod_selector_ip_sets()
                    .iter()
                    .map(|set| set.metadata.prefixed_name())
                    .collect();
                PolicySelection {
                    policy,
                    selector_sets,
                    matching_ips,
                }
            })
            .collect()
    }

    async fn update_pod(
        &self,
        update: &QueuedPodUpdate,
        selections: &[PolicySelection],
    ) -> Result<(), EndpointError> {
        let ip = &update.pod.pod_ip;
        let Some(endpoint) = self.endpoint_cache.get(ip) else {
            if update.sets_to_add.is_empty() {
                // Pod and endpoint are gone; nothing is bound any more.
                debug!("DataPlane: no endpoint for departed pod {}", update.pod);
                return Ok(());
            }
            return Err(EndpointError::EndpointNotFound(ip.clone()));
        };

        let to_add: Vec<Arc<NetworkPolicy>> = selections
            .iter()
            .filter(|s| {
                !endpoint.policy_refs.contains(s.key())
                    && s.touches(&update.sets_to_add)
                    && s.matching_ips.contains(ip)
            })
            .map(|s| Arc::clone(&s.policy))
            .collect();
        let to_remove: Vec<PolicyKey> = selections
            .iter()
            .filter(|s| {
                endpoint.policy_refs.contains(s.key())
                    && s.touches(&update.sets_to_remove)
                    && !s.matching_ips.contains(ip)
            })
            .map(|s| s.key().to_string())
            .collect();

        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(());
        }

        let op = OperationKind::for_binding(!to_add.is_empty(), !to_remove.is_empty());
        let start = Instant::now();
        let result = self
            .endpoints
            .bind_policies(&endpoint.endpoint_id, &to_add, &to_remove)
            .await;
        self.metrics.record_acl_latency(op, start.elapsed());
        if let Err(e) = result {
            self.metrics.inc_acl_failures(op);
            return Err(e);
        }

        let added: Vec<PolicyKey> = to_add
            .iter()
            .map(|policy| policy.policy_key.clone())
            .collect();
        self.endpoint_cache
            .update_policy_refs(ip, &added, &to_remove);
        debug!(
            "DataPlane: endpoint {} of {}: +{} -{} policies",
            endpoint.endpoint_id,
            update.pod,
            added.len(),
            to_remove.len()
        );
        Ok(())
    }
}
