//! Policy lifecycle, set references and rule-commit batching.

use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};

use super::{ApplyContext, DataPlane, RuleBatch};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{DataPlaneError, PolicyStage, Result, StageError};
use crate::ipsets::{
    members_of_translated_set, IpSetError, ReferenceOwner, ReferenceType, SetKind, SetType,
    TranslatedIpSet,
};
use crate::policies::{NetworkPolicy, PolicyError};
use crate::types::PodMetadata;

fn reference_stage(ref_type: ReferenceType) -> PolicyStage {
    match ref_type {
        ReferenceType::Selector => PolicyStage::SelectorReferences,
        ReferenceType::NetPol => PolicyStage::RuleReferences,
    }
}

/// CIDR entries carry no pod key.
fn cidr_member(cidr: &str) -> PodMetadata {
    PodMetadata::new("", cidr, "")
}

impl DataPlane {
    // ============ Policy lifecycle ============

    /// Installs a policy: references its sets, applies them, resolves the
    /// endpoints it selects and installs its rules.
    ///
    /// A failure after the references were taken does not roll them back;
    /// a later `update_policy` or `remove_policy` releases them.
    pub async fn add_policy(&self, policy: NetworkPolicy) -> Result<()> {
        let key = policy.policy_key.clone();
        let result = self.add_policy_stages(policy).await;
        self.audit_policy("add_policy", &key, &result);
        result
    }

    async fn add_policy_stages(&self, policy: NetworkPolicy) -> Result<()> {
        let key = policy.policy_key.clone();
        info!("DataPlane: adding policy {}", key);

        self.create_ip_sets_and_references(
            &policy.all_pod_selector_ip_sets(),
            &key,
            ReferenceType::Selector,
        )?;
        self.create_ip_sets_and_references(&policy.rule_ip_sets, &key, ReferenceType::NetPol)?;

        self.apply_data_plane_now(ApplyContext::AddNetPol)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::Apply, &key, e))?;

        let endpoints = self
            .get_endpoints_to_apply_policy(&policy)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::EndpointResolution, &key, e))?;

        self.policy_mgr
            .add_policy(policy, endpoints)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::RuleInstall, &key, e))?;
        self.metrics.policies.set(self.policy_mgr.policy_count() as i64);

        self.increment_batch_and_reconcile(ApplyContext::AddNetPol)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::RuleCommit, &key, e))
    }

    /// Removes a policy and releases its set references. Unknown keys
    /// succeed.
    pub async fn remove_policy(&self, policy_key: &str) -> Result<()> {
        let result = self.remove_policy_stages(policy_key).await;
        self.audit_policy("remove_policy", policy_key, &result);
        result
    }

    async fn remove_policy_stages(&self, policy_key: &str) -> Result<()> {
        let Some(policy) = self.policy_mgr.get_policy(policy_key) else {
            debug!("DataPlane: policy {} not found, nothing to remove", policy_key);
            return Ok(());
        };
        info!("DataPlane: removing policy {}", policy_key);

        let bound_ips: Vec<String> = policy.pod_endpoints.keys().cloned().collect();

        self.policy_mgr
            .remove_policy(policy_key)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::RuleRemoval, policy_key, e))?;
        self.metrics.policies.set(self.policy_mgr.policy_count() as i64);

        if self.is_windows() {
            let evicted = self.endpoint_cache.prune_policy(policy_key, &bound_ips);
            debug!(
                "DataPlane: pruned {} from {} endpoints, evicted {}",
                policy_key,
                bound_ips.len(),
                evicted
            );
        }

        self.delete_ip_sets_and_references(&policy.rule_ip_sets, policy_key, ReferenceType::NetPol)
            .await?;
        self.delete_ip_sets_and_references(
            &policy.all_pod_selector_ip_sets(),
            policy_key,
            ReferenceType::Selector,
        )
        .await?;

        self.apply_data_plane_now(ApplyContext::DelNetPol)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::Apply, policy_key, e))?;

        self.increment_batch_and_reconcile(ApplyContext::DelNetPol)
            .await
            .map_err(|e| DataPlaneError::policy(PolicyStage::RuleCommit, policy_key, e))
    }

    /// Adds an unknown policy, or replaces a known one by removing and
    /// re-adding it.
    pub async fn update_policy(&self, policy: NetworkPolicy) -> Result<()> {
        if !self.policy_mgr.policy_exists(&policy.policy_key) {
            debug!(
                "DataPlane: policy {} not installed yet, adding it",
                policy.policy_key
            );
            return self.add_policy(policy).await;
        }

        self.remove_policy(&policy.policy_key).await?;
        self.add_policy(policy).await
    }

    fn audit_policy(&self, action: &str, policy_key: &str, result: &Result<()>) {
        let record = AuditRecord::new(AuditCategory::PolicyChange, "DataPlane", action)
            .with_object_id(policy_key)
            .with_object_type("network_policy");
        match result {
            Ok(()) => {
                audit_log!(record.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                let details = serde_json::json!({
                    "stage": e.stage().map(|stage| stage.to_string()),
                });
                audit_log!(record.with_details(details).with_error(e.to_string()));
            }
        }
    }

    // ============ Endpoint resolution ============

    /// Pod address → endpoint id of every local pod the policy selects.
    /// Always empty on Linux, where rules are not bound to endpoints.
    async fn get_endpoints_to_apply_policy(
        &self,
        policy: &NetworkPolicy,
    ) -> std::result::Result<HashMap<String, String>, StageError> {
        if !self.is_windows() {
            return Ok(HashMap::new());
        }

        let bindings = self.endpoints.refresh_pod_endpoints(&[]).await?;
        self.endpoint_cache.apply_refresh(bindings);

        let selector_sets = policy.selector_set_names();
        let ips: BTreeSet<String> = if selector_sets.is_empty() {
            BTreeSet::new()
        } else {
            self.ipset_mgr.get_ips_from_selector_sets(&selector_sets)?
        };

        let endpoints = self.endpoint_cache.resolve(&ips, &policy.policy_key);
        debug!(
            "DataPlane: policy {} selects {} addresses, {} with endpoints",
            policy.policy_key,
            ips.len(),
            endpoints.len()
        );
        Ok(endpoints)
    }

    // ============ Set references ============

    fn create_ip_sets_and_references(
        &self,
        sets: &[TranslatedIpSet],
        policy_key: &str,
        ref_type: ReferenceType,
    ) -> Result<()> {
        let stage = reference_stage(ref_type);
        let fail = |e: IpSetError| DataPlaneError::policy(stage, policy_key, e);

        for set in sets {
            self.ipset_mgr.create_sets(std::slice::from_ref(&set.metadata));
            self.ipset_mgr
                .add_reference(&set.metadata, ReferenceOwner::policy(policy_key), ref_type)
                .map_err(fail)?;
        }

        for set in sets {
            match set.metadata.set_type {
                SetType::CidrBlocks => {
                    for cidr in &set.members {
                        self.ipset_mgr
                            .add_to_sets(std::slice::from_ref(&set.metadata), &cidr_member(cidr))
                            .map_err(fail)?;
                    }
                }
                SetType::NestedLabelOfPod if !set.members.is_empty() => {
                    self.ipset_mgr
                        .add_to_lists(
                            std::slice::from_ref(&set.metadata),
                            &members_of_translated_set(set),
                        )
                        .map_err(fail)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn delete_ip_sets_and_references(
        &self,
        sets: &[TranslatedIpSet],
        policy_key: &str,
        ref_type: ReferenceType,
    ) -> Result<()> {
        let stage = reference_stage(ref_type);
        let fail = |e: IpSetError| DataPlaneError::policy(stage, policy_key, e);

        for set in sets {
            let name = set.metadata.prefixed_name();

            if let Some(rule_batch) = &self.rule_batch {
                // Keeps the set alive until the rules using it are committed away.
                let mut batch = rule_batch.lock().await;
                if let Err(e) = self.ipset_mgr.add_reference(
                    &set.metadata,
                    ReferenceOwner::temporary(policy_key),
                    ref_type,
                ) {
                    info!(
                        "DataPlane: ignoring temporary reference on {} for {} ({}): {}",
                        name, policy_key, ref_type, e
                    );
                    continue;
                }
                batch
                    .pending_cleanup
                    .entry(name.clone())
                    .or_default()
                    .push((policy_key.to_string(), ref_type));
            }

            if let Err(e) =
                self.ipset_mgr
                    .delete_reference(&name, &ReferenceOwner::policy(policy_key), ref_type)
            {
                if !e.is_not_found() {
                    return Err(fail(e));
                }
                info!(
                    "DataPlane: ignoring delete reference on non-existent set {} for {} ({})",
                    name, policy_key, ref_type
                );
            }
        }

        for set in sets {
            if set.metadata.set_type == SetType::CidrBlocks {
                for cidr in &set.members {
                    self.ipset_mgr
                        .remove_from_sets(std::slice::from_ref(&set.metadata), &cidr_member(cidr))
                        .map_err(fail)?;
                }
            } else if set.metadata.kind() == SetKind::ListSet && !set.members.is_empty() {
                self.ipset_mgr
                    .remove_from_list(&set.metadata, &members_of_translated_set(set))
                    .map_err(fail)?;
            }
        }
        Ok(())
    }

    // ============ Rule-commit batching ============

    /// Counts one dirty-policy event and commits when the batch is full.
    /// A no-op unless rule commits are batched.
    async fn increment_batch_and_reconcile(
        &self,
        context: ApplyContext,
    ) -> std::result::Result<(), PolicyError> {
        let Some(rule_batch) = &self.rule_batch else {
            return Ok(());
        };

        // Held through the commit; only the background flush contends.
        let mut batch = rule_batch.lock().await;
        let decision = batch.counter.increment();
        debug!("DataPlane: [{}] new policy batch count: {}", context, decision.count());

        if decision.should_flush() {
            info!(
                "DataPlane: [{}] committing rules since reached maximum batch count: {}",
                context,
                decision.count()
            );
            self.reconcile_dirty_policies_now(&mut batch, context).await?;
        }
        Ok(())
    }

    /// Commits dirty policies if any are pending. Used by the background
    /// flush; callable directly to force a commit.
    pub async fn flush_dirty_policies(&self) -> Result<()> {
        self.flush_dirty_policies_in(ApplyContext::Background)
            .await
            .map_err(|e| DataPlaneError::Apply {
                context: ApplyContext::Background.to_string(),
                source: e.into(),
            })
    }

    pub(crate) async fn flush_dirty_policies_in(
        &self,
        context: ApplyContext,
    ) -> std::result::Result<(), PolicyError> {
        let Some(rule_batch) = &self.rule_batch else {
            return Ok(());
        };

        let mut batch = rule_batch.lock().await;
        if batch.counter.is_empty() {
            return Ok(());
        }
        self.reconcile_dirty_policies_now(&mut batch, context).await
    }

    /// Dirty-policy events counted since the last successful rule commit.
    pub async fn pending_policy_events(&self) -> usize {
        match &self.rule_batch {
            Some(rule_batch) => rule_batch.lock().await.counter.count(),
            None => 0,
        }
    }

    /// Caller holds the rule batch lock.
    async fn reconcile_dirty_policies_now(
        &self,
        batch: &mut RuleBatch,
        context: ApplyContext,
    ) -> std::result::Result<(), PolicyError> {
        info!("DataPlane: [{}] reconciling dirty policies", context);

        if let Err(e) = self.policy_mgr.reconcile_dirty_policies().await {
            self.metrics.send_error_log_and_metric(
                "DataPlane",
                &format!("[{}] failed to reconcile dirty policies: {}", context, e),
            );
            audit_log!(AuditRecord::new(AuditCategory::Flush, "DataPlane", "commit_rules")
                .with_details(serde_json::json!({ "context": context.to_string() }))
                .with_error(e.to_string()));
            return Err(e);
        }

        let committed = batch.counter.count();
        batch.counter.reset();
        self.metrics.rule_commits_total.inc();

        let cleanup = std::mem::take(&mut batch.pending_cleanup);
        let mut released = 0usize;
        for (set_name, owners) in &cleanup {
            for (policy_key, ref_type) in owners {
                match self.ipset_mgr.delete_reference(
                    set_name,
                    &ReferenceOwner::temporary(policy_key.as_str()),
                    *ref_type,
                ) {
                    Ok(()) => released += 1,
                    Err(e) if e.is_not_found() => info!(
                        "DataPlane: [{}] ignoring temporary reference release on non-existent set {} for {}",
                        context, set_name, policy_key
                    ),
                    Err(e) => warn!(
                        "DataPlane: [{}] failed to release temporary reference on {} for {}: {}",
                        context, set_name, policy_key, e
                    ),
                }
            }
        }

        audit_log!(AuditRecord::new(AuditCategory::Flush, "DataPlane", "commit_rules")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "context": context.to_string(),
                "policy_events": committed,
                "temporary_references_released": released,
            })));
        Ok(())
    }
}
