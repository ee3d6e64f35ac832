//! Set-apply flushes and set-apply batching.

use log::{debug, info};

use super::{ApplyContext, DataPlane};
use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::ipsets::IpSetError;

impl DataPlane {
    /// Pushes pending set changes down, or counts one more deferred apply
    /// when set applies are batched and the batch is not full yet.
    ///
    /// Failures are logged and metriced and the changes stay pending for the
    /// next flush; nothing is surfaced to the caller.
    pub async fn apply_data_plane(&self) {
        let context = ApplyContext::ApplyDataPlane;

        if let Some(counter) = &self.apply_batch {
            let decision = counter.lock().increment();
            if !decision.should_flush() {
                debug!("DataPlane: [{}] deferred apply, batch count {}", context, decision.count());
                return;
            }
            info!(
                "DataPlane: [{}] applying now since reached maximum batch count: {}",
                context,
                decision.count()
            );
        }

        if let Err(e) = self.apply_data_plane_now(context).await {
            debug!("DataPlane: [{}] apply left pending: {}", context, e);
        }
    }

    /// Deferred applies counted since the last successful flush.
    pub fn pending_applies(&self) -> usize {
        self.apply_batch
            .as_ref()
            .map(|counter| counter.lock().count())
            .unwrap_or_default()
    }

    /// Applies sets, takes the applies it covered off the apply counter and,
    /// on Windows, drains the pod update queue. Only the set apply can fail.
    pub(crate) async fn apply_data_plane_now(
        &self,
        context: ApplyContext,
    ) -> Result<(), IpSetError> {
        // Applies counted after this point may have missed the push below and
        // stay pending for the next flush.
        let covered = self.pending_applies();
        debug!("DataPlane: [{}] applying sets, covering {} deferred applies", context, covered);

        if let Err(e) = self.ipset_mgr.apply_sets(&context.to_string()).await {
            self.metrics.send_error_log_and_metric(
                "DataPlane",
                &format!("[{}] failed to apply sets: {}", context, e),
            );
            audit_log!(AuditRecord::new(AuditCategory::Flush, "DataPlane", "apply_sets")
                .with_details(serde_json::json!({ "context": context.to_string() }))
                .with_error(e.to_string()));
            return Err(e);
        }

        self.metrics.set_applies_total.inc();
        if let Some(counter) = &self.apply_batch {
            counter.lock().consume(covered);
        }

        if self.is_windows() {
            self.update_pods(context).await;
        }
        Ok(())
    }

    /// Background tick of set-apply batching.
    pub(crate) async fn apply_pending_in_background(&self) {
        if self.pending_applies() == 0 {
            return;
        }
        // Errors are already logged and metriced.
        if let Err(e) = self.apply_data_plane_now(ApplyContext::Background).await {
            debug!("DataPlane: [{}] apply left pending: {}", ApplyContext::Background, e);
        }
    }
}
