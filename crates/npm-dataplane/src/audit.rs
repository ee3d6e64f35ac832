//! Structured audit records.
//!
//! Policy lifecycle, set deletions, flushes, reconcile passes and
//! dead-lettered pod updates are emitted as JSON audit records on the
//! `audit` tracing target, separate from the operational log. With no
//! tracing subscriber installed the records are forwarded to `log`, so they
//! end up in the daemon's `env_logger` output under the `audit` target.
//!
//! # Usage
//! ```ignore
//! audit_log!(AuditRecord::new(AuditCategory::PolicyChange, "DataPlane", "add_policy")
//!     .with_outcome(AuditOutcome::Success)
//!     .with_object_id("ns/allow-web")
//!     .with_object_type("network_policy"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Network policy add, update or removal
    PolicyChange,
    /// Address set creation or deletion
    SetChange,
    /// Set-apply or rule-commit flush
    Flush,
    /// Bootup and shutdown
    Lifecycle,
    /// Background reconciliation
    Reconcile,
    /// Error and failure events
    ErrorCondition,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::PolicyChange => write!(f, "POLICY_CHANGE"),
            AuditCategory::SetChange => write!(f, "SET_CHANGE"),
            AuditCategory::Flush => write!(f, "FLUSH"),
            AuditCategory::Lifecycle => write!(f, "LIFECYCLE"),
            AuditCategory::Reconcile => write!(f, "RECONCILE"),
            AuditCategory::ErrorCondition => write!(f, "ERROR_CONDITION"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component emitting the record.
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Policy key, set name or pod key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// e.g. "network_policy", "ip_set", "pod_update"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped with the current time. The outcome defaults
    /// to success; [`AuditRecord::with_error`] marks it failed.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::Success,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as failure.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] on the `audit` target.
///
/// Success is logged at info, failure at warn.
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}
