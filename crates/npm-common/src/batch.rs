//! Batch counters for deferred apply paths.
//!
//! A batch counter tracks how many operations have been deferred since the
//! last successful flush. The caller owns the lock around the counter; the
//! counter itself only decides when the configured maximum is reached.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type for batch configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchConfigError {
    #[error("max_batches must be positive")]
    NonPositiveMaxBatches,

    #[error("interval must be non-zero")]
    ZeroInterval,
}

/// Flush triggers for one batched path: whichever of `max_batches` deferred
/// operations or `interval_ms` of wall clock comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of deferred operations that forces an immediate flush.
    pub max_batches: usize,
    /// Period of the background flush check, in milliseconds.
    pub interval_ms: u64,
}

impl BatchConfig {
    pub fn new(max_batches: usize, interval: Duration) -> Self {
        Self {
            max_batches,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the flush interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Rejects configurations that would silently disable batching.
    pub fn validate(&self) -> Result<(), BatchConfigError> {
        if self.max_batches == 0 {
            return Err(BatchConfigError::NonPositiveMaxBatches);
        }
        if self.interval_ms == 0 {
            return Err(BatchConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// Outcome of recording one deferred operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Below the maximum; keep deferring. Carries the new count.
    Defer(usize),
    /// Maximum reached; the caller should flush now. Carries the new count.
    Flush(usize),
}

impl BatchDecision {
    pub fn should_flush(&self) -> bool {
        matches!(self, BatchDecision::Flush(_))
    }

    pub fn count(&self) -> usize {
        match self {
            BatchDecision::Defer(n) | BatchDecision::Flush(n) => *n,
        }
    }
}

/// Number of operations deferred since the last flush.
#[derive(Debug, Clone)]
pub struct BatchCounter {
    count: usize,
    max_batches: usize,
}

impl BatchCounter {
    pub fn new(max_batches: usize) -> Self {
        Self {
            count: 0,
            max_batches,
        }
    }

    /// Records one deferred operation.
    pub fn increment(&mut self) -> BatchDecision {
        self.count += 1;
        if self.count >= self.max_batches {
            BatchDecision::Flush(self.count)
        } else {
            BatchDecision::Defer(self.count)
        }
    }

    /// Zeroes the counter. Call only after a successful flush.
    pub fn reset(&mut self) {
        if self.count > 0 {
            log::debug!("BatchCounter: reset after {} deferred operations", self.count);
        }
        self.count = 0;
    }

    /// Takes `flushed` operations off the counter after a flush that covered
    /// them. Operations counted while the flush was running stay pending.
    pub fn consume(&mut self, flushed: usize) {
        let left = self.count.saturating_sub(flushed);
        if left > 0 {
            log::debug!(
                "BatchCounter: flush covered {} operations, {} still pending",
                flushed,
                left
            );
        }
        self.count = left;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn max_batches(&self) -> usize {
        self.max_batches
    }
}
