//! Bounded retry accounting.
//!
//! Work that fails transiently is put back on its queue and retried on the
//! next flush. A permanently failing item must not be retried forever, so
//! every requeue goes through a [`RetryBudget`] which turns the item into a
//! dead letter once its attempts are used up.

/// What to do with an item that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Put it back; carries the number of failed attempts so far.
    Retry(u32),
    /// Budget exhausted; carries the number of failed attempts.
    Exhausted(u32),
}

impl RetryVerdict {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryVerdict::Exhausted(_))
    }
}

/// Maximum number of failed attempts an item may accumulate.
///
/// A budget of zero means unlimited retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max_attempts: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn unlimited() -> Self {
        Self { max_attempts: 0 }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records one more failure against `attempts` and decides the item's fate.
    pub fn record_failure(&self, attempts: &mut u32) -> RetryVerdict {
        *attempts = attempts.saturating_add(1);
        if self.max_attempts != 0 && *attempts >= self.max_attempts {
            RetryVerdict::Exhausted(*attempts)
        } else {
            RetryVerdict::Retry(*attempts)
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(10)
    }
}
