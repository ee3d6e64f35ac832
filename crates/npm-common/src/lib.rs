//! Common data-plane primitives for NPM.
//!
//! This crate provides the small building blocks the data-plane orchestrator
//! is assembled from:
//!
//! - [`SyncMap`]: map that never auto-creates entries, with reference
//!   tracking for values implementing [`HasReferences`]
//! - [`BatchCounter`] / [`BatchConfig`]: deferred-operation counting with a
//!   flush threshold and interval
//! - [`RetryBudget`]: bounded requeue accounting
//!
//! # Example
//!
//! ```
//! use npm_common::{BatchCounter, BatchDecision};
//!
//! let mut counter = BatchCounter::new(2);
//! assert_eq!(counter.increment(), BatchDecision::Defer(1));
//! assert!(counter.increment().should_flush());
//! counter.reset();
//! ```

mod batch;
mod retry;
mod sync_map;

pub use batch::{BatchConfig, BatchConfigError, BatchCounter, BatchDecision};
pub use retry::{RetryBudget, RetryVerdict};
pub use sync_map::{HasReferences, SyncMap, SyncMapError};
