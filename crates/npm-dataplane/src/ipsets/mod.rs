//! Address set storage.
//!
//! The orchestrator talks to set storage only through [`IpSetManager`]. The
//! manager owns its locking, reference counts and the diff between desired
//! and committed state; `apply_sets` pushes that diff down.

mod memory;
mod types;

pub use memory::{InMemoryIpSetManager, IpSetManagerStats};
pub use types::{
    hashed_set_name, members_of_translated_set, IpSet, IpSetMetadata, ReferenceOwner,
    ReferenceType, SetKind, SetType, TranslatedIpSet,
};

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use crate::types::PodMetadata;

/// Error type for address set operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpSetError {
    /// Distinguishable so reference release can tolerate torn-down sets.
    #[error("Set not found: {0}")]
    SetNotFound(String),

    #[error("Set {name} still referenced ({selector} selector, {netpol} netpol, {lists} list)")]
    SetInUse {
        name: String,
        selector: usize,
        netpol: usize,
        lists: usize,
    },

    #[error("Set {name} is a {actual:?}, expected a {expected:?}")]
    WrongKind {
        name: String,
        expected: SetKind,
        actual: SetKind,
    },

    #[error("Invalid member {member} for set {name}: {reason}")]
    InvalidMember {
        name: String,
        member: String,
        reason: String,
    },

    #[error("Apply failed: {0}")]
    ApplyFailed(String),
}

impl IpSetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, IpSetError::SetNotFound(_))
    }
}

/// Result type for address set operations.
pub type Result<T> = std::result::Result<T, IpSetError>;

/// Set and list storage with reference counting and diff-based apply.
///
/// In-memory operations are synchronous and cheap; only the calls that
/// talk to the packet filter are async.
#[async_trait]
pub trait IpSetManager: Send + Sync {
    /// Creates the sets that do not exist yet.
    fn create_sets(&self, sets: &[IpSetMetadata]);

    /// Snapshot of one set by prefixed name.
    fn get_set(&self, name: &str) -> Option<IpSet>;

    /// Deletes a set. Without `force` the set must be unreferenced.
    fn delete_set(&self, set: &IpSetMetadata, force: bool) -> Result<()>;

    /// Records a reference. Fails with [`IpSetError::SetNotFound`] if the set
    /// does not exist.
    fn add_reference(
        &self,
        set: &IpSetMetadata,
        owner: ReferenceOwner,
        ref_type: ReferenceType,
    ) -> Result<()>;

    /// Drops a reference. Fails with [`IpSetError::SetNotFound`] if the set
    /// does not exist; dropping a reference that is not held is a no-op.
    fn delete_reference(
        &self,
        set_name: &str,
        owner: &ReferenceOwner,
        ref_type: ReferenceType,
    ) -> Result<()>;

    /// Adds the pod's address to every set, creating missing ones.
    fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<()>;

    /// Removes the pod's address from every set. Missing sets and addresses
    /// owned by another pod key are skipped.
    fn remove_from_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<()>;

    /// Adds member sets to every list, creating missing lists and members.
    fn add_to_lists(&self, lists: &[IpSetMetadata], members: &[IpSetMetadata]) -> Result<()>;

    /// Removes member sets from a list. A missing list is skipped.
    fn remove_from_list(&self, list: &IpSetMetadata, members: &[IpSetMetadata]) -> Result<()>;

    /// Prefixed name → backend identifier for every set.
    fn list_all(&self) -> HashMap<String, String>;

    /// Addresses present in every named selector set, list sets expanded.
    fn get_ips_from_selector_sets(&self, set_names: &[String]) -> Result<BTreeSet<String>>;

    /// Pushes pending set changes down.
    async fn apply_sets(&self, context: &str) -> Result<()>;

    /// Garbage collects sets nothing references any more.
    async fn reconcile(&self);

    /// Drops every set, in memory and in the packet filter.
    async fn reset(&self) -> Result<()>;
}
