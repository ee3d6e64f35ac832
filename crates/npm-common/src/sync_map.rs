//! Map wrapper that never creates entries implicitly.
//!
//! Reference tracking on address sets is the place where an implicit insert
//! hurts the most: a `DeleteReference` on a set that was already torn down
//! must not bring the set back with an empty reference table. `SyncMap`
//! only ever inserts through `insert` or the explicit `get_or_insert*`
//! methods, and the reference helpers fail with [`SyncMapError::KeyNotFound`]
//! instead of creating the entry.

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Error type for SyncMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key not found")]
    KeyNotFound,
}

/// Trait for values that hold owner references partitioned by kind.
///
/// An owner holds at most one reference of a given kind on a value, so adding
/// the same `(owner, kind)` twice is a no-op and the count reported by
/// [`HasReferences::reference_count`] is the number of distinct owners.
pub trait HasReferences {
    /// Identity of whoever holds the reference.
    type Owner: Eq + Hash + Clone;
    /// Partition of the references (for address sets: selector vs rule).
    type Kind: Copy + Eq;

    /// Records a reference. Returns false if it was already held.
    fn add_reference(&mut self, owner: Self::Owner, kind: Self::Kind) -> bool;

    /// Drops a reference. Returns false if it was not held.
    fn remove_reference(&mut self, owner: &Self::Owner, kind: Self::Kind) -> bool;

    /// Number of distinct owners holding a reference of `kind`.
    fn reference_count(&self, kind: Self::Kind) -> usize;

    /// True if any reference of any kind is held.
    fn is_referenced(&self) -> bool;
}

/// A map wrapper that prevents auto-vivification.
///
/// # Example
///
/// ```
/// use npm_common::SyncMap;
///
/// let mut map: SyncMap<String, i32> = SyncMap::new();
///
/// assert!(map.get(&"missing".to_string()).is_none());
/// assert!(map.is_empty());
///
/// map.insert("key".to_string(), 42);
/// assert_eq!(map.get(&"key".to_string()), Some(&42));
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the value for `key`. **Never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns the value for `key` mutably. **Never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    /// Gets the value for a key, or inserts the result of `f`.
    ///
    /// Unlike `get()`, this **will** create an entry. Use it where creation
    /// is the intent (e.g. `CreateSets`).
    pub fn get_or_insert_with<F>(&mut self, key: K, f: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        self.inner.entry(key).or_insert_with(f)
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: HasReferences,
{
    /// Adds a reference on an existing entry and returns the new count for
    /// that kind.
    pub fn add_reference(
        &mut self,
        key: &K,
        owner: V::Owner,
        kind: V::Kind,
    ) -> Result<usize, SyncMapError> {
        let entry = self.inner.get_mut(key).ok_or(SyncMapError::KeyNotFound)?;
        entry.add_reference(owner, kind);
        Ok(entry.reference_count(kind))
    }

    /// Drops a reference on an existing entry and returns the remaining count
    /// for that kind. Dropping a reference that is not held is a no-op.
    pub fn remove_reference(
        &mut self,
        key: &K,
        owner: &V::Owner,
        kind: V::Kind,
    ) -> Result<usize, SyncMapError> {
        let entry = self.inner.get_mut(key).ok_or(SyncMapError::KeyNotFound)?;
        entry.remove_reference(owner, kind);
        Ok(entry.reference_count(kind))
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
