//! In-memory [`IpSetManager`].
//!
//! Keeps the desired state in a [`SyncMap`] and a committed view of backend
//! identifiers. `apply_sets` moves the dirty diff into the committed view,
//! which is what a real backend would render into restore files or HNS calls.

use async_trait::async_trait;
use log::{debug, info, warn};
use npm_common::{HasReferences, SyncMap};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::{
    IpSet, IpSetError, IpSetManager, IpSetMetadata, ReferenceOwner, ReferenceType, Result,
    SetKind,
};
use crate::types::PodMetadata;

impl HasReferences for IpSet {
    type Owner = ReferenceOwner;
    type Kind = ReferenceType;

    fn add_reference(&mut self, owner: ReferenceOwner, kind: ReferenceType) -> bool {
        match kind {
            ReferenceType::Selector => self.selector_references.insert(owner),
            ReferenceType::NetPol => self.netpol_references.insert(owner),
        }
    }

    fn remove_reference(&mut self, owner: &ReferenceOwner, kind: ReferenceType) -> bool {
        match kind {
            ReferenceType::Selector => self.selector_references.remove(owner),
            ReferenceType::NetPol => self.netpol_references.remove(owner),
        }
    }

    fn reference_count(&self, kind: ReferenceType) -> usize {
        IpSet::reference_count(self, kind)
    }

    fn is_referenced(&self) -> bool {
        IpSet::is_referenced(self)
    }
}

/// Counters exposed for tests and the daemon's status log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSetManagerStats {
    pub applies: u64,
    pub sets_created: u64,
    pub sets_deleted: u64,
    pub sets_reconciled: u64,
}

#[derive(Default)]
struct State {
    sets: SyncMap<String, IpSet>,
    /// Created or modified since the last apply.
    dirty: BTreeSet<String>,
    /// Deleted since the last apply.
    deleted: BTreeSet<String>,
    /// Prefixed name → backend identifier of what has been pushed down.
    committed: HashMap<String, String>,
    stats: IpSetManagerStats,
}

impl State {
    fn ensure(&mut self, metadata: &IpSetMetadata) -> &mut IpSet {
        let name = metadata.prefixed_name();
        if !self.sets.contains_key(&name) {
            debug!("IpSetManager: creating set {}", name);
            self.stats.sets_created += 1;
            self.deleted.remove(&name);
            self.dirty.insert(name.clone());
        }
        self.sets
            .get_or_insert_with(name, || IpSet::new(metadata.clone()))
    }

    fn mark_dirty(&mut self, name: &str) {
        self.dirty.insert(name.to_string());
    }

    fn remove_set(&mut self, name: &str) {
        let Some(set) = self.sets.remove(&name.to_string()) else {
            return;
        };

        for list in &set.list_references {
            if let Some(list_set) = self.sets.get_mut(list) {
                list_set.member_sets.remove(name);
                self.dirty.insert(list.clone());
            }
        }
        for member in &set.member_sets {
            if let Some(member_set) = self.sets.get_mut(member) {
                member_set.list_references.remove(name);
            }
        }

        self.dirty.remove(name);
        self.deleted.insert(name.to_string());
        self.stats.sets_deleted += 1;
    }

    fn set_ips(&self, name: &str) -> Result<BTreeSet<String>> {
        let set = self
            .sets
            .get(&name.to_string())
            .ok_or_else(|| IpSetError::SetNotFound(name.to_string()))?;

        match set.kind() {
            SetKind::HashSet => Ok(set.ip_members.keys().cloned().collect()),
            SetKind::ListSet => Ok(set
                .member_sets
                .iter()
                .filter_map(|member| self.sets.get(member))
                .flat_map(|member| member.ip_members.keys().cloned())
                .collect()),
        }
    }
}

fn expect_kind(metadata: &IpSetMetadata, expected: SetKind) -> Result<()> {
    if metadata.kind() != expected {
        return Err(IpSetError::WrongKind {
            name: metadata.prefixed_name(),
            expected,
            actual: metadata.kind(),
        });
    }
    Ok(())
}

/// Reference [`IpSetManager`] holding everything in process memory.
#[derive(Default)]
pub struct InMemoryIpSetManager {
    state: Mutex<State>,
}

impl InMemoryIpSetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> IpSetManagerStats {
        self.state.lock().stats.clone()
    }

    /// Number of sets held in memory.
    pub fn set_count(&self) -> usize {
        self.state.lock().sets.len()
    }

    /// Prefixed names changed since the last apply.
    pub fn pending_changes(&self) -> usize {
        let state = self.state.lock();
        state.dirty.len() + state.deleted.len()
    }

    /// Backend identifier of a set as last pushed down.
    pub fn committed_name(&self, name: &str) -> Option<String> {
        self.state.lock().committed.get(name).cloned()
    }
}

#[async_trait]
impl IpSetManager for InMemoryIpSetManager {
    fn create_sets(&self, sets: &[IpSetMetadata]) {
        let mut state = self.state.lock();
        for metadata in sets {
            state.ensure(metadata);
        }
    }

    fn get_set(&self, name: &str) -> Option<IpSet> {
        self.state.lock().sets.get(&name.to_string()).cloned()
    }

    fn delete_set(&self, set: &IpSetMetadata, force: bool) -> Result<()> {
        let name = set.prefixed_name();
        let mut state = self.state.lock();

        let Some(existing) = state.sets.get(&name) else {
            debug!("IpSetManager: delete of unknown set {} ignored", name);
            return Ok(());
        };

        if !force && existing.is_referenced() {
            return Err(IpSetError::SetInUse {
                name,
                selector: existing.selector_references.len(),
                netpol: existing.netpol_references.len(),
                lists: existing.list_references.len(),
            });
        }
        if force && existing.is_referenced() {
            warn!("IpSetManager: force deleting referenced set {}", name);
        }

        state.remove_set(&name);
        Ok(())
    }

    fn add_reference(
        &self,
        set: &IpSetMetadata,
        owner: ReferenceOwner,
        ref_type: ReferenceType,
    ) -> Result<()> {
        let name = set.prefixed_name();
        let mut state = self.state.lock();
        let count = state
            .sets
            .add_reference(&name, owner, ref_type)
            .map_err(|_| IpSetError::SetNotFound(name.clone()))?;
        debug!("IpSetManager: {} now has {} {} references", name, count, ref_type);
        Ok(())
    }

    fn delete_reference(
        &self,
        set_name: &str,
        owner: &ReferenceOwner,
        ref_type: ReferenceType,
    ) -> Result<()> {
        let name = set_name.to_string();
        let mut state = self.state.lock();
        let count = state
            .sets
            .remove_reference(&name, owner, ref_type)
            .map_err(|_| IpSetError::SetNotFound(name.clone()))?;
        debug!("IpSetManager: {} has {} {} references left", name, count, ref_type);
        Ok(())
    }

    fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<()> {
        for metadata in sets {
            expect_kind(metadata, SetKind::HashSet)?;
        }
        if pod.pod_ip.is_empty() {
            return Err(IpSetError::InvalidMember {
                name: sets
                    .first()
                    .map(IpSetMetadata::prefixed_name)
                    .unwrap_or_default(),
                member: pod.pod_key.clone(),
                reason: "empty address".to_string(),
            });
        }

        let mut state = self.state.lock();
        for metadata in sets {
            let set = state.ensure(metadata);
            let previous = set
                .ip_members
                .insert(pod.pod_ip.clone(), pod.pod_key.clone());
            if previous.as_deref() != Some(pod.pod_key.as_str()) {
                let name = metadata.prefixed_name();
                state.mark_dirty(&name);
            }
        }
        Ok(())
    }

    fn remove_from_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<()> {
        let mut state = self.state.lock();
        for metadata in sets {
            let name = metadata.prefixed_name();
            let Some(set) = state.sets.get_mut(&name) else {
                debug!("IpSetManager: remove from unknown set {} skipped", name);
                continue;
            };

            match set.ip_members.get(&pod.pod_ip).cloned() {
                Some(owner) if owner == pod.pod_key => {
                    set.ip_members.remove(&pod.pod_ip);
                    state.mark_dirty(&name);
                }
                Some(owner) => {
                    debug!(
                        "IpSetManager: {} in {} owned by {}, not {}",
                        pod.pod_ip, name, owner, pod.pod_key
                    );
                }
                None => {}
            }
        }
        Ok(())
    }

    fn add_to_lists(&self, lists: &[IpSetMetadata], members: &[IpSetMetadata]) -> Result<()> {
        for list in lists {
            expect_kind(list, SetKind::ListSet)?;
        }
        for member in members {
            expect_kind(member, SetKind::HashSet)?;
        }

        let mut state = self.state.lock();
        for member in members {
            state.ensure(member);
        }
        for list in lists {
            let list_name = list.prefixed_name();
            state.ensure(list);
            for member in members {
                let member_name = member.prefixed_name();
                if let Some(list_set) = state.sets.get_mut(&list_name) {
                    list_set.member_sets.insert(member_name.clone());
                }
                if let Some(member_set) = state.sets.get_mut(&member_name) {
                    member_set.list_references.insert(list_name.clone());
                }
            }
            state.mark_dirty(&list_name);
        }
        Ok(())
    }

    fn remove_from_list(&self, list: &IpSetMetadata, members: &[IpSetMetadata]) -> Result<()> {
        let list_name = list.prefixed_name();
        let mut state = self.state.lock();
        let Some(list_set) = state.sets.get_mut(&list_name) else {
            debug!("IpSetManager: remove from unknown list {} skipped", list_name);
            return Ok(());
        };

        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            let member_name = member.prefixed_name();
            if list_set.member_sets.remove(&member_name) {
                removed.push(member_name);
            }
        }
        for member_name in &removed {
            if let Some(member_set) = state.sets.get_mut(member_name) {
                member_set.list_references.remove(&list_name);
            }
        }
        if !removed.is_empty() {
            state.mark_dirty(&list_name);
        }
        Ok(())
    }

    fn list_all(&self) -> HashMap<String, String> {
        self.state
            .lock()
            .sets
            .values()
            .map(|set| (set.name(), set.metadata.hashed_name()))
            .collect()
    }

    fn get_ips_from_selector_sets(&self, set_names: &[String]) -> Result<BTreeSet<String>> {
        let state = self.state.lock();
        let mut names = set_names.iter();
        let Some(first) = names.next() else {
            return Ok(BTreeSet::new());
        };

        let mut ips = state.set_ips(first)?;
        for name in names {
            let other = state.set_ips(name)?;
            ips.retain(|ip| other.contains(ip));
        }
        Ok(ips)
    }

    async fn apply_sets(&self, context: &str) -> Result<()> {
        let mut state = self.state.lock();
        let dirty = std::mem::take(&mut state.dirty);
        let deleted = std::mem::take(&mut state.deleted);

        for name in &dirty {
            if let Some(set) = state.sets.get(name) {
                let hashed = set.metadata.hashed_name();
                state.committed.insert(name.clone(), hashed);
            }
        }
        for name in &deleted {
            state.committed.remove(name);
        }
        state.stats.applies += 1;

        debug!(
            "IpSetManager: [{}] applied {} updated and {} deleted sets",
            context,
            dirty.len(),
            deleted.len()
        );
        Ok(())
    }

    async fn reconcile(&self) {
        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .sets
            .iter()
            .filter(|(_, set)| {
                !set.is_referenced() && set.ip_members.is_empty() && set.member_sets.is_empty()
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &stale {
            state.remove_set(name);
        }
        state.stats.sets_reconciled += stale.len() as u64;

        if !stale.is_empty() {
            info!("IpSetManager: reconcile removed {} unused sets", stale.len());
        }
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        let dropped = state.sets.len() + state.committed.len();
        state.sets.clear();
        state.dirty.clear();
        state.deleted.clear();
        state.committed.clear();
        if dropped > 0 {
            info!("IpSetManager: reset dropped all sets");
        }
        Ok(())
    }
}
