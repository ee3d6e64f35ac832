//! Per-pod queue of pending endpoint updates.
//!
//! One entry per pod key and address; enqueueing for a pod already queued at
//! the same address merges the deltas instead of adding a second entry. A pod
//! re-created on a new address gets a separate entry, so changes meant for
//! the old endpoint are never applied to the new one. Failed entries are
//! requeued against a [`RetryBudget`] and become dead letters once it is
//! spent; only the most recent dead letters are kept.

use log::debug;
use npm_common::{RetryBudget, RetryVerdict};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::ipsets::IpSetMetadata;
use crate::types::{PodKey, PodMetadata};

/// Dead letters kept for inspection; older ones are dropped first.
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 256;

/// Pod key and address an entry is queued under.
type QueueKey = (PodKey, String);

/// Accumulated set membership changes of one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPodUpdate {
    pub pod: PodMetadata,
    /// Prefixed name → set the pod joined.
    pub sets_to_add: BTreeMap<String, IpSetMetadata>,
    /// Prefixed name → set the pod left.
    pub sets_to_remove: BTreeMap<String, IpSetMetadata>,
    /// Failed drain attempts so far.
    pub attempts: u32,
}

impl QueuedPodUpdate {
    fn new(pod: PodMetadata) -> Self {
        Self {
            pod,
            sets_to_add: BTreeMap::new(),
            sets_to_remove: BTreeMap::new(),
            attempts: 0,
        }
    }

    fn key(&self) -> QueueKey {
        queue_key(&self.pod)
    }

    fn add_sets(&mut self, sets: &[IpSetMetadata]) {
        for set in sets {
            let name = set.prefixed_name();
            self.sets_to_remove.remove(&name);
            self.sets_to_add.insert(name, set.clone());
        }
    }

    fn remove_sets(&mut self, sets: &[IpSetMetadata]) {
        for set in sets {
            let name = set.prefixed_name();
            self.sets_to_add.remove(&name);
            self.sets_to_remove.insert(name, set.clone());
        }
    }
}

fn queue_key(pod: &PodMetadata) -> QueueKey {
    (pod.pod_key.clone(), pod.pod_ip.clone())
}

/// FIFO of [`QueuedPodUpdate`] keyed by pod key and address.
#[derive(Debug)]
pub struct UpdatePodQueue {
    entries: HashMap<QueueKey, QueuedPodUpdate>,
    order: VecDeque<QueueKey>,
    budget: RetryBudget,
    dead_letters: VecDeque<QueuedPodUpdate>,
    dead_letter_limit: usize,
}

impl UpdatePodQueue {
    pub fn new(capacity: usize, budget: RetryBudget) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            budget,
            dead_letters: VecDeque::new(),
            dead_letter_limit: DEFAULT_DEAD_LETTER_LIMIT,
        }
    }

    /// Caps the dead letters kept. Zero keeps none.
    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pod_key: &str, pod_ip: &str) -> Option<&QueuedPodUpdate> {
        self.entries.get(&(pod_key.to_string(), pod_ip.to_string()))
    }

    /// Pod keys in drain order. A pod queued under two addresses shows up
    /// twice.
    pub fn pod_keys(&self) -> Vec<PodKey> {
        self.order
            .iter()
            .filter(|key| self.entries.contains_key(*key))
            .map(|(pod_key, _)| pod_key.clone())
            .collect()
    }

    /// Most recent dead letters, oldest first.
    pub fn dead_letters(&self) -> &VecDeque<QueuedPodUpdate> {
        &self.dead_letters
    }

    fn entry(&mut self, pod: &PodMetadata) -> &mut QueuedPodUpdate {
        let key = queue_key(pod);
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries
            .entry(key)
            .or_insert_with(|| QueuedPodUpdate::new(pod.clone()))
    }

    pub fn enqueue_add(&mut self, pod: &PodMetadata, sets: &[IpSetMetadata]) {
        self.entry(pod).add_sets(sets);
    }

    pub fn enqueue_remove(&mut self, pod: &PodMetadata, sets: &[IpSetMetadata]) {
        self.entry(pod).remove_sets(sets);
    }

    /// Pops the oldest entry.
    pub fn dequeue(&mut self) -> Option<QueuedPodUpdate> {
        while let Some(key) = self.order.pop_front() {
            if let Some(update) = self.entries.remove(&key) {
                return Some(update);
            }
        }
        None
    }

    /// Puts a failed entry back, or dead-letters it once its budget is spent.
    ///
    /// If the pod was enqueued again at the same address in the meantime, the
    /// newer deltas win over the failed ones.
    pub fn requeue(&mut self, mut update: QueuedPodUpdate) -> RetryVerdict {
        let verdict = self.budget.record_failure(&mut update.attempts);
        if verdict.is_exhausted() {
            self.push_dead_letter(update);
            return verdict;
        }

        let key = update.key();
        match self.entries.get_mut(&key) {
            Some(newer) => {
                for (name, set) in update.sets_to_add {
                    if !newer.sets_to_remove.contains_key(&name) {
                        newer.sets_to_add.entry(name).or_insert(set);
                    }
                }
                for (name, set) in update.sets_to_remove {
                    if !newer.sets_to_add.contains_key(&name) {
                        newer.sets_to_remove.entry(name).or_insert(set);
                    }
                }
                newer.attempts = newer.attempts.max(update.attempts);
            }
            None => {
                self.order.push_back(key.clone());
                self.entries.insert(key, update);
            }
        }
        verdict
    }

    fn push_dead_letter(&mut self, update: QueuedPodUpdate) {
        if self.dead_letter_limit == 0 {
            return;
        }
        while self.dead_letters.len() >= self.dead_letter_limit {
            if let Some(dropped) = self.dead_letters.pop_front() {
                debug!("UpdatePodQueue: dropping oldest dead letter for {}", dropped.pod);
            }
        }
        self.dead_letters.push_back(update);
    }
}
