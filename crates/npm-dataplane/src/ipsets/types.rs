//! Address set identity, kinds and reference bookkeeping types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::types::{PodKey, PolicyKey};

/// Set kind as seen by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetKind {
    /// Holds addresses (or CIDR blocks).
    HashSet,
    /// Holds other hash sets.
    ListSet,
}

/// What an address set is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SetType {
    /// All pods of a namespace.
    Namespace,
    /// Pods carrying a label key.
    KeyLabelOfPod,
    /// Pods carrying a label key=value.
    KeyValueLabelOfPod,
    /// Pods exposing a named port.
    NamedPorts,
    /// Namespaces carrying a label key (list of namespace sets).
    KeyLabelOfNamespace,
    /// Namespaces carrying a label key=value (list of namespace sets).
    KeyValueLabelOfNamespace,
    /// Pods matching several label expressions (list of label sets).
    NestedLabelOfPod,
    /// CIDR blocks from an ipBlock peer.
    CidrBlocks,
}

impl SetType {
    pub fn kind(&self) -> SetKind {
        match self {
            SetType::KeyLabelOfNamespace
            | SetType::KeyValueLabelOfNamespace
            | SetType::NestedLabelOfPod => SetKind::ListSet,
            SetType::Namespace
            | SetType::KeyLabelOfPod
            | SetType::KeyValueLabelOfPod
            | SetType::NamedPorts
            | SetType::CidrBlocks => SetKind::HashSet,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            SetType::Namespace => "ns-",
            SetType::KeyLabelOfPod | SetType::KeyValueLabelOfPod => "podlabel-",
            SetType::NamedPorts => "namedport:",
            SetType::KeyLabelOfNamespace | SetType::KeyValueLabelOfNamespace => "nslabel-",
            SetType::NestedLabelOfPod => "nestedlabel-",
            SetType::CidrBlocks => "cidr-",
        }
    }
}

/// Identity of an address set: name plus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpSetMetadata {
    pub name: String,
    pub set_type: SetType,
}

impl IpSetMetadata {
    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        Self {
            name: name.into(),
            set_type,
        }
    }

    /// Name including the type prefix; this is the key every manager uses.
    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.set_type.prefix(), self.name)
    }

    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }

    /// Backend identifier of the set. Stable for a given prefixed name.
    pub fn hashed_name(&self) -> String {
        hashed_set_name(&self.prefixed_name())
    }
}

impl fmt::Display for IpSetMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefixed_name())
    }
}

/// FNV-1a over the prefixed name, rendered the way backend set names look.
pub fn hashed_set_name(prefixed_name: &str) -> String {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = prefixed_name
        .bytes()
        .fold(OFFSET, |acc, b| (acc ^ u32::from(b)).wrapping_mul(PRIME));
    format!("azure-npm-{}", hash)
}

/// Why a reference is held on a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    /// The set implements a policy's endpoint selector.
    Selector,
    /// A policy's rule body names the set.
    NetPol,
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceType::Selector => write!(f, "Selector"),
            ReferenceType::NetPol => write!(f, "NetPol"),
        }
    }
}

/// Who holds a reference.
///
/// Temporary references keep a set alive between a policy's release and the
/// next batched rule commit. Being a separate variant, they can never collide
/// with a real policy key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReferenceOwner {
    Policy(PolicyKey),
    Temporary(PolicyKey),
}

impl ReferenceOwner {
    pub fn policy(key: impl Into<String>) -> Self {
        ReferenceOwner::Policy(key.into())
    }

    pub fn temporary(key: impl Into<String>) -> Self {
        ReferenceOwner::Temporary(key.into())
    }

    pub fn policy_key(&self) -> &str {
        match self {
            ReferenceOwner::Policy(key) | ReferenceOwner::Temporary(key) => key,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ReferenceOwner::Temporary(_))
    }
}

impl fmt::Display for ReferenceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceOwner::Policy(key) => write!(f, "{}", key),
            ReferenceOwner::Temporary(key) => write!(f, "temporary({})", key),
        }
    }
}

/// A set plus the literal members one policy's translation contributed.
///
/// Only used while adding or releasing that policy's references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedIpSet {
    pub metadata: IpSetMetadata,
    /// CIDR blocks for [`SetType::CidrBlocks`], member set names otherwise.
    pub members: Vec<String>,
}

impl TranslatedIpSet {
    pub fn new(metadata: IpSetMetadata) -> Self {
        Self {
            metadata,
            members: Vec::new(),
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }
}

/// Member sets of a nested translated set. Nested members are always plain
/// pod label sets.
pub fn members_of_translated_set(set: &TranslatedIpSet) -> Vec<IpSetMetadata> {
    set.members
        .iter()
        .map(|name| IpSetMetadata::new(name.clone(), SetType::KeyValueLabelOfPod))
        .collect()
}

/// Point-in-time view of a set as held by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSet {
    pub metadata: IpSetMetadata,
    /// Address (or CIDR) → pod key that contributed it. Empty key for CIDRs.
    pub ip_members: BTreeMap<String, PodKey>,
    /// Prefixed names of member sets (list sets only).
    pub member_sets: BTreeSet<String>,
    pub selector_references: HashSet<ReferenceOwner>,
    pub netpol_references: HashSet<ReferenceOwner>,
    /// Prefixed names of lists that contain this set.
    pub list_references: BTreeSet<String>,
}

impl IpSet {
    pub fn new(metadata: IpSetMetadata) -> Self {
        Self {
            metadata,
            ip_members: BTreeMap::new(),
            member_sets: BTreeSet::new(),
            selector_references: HashSet::new(),
            netpol_references: HashSet::new(),
            list_references: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> String {
        self.metadata.prefixed_name()
    }

    pub fn kind(&self) -> SetKind {
        self.metadata.kind()
    }

    /// Sorted members: addresses for hash sets, member set names for lists.
    pub fn members(&self) -> Vec<String> {
        match self.kind() {
            SetKind::HashSet => self.ip_members.keys().cloned().collect(),
            SetKind::ListSet => self.member_sets.iter().cloned().collect(),
        }
    }

    pub fn reference_count(&self, ref_type: ReferenceType) -> usize {
        match ref_type {
            ReferenceType::Selector => self.selector_references.len(),
            ReferenceType::NetPol => self.netpol_references.len(),
        }
    }

    /// True if any policy or temporary reference, or any list, holds the set.
    pub fn is_referenced(&self) -> bool {
        !self.selector_references.is_empty()
            || !self.netpol_references.is_empty()
            || !self.list_references.is_empty()
    }
}
