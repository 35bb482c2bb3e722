//! DIFC labels and agent state.
//!
//! A label is an unordered set of tags. Agents accumulate tags as they read
//! labeled data; the accumulated state never shrinks within a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// An unordered set of tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(BTreeSet<String>);

impl Label {
    /// The empty label.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a label from tags.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    /// Add a tag.
    pub fn insert(&mut self, tag: impl Into<String>) {
        self.0.insert(tag.into());
    }

    /// Merge every tag of `other` into this label.
    pub fn union_with(&mut self, other: &Self) {
        for tag in &other.0 {
            self.0.insert(tag.clone());
        }
    }

    /// Whether every tag of this label appears in `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Tags of this label missing from `other`, in deterministic order.
    pub fn missing_from(&self, other: &Self) -> Vec<String> {
        self.0.difference(&other.0).cloned().collect()
    }

    /// Whether the label carries no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the label contains `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// Iterate over the tags.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Label {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_tags(iter)
    }
}

/// What a tool invocation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// The invocation only reads
    Read,
    /// The invocation only writes
    Write,
    /// The invocation both reads and writes
    ReadWrite,
}

impl OperationKind {
    /// Whether the operation has a read component.
    pub fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether the operation has a write component.
    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Accumulated `(secrecy, integrity)` state of one agent.
///
/// Grows monotonically over a session as the agent reads labeled data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentState {
    /// Secrecy tags the agent has acquired
    pub secrecy: Label,
    /// Integrity tags the agent has acquired
    pub integrity: Label,
}

impl AgentState {
    /// Merge a pair of labels into the state. Never removes tags.
    pub fn absorb(&mut self, secrecy: &Label, integrity: &Label) {
        self.secrecy.union_with(secrecy);
        self.integrity.union_with(integrity);
    }
}

/// A labeled resource about to be touched by a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledResource {
    /// Human-readable description, used in denial reasons
    pub description: String,
    /// Secrecy label of the resource
    pub secrecy: Label,
    /// Integrity label of the resource
    pub integrity: Label,
    /// What the invocation does to the resource
    pub operation: OperationKind,
}

impl LabeledResource {
    /// An unlabeled resource; every policy check trivially passes.
    pub fn unlabeled(description: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            description: description.into(),
            secrecy: Label::empty(),
            integrity: Label::empty(),
            operation,
        }
    }
}

/// One labeled item of response data.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledItem {
    /// The item payload as it appears in the backend response
    pub value: Value,
    /// Secrecy label
    pub secrecy: Label,
    /// Integrity label
    pub integrity: Label,
}

/// A labeled collection: a sequence of labeled items plus an overall label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionLabeledData {
    /// The labeled items
    pub items: Vec<LabeledItem>,
    /// Overall secrecy label of the collection
    pub secrecy: Label,
    /// Overall integrity label of the collection
    pub integrity: Label,
}

/// Labeled response data produced by a guard.
#[derive(Debug, Clone, PartialEq)]
pub enum LabeledData {
    /// One labeled value
    Single(LabeledItem),
    /// A labeled collection, eligible for fine-grained filtering
    Collection(CollectionLabeledData),
}
