//! Capability tags and capability sets
//!
//! Capabilities are opaque tags. Matching is exact string equality after
//! trimming; a task is eligible for an agent when the agent's set is a
//! superset of the task's required set.

use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Longest accepted capability tag, in bytes.
pub const MAX_CAPABILITY_LEN: usize = 128;

/// A single capability tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    /// Parse a tag, trimming surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let tag = raw.trim();
        if tag.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "capabilities".to_string(),
                reason: "capability tags must not be empty".to_string(),
            });
        }
        if tag.len() > MAX_CAPABILITY_LEN {
            return Err(ValidationError::InvalidValue {
                field: "capabilities".to_string(),
                reason: format!("capability tag exceeds {} bytes", MAX_CAPABILITY_LEN),
            });
        }
        Ok(Self(tag.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Capability {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered, de-duplicated set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw tags. Fails on the first invalid tag.
    pub fn from_tags<I, S>(tags: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter()
            .map(|t| Capability::parse(t.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    /// True when every capability in `required` is present here.
    ///
    /// The empty set is a subset of everything, so a task with no
    /// requirements is eligible for any registered agent.
    pub fn is_superset_of(&self, required: &CapabilitySet) -> bool {
        self.0.is_superset(&required.0)
    }

    /// Number of capabilities held beyond `required`. Lower means a more
    /// specific match.
    pub fn extra_over(&self, required: &CapabilitySet) -> usize {
        self.0.difference(&required.0).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tags as plain strings, sorted.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().map(|c| c.0.clone()).collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::collections::btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
