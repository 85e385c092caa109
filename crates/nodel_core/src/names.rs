//! Name reduction and wildcard filter matching.
//!
//! Node, action and event names are compared by their reduced form: letters
//! and digits only, lower-cased. `"Kitchen Light #1"` and `"kitchen-light-1"`
//! name the same thing. The original spelling is kept for display.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

pub const WILDCARD: char = '*';

/// Strips everything that is not a letter or digit. Case is preserved.
pub fn reduce(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// The canonical comparison key: letters and digits only, lower-cased.
pub fn reduce_to_lower(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Like [`reduce_to_lower`] but keeps the `*` wildcard.
pub fn reduce_filter(filter: &str) -> String {
    filter
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == WILDCARD)
        .flat_map(char::to_lowercase)
        .collect()
}

/// Exact match on reduced keys. Absent names never match anything.
pub fn name_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => reduce_to_lower(a) == reduce_to_lower(b),
        _ => false,
    }
}

/// Ordered, unanchored wildcard match.
///
/// The reduced filter is split on `*` into literal cards. Each card must be
/// found in the reduced text, searching only the part after the previous
/// card's match. Cards are never anchored to the start or end of the text,
/// so `"Lamp*"`, `"*Lamp"` and `"Lamp"` all mean "contains lamp".
pub fn filter_match(text: &str, filter: &str) -> bool {
    let text = reduce_to_lower(text);
    let filter = reduce_filter(filter);

    let mut rest = text.as_str();
    for card in filter.split(WILDCARD).filter(|card| !card.is_empty()) {
        match rest.find(card) {
            Some(i) => rest = &rest[i + card.len()..],
            None => return false,
        }
    }
    true
}

/// A name whose identity is its reduced key.
///
/// Equality, ordering and hashing only look at the reduced key; the original
/// string is carried along for display and serialization.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeName {
    original: String,
    reduced: String,
}

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        let original = name.into();
        let reduced = reduce_to_lower(&original);
        Self { original, reduced }
    }

    /// The name as it was given.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// The comparison key.
    pub fn reduced(&self) -> &str {
        &self.reduced
    }

    /// True when nothing survives reduction, e.g. `"--"` or `""`.
    pub fn is_empty(&self) -> bool {
        self.reduced.is_empty()
    }

    pub fn matches(&self, filter: &str) -> bool {
        filter_match(&self.original, filter)
    }
}

impl PartialEq for NodeName {
    fn eq(&self, other: &Self) -> bool {
        self.reduced == other.reduced
    }
}

impl Eq for NodeName {}

impl Hash for NodeName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reduced.hash(state);
    }
}

impl PartialOrd for NodeName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reduced.cmp(&other.reduced)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({:?})", self.original)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&NodeName> for NodeName {
    fn from(name: &NodeName) -> Self {
        name.clone()
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.original
    }
}
