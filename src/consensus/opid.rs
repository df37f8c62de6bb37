//! Operation identifiers.
//!
//! An [`OpId`] names one log entry as a `(term, index)` pair. Ordering is
//! lexicographic: term first, then index. The sentinel [`OpId::MIN`] is
//! `(0, 0)` and precedes every real entry.

use serde::{Deserialize, Serialize};

/// Identifier of a single replicated operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpId {
    /// Term under which the entry was created.
    pub term: i64,
    /// Position of the entry in the log.
    pub index: i64,
}

impl OpId {
    /// The minimum op id, `(0, 0)`. Precedes every real entry.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    /// The maximum op id. Follows every real entry.
    pub const MAX: OpId = OpId {
        term: i64::MAX,
        index: i64::MAX,
    };

    /// Build an op id from term and index.
    pub const fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }

    /// Whether this is the sentinel minimum.
    pub const fn is_min(self) -> bool {
        self.term == 0 && self.index == 0
    }

    /// The id of the next entry within the same term.
    pub const fn next_within_term(self) -> Self {
        Self {
            term: self.term,
            index: self.index + 1,
        }
    }

    /// Checks that `current` correctly follows `previous`: the term is the
    /// same or higher and the index is sequential.
    pub fn follows(previous: OpId, current: OpId) -> bool {
        current.term >= previous.term && current.index == previous.index + 1
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}
