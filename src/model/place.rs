//! Typed article locations.

use std::fmt;

/// Article numbers within a group.
///
/// The on-disk active format reserves nine decimal digits per field, so
/// anything representable there fits comfortably in a `u64`.
pub type ArtNo = u64;

/// Largest article number the fixed-width active format can hold.
pub const MAX_ARTICLE: ArtNo = 999_999_999;

/// Typed index into the active table's record arena.
///
/// Group records are referenced by index, never by pointer, so the arena
/// may grow and reallocate without invalidating hash chains or trail
/// entries that point into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u32);

impl GroupId {
    /// Zero-based position of the record in the table.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(idx: usize) -> Self {
        Self(idx as u32)
    }
}

/// A (group, article-number) pair: where one copy of an article lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Place {
    pub group: GroupId,
    pub article: ArtNo,
}

impl Place {
    pub fn new(group: GroupId, article: ArtNo) -> Self {
        Self { group, article }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}/{}", self.group.0, self.article)
    }
}
