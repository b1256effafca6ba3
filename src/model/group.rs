//! In-core newsgroup records and the per-user seen bitmap.

use super::place::ArtNo;

/// Status flags for a group, split between what the active file itself
/// says and the administrative overlay file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupFlags {
    /// Postings must go through a moderator.
    pub moderated: bool,
    /// The group is local to this site (no `.` in its name).
    pub local: bool,
    /// The group has been removed and awaits deletion.
    pub removed: bool,
    /// Articles arrived since the last load (cleared once the seen
    /// bitmap has been reconciled).
    pub changed: bool,
    /// Admin overlay: articles in this group age out quickly.
    pub volatile: bool,
    /// Admin overlay: expired articles are archived rather than dropped.
    pub archived: bool,
    /// Admin overlay: article bodies are stored compressed.
    pub compressed: bool,
    /// Admin overlay: ignore explicit Expires headers.
    pub ignore_expiry: bool,
    /// Admin overlay: apply expiration-by-ageing to this group.
    pub expire_by_age: bool,
}

/// Per-user subscription state, populated by the newsrc layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubState {
    /// The group appeared in the user's subscription file.
    pub noted: bool,
    /// The group line used the unsubscribe separator.
    pub unsubscribed: bool,
    /// The user unsubscribed during this session; takes effect on write.
    pub drop_pending: bool,
    /// The session has visited this group at least once.
    pub visited: bool,
}

impl SubState {
    /// Whether traversal should enter this group. Groups absent from the
    /// subscription file default to subscribed.
    pub fn is_subscribed(&self) -> bool {
        !self.unsubscribed && !self.drop_pending
    }
}

/// One element of the in-core active table.
///
/// Invariant: `min <= max + 1`; a group with no articles has
/// `min == max + 1`.
#[derive(Debug, Clone, Default)]
pub struct GroupRecord {
    /// Group name, unique within the table.
    pub name: String,
    /// Hash-chain link: 1-based index of the next record in this record's
    /// bucket, 0 for end of chain. An index, not a pointer, so the record
    /// arena can reallocate safely.
    pub(crate) next_in_bucket: u32,
    /// Highest active article number.
    pub max: ArtNo,
    /// Lowest active article number.
    pub min: ArtNo,
    pub flags: GroupFlags,
    /// Unix timestamp of the last posting (0 = unknown).
    pub last_post: i64,
    /// Per-group expiry period in seconds, from the admin overlay.
    pub expire_after: Option<i64>,
    /// Byte offset of this group's line in the active file, for in-place
    /// single-record rewrites.
    pub file_offset: u64,
    /// Count of unread articles, maintained incrementally by the bitmap
    /// codec.
    pub unread: u64,
    pub sub: SubState,
    /// Seen bits, allocated lazily on the first mark.
    pub seen: Option<Bitmap>,
}

impl GroupRecord {
    /// Number of active articles (`min <= max + 1` makes this safe).
    pub fn article_count(&self) -> u64 {
        self.max + 1 - self.min
    }

    pub fn in_range(&self, article: ArtNo) -> bool {
        article >= self.min && article <= self.max
    }
}

/// Word-packed seen bits with a base article number fixed at allocation.
///
/// Bit `n` covers article `base + n`. The map grows on demand when marks
/// land past the end; articles below `base` are always reported unseen
/// (they were below the group floor when the map was allocated, so they
/// can only be expired ones).
#[derive(Debug, Clone, Default)]
pub struct Bitmap {
    base: ArtNo,
    words: Vec<u64>,
}

impl Bitmap {
    /// Allocate a map covering `count` articles starting at `base`.
    pub fn sized(base: ArtNo, count: u64) -> Self {
        let words = ((count + 63) / 64) as usize;
        Self {
            base,
            words: vec![0; words],
        }
    }

    pub fn base(&self) -> ArtNo {
        self.base
    }

    fn slot(&self, article: ArtNo) -> Option<(usize, u32)> {
        if article < self.base {
            return None;
        }
        let off = article - self.base;
        Some(((off / 64) as usize, (off % 64) as u32))
    }

    pub fn get(&self, article: ArtNo) -> bool {
        match self.slot(article) {
            Some((w, b)) if w < self.words.len() => self.words[w] >> b & 1 != 0,
            _ => false,
        }
    }

    pub fn set(&mut self, article: ArtNo) {
        if let Some((w, b)) = self.slot(article) {
            if w >= self.words.len() {
                self.words.resize(w + 1, 0);
            }
            self.words[w] |= 1 << b;
        }
    }

    pub fn clear(&mut self, article: ArtNo) {
        if let Some((w, b)) = self.slot(article) {
            if w < self.words.len() {
                self.words[w] &= !(1 << b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_set_get_clear() {
        let mut map = Bitmap::sized(10, 20);
        assert!(!map.get(10));
        map.set(10);
        map.set(29);
        assert!(map.get(10));
        assert!(map.get(29));
        map.clear(10);
        assert!(!map.get(10));
    }

    #[test]
    fn test_bitmap_below_base_is_unseen() {
        let mut map = Bitmap::sized(100, 5);
        map.set(99); // silently ignored
        assert!(!map.get(99));
    }

    #[test]
    fn test_bitmap_grows_past_end() {
        let mut map = Bitmap::sized(1, 10);
        map.set(500);
        assert!(map.get(500));
        assert!(!map.get(499));
    }

    #[test]
    fn test_empty_group_article_count() {
        let grp = GroupRecord {
            min: 11,
            max: 10,
            ..Default::default()
        };
        assert_eq!(grp.article_count(), 0);
    }
}
