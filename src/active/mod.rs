//! The active index: an in-core, hash-accelerated table of newsgroup
//! records, rebuilt incrementally from the flat active file.
//!
//! `load` may be called repeatedly within one process to pick up
//! concurrent posting activity; names already present are reconciled
//! through a caller-supplied [`MergePolicy`] so session-local state
//! (seen bitmaps, subscription flags) survives the reload.

pub mod admin;
pub mod file;

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{NewsError, Result};
use crate::model::{ArtNo, GroupId, GroupRecord};

/// Number of hash buckets for name lookup. Chains stay short up to a few
/// thousand groups.
const BUCKETS: usize = 2007;

/// Hook for reconciling an in-core group record with its freshly loaded
/// replacement. The new record arrives with empty session state; the
/// policy may copy or rebuild bitmaps and subscription flags from the
/// old one. Return `true` if the group materially changed.
pub trait MergePolicy {
    fn reconcile(&self, new: &mut GroupRecord, old: &GroupRecord) -> bool;
}

/// Sequential cursor position over the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeFirst,
    At(u32),
    AfterLast,
}

/// The in-core active table.
///
/// Records live in an arena indexed by [`GroupId`]; the name hash chains
/// link records through 1-based indices stored in the records themselves,
/// so growing the arena never invalidates a chain.
#[derive(Debug)]
pub struct ActiveTable {
    path: PathBuf,
    records: Vec<GroupRecord>,
    buckets: Vec<u32>,
    cursor: Cursor,
    /// Current article number within the cursor's group; maintained by
    /// the traversal layer.
    pub article: ArtNo,
    load_count: u32,
}

fn bucket_of(name: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() % BUCKETS as u64) as usize
}

impl ActiveTable {
    /// Open the active file and perform the initial load.
    ///
    /// A missing file is fatal: the system cannot function without the
    /// active index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(NewsError::ActiveMissing(path));
        }
        let mut table = Self {
            path,
            records: Vec::new(),
            buckets: vec![0; BUCKETS],
            cursor: Cursor::BeforeFirst,
            article: 0,
            load_count: 0,
        };
        table.load(None)?;
        Ok(table)
    }

    /// File the table was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the active file, merging into the existing table.
    ///
    /// Returns how many groups are new or materially changed. A corrupt
    /// line aborts the whole load: no partial state is tolerated.
    pub fn load(&mut self, policy: Option<&dyn MergePolicy>) -> Result<usize> {
        let file = File::open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NewsError::ActiveMissing(self.path.clone())
            } else {
                NewsError::io(&self.path, e)
            }
        })?;
        let mut reader = BufReader::new(file);

        let mut changed = 0usize;
        let mut offset = 0u64;
        let mut line_no = 0u64;
        let mut line = String::new();

        loop {
            line.clear();
            let len = reader
                .read_line(&mut line)
                .map_err(|e| NewsError::io(&self.path, e))? as u64;
            if len == 0 {
                break;
            }
            line_no += 1;
            if line.trim().is_empty() {
                offset += len;
                continue;
            }

            let mut hold = file::parse_line(line.trim_end(), line_no)?;
            hold.file_offset = offset;
            offset += len;

            if self.load_count > 0 {
                if let Some(id) = self.find(&hold.name) {
                    let old = &self.records[id.index()];
                    // Admin overlay flags and the hash link are not on the
                    // active line; carry them across the replace.
                    hold.flags.volatile = old.flags.volatile;
                    hold.flags.archived = old.flags.archived;
                    hold.flags.compressed = old.flags.compressed;
                    hold.flags.ignore_expiry = old.flags.ignore_expiry;
                    hold.flags.expire_by_age = old.flags.expire_by_age;
                    hold.flags.removed |= old.flags.removed;
                    hold.expire_after = old.expire_after;
                    hold.next_in_bucket = old.next_in_bucket;

                    if let Some(policy) = policy {
                        if policy.reconcile(&mut hold, old) {
                            hold.flags.changed = true;
                            changed += 1;
                        }
                    }
                    self.records[id.index()] = hold;
                    continue;
                }
            }

            // First sighting of this group.
            hold.flags.changed = true;
            changed += 1;
            self.alloc(hold);
        }

        self.cursor = Cursor::BeforeFirst;
        self.load_count += 1;
        info!(
            path = %self.path.display(),
            groups = self.records.len(),
            changed,
            "active table loaded"
        );
        Ok(changed)
    }

    /// Append a record to the arena and cons it onto its hash chain.
    fn alloc(&mut self, mut record: GroupRecord) -> GroupId {
        record.next_in_bucket = 0;
        let id = GroupId::from_index(self.records.len());
        let bucket = bucket_of(&record.name);

        // Walk to the end of the chain; store 1-based indices.
        let mut slot = self.buckets[bucket];
        if slot == 0 {
            self.buckets[bucket] = id.0 + 1;
        } else {
            loop {
                let next = self.records[(slot - 1) as usize].next_in_bucket;
                if next == 0 {
                    break;
                }
                slot = next;
            }
            self.records[(slot - 1) as usize].next_in_bucket = id.0 + 1;
        }

        self.records.push(record);
        id
    }

    /// O(1) expected lookup by group name.
    pub fn find(&self, name: &str) -> Option<GroupId> {
        let mut slot = self.buckets[bucket_of(name)];
        while slot != 0 {
            let rec = &self.records[(slot - 1) as usize];
            if rec.name == name {
                return Some(GroupId(slot - 1));
            }
            slot = rec.next_in_bucket;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn group(&self, id: GroupId) -> &GroupRecord {
        &self.records[id.index()]
    }

    pub fn group_mut(&mut self, id: GroupId) -> &mut GroupRecord {
        &mut self.records[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &GroupRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, g)| (GroupId::from_index(i), g))
    }

    // ── Sequential cursor ───────────────────────────────────────────

    /// Park the cursor so the next `cursor_next` (forward) or
    /// `cursor_back` (backward) lands on the first group in that
    /// direction.
    pub fn rewind(&mut self, forward: bool) {
        self.cursor = if forward {
            Cursor::BeforeFirst
        } else {
            Cursor::AfterLast
        };
    }

    /// Move to the next group. Returns `false` (and wraps to the first
    /// group) when the end of the table is passed.
    pub fn cursor_next(&mut self) -> bool {
        let next = match self.cursor {
            Cursor::BeforeFirst => 0,
            Cursor::At(i) => i as usize + 1,
            Cursor::AfterLast => self.records.len(),
        };
        if next < self.records.len() {
            self.cursor = Cursor::At(next as u32);
            true
        } else {
            self.cursor = Cursor::At(0);
            false
        }
    }

    /// Move to the previous group. Returns `false` (and wraps to the
    /// last group) when the start of the table is passed.
    pub fn cursor_back(&mut self) -> bool {
        let prev = match self.cursor {
            Cursor::BeforeFirst => None,
            Cursor::At(0) => None,
            Cursor::At(i) => Some(i as usize - 1),
            Cursor::AfterLast => self.records.len().checked_sub(1),
        };
        match prev {
            Some(i) => {
                self.cursor = Cursor::At(i as u32);
                true
            }
            None => {
                self.cursor = if self.records.is_empty() {
                    Cursor::BeforeFirst
                } else {
                    Cursor::At(self.records.len() as u32 - 1)
                };
                false
            }
        }
    }

    /// The group under the cursor, if the cursor is on one.
    pub fn current(&self) -> Option<GroupId> {
        match self.cursor {
            Cursor::At(i) => Some(GroupId(i)),
            _ => None,
        }
    }

    /// Point the cursor at a specific group.
    pub fn select(&mut self, id: GroupId) {
        debug_assert!(id.index() < self.records.len());
        self.cursor = Cursor::At(id.0);
    }

    /// The place (group, article) the cursor is sitting on.
    pub fn tell(&self) -> Option<crate::model::Place> {
        self.current()
            .map(|g| crate::model::Place::new(g, self.article))
    }

    /// Restore the cursor to a saved place.
    pub fn seek(&mut self, place: crate::model::Place) {
        self.select(place.group);
        self.article = place.article;
    }

    /// Count of loads performed, for callers that behave differently on
    /// the first pass (the newsrc merge does).
    pub fn load_count(&self) -> u32 {
        self.load_count
    }

    /// Log every record at debug level.
    pub fn debug_dump(&self) {
        for (id, grp) in self.iter() {
            debug!(
                id = id.index(),
                name = %grp.name,
                min = grp.min,
                max = grp.max,
                unread = grp.unread,
                "group"
            );
        }
    }
}
