//! Low-level traversal: stepping the active table's cursor from visible
//! article to visible article, across group boundaries, with
//! wraparound.
//!
//! A "visible" article is in the group's numeric range, materially
//! present in the spool, and either unread or rereading is allowed.
//! The walker owns no state beyond its two flags; position lives in the
//! table (cursor + `article`), so every layer above sees one truth.

use tracing::trace;

use crate::active::ActiveTable;
use crate::error::{NewsError, Result};
use crate::model::{ArtNo, GroupId, Place};
use crate::spool::ArticleSource;

#[derive(Debug, Clone, Copy)]
pub struct Walker {
    /// Include already-read articles.
    pub reread: bool,
    /// Walk high-to-low and last-group-to-first.
    pub reverse: bool,
}

impl Walker {
    pub fn new(reread: bool, reverse: bool) -> Self {
        Self { reread, reverse }
    }

    /// Park the cursor before the first group in walk order.
    pub fn init(&self, table: &mut ActiveTable) {
        table.rewind(!self.reverse);
        table.article = 0;
    }

    /// Does the group qualify for a visit at all?
    fn group_qualifies(&self, table: &ActiveTable, id: GroupId) -> bool {
        let grp = table.group(id);
        if grp.flags.removed || !grp.sub.is_subscribed() {
            return false;
        }
        if self.reread {
            grp.article_count() > 0
        } else {
            grp.unread > 0
        }
    }

    /// Is this article a stopping point?
    pub fn visible(
        &self,
        table: &ActiveTable,
        source: &dyn ArticleSource,
        id: GroupId,
        article: ArtNo,
    ) -> bool {
        let grp = table.group(id);
        if !grp.in_range(article) {
            return false;
        }
        if !self.reread {
            let read = grp.seen.as_ref().is_some_and(|map| map.get(article));
            if read {
                return false;
            }
        }
        source.exists(&grp.name, article)
    }

    /// Advance within the current group only. Returns `false` when the
    /// group is exhausted in the walk direction.
    pub fn step_in_group(&self, table: &mut ActiveTable, source: &dyn ArticleSource) -> bool {
        let Some(id) = table.current() else {
            return false;
        };
        let (min, max) = {
            let grp = table.group(id);
            (grp.min, grp.max)
        };
        if max + 1 == min {
            return false;
        }

        let mut art = table.article;
        loop {
            if self.reverse {
                if art <= min {
                    return false;
                }
                art = if art > max + 1 { max } else { art - 1 };
            } else {
                if art >= max {
                    return false;
                }
                art = if art < min { min } else { art + 1 };
            }
            if self.visible(table, source, id, art) {
                table.article = art;
                trace!(article = art, "stepped to article");
                return true;
            }
        }
    }

    /// Move the cursor to the next qualifying group in walk order,
    /// positioning `article` just outside its range so the next
    /// `step_in_group` lands on the first visible article. Returns
    /// `false` after a full wrap finds nothing.
    pub fn next_group(&self, table: &mut ActiveTable) -> bool {
        let total = table.len();
        for _ in 0..=total {
            let moved = if self.reverse {
                table.cursor_back()
            } else {
                table.cursor_next()
            };
            // `moved` is false exactly when the walk wrapped; the cursor
            // still points at the wrapped-to group, so keep scanning and
            // let the hop budget terminate us.
            let _ = moved;
            if let Some(id) = table.current() {
                if self.group_qualifies(table, id) {
                    self.enter_group(table, id);
                    return true;
                }
            }
        }
        false
    }

    fn enter_group(&self, table: &mut ActiveTable, id: GroupId) {
        let grp = table.group(id);
        table.article = if self.reverse { grp.max + 1 } else { grp.min.saturating_sub(1) };
        trace!(group = %table.group(id).name, "entered group");
    }

    /// The workhorse: next visible article anywhere, crossing group
    /// boundaries with wraparound. Returns the new place, or `None`
    /// when no group holds anything visible.
    pub fn next_article(
        &self,
        table: &mut ActiveTable,
        source: &dyn ArticleSource,
    ) -> Option<Place> {
        let budget = table.len() + 2;
        for _ in 0..budget {
            if table.current().is_some() && self.step_in_group(table, source) {
                return table.tell();
            }
            if !self.next_group(table) {
                return None;
            }
        }
        None
    }

    /// Position on a named group, before its first article in walk
    /// order.
    pub fn goto_group(&self, table: &mut ActiveTable, name: &str) -> Result<GroupId> {
        let id = table
            .find(name)
            .ok_or_else(|| NewsError::UnknownGroup(name.to_string()))?;
        table.select(id);
        self.enter_group(table, id);
        Ok(id)
    }

    /// Position on an exact article in the current group.
    pub fn goto_article(&self, table: &mut ActiveTable, article: ArtNo) -> Result<Place> {
        let Some(id) = table.current() else {
            return Err(NewsError::UnknownGroup(String::new()));
        };
        let grp = table.group(id);
        if !grp.in_range(article) {
            return Err(NewsError::OutOfRange {
                article,
                min: grp.min,
                max: grp.max,
            });
        }
        table.article = article;
        Ok(Place::new(id, article))
    }
}
