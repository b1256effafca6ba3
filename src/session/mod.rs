//! The reading session: move-request state machine, trail logging,
//! backtracking, thread following and read marking.
//!
//! Position is always the active table's cursor plus its article field;
//! the trail is a log of where the session has been, compact enough to
//! hold a whole session in memory. Backtracking replays the log, either
//! by seeking a record's stored location or by re-deriving positions
//! inside a run with a reread-mode walk over materialized content.

pub mod trail;
pub mod walk;

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::active::ActiveTable;
use crate::bitmap;
use crate::error::{NewsError, Result};
use crate::history::{HistoryStatus, HistoryStore};
use crate::model::{GroupId, Place};
use crate::newsrc::BitmapCarry;
use crate::pattern;
use crate::spool::ArticleSource;

pub use trail::{Feedback, MarkScope, Redo, Retreat, Trail, TrailEntry};
pub use walk::Walker;

/// A move request from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveCmd {
    /// Next qualifying article.
    Next,
    /// Like `Next`, but in thread mode keep going until the walk is back
    /// at the depth where the skip began. Skips a whole subtree.
    Skip,
    /// The caller picked the position; validate and log it.
    Seek(Place),
    /// Re-display the current position without logging.
    Hold,
}

/// Reader verdict on the current article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rating {
    Seen,
    Praise,
    Condemn,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Follow reply chains before sequential order.
    pub thread: bool,
    /// Visit already-read articles too.
    pub reread: bool,
    /// Walk backwards.
    pub reverse: bool,
    /// Name written into feedback log lines.
    pub user: String,
    /// Groups whose feedback is never logged.
    pub quiet: String,
}

pub struct Session<S: ArticleSource> {
    table: ActiveTable,
    history: HistoryStore,
    source: S,
    opts: SessionOptions,
    trail: Trail,
    depth: u32,
    /// Sequential position to resume from once a thread subtree is
    /// exhausted.
    backto: Option<Place>,
    /// Delayed marks, applied when their group is exited.
    delayed: Vec<(Place, bool)>,
    muted: HashSet<String>,
    started: bool,
}

impl<S: ArticleSource> Session<S> {
    pub fn new(table: ActiveTable, history: HistoryStore, source: S, opts: SessionOptions) -> Self {
        Self {
            table,
            history,
            source,
            opts,
            trail: Trail::new(),
            depth: 0,
            backto: None,
            delayed: Vec::new(),
            muted: HashSet::new(),
            started: false,
        }
    }

    pub fn table(&self) -> &ActiveTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ActiveTable {
        &mut self.table
    }

    pub fn history_mut(&mut self) -> &mut HistoryStore {
        &mut self.history
    }

    pub fn trail(&self) -> &Trail {
        &self.trail
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn current(&self) -> Option<Place> {
        self.table.tell()
    }

    /// Don't follow this discussion any further.
    pub fn mute(&mut self, id: &str) {
        self.muted.insert(id.to_string());
    }

    pub fn set_muted(&mut self, ids: impl IntoIterator<Item = String>) {
        self.muted.extend(ids);
    }

    fn walker(&self) -> Walker {
        Walker::new(self.opts.reread, self.opts.reverse)
    }

    /// Walk configuration for re-deriving already-visited positions.
    fn replay_fwd(&self) -> Walker {
        Walker::new(true, self.opts.reverse)
    }

    fn replay_back(&self) -> Walker {
        Walker::new(true, !self.opts.reverse)
    }

    // ── Moving ──────────────────────────────────────────────────────

    pub fn advance(&mut self, cmd: MoveCmd) -> Result<Option<Place>> {
        match cmd {
            MoveCmd::Hold => Ok(self.table.tell()),
            MoveCmd::Seek(place) => self.seek_to(place).map(Some),
            MoveCmd::Next => self.step(false),
            MoveCmd::Skip => self.step(true),
        }
    }

    fn step(&mut self, skip: bool) -> Result<Option<Place>> {
        if !self.started {
            self.walker().init(&mut self.table);
            self.started = true;
        }
        let target_depth = self.depth;
        let mut rechecked = false;
        loop {
            let Some(place) = self.advance_once()? else {
                // exhausted; look once for arrivals since our load
                if rechecked || !self.recheck()? {
                    return Ok(None);
                }
                rechecked = true;
                continue;
            };
            if !skip || !self.opts.thread || self.depth <= target_depth {
                return Ok(Some(place));
            }
            debug!(depth = self.depth, target = target_depth, "skipping subtree");
        }
    }

    fn advance_once(&mut self) -> Result<Option<Place>> {
        if self.trail.is_behind() {
            return self.replay_step();
        }

        if self.opts.thread {
            if let Some(place) = self.jump_next()? {
                return Ok(Some(place));
            }
        }

        let leaving = self.table.current();
        match self.walker().next_article(&mut self.table, &self.source) {
            Some(place) => {
                if leaving.is_some() && leaving != Some(place.group) {
                    self.flush_delayed(leaving)?;
                }
                self.depth = 0;
                self.visit(place, false, None)?;
                Ok(Some(place))
            }
            None => {
                self.flush_delayed(None)?;
                Ok(None)
            }
        }
    }

    /// Step forward along the already-logged trail.
    fn replay_step(&mut self) -> Result<Option<Place>> {
        match self.trail.redo() {
            Redo::WithinRun => {
                if !self.replay_fwd().step_in_group(&mut self.table, &self.source) {
                    warn!("trail replay lost its position");
                }
                if let Some(e) = self.trail.current() {
                    self.depth = e.depth;
                }
                Ok(self.table.tell())
            }
            Redo::ToRecord(i) => {
                let e = self.trail.entry(i).expect("redo returned a valid index");
                self.depth = e.depth;
                self.table.seek(e.loc);
                Ok(Some(e.loc))
            }
            Redo::AtEnd => Ok(None),
        }
    }

    /// Back up one step. Returns the restored place, or `None` at the
    /// start of the trail.
    pub fn backtrack(&mut self) -> Result<Option<Place>> {
        match self.trail.retreat() {
            Retreat::AtStart => Ok(None),
            Retreat::WithinRun => {
                if !self.replay_back().step_in_group(&mut self.table, &self.source) {
                    warn!("analytic backtrack lost its position");
                }
                Ok(self.table.tell())
            }
            Retreat::ToRecord(i) => {
                let e = self.trail.entry(i).expect("retreat returned a valid index");
                self.depth = e.depth;
                self.table.seek(e.loc);
                Ok(Some(e.loc))
            }
        }
    }

    fn seek_to(&mut self, place: Place) -> Result<Place> {
        let grp = self.table.group(place.group);
        if !grp.in_range(place.article) {
            return Err(NewsError::OutOfRange {
                article: place.article,
                min: grp.min,
                max: grp.max,
            });
        }
        if self.trail.is_behind() {
            if let Some(here) = self.table.tell() {
                let prev = self.analytic_prev();
                self.trail.truncate_here(here, prev);
            }
        }
        // a manual seek leaves whatever thread we were in
        self.depth = 0;
        self.backto = None;
        self.started = true;
        self.table.seek(place);
        self.visit(place, true, None)?;
        info!(place = %place, "seek");
        Ok(place)
    }

    /// Jump to the article holding this message-ID, if it is held
    /// locally.
    pub fn goto_id(&mut self, id: &str) -> Result<Option<Place>> {
        let Some(place) = self.history.find_file(id, &self.table) else {
            return Ok(None);
        };
        self.seek_to(place).map(Some)
    }

    /// Remember the current position so the caller can come back to it.
    /// The position is pinned into its own trail record first.
    pub fn placemark(&mut self) -> Option<Place> {
        let here = self.table.tell()?;
        let prev = self.analytic_prev();
        self.trail.materialize(here, prev);
        Some(here)
    }

    /// Go to the parent article, via the trail's thread link when one
    /// exists, else via the References header.
    pub fn parent(&mut self) -> Result<Option<Place>> {
        if let Some(pi) = self.trail.current().and_then(|e| e.parent) {
            let pe = self.trail.entry(pi).expect("parent index in range");
            let (loc, depth) = (pe.loc, pe.depth);
            if self.trail.is_behind() {
                if let Some(here) = self.table.tell() {
                    let prev = self.analytic_prev();
                    self.trail.truncate_here(here, prev);
                }
            }
            self.depth = depth;
            self.table.seek(loc);
            self.trail.record(loc, depth, true);
            return Ok(Some(loc));
        }

        let Some(place) = self.table.tell() else {
            return Ok(None);
        };
        let name = self.table.group(place.group).name.clone();
        let Ok(art) = self.source.fetch(&name, place.article) else {
            return Ok(None);
        };
        for ancestor in art.references.iter().rev() {
            if let Some(p) = self.history.find_file(ancestor, &self.table) {
                self.depth = self.depth.saturating_sub(1);
                self.table.seek(p);
                self.visit(p, true, None)?;
                return Ok(Some(p));
            }
        }
        Ok(None)
    }

    // ── Thread following ────────────────────────────────────────────

    /// Prefer an unconsumed child reference, on the current record or
    /// any thread ancestor, over sequential advance. Falls back to the
    /// remembered sequential position when the subtree is exhausted.
    fn jump_next(&mut self) -> Result<Option<Place>> {
        if self.trail.is_empty() {
            return Ok(None);
        }
        let mut idx = Some(self.trail.current_index());
        while let Some(i) = idx {
            loop {
                let entry = self.trail.entry_mut(i).expect("trail index in range");
                let parent_depth = entry.depth;
                let Some(child) = entry.take_follow() else {
                    break;
                };
                if self.muted.contains(&child) {
                    debug!(id = %child, "muted followup skipped");
                    continue;
                }
                let Some(place) = self.history.find_file(&child, &self.table) else {
                    continue;
                };
                if !self.opts.reread
                    && !self
                        .walker()
                        .visible(&self.table, &self.source, place.group, place.article)
                {
                    continue;
                }
                if self.backto.is_none() {
                    self.backto = self.table.tell();
                }
                self.depth = parent_depth + 1;
                self.table.seek(place);
                self.visit(place, true, Some(i))?;
                debug!(id = %child, depth = self.depth, "followed reply");
                return Ok(Some(place));
            }
            idx = self.trail.entry(i).and_then(|e| e.parent);
        }

        // subtree exhausted; resume sequential traversal where we left it
        if self.depth > 0 {
            self.depth = 0;
            if let Some(back) = self.backto.take() {
                debug!(place = %back, "thread done, resuming sequential walk");
                self.table.seek(back);
            }
        }
        Ok(None)
    }

    // ── Bookkeeping ─────────────────────────────────────────────────

    /// Record a successful move: mark the article read, log the trail
    /// entry, and in thread mode capture its unvisited children.
    fn visit(&mut self, place: Place, sought: bool, parent: Option<usize>) -> Result<()> {
        let _ = bitmap::set_bit(place.article, self.table.group_mut(place.group));

        let mut follow = None;
        if self.opts.thread {
            let name = self.table.group(place.group).name.clone();
            if let Ok(art) = self.source.fetch(&name, place.article) {
                let kids: Vec<String> = art
                    .back_refs
                    .iter()
                    .filter(|k| !self.muted.contains(*k))
                    .cloned()
                    .collect();
                if !kids.is_empty() {
                    follow = Some(kids.join(" "));
                }
            }
        }

        // records carrying thread state must keep their exact location
        let pinned = sought || parent.is_some() || follow.is_some();
        let idx = self.trail.record(place, self.depth, pinned);
        let entry = self.trail.entry_mut(idx).expect("just recorded");
        if parent.is_some() {
            entry.parent = parent;
        }
        if follow.is_some() {
            entry.follow = follow;
        }
        Ok(())
    }

    /// Position one analytic step before the current one, used when a
    /// run has to be split. The table position is restored.
    fn analytic_prev(&mut self) -> Option<Place> {
        let here = self.table.tell()?;
        let prev = if self.replay_back().step_in_group(&mut self.table, &self.source) {
            self.table.tell()
        } else {
            None
        };
        self.table.seek(here);
        prev
    }

    // ── Marking ─────────────────────────────────────────────────────

    /// Mark the current article read (or unread). `Global` fans out to
    /// every other location the history lists for it; `Delayed` is
    /// batched until the group is exited.
    pub fn mark(&mut self, read: bool, scope: MarkScope) -> Result<()> {
        let Some(place) = self.table.tell() else {
            return Ok(());
        };
        let prev = self.analytic_prev();
        let idx = self.trail.materialize(place, prev);
        if let Some(entry) = self.trail.entry_mut(idx) {
            entry.mark = Some((scope, read));
        }

        match scope {
            MarkScope::Local => self.apply_mark(place, read),
            MarkScope::Global => {
                self.apply_mark(place, read);
                let name = self.table.group(place.group).name.clone();
                if let Ok(art) = self.source.fetch(&name, place.article) {
                    if !art.id.is_empty() {
                        self.mark_everywhere(&art.id, read);
                    }
                }
            }
            MarkScope::Delayed => self.delayed.push((place, read)),
        }
        Ok(())
    }

    fn apply_mark(&mut self, place: Place, read: bool) {
        let grp = self.table.group_mut(place.group);
        let res = if read {
            bitmap::set_bit(place.article, grp)
        } else {
            bitmap::clear_bit(place.article, grp)
        };
        if let Err(e) = res {
            // the article may have expired out of range meanwhile
            debug!(error = %e, "mark fell outside the group range");
        }
    }

    fn mark_everywhere(&mut self, id: &str, read: bool) {
        if self.history.seek(id) != Some(HistoryStatus::Valid) {
            return;
        }
        let mut locations = Vec::new();
        while let Some(loc) = self.history.next_location() {
            locations.push(loc);
        }
        for loc in locations {
            let Some(gid) = self.table.find(&loc.group) else {
                continue;
            };
            self.apply_mark(Place::new(gid, loc.article), read);
        }
    }

    /// Apply pending delayed marks, either for one group being exited or
    /// (with `None`) all of them.
    fn flush_delayed(&mut self, leaving: Option<GroupId>) -> Result<()> {
        let (apply, keep): (Vec<_>, Vec<_>) = self
            .delayed
            .drain(..)
            .partition(|(p, _)| leaving.is_none_or(|g| p.group == g));
        self.delayed = keep;
        if !apply.is_empty() {
            debug!(count = apply.len(), "applying delayed marks");
        }
        for (p, read) in apply {
            self.apply_mark(p, read);
        }
        Ok(())
    }

    /// The caller just posted a followup with this ID; its copies are
    /// read as far as this user is concerned.
    pub fn note_posted(&mut self, id: &str) {
        self.mark_everywhere(id, true);
    }

    /// Reload the active table, carrying bitmaps forward. Returns true
    /// if anything arrived.
    fn recheck(&mut self) -> Result<bool> {
        let changed = self.table.load(Some(&BitmapCarry))?;
        if changed == 0 {
            return Ok(false);
        }
        info!(changed, "new arrivals during session");
        self.walker().init(&mut self.table);
        Ok(true)
    }

    // ── Feedback ────────────────────────────────────────────────────

    /// Rate the current article. The rating rides on its trail record
    /// and reaches the feedback log at session end.
    pub fn rate(&mut self, rating: Rating) -> Result<()> {
        let Some(place) = self.table.tell() else {
            return Ok(());
        };
        let name = self.table.group(place.group).name.clone();
        let Ok(art) = self.source.fetch(&name, place.article) else {
            return Ok(());
        };
        if art.id.is_empty() {
            return Ok(());
        }

        let prev = self.analytic_prev();
        let idx = self.trail.materialize(place, prev);
        if let Some(entry) = self.trail.entry_mut(idx) {
            let fb = entry.feedback.get_or_insert(Feedback {
                id: art.id.clone(),
                pro: 0,
                con: 0,
            });
            match rating {
                Rating::Seen => {}
                Rating::Praise => fb.pro += 1,
                Rating::Condemn => fb.con += 1,
            }
        }
        Ok(())
    }

    /// Append `user id group/artno pro con` lines for every rated trail
    /// record, deduplicated by ID keeping the latest verdict. Quiet
    /// groups are skipped.
    pub fn sweep_feedback(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();

        // last verdict per id, in last-seen order
        let mut order: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, (Place, &Feedback)> = HashMap::new();
        for entry in self.trail.entries() {
            let Some(fb) = &entry.feedback else {
                continue;
            };
            let group = &self.table.group(entry.loc.group).name;
            if !self.opts.quiet.is_empty() && pattern::matches(group, &self.opts.quiet) {
                continue;
            }
            if latest.insert(fb.id.as_str(), (entry.loc, fb)).is_none() {
                order.push(fb.id.as_str());
            } else {
                order.retain(|id| *id != fb.id.as_str());
                order.push(fb.id.as_str());
            }
        }
        if order.is_empty() {
            return Ok(0);
        }

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| NewsError::io(path, e))?;
        for id in &order {
            let (loc, fb) = latest[id];
            let group = &self.table.group(loc.group).name;
            writeln!(
                file,
                "{} {} {}/{} {} {}",
                self.opts.user, id, group, loc.article, fb.pro, fb.con
            )
            .map_err(|e| NewsError::io(path, e))?;
        }
        info!(path = %path.display(), lines = order.len(), "feedback swept");
        Ok(order.len())
    }

    /// End the session: apply all pending delayed marks, drain feedback
    /// if a log is configured, and commit history mutations.
    pub fn finish(mut self, feedback_log: Option<&Path>) -> Result<(ActiveTable, HistoryStore)> {
        self.flush_delayed(None)?;
        if let Some(path) = feedback_log {
            self.sweep_feedback(path)?;
        }
        self.history.commit()?;
        Ok((self.table, self.history))
    }
}
