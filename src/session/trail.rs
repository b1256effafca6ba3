//! The session trail: a bounded-memory log of every position visited.
//!
//! Linear advances do not allocate. A record's `run` counts how many
//! consecutive plain advances it stands for, with `loc` holding the last
//! of them; earlier positions in the run are re-derived analytically by
//! walking backward over materialized content. Anything that attaches
//! per-article state (a mark, a thread link, feedback) gets a record of
//! its own, because that state cannot be shared across a run.

use crate::model::Place;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkScope {
    /// Current group's bitmap only.
    Local,
    /// Every location the history lists for the article's ID.
    Global,
    /// Like Local, but applied in a batch when the group is exited.
    Delayed,
}

/// Reader verdict on an article, drained to the feedback log at session
/// end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub id: String,
    pub pro: u32,
    pub con: u32,
}

#[derive(Debug, Clone)]
pub struct TrailEntry {
    /// Last position the record stands for.
    pub loc: Place,
    /// How many consecutive linear advances it absorbs, at least 1.
    pub run: u64,
    /// Thread depth at this position; 0 outside any followup chain.
    pub depth: u32,
    /// Reached by a jump (seek, thread follow), not a linear step.
    pub sought: bool,
    pub mark: Option<(MarkScope, bool)>,
    /// Trail index of the thread parent this entry was reached from.
    pub parent: Option<usize>,
    /// Unvisited child message-IDs, space separated, consumed
    /// front-first by thread following.
    pub follow: Option<String>,
    pub feedback: Option<Feedback>,
}

impl TrailEntry {
    pub fn new(loc: Place, depth: u32, sought: bool) -> Self {
        Self {
            loc,
            run: 1,
            depth,
            sought,
            mark: None,
            parent: None,
            follow: None,
            feedback: None,
        }
    }

    /// Whether one more linear advance to `next` may be absorbed into
    /// this record. Per-article state, thread linkage and jump origins
    /// pin a record to exactly one position.
    pub fn can_extend(&self, next: Place) -> bool {
        self.mark.is_none()
            && self.parent.is_none()
            && self.follow.is_none()
            && self.feedback.is_none()
            && !self.sought
            && self.loc.group == next.group
    }

    /// Pop the next unvisited child ID off the follow list.
    pub fn take_follow(&mut self) -> Option<String> {
        let list = self.follow.take()?;
        let mut parts = list.splitn(2, ' ');
        let head = parts.next()?.to_string();
        if let Some(rest) = parts.next() {
            if !rest.is_empty() {
                self.follow = Some(rest.to_string());
            }
        }
        Some(head)
    }
}

/// Outcome of moving the trail pointer backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retreat {
    /// Still inside the current record's run; position is one analytic
    /// step back.
    WithinRun,
    /// Moved to this record; position is its stored `loc`.
    ToRecord(usize),
    /// Nothing earlier.
    AtStart,
}

/// Outcome of moving the trail pointer forward while behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redo {
    /// One analytic step forward inside the current run.
    WithinRun,
    /// Entered this record at its first position; analytic step unless
    /// the record was sought, in which case seek its stored `loc`.
    ToRecord(usize),
    /// Pointer is at the live end of the trail.
    AtEnd,
}

#[derive(Default)]
pub struct Trail {
    entries: Vec<TrailEntry>,
    /// Record the pointer is on.
    at: usize,
    /// Steps backed up inside the current record's run, 0 = at its loc.
    back_in_run: u64,
}

impl Trail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TrailEntry] {
        &self.entries
    }

    pub fn current(&self) -> Option<&TrailEntry> {
        self.entries.get(self.at)
    }

    pub fn current_mut(&mut self) -> Option<&mut TrailEntry> {
        self.entries.get_mut(self.at)
    }

    pub fn current_index(&self) -> usize {
        self.at
    }

    pub fn entry(&self, idx: usize) -> Option<&TrailEntry> {
        self.entries.get(idx)
    }

    pub fn entry_mut(&mut self, idx: usize) -> Option<&mut TrailEntry> {
        self.entries.get_mut(idx)
    }

    /// Is the pointer behind the live end (replaying)?
    pub fn is_behind(&self) -> bool {
        self.back_in_run > 0 || self.at + 1 < self.entries.len()
    }

    /// Log a fresh advance at the live end. Linear advances extend the
    /// current record's run; everything else allocates. Returns the
    /// index of the record now holding the position.
    pub fn record(&mut self, loc: Place, depth: u32, sought: bool) -> usize {
        debug_assert!(!self.is_behind());
        if !sought {
            if let Some(last) = self.entries.last_mut() {
                if last.depth == depth && last.can_extend(loc) {
                    last.run += 1;
                    last.loc = loc;
                    return self.at;
                }
            }
        }
        self.entries.push(TrailEntry::new(loc, depth, sought));
        self.at = self.entries.len() - 1;
        self.at
    }

    /// Move the pointer one step back.
    pub fn retreat(&mut self) -> Retreat {
        let Some(cur) = self.entries.get(self.at) else {
            return Retreat::AtStart;
        };
        if self.back_in_run + 1 < cur.run {
            self.back_in_run += 1;
            Retreat::WithinRun
        } else if self.at > 0 {
            self.at -= 1;
            self.back_in_run = 0;
            Retreat::ToRecord(self.at)
        } else {
            Retreat::AtStart
        }
    }

    /// Move the pointer one step forward while behind.
    pub fn redo(&mut self) -> Redo {
        if self.back_in_run > 0 {
            self.back_in_run -= 1;
            Redo::WithinRun
        } else if self.at + 1 < self.entries.len() {
            self.at += 1;
            self.back_in_run = self.entries[self.at].run - 1;
            if self.back_in_run > 0 {
                Redo::WithinRun
            } else {
                Redo::ToRecord(self.at)
            }
        } else {
            Redo::AtEnd
        }
    }

    /// Ensure the current position has a record of its own that can
    /// carry per-article state, splitting the current run if needed.
    ///
    /// `here` is the actual current position; `prev` the analytically
    /// derived position one step before it, only consulted when a run
    /// has to be split. Any replay tail beyond the pointer is dropped;
    /// it held no state, or it could not have been part of a run.
    pub fn materialize(&mut self, here: Place, prev: Option<Place>) -> usize {
        if self.entries.is_empty() {
            self.entries.push(TrailEntry::new(here, 0, false));
            self.at = 0;
            return 0;
        }

        self.entries.truncate(self.at + 1);
        let entry = &mut self.entries[self.at];
        entry.run -= self.back_in_run;
        entry.loc = here;
        self.back_in_run = 0;

        if entry.run > 1 {
            let depth = entry.depth;
            entry.run -= 1;
            entry.loc = prev.unwrap_or(here);
            self.entries.push(TrailEntry::new(here, depth, false));
            self.at += 1;
        }
        self.at
    }

    /// Drop everything after the pointer; used before a fresh move while
    /// behind.
    pub fn truncate_here(&mut self, here: Place, prev: Option<Place>) {
        if !self.entries.is_empty() {
            self.materialize(here, prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupId, Place};

    fn p(g: u32, a: u64) -> Place {
        Place::new(GroupId::from_index(g as usize), a)
    }

    #[test]
    fn test_linear_run_absorbs() {
        let mut t = Trail::new();
        for a in 1..=5 {
            t.record(p(0, a), 0, false);
        }
        assert_eq!(t.len(), 1);
        let e = t.current().unwrap();
        assert_eq!(e.run, 5);
        assert_eq!(e.loc, p(0, 5));
    }

    #[test]
    fn test_group_change_allocates() {
        let mut t = Trail::new();
        t.record(p(0, 1), 0, false);
        t.record(p(0, 2), 0, false);
        t.record(p(1, 1), 0, false);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_sought_record_never_extends() {
        let mut t = Trail::new();
        t.record(p(0, 7), 0, true);
        t.record(p(0, 8), 0, false);
        assert_eq!(t.len(), 2, "a jump record keeps its exact location");
        t.record(p(0, 9), 0, false);
        assert_eq!(t.len(), 2);
        assert_eq!(t.current().unwrap().run, 2);
    }

    #[test]
    fn test_mark_splits_run() {
        let mut t = Trail::new();
        for a in 1..=4 {
            t.record(p(0, a), 0, false);
        }
        let idx = t.materialize(p(0, 4), Some(p(0, 3)));
        t.entry_mut(idx).unwrap().mark = Some((MarkScope::Global, true));
        assert_eq!(t.len(), 2);
        assert_eq!(t.entry(0).unwrap().run, 3);
        assert_eq!(t.entry(0).unwrap().loc, p(0, 3));
        assert_eq!(t.entry(1).unwrap().run, 1);

        // the marked record cannot absorb further advances
        t.record(p(0, 5), 0, false);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_materialize_single_is_noop() {
        let mut t = Trail::new();
        t.record(p(0, 3), 0, true);
        let idx = t.materialize(p(0, 3), None);
        assert_eq!(idx, 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_retreat_and_redo_through_run() {
        let mut t = Trail::new();
        t.record(p(0, 1), 0, true);
        for a in 2..=4 {
            t.record(p(0, a), 0, false);
        }
        assert_eq!(t.len(), 2); // sought(1) + run of 3 ending at 4

        assert_eq!(t.retreat(), Retreat::WithinRun); // at 3
        assert_eq!(t.retreat(), Retreat::WithinRun); // at 2
        assert_eq!(t.retreat(), Retreat::ToRecord(0)); // at 1
        assert_eq!(t.retreat(), Retreat::AtStart);

        assert!(t.is_behind());
        assert_eq!(t.redo(), Redo::WithinRun); // back into the run, at 2
        assert_eq!(t.redo(), Redo::WithinRun); // at 3
        assert_eq!(t.redo(), Redo::WithinRun); // at 4
        assert_eq!(t.redo(), Redo::AtEnd);
        assert!(!t.is_behind());
    }

    #[test]
    fn test_take_follow_consumes_front_first() {
        let mut e = TrailEntry::new(p(0, 1), 0, true);
        e.follow = Some("<a@x> <b@y> <c@z>".into());
        assert_eq!(e.take_follow().as_deref(), Some("<a@x>"));
        assert_eq!(e.follow.as_deref(), Some("<b@y> <c@z>"));
        assert_eq!(e.take_follow().as_deref(), Some("<b@y>"));
        assert_eq!(e.take_follow().as_deref(), Some("<c@z>"));
        assert_eq!(e.take_follow(), None);
    }

    #[test]
    fn test_materialize_while_behind_truncates() {
        let mut t = Trail::new();
        t.record(p(0, 1), 0, true);
        for a in 2..=5 {
            t.record(p(0, a), 0, false);
        }
        t.retreat(); // at 4
        t.retreat(); // at 3
        let idx = t.materialize(p(0, 3), Some(p(0, 2)));
        assert!(!t.is_behind());
        assert_eq!(t.entry(idx).unwrap().loc, p(0, 3));
        assert_eq!(t.entry(idx).unwrap().run, 1);
        // the run now ends at 2, the replay tail (4, 5) is gone
        assert_eq!(t.entry(idx - 1).unwrap().loc, p(0, 2));
        assert_eq!(t.entry(idx - 1).unwrap().run, 1);
    }
}
