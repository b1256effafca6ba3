//! Per-user subscription store, the `.newsrc` file.
//!
//! Each group line is `name:ranges` (subscribed) or `name!ranges`
//! (unsubscribed); everything else, including comments, `options`,
//! `macro`, `ignore` and lines naming groups the active table no longer
//! knows, is carried verbatim so a rewrite never destroys what the user
//! (or another reader) put there.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::active::{ActiveTable, MergePolicy};
use crate::bitmap::{self, Mode};
use crate::error::{NewsError, Result};
use crate::model::GroupRecord;
use crate::pattern;

enum RcLine {
    /// A group the table knew at read time; regenerated on write.
    Group(String),
    /// Anything else, reproduced byte for byte.
    Passthrough(String),
}

pub struct Newsrc {
    path: PathBuf,
    lines: Vec<RcLine>,
    mentioned: HashSet<String>,
    /// Message-IDs of discussions the user muted with `ignore` lines.
    ignored: HashSet<String>,
}

/// Split a group line at the first `:` or `!`. The separator doubles as
/// the subscription flag.
fn split_group_line(line: &str) -> Option<(&str, bool, &str)> {
    let sep = line.find([':', '!'])?;
    let (name, rest) = line.split_at(sep);
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    let subscribed = rest.starts_with(':');
    Some((name, subscribed, &rest[1..]))
}

impl Newsrc {
    /// Parse the file, merging each known group's range list into the
    /// table's seen bitmaps. Unknown groups pass through untouched.
    ///
    /// A missing file is not an error: the caller generates a default
    /// with [`Newsrc::generate_default`].
    pub fn read(path: impl AsRef<Path>, table: &mut ActiveTable) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NewsError::io(&path, e)),
        };

        let mut rc = Self {
            path,
            lines: Vec::new(),
            mentioned: HashSet::new(),
            ignored: HashSet::new(),
        };

        for line in text.lines() {
            if let Some(id) = line.strip_prefix("ignore ") {
                rc.ignored.insert(id.trim().to_string());
                rc.lines.push(RcLine::Passthrough(line.to_string()));
                continue;
            }
            if line.starts_with('#')
                || line.starts_with("options ")
                || line.starts_with("macro ")
                || line.trim().is_empty()
            {
                rc.lines.push(RcLine::Passthrough(line.to_string()));
                continue;
            }

            let Some((name, subscribed, ranges)) = split_group_line(line) else {
                rc.lines.push(RcLine::Passthrough(line.to_string()));
                continue;
            };
            let Some(id) = table.find(name) else {
                // group gone from the active file; keep the user's line
                debug!(group = name, "newsrc group unknown, passing through");
                rc.lines.push(RcLine::Passthrough(line.to_string()));
                continue;
            };

            let grp = table.group_mut(id);
            grp.sub.noted = true;
            grp.sub.unsubscribed = !subscribed;
            if !ranges.trim().is_empty() {
                bitmap::decode(ranges.trim(), Mode::Set, grp)?;
            }
            rc.mentioned.insert(name.to_string());
            rc.lines.push(RcLine::Group(name.to_string()));
        }

        info!(path = %rc.path.display(), groups = rc.mentioned.len(), "newsrc loaded");
        Ok(Some(rc))
    }

    /// Build a first-time file: every group matching the subscription
    /// pattern is listed subscribed with nothing read, the rest are left
    /// out entirely. The file is written immediately.
    pub fn generate_default(
        path: impl AsRef<Path>,
        table: &mut ActiveTable,
        subscribe_spec: &str,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rc = Self {
            path,
            lines: Vec::new(),
            mentioned: HashSet::new(),
            ignored: HashSet::new(),
        };

        let ids: Vec<_> = table.iter().map(|(id, _)| id).collect();
        for id in ids {
            let grp = table.group_mut(id);
            if grp.flags.removed || !pattern::matches(&grp.name, subscribe_spec) {
                continue;
            }
            grp.sub.noted = true;
            grp.sub.unsubscribed = false;
            rc.mentioned.insert(grp.name.clone());
            rc.lines.push(RcLine::Group(grp.name.clone()));
        }

        info!(
            path = %rc.path.display(),
            groups = rc.mentioned.len(),
            spec = subscribe_spec,
            "generated default newsrc"
        );
        rc.write(table)?;
        Ok(rc)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to a group, adding a line for it if the file never
    /// mentioned it.
    pub fn subscribe(&mut self, table: &mut ActiveTable, name: &str) -> Result<()> {
        let id = table
            .find(name)
            .ok_or_else(|| NewsError::UnknownGroup(name.to_string()))?;
        let grp = table.group_mut(id);
        grp.sub.noted = true;
        grp.sub.unsubscribed = false;
        grp.sub.drop_pending = false;
        self.mention(name);
        Ok(())
    }

    /// Unsubscribe; read state is retained in case the user comes back.
    pub fn unsubscribe(&mut self, table: &mut ActiveTable, name: &str) -> Result<()> {
        let id = table
            .find(name)
            .ok_or_else(|| NewsError::UnknownGroup(name.to_string()))?;
        let grp = table.group_mut(id);
        grp.sub.noted = true;
        grp.sub.unsubscribed = true;
        self.mention(name);
        Ok(())
    }

    fn mention(&mut self, name: &str) {
        if self.mentioned.insert(name.to_string()) {
            self.lines.push(RcLine::Group(name.to_string()));
        }
    }

    /// Mute a discussion by its root message-ID.
    pub fn dont_follow(&mut self, id: &str) {
        if self.ignored.insert(id.to_string()) {
            self.lines.push(RcLine::Passthrough(format!("ignore {id}")));
        }
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignored.contains(id)
    }

    /// Root message-IDs of discussions the user has muted.
    pub fn ignored_ids(&self) -> impl Iterator<Item = &str> {
        self.ignored.iter().map(String::as_str)
    }

    /// Number of subscribed groups with unread articles.
    pub fn waiting(&self, table: &ActiveTable) -> usize {
        table
            .iter()
            .filter(|(_, g)| {
                g.sub.is_subscribed() && !g.flags.removed && g.unread > 0
            })
            .count()
    }

    /// Rewrite the file from current table state, via temp and rename.
    ///
    /// Group lines come out where the user had them; groups touched this
    /// session that the file never mentioned were appended by `mention`.
    pub fn write(&self, table: &ActiveTable) -> Result<()> {
        let tmp = self.path.with_extension("new");
        let mut out = String::new();
        for line in &self.lines {
            match line {
                RcLine::Passthrough(raw) => {
                    out.push_str(raw);
                    out.push('\n');
                }
                RcLine::Group(name) => {
                    let Some(id) = table.find(name) else {
                        warn!(group = %name, "group vanished between read and write");
                        continue;
                    };
                    let grp = table.group(id);
                    let sep = if grp.sub.unsubscribed || grp.sub.drop_pending {
                        '!'
                    } else {
                        ':'
                    };
                    out.push_str(name);
                    out.push(sep);
                    out.push_str(&bitmap::encode(grp));
                    out.push('\n');
                }
            }
        }

        fs::write(&tmp, out).map_err(|e| NewsError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| NewsError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "newsrc written");
        Ok(())
    }
}

/// Reload reconciliation for the active table once newsrc state is
/// loaded.
///
/// When a group's floor is unchanged the old bitmap and counter carry
/// straight over, with newly arrived articles counted unread. When the
/// floor moved (expiry ran), the old bitmap is re-encoded and replayed
/// against the new range in clear mode, which clamps expired reads to
/// the new floor and leaves the unread counter exact.
pub struct BitmapCarry;

impl MergePolicy for BitmapCarry {
    fn reconcile(&self, new: &mut GroupRecord, old: &GroupRecord) -> bool {
        let changed = new.min != old.min || new.max != old.max;
        new.sub = old.sub;

        if old.seen.is_none() {
            return changed;
        }

        if new.min == old.min {
            new.seen = old.seen.clone();
            new.unread = old.unread + new.max.saturating_sub(old.max);
        } else {
            let ranges = bitmap::encode(old);
            if let Err(e) = bitmap::decode(&ranges, Mode::Clear, new) {
                warn!(group = %new.name, error = %e, "could not replay read state");
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::get_bit;
    use std::io::Write as _;

    fn active_of(lines: &[&str]) -> (tempfile::NamedTempFile, ActiveTable) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        f.flush().unwrap();
        let t = ActiveTable::open(f.path()).unwrap();
        (f, t)
    }

    fn rc_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_read_merges_bitmaps() {
        let (_a, mut table) = active_of(&[
            "alt.test 000000010 000000001 y 00000000",
            "comp.misc 000000020 000000001 y 00000000",
        ]);
        let rc = rc_file(&["alt.test:1-5,9", "comp.misc!1-20"]);
        let rc = Newsrc::read(rc.path(), &mut table).unwrap().unwrap();

        let id = table.find("alt.test").unwrap();
        let grp = table.group(id);
        assert!(grp.sub.is_subscribed());
        assert_eq!(grp.unread, 4); // 10 articles, 6 read
        assert!(get_bit(5, grp).unwrap());
        assert!(!get_bit(6, grp).unwrap());

        let id = table.find("comp.misc").unwrap();
        assert!(!table.group(id).sub.is_subscribed());

        assert_eq!(rc.waiting(&table), 1);
    }

    #[test]
    fn test_passthrough_roundtrip() {
        let (_a, mut table) = active_of(&["alt.test 000000010 000000001 y 00000000"]);
        let rc = rc_file(&[
            "# reader settings",
            "options -h Received",
            "alt.test:1-5",
            "removed.group:1-99",
            "ignore <thread@dead>",
        ]);
        let path = rc.path().to_path_buf();
        let mut loaded = Newsrc::read(&path, &mut table).unwrap().unwrap();
        assert!(loaded.is_ignored("<thread@dead>"));
        loaded.dont_follow("<flame@war>");
        assert!(loaded.is_ignored("<flame@war>"));
        loaded.write(&table).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# reader settings");
        assert_eq!(lines[1], "options -h Received");
        assert_eq!(lines[2], "alt.test:1-5");
        assert_eq!(lines[3], "removed.group:1-99");
        assert_eq!(lines[4], "ignore <thread@dead>");
        assert_eq!(lines[5], "ignore <flame@war>");
    }

    #[test]
    fn test_missing_file_is_none() {
        let (_a, mut table) = active_of(&["alt.test 000000001 000000001 y 00000000"]);
        assert!(Newsrc::read("/nonexistent/newsrc", &mut table)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_generate_default() {
        let (_a, mut table) = active_of(&[
            "general 000000003 000000001 y 00000000",
            "comp.lang.rust 000000005 000000001 y 00000000",
            "alt.flame 000000099 000000001 y 00000000",
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("newsrc");
        Newsrc::generate_default(&path, &mut table, "general,comp.all").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("general:"));
        assert!(text.contains("comp.lang.rust:"));
        assert!(!text.contains("alt.flame"));
    }

    #[test]
    fn test_subscribe_appends_new_group() {
        let (_a, mut table) = active_of(&[
            "alt.test 000000005 000000001 y 00000000",
            "misc.news 000000005 000000001 y 00000000",
        ]);
        let rc = rc_file(&["alt.test:1-2"]);
        let path = rc.path().to_path_buf();
        let mut loaded = Newsrc::read(&path, &mut table).unwrap().unwrap();

        loaded.subscribe(&mut table, "misc.news").unwrap();
        loaded.unsubscribe(&mut table, "alt.test").unwrap();
        assert!(loaded.subscribe(&mut table, "no.such.group").is_err());
        loaded.write(&table).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "alt.test!1-2");
        assert_eq!(lines[1], "misc.news:");
    }

    #[test]
    fn test_bitmap_carry_same_floor() {
        let (_a, mut table) = active_of(&["alt.test 000000010 000000001 y 00000000"]);
        let rc = rc_file(&["alt.test:1-5"]);
        Newsrc::read(rc.path(), &mut table).unwrap().unwrap();

        let mut new = crate::active::file::parse_line(
            "alt.test 000000012 000000001 y 00000000",
            1,
        )
        .unwrap();
        let old = table.group(table.find("alt.test").unwrap());
        assert!(BitmapCarry.reconcile(&mut new, old));
        assert_eq!(new.unread, 7); // 5 old unread + 2 arrivals
        assert!(get_bit(5, &new).unwrap());
    }

    #[test]
    fn test_bitmap_carry_shifted_floor() {
        let (_a, mut table) = active_of(&["alt.test 000000010 000000001 y 00000000"]);
        let rc = rc_file(&["alt.test:1-5,8"]);
        Newsrc::read(rc.path(), &mut table).unwrap().unwrap();

        // expiry moved the floor past some of the read articles
        let mut new = crate::active::file::parse_line(
            "alt.test 000000012 000000004 y 00000000",
            1,
        )
        .unwrap();
        let old = table.group(table.find("alt.test").unwrap());
        assert!(BitmapCarry.reconcile(&mut new, old));

        // 4..=12 live, of which 4, 5 and 8 are read
        assert_eq!(new.unread, 6);
        assert!(get_bit(4, &new).unwrap());
        assert!(get_bit(8, &new).unwrap());
        assert!(!get_bit(6, &new).unwrap());
        assert_eq!(bitmap::encode(&new), "4-5,8");
    }
}
