//! On-disk active file codec and in-place record rewrites.
//!
//! Each record is one line, `<name> <max> <min> <flag> <age-hex>`, with
//! numeric fields zero-padded to fixed widths. Fixed width is the point:
//! bumping a group's high-water mark rewrites only that group's line,
//! byte for byte, so concurrent posting agents never shift surrounding
//! records.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{NewsError, Result};
use crate::model::place::MAX_ARTICLE;
use crate::model::{ArtNo, GroupFlags, GroupId, GroupRecord};

use super::ActiveTable;

/// Canonical field widths (`%09d` article numbers, `%08x` age).
const W_ART: usize = 9;
const W_AGE: usize = 8;

/// Field widths observed on a particular on-disk line. In-place rewrites
/// reproduce them so the record stays byte-stable even if the file was
/// written with non-canonical padding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineShape {
    w_max: usize,
    w_min: usize,
    /// Width of the age field, or `None` when the line has no age field
    /// at all (very old files). A rewrite must not grow such a line.
    w_age: Option<usize>,
}

impl Default for LineShape {
    fn default() -> Self {
        Self {
            w_max: W_ART,
            w_min: W_ART,
            w_age: Some(W_AGE),
        }
    }
}

/// Parse one active line into a fresh group record.
///
/// Session-local fields (bitmap, subscription, offset) are left at their
/// defaults; the caller fills in `file_offset`.
pub fn parse_line(line: &str, line_no: u64) -> Result<GroupRecord> {
    parse_line_full(line, line_no).map(|(rec, _)| rec)
}

pub(crate) fn parse_line_full(line: &str, line_no: u64) -> Result<(GroupRecord, LineShape)> {
    let corrupt = |reason: &str| NewsError::ActiveCorrupt {
        line: line_no,
        reason: format!("{reason}: {line:?}"),
    };

    let mut fields = line.split_whitespace();
    let name = fields.next().ok_or_else(|| corrupt("empty record"))?;
    let max_fld = fields.next().ok_or_else(|| corrupt("missing max field"))?;
    let min_fld = fields.next().ok_or_else(|| corrupt("missing min field"))?;
    let flag_fld = fields.next().ok_or_else(|| corrupt("missing flags field"))?;
    let age_fld = fields.next(); // absent in very old files
    if fields.next().is_some() {
        return Err(corrupt("trailing junk"));
    }

    let max: ArtNo = max_fld.parse().map_err(|_| corrupt("bad max field"))?;
    let min: ArtNo = min_fld.parse().map_err(|_| corrupt("bad min field"))?;
    if max > MAX_ARTICLE || min > MAX_ARTICLE {
        return Err(corrupt("article number out of range"));
    }
    if min > max + 1 {
        return Err(corrupt("min exceeds max+1"));
    }
    let last_post = match age_fld {
        Some(hex) => {
            i64::from_str_radix(hex, 16).map_err(|_| corrupt("bad age field"))? }
        None => 0,
    };

    let flags = GroupFlags {
        moderated: flag_fld.contains('m'),
        removed: flag_fld.contains('x'),
        local: !name.contains('.'),
        ..Default::default()
    };

    let rec = GroupRecord {
        name: name.to_string(),
        max,
        min,
        flags,
        last_post,
        unread: max + 1 - min,
        ..Default::default()
    };
    let shape = LineShape {
        w_max: max_fld.len(),
        w_min: min_fld.len(),
        w_age: age_fld.map(str::len),
    };
    Ok((rec, shape))
}

/// Render a record as a canonical fixed-width active line (no newline).
pub fn format_line(grp: &GroupRecord) -> String {
    format_line_shaped(grp, LineShape::default())
}

fn format_line_shaped(grp: &GroupRecord, shape: LineShape) -> String {
    let flag = if grp.flags.removed {
        'x'
    } else if grp.flags.moderated {
        'm'
    } else {
        'y'
    };
    let mut out = format!(
        "{} {:0w_max$} {:0w_min$} {}",
        grp.name,
        grp.max,
        grp.min,
        flag,
        w_max = shape.w_max,
        w_min = shape.w_min,
    );
    if let Some(w_age) = shape.w_age {
        out.push_str(&format!(" {:0w_age$x}", grp.last_post as u64));
    }
    out
}

/// Read the single line starting at `offset` from an open file.
fn line_at(file: &mut fs::File, path: &Path, offset: u64) -> Result<String> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| NewsError::io(path, e))?;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = file.read(&mut byte).map_err(|e| NewsError::io(path, e))?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).map_err(|_| NewsError::ActiveCorrupt {
        line: 0,
        reason: format!("non-UTF-8 record at offset {offset}"),
    })
}

/// An in-place rewrite must not move the bytes of any other record. A
/// value that outgrew its stored field width cannot be written back;
/// the file needs a full rewrite to widen the field first.
fn same_length(out: &str, line: &str, group: &str) -> Result<()> {
    if out.len() != line.len() {
        return Err(NewsError::ActiveCorrupt {
            line: 0,
            reason: format!(
                "record for {group} would grow from {} to {} bytes on rewrite",
                line.len(),
                out.len()
            ),
        });
    }
    Ok(())
}

impl ActiveTable {
    /// Atomically reserve the next article number in a group.
    ///
    /// Takes the file-wide advisory lock, re-reads the group's on-disk
    /// line (another posting agent may have bumped it since our load),
    /// increments the high-water mark, and rewrites only that line in
    /// place. Returns the reserved number.
    pub fn bump_article(&mut self, id: GroupId) -> Result<ArtNo> {
        let offset = self.records[id.index()].file_offset;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| NewsError::io(&self.path, e))?;
        file.lock_exclusive().map_err(|e| NewsError::io(&self.path, e))?;

        let result = (|| {
            let line = line_at(&mut file, &self.path, offset)?;
            let (mut fresh, shape) = parse_line_full(&line, 0)?;
            if fresh.name != self.records[id.index()].name {
                return Err(NewsError::ActiveCorrupt {
                    line: 0,
                    reason: format!(
                        "record moved: expected {} at offset {offset}, found {}",
                        self.records[id.index()].name,
                        fresh.name
                    ),
                });
            }

            if fresh.max >= MAX_ARTICLE {
                warn!(group = %fresh.name, max = fresh.max, "article number overflow, resetting to 1");
                fresh.max = 0;
                fresh.min = 1;
            }
            fresh.max += 1;
            fresh.last_post = Utc::now().timestamp();

            let out = format_line_shaped(&fresh, shape);
            same_length(&out, &line, &fresh.name)?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| NewsError::io(&self.path, e))?;
            file.write_all(out.as_bytes())
                .map_err(|e| NewsError::io(&self.path, e))?;
            file.flush().map_err(|e| NewsError::io(&self.path, e))?;

            // Bring the in-core record up to date; session state stays.
            let rec = &mut self.records[id.index()];
            rec.max = fresh.max;
            rec.min = fresh.min;
            rec.last_post = fresh.last_post;
            debug!(group = %rec.name, article = rec.max, "reserved article number");
            Ok(rec.max)
        })();

        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Refresh one in-core record from its on-disk line, carrying
    /// everything not stored on the active line across the replacement.
    /// Returns `true` if the record changed.
    pub fn reread_group(&mut self, id: GroupId, policy: Option<&dyn super::MergePolicy>) -> Result<bool> {
        let offset = self.records[id.index()].file_offset;
        let mut file = fs::File::open(&self.path).map_err(|e| NewsError::io(&self.path, e))?;
        let line = line_at(&mut file, &self.path, offset)?;
        let mut fresh = parse_line(&line, 0)?;

        let old = &self.records[id.index()];
        fresh.file_offset = old.file_offset;
        fresh.next_in_bucket = old.next_in_bucket;
        fresh.flags.volatile = old.flags.volatile;
        fresh.flags.archived = old.flags.archived;
        fresh.flags.compressed = old.flags.compressed;
        fresh.flags.ignore_expiry = old.flags.ignore_expiry;
        fresh.flags.expire_by_age = old.flags.expire_by_age;
        fresh.expire_after = old.expire_after;
        fresh.sub = old.sub;
        fresh.seen = old.seen.clone();
        fresh.unread = old.unread;

        let changed = match policy {
            Some(policy) => policy.reconcile(&mut fresh, old),
            None => fresh.min != old.min || fresh.max != old.max,
        };
        self.records[id.index()] = fresh;
        Ok(changed)
    }

    /// Append a new group to the table and the file.
    ///
    /// With `make_parents`, every ancestor prefix of a dotted name is
    /// created first (unmoderated), so `comp.lang.rust` implies `comp`
    /// and `comp.lang`.
    pub fn create(&mut self, name: &str, moderated: bool, make_parents: bool) -> Result<GroupId> {
        if make_parents {
            let mut upto = 0;
            while let Some(dot) = name[upto..].find('.') {
                let prefix = &name[..upto + dot];
                self.make_group(prefix, false)?;
                upto += dot + 1;
            }
        }
        self.make_group(name, moderated)
    }

    fn make_group(&mut self, name: &str, moderated: bool) -> Result<GroupId> {
        if let Some(id) = self.find(name) {
            return Ok(id);
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| NewsError::io(&self.path, e))?;
        file.lock_exclusive().map_err(|e| NewsError::io(&self.path, e))?;

        let result = (|| {
            let offset = file
                .seek(SeekFrom::End(0))
                .map_err(|e| NewsError::io(&self.path, e))?;
            let rec = GroupRecord {
                name: name.to_string(),
                min: 1,
                max: 0,
                flags: GroupFlags {
                    moderated,
                    local: !name.contains('.'),
                    ..Default::default()
                },
                last_post: Utc::now().timestamp(),
                file_offset: offset,
                unread: 0,
                ..Default::default()
            };
            let line = format_line(&rec);
            file.write_all(line.as_bytes())
                .and_then(|()| file.write_all(b"\n"))
                .map_err(|e| NewsError::io(&self.path, e))?;
            debug!(group = name, offset, "created newsgroup");
            Ok(self.alloc(rec))
        })();

        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Flag a group as removed, rewriting its line in place. The record
    /// stays in the table (and the file) until the next full rewrite
    /// drops it.
    pub fn mark_removed(&mut self, id: GroupId) -> Result<()> {
        let offset = self.records[id.index()].file_offset;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| NewsError::io(&self.path, e))?;
        file.lock_exclusive().map_err(|e| NewsError::io(&self.path, e))?;

        let result = (|| {
            let line = line_at(&mut file, &self.path, offset)?;
            let (mut fresh, shape) = parse_line_full(&line, 0)?;
            fresh.flags.removed = true;
            let out = format_line_shaped(&fresh, shape);
            same_length(&out, &line, &fresh.name)?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| NewsError::io(&self.path, e))?;
            file.write_all(out.as_bytes())
                .map_err(|e| NewsError::io(&self.path, e))?;
            self.records[id.index()].flags.removed = true;
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Rewrite the whole active file from the in-core table.
    ///
    /// Writes to `<active>.new`, keeps the previous version as
    /// `<active>.old`, then renames into place so a concurrent reader
    /// never observes a half-written file.
    pub fn write_back(&self, drop_removed: bool) -> Result<()> {
        let new_path = self.path.with_extension("new");
        let old_path = self.path.with_extension("old");

        let mut out = fs::File::create(&new_path).map_err(|e| NewsError::io(&new_path, e))?;
        for grp in &self.records {
            if drop_removed && grp.flags.removed {
                continue;
            }
            out.write_all(format_line(grp).as_bytes())
                .and_then(|()| out.write_all(b"\n"))
                .map_err(|e| NewsError::io(&new_path, e))?;
        }
        out.flush().map_err(|e| NewsError::io(&new_path, e))?;
        drop(out);

        let _ = fs::remove_file(&old_path);
        fs::hard_link(&self.path, &old_path).map_err(|e| NewsError::io(&old_path, e))?;
        fs::rename(&new_path, &self.path).map_err(|e| NewsError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "active file rewritten");
        Ok(())
    }
}
