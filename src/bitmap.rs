//! Read-state bitmap codec.
//!
//! Translates between a group's in-core seen bitmap and the textual
//! range-list form stored in subscription files (`"1-5,9,12-30"`).
//! The group's unread counter is maintained incrementally on every bit
//! flip rather than recomputed by popcount; it is read far more often
//! than bits change.

use tracing::trace;

use crate::error::{NewsError, Result};
use crate::model::{ArtNo, Bitmap, GroupRecord};

/// What `decode` should do with the bits implied by a range list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Mark the listed articles read; leave everything else alone.
    /// Used on the first merge of a subscription line.
    Set,
    /// Full re-synchronization: mark the listed articles read and
    /// explicitly clear every other article in the active range. Used
    /// when the group's numeric range has shifted and the unread count
    /// must be rebuilt exactly.
    Clear,
}

/// Return the seen state of an article.
pub fn get_bit(article: ArtNo, grp: &GroupRecord) -> Result<bool> {
    check_range(article, grp)?;
    Ok(grp.seen.as_ref().is_some_and(|map| map.get(article)))
}

/// Mark an article read. Returns the previous state. The first set
/// allocates a right-sized bitmap lazily.
pub fn set_bit(article: ArtNo, grp: &mut GroupRecord) -> Result<bool> {
    check_range(article, grp)?;
    let map = grp
        .seen
        .get_or_insert_with(|| Bitmap::sized(grp.min, grp.max + 1 - grp.min));
    let old = map.get(article);
    if !old {
        map.set(article);
        grp.unread = grp.unread.saturating_sub(1);
    }
    grp.sub.visited = true;
    Ok(old)
}

/// Mark an article unread. Returns the previous state.
pub fn clear_bit(article: ArtNo, grp: &mut GroupRecord) -> Result<bool> {
    check_range(article, grp)?;
    let Some(map) = grp.seen.as_mut() else {
        // No bitmap yet: the bit is already clear.
        return Ok(false);
    };
    let old = map.get(article);
    if old {
        map.clear(article);
        grp.unread += 1;
    }
    Ok(old)
}

fn check_range(article: ArtNo, grp: &GroupRecord) -> Result<()> {
    if grp.in_range(article) {
        Ok(())
    } else {
        Err(NewsError::OutOfRange {
            article,
            min: grp.min,
            max: grp.max,
        })
    }
}

/// Apply a textual range list to a group's bitmap.
///
/// Ranges must be ascending and non-overlapping as written; anything else
/// is rejected rather than silently mis-applied. Numbers below the
/// group's current floor are clamped to the floor, since expired
/// articles cannot be un-read.
pub fn decode(text: &str, mode: Mode, grp: &mut GroupRecord) -> Result<()> {
    let ranges = parse_ranges(text)?;
    trace!(group = %grp.name, ranges = ranges.len(), ?mode, "applying range list");

    match mode {
        Mode::Set => {
            for &(lo, hi) in &ranges {
                let lo = lo.max(grp.min);
                let hi = hi.min(grp.max);
                for art in lo..=hi {
                    let _ = set_bit(art, grp)?;
                }
            }
        }
        Mode::Clear => {
            // Rebuild from scratch: everything not listed comes out
            // unread and the counter is exact no matter what the bitmap
            // or the counter held before.
            grp.seen = None;
            grp.unread = grp.max + 1 - grp.min;
            for &(lo, hi) in &ranges {
                let lo = lo.max(grp.min);
                let hi = hi.min(grp.max);
                for art in lo..=hi {
                    let _ = set_bit(art, grp)?;
                }
            }
        }
    }
    Ok(())
}

/// Render a group's bitmap as a canonical minimal range list.
pub fn encode(grp: &GroupRecord) -> String {
    let mut out = String::new();
    let mut run: Option<(ArtNo, ArtNo)> = None;

    if grp.max + 1 == grp.min {
        return out;
    }

    for art in grp.min..=grp.max {
        let read = get_bit(art, grp).unwrap_or(false);
        match (read, run) {
            (true, Some((lo, _))) => run = Some((lo, art)),
            (true, None) => run = Some((art, art)),
            (false, Some(span)) => {
                push_span(&mut out, span);
                run = None;
            }
            (false, None) => {}
        }
    }
    if let Some(span) = run {
        push_span(&mut out, span);
    }
    out
}

fn push_span(out: &mut String, (lo, hi): (ArtNo, ArtNo)) {
    if !out.is_empty() {
        out.push(',');
    }
    if lo == hi {
        out.push_str(&lo.to_string());
    } else {
        out.push_str(&format!("{lo}-{hi}"));
    }
}

/// Parse `"1-5,9,12-30"` into ordered inclusive spans.
fn parse_ranges(text: &str) -> Result<Vec<(ArtNo, ArtNo)>> {
    let mut out: Vec<(ArtNo, ArtNo)> = Vec::new();
    for item in text.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (lo, hi) = match item.split_once('-') {
            Some((a, b)) => (parse_num(a)?, parse_num(b)?),
            None => {
                let n = parse_num(item)?;
                (n, n)
            }
        };
        if lo > hi {
            return Err(NewsError::BadRangeList {
                reason: format!("descending range {lo}-{hi}"),
            });
        }
        if let Some(&(_, prev_hi)) = out.last() {
            if lo <= prev_hi {
                return Err(NewsError::BadRangeList {
                    reason: format!("range starting at {lo} is out of ascending order"),
                });
            }
        }
        out.push((lo, hi));
    }
    Ok(out)
}

fn parse_num(tok: &str) -> Result<ArtNo> {
    tok.trim().parse().map_err(|_| NewsError::BadRangeList {
        reason: format!("bad number '{}'", tok.trim()),
    })
}
