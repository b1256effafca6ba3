//! Administrative flag overlay.
//!
//! The active file only records what posting needs. Site policy that
//! readers and expiry care about lives in a separate overlay file, one
//! directive per line:
//!
//! ```text
//! # pattern  flags  [expire-days]
//! comp.all     a    90
//! alt.binaries.all  c e 14
//! junk         !a x
//! ```
//!
//! Flag letters: `v` volatile, `a` archived, `c` compressed, `i` ignore
//! expiry, `e` expire by posting age, `x` removed. A `!` prefix clears
//! the flag instead of setting it. A bare number sets the per-group
//! expiry horizon in days. Directives apply in file order to every group
//! matching the pattern, so later lines can refine earlier ones.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{NewsError, Result};
use crate::pattern;

use super::ActiveTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagBit {
    Volatile,
    Archived,
    Compressed,
    IgnoreExpiry,
    ExpireByAge,
    Removed,
}

#[derive(Debug, Clone)]
struct Directive {
    pattern: String,
    set: Vec<FlagBit>,
    clear: Vec<FlagBit>,
    expire_days: Option<i64>,
}

fn parse_directive(line: &str, line_no: u64) -> Result<Directive> {
    let corrupt = |reason: String| NewsError::ActiveCorrupt {
        line: line_no,
        reason,
    };

    let mut fields = line.split_whitespace();
    let pattern = fields
        .next()
        .ok_or_else(|| corrupt("empty directive".into()))?
        .to_string();

    let mut dir = Directive {
        pattern,
        set: Vec::new(),
        clear: Vec::new(),
        expire_days: None,
    };

    for field in fields {
        if field.chars().all(|c| c.is_ascii_digit()) {
            dir.expire_days = Some(field.parse().map_err(|_| {
                corrupt(format!("bad expiry horizon {field:?}"))
            })?);
            continue;
        }
        let (letters, negate) = match field.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (field, false),
        };
        for ch in letters.chars() {
            let bit = match ch {
                'v' => FlagBit::Volatile,
                'a' => FlagBit::Archived,
                'c' => FlagBit::Compressed,
                'i' => FlagBit::IgnoreExpiry,
                'e' => FlagBit::ExpireByAge,
                'x' => FlagBit::Removed,
                _ => {
                    return Err(corrupt(format!(
                        "unknown flag letter {ch:?} in {field:?}"
                    )))
                }
            };
            if negate {
                dir.clear.push(bit);
            } else {
                dir.set.push(bit);
            }
        }
    }
    Ok(dir)
}

impl ActiveTable {
    /// Read an overlay file and apply its directives to the table.
    ///
    /// A missing overlay is not an error, it just means the site has no
    /// policy beyond the active file. Returns the number of directives
    /// applied.
    pub fn apply_admin_overlay(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no admin overlay");
                return Ok(0);
            }
            Err(e) => return Err(NewsError::io(path, e)),
        };

        let mut applied = 0usize;
        for (idx, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            if line.trim().is_empty() {
                continue;
            }
            let dir = parse_directive(line, idx as u64 + 1)?;

            let mut touched = 0usize;
            for rec in &mut self.records {
                if !pattern::matches(&rec.name, &dir.pattern) {
                    continue;
                }
                for &bit in &dir.set {
                    apply_bit(rec, bit, true);
                }
                for &bit in &dir.clear {
                    apply_bit(rec, bit, false);
                }
                if let Some(days) = dir.expire_days {
                    rec.expire_after = Some(days * 86_400);
                }
                touched += 1;
            }
            if touched == 0 {
                warn!(pattern = %dir.pattern, "admin directive matched no groups");
            }
            applied += 1;
        }

        info!(path = %path.display(), directives = applied, "admin overlay applied");
        Ok(applied)
    }
}

fn apply_bit(rec: &mut crate::model::GroupRecord, bit: FlagBit, on: bool) {
    let flags = &mut rec.flags;
    match bit {
        FlagBit::Volatile => flags.volatile = on,
        FlagBit::Archived => flags.archived = on,
        FlagBit::Compressed => flags.compressed = on,
        FlagBit::IgnoreExpiry => flags.ignore_expiry = on,
        FlagBit::ExpireByAge => flags.expire_by_age = on,
        FlagBit::Removed => flags.removed = on,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table_of(lines: &[&str]) -> (tempfile::NamedTempFile, ActiveTable) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        f.flush().unwrap();
        let t = ActiveTable::open(f.path()).unwrap();
        (f, t)
    }

    #[test]
    fn test_overlay_sets_and_clears() {
        let (_f, mut table) = table_of(&[
            "comp.lang.rust 000000005 000000001 y 00000000",
            "comp.sys.mac 000000005 000000001 y 00000000",
            "alt.test 000000005 000000001 y 00000000",
        ]);
        let mut overlay = tempfile::NamedTempFile::new().unwrap();
        writeln!(overlay, "# site policy").unwrap();
        writeln!(overlay, "comp.all a 90").unwrap();
        writeln!(overlay, "comp.sys.all !a c").unwrap();
        overlay.flush().unwrap();

        assert_eq!(table.apply_admin_overlay(overlay.path()).unwrap(), 2);

        let rust = table.group(table.find("comp.lang.rust").unwrap());
        assert!(rust.flags.archived);
        assert_eq!(rust.expire_after, Some(90 * 86_400));

        let mac = table.group(table.find("comp.sys.mac").unwrap());
        assert!(!mac.flags.archived, "later directive clears the flag");
        assert!(mac.flags.compressed);
        assert_eq!(mac.expire_after, Some(90 * 86_400));

        let alt = table.group(table.find("alt.test").unwrap());
        assert!(!alt.flags.archived);
        assert_eq!(alt.expire_after, None);
    }

    #[test]
    fn test_overlay_missing_is_fine() {
        let (_f, mut table) = table_of(&["alt.test 000000001 000000001 y 00000000"]);
        assert_eq!(
            table.apply_admin_overlay("/nonexistent/overlay").unwrap(),
            0
        );
    }

    #[test]
    fn test_overlay_survives_reload() {
        let (f, mut table) = table_of(&["alt.test 000000005 000000001 y 00000000"]);
        let mut overlay = tempfile::NamedTempFile::new().unwrap();
        writeln!(overlay, "alt.all v i 30").unwrap();
        overlay.flush().unwrap();
        table.apply_admin_overlay(overlay.path()).unwrap();

        table.load(None).unwrap();
        let grp = table.group(table.find("alt.test").unwrap());
        assert!(grp.flags.volatile);
        assert!(grp.flags.ignore_expiry);
        assert_eq!(grp.expire_after, Some(30 * 86_400));
        let _ = f;
    }

    #[test]
    fn test_bad_flag_letter_rejected() {
        let (_f, mut table) = table_of(&["alt.test 000000001 000000001 y 00000000"]);
        let mut overlay = tempfile::NamedTempFile::new().unwrap();
        writeln!(overlay, "alt.all q").unwrap();
        overlay.flush().unwrap();
        let err = table.apply_admin_overlay(overlay.path()).unwrap_err();
        assert!(matches!(err, NewsError::ActiveCorrupt { line: 1, .. }));
    }
}
