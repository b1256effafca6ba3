//! Integration tests for the active index: loading, allocation,
//! in-place rewrites, admin overlays, and reload merging.

use std::fs;
use std::path::{Path, PathBuf};

use assert_fs::prelude::*;
use predicates::prelude::*;

use newspool::active::ActiveTable;
use newspool::bitmap::{self, Mode};
use newspool::error::NewsError;
use newspool::newsrc::BitmapCarry;

fn write_active(dir: &Path, lines: &[&str]) -> PathBuf {
    let path = dir.join("active");
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(&path, text).unwrap();
    path
}

// ─── Test 1: Load and look up groups ────────────────────────────────

#[test]
fn test_open_load_and_find() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(
        dir.path(),
        &[
            "comp.lang.misc 000000042 000000010 y",
            "alt.test 000000005 000000001 y",
            "general 000000003 000000001 m",
        ],
    );

    let table = ActiveTable::open(&path).unwrap();
    assert_eq!(table.len(), 3);

    let id = table.find("alt.test").expect("alt.test should be present");
    let grp = table.group(id);
    assert_eq!(grp.min, 1);
    assert_eq!(grp.max, 5);
    assert_eq!(grp.unread, 5);
    assert!(!grp.flags.moderated);

    let id = table.find("general").unwrap();
    assert!(table.group(id).flags.moderated, "m flag should set moderated");

    assert!(table.find("no.such.group").is_none());
}

// ─── Test 2: Missing file is fatal ──────────────────────────────────

#[test]
fn test_missing_active_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = ActiveTable::open(dir.path().join("active")).unwrap_err();
    assert!(matches!(err, NewsError::ActiveMissing(_)));
}

// ─── Test 3: Corrupt line reports its position ──────────────────────

#[test]
fn test_corrupt_line_reports_line_number() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(
        dir.path(),
        &["good.group 000000002 000000001 y", "this line is not parsable at all ???"],
    );
    let err = ActiveTable::open(&path).unwrap_err();
    match err {
        NewsError::ActiveCorrupt { line, .. } => assert_eq!(line, 2),
        other => panic!("expected ActiveCorrupt, got {other:?}"),
    }
}

// ─── Test 4: bump rewrites one field in place ───────────────────────

#[test]
fn test_bump_allocates_next_and_rewrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(
        dir.path(),
        &[
            "aaa.first 000000007 000000001 y",
            "alt.test 000000010 000000001 y",
            "zzz.last 000000099 000000090 y",
        ],
    );
    let before = fs::read_to_string(&path).unwrap();

    let mut table = ActiveTable::open(&path).unwrap();
    let id = table.find("alt.test").unwrap();
    let article = table.bump_article(id).unwrap();
    assert_eq!(article, 11);
    assert_eq!(table.group(id).max, 11);

    let after = fs::read_to_string(&path).unwrap();
    assert_eq!(after.len(), before.len(), "file length must not change");
    assert!(after.contains("alt.test 000000011 000000001 y"));
    // neighbours untouched byte for byte
    assert_eq!(after.lines().next(), before.lines().next());
    assert_eq!(after.lines().last(), before.lines().last());
}

// ─── Test 5: bump picks up a concurrent poster's update ─────────────

#[test]
fn test_bump_sees_concurrent_update() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["alt.test 000000010 000000001 y"]);

    let mut ours = ActiveTable::open(&path).unwrap();
    let mut theirs = ActiveTable::open(&path).unwrap();
    let id = ours.find("alt.test").unwrap();
    let their_id = theirs.find("alt.test").unwrap();

    assert_eq!(theirs.bump_article(their_id).unwrap(), 11);
    // our in-core copy still says 10, but the disk line wins
    assert_eq!(ours.bump_article(id).unwrap(), 12);
}

// ─── Test 6: overflow resets the counter ────────────────────────────

#[test]
fn test_bump_overflow_resets_to_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["alt.test 999999999 999999990 y"]);

    let mut table = ActiveTable::open(&path).unwrap();
    let id = table.find("alt.test").unwrap();
    assert_eq!(table.bump_article(id).unwrap(), 1);
}

// ─── Test 7: create with ancestors ──────────────────────────────────

#[test]
fn test_create_with_parents() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["general 000000001 000000001 y"]);

    let mut table = ActiveTable::open(&path).unwrap();
    table.create("comp.lang.rust", false, true).unwrap();

    for name in ["comp", "comp.lang", "comp.lang.rust"] {
        assert!(table.find(name).is_some(), "{name} should exist after create");
    }
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("comp.lang.rust 000000000 000000001 y"));

    // creating it again is a no-op
    let id = table.create("comp.lang.rust", false, true).unwrap();
    assert_eq!(id, table.find("comp.lang.rust").unwrap());
}

// ─── Test 8: write_back drops removed groups and keeps a backup ─────

#[test]
fn test_write_back_drops_removed() {
    let tmp = assert_fs::TempDir::new().unwrap();
    let active = tmp.child("active");
    active
        .write_str("alt.dead 000000005 000000001 y\nalt.test 000000005 000000001 y\n")
        .unwrap();

    let mut table = ActiveTable::open(active.path()).unwrap();
    let id = table.find("alt.dead").unwrap();
    table.mark_removed(id).unwrap();
    table.write_back(true).unwrap();

    active.assert(predicate::str::contains("alt.dead").not());
    active.assert(predicate::str::contains("alt.test"));
    tmp.child("active.old")
        .assert(predicate::str::contains("alt.dead"));
}

// ─── Test 9: admin overlay flags by pattern ─────────────────────────

#[test]
fn test_admin_overlay_applies_flags() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(
        dir.path(),
        &["comp.sources 000000005 000000001 y", "alt.test 000000005 000000001 y"],
    );
    let admin = dir.path().join("admin");
    fs::write(&admin, "# archive all of comp\ncomp.all a 30\nalt.all v\n").unwrap();

    let mut table = ActiveTable::open(&path).unwrap();
    let applied = table.apply_admin_overlay(&admin).unwrap();
    assert_eq!(applied, 2);

    let comp = table.group(table.find("comp.sources").unwrap());
    assert!(comp.flags.archived);
    assert_eq!(comp.expire_after, Some(30 * 86_400));

    let alt = table.group(table.find("alt.test").unwrap());
    assert!(alt.flags.volatile);
    assert!(!alt.flags.archived);
}

// ─── Test 10: reload with BitmapCarry keeps read state ──────────────

#[test]
fn test_reload_carries_bitmap_and_counts_arrivals() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["alt.test 000000010 000000001 y"]);

    let mut table = ActiveTable::open(&path).unwrap();
    let id = table.find("alt.test").unwrap();
    bitmap::decode("1-3", Mode::Set, table.group_mut(id)).unwrap();
    assert_eq!(table.group(id).unread, 7);

    // two new articles arrive
    fs::write(&path, "alt.test 000000012 000000001 y\n").unwrap();
    table.load(Some(&BitmapCarry)).unwrap();

    let id = table.find("alt.test").unwrap();
    let grp = table.group(id);
    assert_eq!(grp.max, 12);
    assert_eq!(grp.unread, 9, "7 unread before plus 2 arrivals");
    assert_eq!(bitmap::encode(grp), "1-3");
}

// ─── Test 11: nonstandard field widths survive a bump ───────────────

#[test]
fn test_wide_fields_preserved_on_bump() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["alt.test 0000000010 0000000001 y"]);

    let mut table = ActiveTable::open(&path).unwrap();
    let id = table.find("alt.test").unwrap();
    assert_eq!(table.bump_article(id).unwrap(), 11);

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("alt.test 0000000011 0000000001 y"));
}

// ─── Test 12: single-group refresh keeps session state ──────────────

#[test]
fn test_reread_group_carries_read_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["alt.test 000000010 000000001 y"]);

    let mut ours = ActiveTable::open(&path).unwrap();
    let id = ours.find("alt.test").unwrap();
    bitmap::decode("1-3", Mode::Set, ours.group_mut(id)).unwrap();
    assert_eq!(ours.group(id).unread, 7);

    let mut theirs = ActiveTable::open(&path).unwrap();
    let their_id = theirs.find("alt.test").unwrap();
    assert_eq!(theirs.bump_article(their_id).unwrap(), 11);

    let changed = ours.reread_group(id, Some(&BitmapCarry)).unwrap();
    assert!(changed, "refresh should notice the new article");
    let grp = ours.group(id);
    assert_eq!(grp.max, 11);
    assert_eq!(grp.unread, 8, "arrival should count as unread");
    assert_eq!(bitmap::encode(grp), "1-3");

    let changed = ours.reread_group(id, None).unwrap();
    assert!(!changed, "no range movement, nothing to reconcile");
    assert_eq!(ours.group(id).unread, 8);
}

// ─── Test 13: narrow fields refuse a growing rewrite ────────────────

#[test]
fn test_bump_refuses_to_grow_narrow_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_active(dir.path(), &["alt.test 9 1 y", "alt.next 5 1 y"]);
    let before = fs::read_to_string(&path).unwrap();

    let mut table = ActiveTable::open(&path).unwrap();
    let id = table.find("alt.test").unwrap();
    let err = table.bump_article(id).unwrap_err();
    assert!(
        matches!(err, NewsError::ActiveCorrupt { .. }),
        "9 -> 10 cannot fit the one-digit field, got {err:?}"
    );

    let after = fs::read_to_string(&path).unwrap();
    assert_eq!(before, after, "a refused bump must leave the file untouched");
    assert_eq!(table.group(id).max, 9, "in-core record must not advance either");
}
