//! Tests for the SQLite driver
//!
//! These tests verify:
//! - Schema creation and reopening an existing database
//! - Revision assignment and the row lifecycle columns
//! - Conditional writes
//! - Range listing, counting, and rows-after-revision
//! - Expiry queries and compaction

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use kvsql::driver::{Driver, Endpoint, KeyRange, SqliteDriver};
use kvsql::{Config, KvError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_driver() -> (TempDir, SqliteDriver) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("state.db");
    let driver = SqliteDriver::open(path.to_str().unwrap(), &Config::default()).unwrap();
    (temp_dir, driver)
}

fn prefix(p: &'static str) -> KeyRange {
    KeyRange::Span {
        start: Bytes::from_static(p.as_bytes()),
        end: kvsql::op::prefix_end(p.as_bytes()),
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_open_creates_parent_directories() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("dir").join("state.db");

    let _driver = SqliteDriver::open(path.to_str().unwrap(), &Config::default()).unwrap();

    assert!(path.exists());
}

#[test]
fn test_reopen_keeps_history() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("state.db");
    let path = path.to_str().unwrap();

    {
        let driver = SqliteDriver::open(path, &Config::default()).unwrap();
        driver.update(b"k", b"v1", 0, 0).unwrap();
        driver.update(b"k", b"v2", 0, 0).unwrap();
        driver.close().unwrap();
    }

    let driver = SqliteDriver::open(path, &Config::default()).unwrap();
    assert_eq!(driver.current_revision().unwrap(), 2);
    let (_, row) = driver.update(b"k", b"v3", 0, 0).unwrap();
    assert_eq!(row.revision, 3);
    assert_eq!(row.version, 3);
}

#[test]
fn test_closed_driver_reports_closed() {
    let driver = SqliteDriver::in_memory().unwrap();
    driver.close().unwrap();
    driver.close().unwrap();

    assert!(matches!(driver.get(b"k"), Err(KvError::Closed)));
    assert!(matches!(driver.update(b"k", b"v", 0, 0), Err(KvError::Closed)));
}

#[test]
fn test_endpoint_opens_memory_engine() {
    let endpoint = Endpoint::parse("sqlite://:memory:").unwrap();
    let driver = endpoint.open(&Config::default()).unwrap();

    driver.update(b"k", b"v", 0, 0).unwrap();
    assert_eq!(driver.current_revision().unwrap(), 1);
    assert_eq!(endpoint.to_string(), "sqlite://:memory:");
}

// =============================================================================
// Write Tests
// =============================================================================

#[test]
fn test_update_and_delete_columns() {
    let (_temp, driver) = setup_temp_driver();

    let (prev, first) = driver.update(b"k", b"v1", 0, 0).unwrap();
    assert!(prev.is_none());
    assert_eq!((first.revision, first.create_revision, first.version), (1, 1, 1));
    assert_eq!(first.old_revision, 0);

    let (prev, second) = driver.update(b"k", b"v2", 0, 0).unwrap();
    assert_eq!(prev.unwrap().revision, 1);
    assert_eq!((second.revision, second.create_revision, second.version), (2, 1, 2));
    assert_eq!(second.old_value, Bytes::from_static(b"v1"));
    assert_eq!(second.old_revision, 1);

    let (live, tombstone) = driver.delete(b"k", 0).unwrap().unwrap();
    assert_eq!(live.revision, 2);
    assert!(tombstone.del);
    assert_eq!(tombstone.revision, 3);
    assert_eq!(tombstone.version, 3);
    assert_eq!(tombstone.old_value, Bytes::from_static(b"v2"));

    // The tombstone is still the newest row
    assert!(driver.get(b"k").unwrap().unwrap().del);
    assert!(driver.delete(b"k", 0).unwrap().is_none());

    let (prev, recreated) = driver.update(b"k", b"v3", 0, 0).unwrap();
    assert!(prev.is_none());
    assert_eq!((recreated.create_revision, recreated.version), (4, 1));
}

#[test]
fn test_conditional_update_conflict() {
    let (_temp, driver) = setup_temp_driver();
    driver.update(b"k", b"v1", 0, 0).unwrap();

    let err = driver.update(b"k", b"v2", 7, 0).unwrap_err();
    assert!(matches!(
        err,
        KvError::Conflict {
            expected: 7,
            actual: 1,
            ..
        }
    ));
    assert_eq!(driver.current_revision().unwrap(), 1);

    driver.update(b"k", b"v2", 1, 0).unwrap();
    assert!(driver.delete(b"k", 1).is_err());
    assert!(driver.delete(b"k", 2).unwrap().is_some());
}

#[test]
fn test_concurrent_updates_are_serialized() {
    let (_temp, driver) = setup_temp_driver();
    let driver = Arc::new(driver);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let driver = Arc::clone(&driver);
            thread::spawn(move || {
                for i in 0..20 {
                    let key = format!("t{t}/{i}");
                    driver.update(key.as_bytes(), b"v", 0, 0).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let rows = driver.after(&KeyRange::all(), 0, 0).unwrap();
    let revisions: Vec<i64> = rows.iter().map(|r| r.revision).collect();
    assert_eq!(revisions, (1..=80).collect::<Vec<_>>());
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_list_latest_per_key() {
    let (_temp, driver) = setup_temp_driver();
    driver.update(b"/a/2", b"x", 0, 0).unwrap();
    driver.update(b"/a/1", b"x", 0, 0).unwrap();
    driver.update(b"/a/2", b"y", 0, 0).unwrap();
    driver.update(b"/b/1", b"x", 0, 0).unwrap();
    driver.delete(b"/a/1", 0).unwrap();

    let list = driver.list(0, 0, &prefix("/a/")).unwrap();
    assert_eq!(list.revision, 5);
    assert_eq!(list.rows.len(), 1);
    assert_eq!(list.rows[0].name, Bytes::from_static(b"/a/2"));
    assert_eq!(list.rows[0].value, Bytes::from_static(b"y"));

    // As of revision 2 both keys were live with their first values
    let list = driver.list(2, 0, &prefix("/a/")).unwrap();
    let names: Vec<_> = list.rows.iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec![Bytes::from_static(b"/a/1"), Bytes::from_static(b"/a/2")]);
    assert_eq!(list.rows[1].value, Bytes::from_static(b"x"));

    assert_eq!(driver.count(0, &KeyRange::all()).unwrap(), (5, 2));
    assert_eq!(driver.count(3, &KeyRange::all()).unwrap(), (5, 2));
    assert_eq!(driver.list(0, 1, &KeyRange::all()).unwrap().rows.len(), 1);
}

#[test]
fn test_keys_compare_bytewise() {
    let (_temp, driver) = setup_temp_driver();
    driver.update(b"a\xff", b"x", 0, 0).unwrap();
    driver.update(b"b", b"x", 0, 0).unwrap();
    driver.update(b"a\x00", b"x", 0, 0).unwrap();

    let list = driver.list(0, 0, &prefix("a")).unwrap();
    let names: Vec<_> = list.rows.iter().map(|r| r.name.to_vec()).collect();
    assert_eq!(names, vec![b"a\x00".to_vec(), b"a\xff".to_vec()]);
}

#[test]
fn test_after_returns_every_row_in_order() {
    let (_temp, driver) = setup_temp_driver();
    driver.update(b"k", b"1", 0, 0).unwrap();
    driver.update(b"other", b"1", 0, 0).unwrap();
    driver.update(b"k", b"2", 0, 0).unwrap();
    driver.delete(b"k", 0).unwrap();

    let rows = driver
        .after(&KeyRange::Single(Bytes::from_static(b"k")), 1, 0)
        .unwrap();
    let revisions: Vec<_> = rows.iter().map(|r| (r.revision, r.del)).collect();
    assert_eq!(revisions, vec![(3, false), (4, true)]);

    assert_eq!(driver.after(&KeyRange::all(), 0, 2).unwrap().len(), 2);
}

// =============================================================================
// Maintenance Tests
// =============================================================================

#[test]
fn test_expired_lists_only_current_live_rows() {
    let (_temp, driver) = setup_temp_driver();
    let (_, a) = driver.update(b"a", b"x", 0, 10).unwrap();
    driver.update(b"b", b"x", 0, 10).unwrap();
    driver.update(b"b", b"y", 0, 0).unwrap();
    driver.update(b"c", b"x", 0, 0).unwrap();

    let expired = driver.expired(a.ttl + 1, 100).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].name, Bytes::from_static(b"a"));

    assert!(driver.expired(a.ttl - 20, 100).unwrap().is_empty());
}

#[test]
fn test_compact_keeps_state_at_target() {
    let (_temp, driver) = setup_temp_driver();
    driver.update(b"a", b"1", 0, 0).unwrap(); // 1
    driver.update(b"a", b"2", 0, 0).unwrap(); // 2
    driver.update(b"b", b"1", 0, 0).unwrap(); // 3
    driver.delete(b"b", 0).unwrap(); // 4
    driver.update(b"a", b"3", 0, 0).unwrap(); // 5

    let before = driver.list(4, 0, &KeyRange::all()).unwrap().rows;
    let removed = driver.compact(4).unwrap();
    assert_eq!(removed, 3);
    assert_eq!(driver.compact_revision().unwrap(), 4);

    let after = driver.list(4, 0, &KeyRange::all()).unwrap().rows;
    assert_eq!(before, after);
    assert_eq!(driver.get(b"a").unwrap().unwrap().revision, 5);

    // Compacting backwards is a no-op
    assert_eq!(driver.compact(2).unwrap(), 0);
    assert_eq!(driver.compact_revision().unwrap(), 4);
}

#[test]
fn test_snapshot_reads_check_the_watermark() {
    let (_temp, driver) = setup_temp_driver();
    for i in 0..6 {
        driver.update(b"k", i.to_string().as_bytes(), 0, 0).unwrap();
    }
    driver.compact(4).unwrap();

    let err = driver.list(3, 0, &KeyRange::all()).unwrap_err();
    assert!(matches!(
        err,
        KvError::Compacted {
            revision: 3,
            compact_revision: 4
        }
    ));
    assert!(matches!(
        driver.count(3, &KeyRange::all()),
        Err(KvError::Compacted { .. })
    ));

    let list = driver.list(4, 0, &KeyRange::all()).unwrap();
    assert_eq!(list.revision, 6);
    assert_eq!(list.rows[0].value, Bytes::from_static(b"3"));

    assert!(matches!(
        driver.list(7, 0, &KeyRange::all()),
        Err(KvError::FutureRevision {
            requested: 7,
            current: 6
        })
    ));
    assert!(matches!(
        driver.count(7, &KeyRange::all()),
        Err(KvError::FutureRevision { .. })
    ));
}

#[test]
fn test_revision_survives_full_compaction() {
    let (_temp, driver) = setup_temp_driver();
    driver.update(b"a", b"1", 0, 0).unwrap();
    driver.delete(b"a", 0).unwrap();

    driver.compact(2).unwrap();
    assert!(driver.after(&KeyRange::all(), 0, 0).unwrap().is_empty());
    assert_eq!(driver.current_revision().unwrap(), 2);

    let (_, row) = driver.update(b"a", b"again", 0, 0).unwrap();
    assert_eq!(row.revision, 3);
}
