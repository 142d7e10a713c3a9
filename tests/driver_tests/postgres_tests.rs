//! Tests for the Postgres driver
//!
//! These run only when `KVSQL_TEST_POSTGRES` names a server as
//! `user:password@host:port`; each test works in its own database there.
//!
//! These tests verify:
//! - Database and schema creation on first open
//! - Revision assignment and conditional writes
//! - Snapshot reads against the compaction watermark
//! - Writers in separate connections share one revision sequence

use std::env;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use kvsql::driver::{Driver, Endpoint, KeyRange, PostgresDriver};
use kvsql::{Config, KvError};
use postgres::NoTls;

// =============================================================================
// Helper Functions
// =============================================================================

/// A driver on an emptied database, or `None` when no server is configured
fn fresh_driver(database: &str) -> Option<(String, PostgresDriver)> {
    let base = env::var("KVSQL_TEST_POSTGRES").ok()?;
    let dsn = format!("{base}/kvsql_test_{database}");
    let driver = PostgresDriver::open(&dsn, &Config::default()).unwrap();

    let mut raw = postgres::Client::connect(&format!("postgres://{dsn}"), NoTls).unwrap();
    raw.batch_execute("TRUNCATE key_value, key_value_meta RESTART IDENTITY")
        .unwrap();
    raw.close().unwrap();

    Some((dsn, driver))
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
fn test_reopen_keeps_history() {
    let Some((dsn, driver)) = fresh_driver("reopen") else {
        return;
    };
    driver.update(b"k", b"v1", 0, 0).unwrap();
    driver.update(b"k", b"v2", 0, 0).unwrap();
    driver.close().unwrap();

    let driver = Endpoint::parse(&format!("postgres://{dsn}"))
        .unwrap()
        .open(&Config::default())
        .unwrap();
    let row = driver.get(b"k").unwrap().unwrap();
    assert_eq!(row.value, Bytes::from_static(b"v2"));
    assert_eq!(row.version, 2);
    assert_eq!(driver.current_revision().unwrap(), 2);
}

#[test]
fn test_closed_driver_reports_closed() {
    let Some((_dsn, driver)) = fresh_driver("closed") else {
        return;
    };
    driver.close().unwrap();

    assert!(matches!(driver.get(b"k"), Err(KvError::Closed)));
    assert!(driver.close().is_ok());
}

// =============================================================================
// Write Tests
// =============================================================================

#[test]
fn test_update_and_delete_columns() {
    let Some((_dsn, driver)) = fresh_driver("columns") else {
        return;
    };

    let (prev, created) = driver.update(b"k", b"v1", 0, 0).unwrap();
    assert!(prev.is_none());
    assert_eq!((created.revision, created.create_revision, created.version), (1, 1, 1));

    let (prev, updated) = driver.update(b"k", b"v2", 0, 0).unwrap();
    assert_eq!(prev.unwrap().revision, 1);
    assert_eq!(updated.old_value, Bytes::from_static(b"v1"));
    assert_eq!((updated.revision, updated.create_revision, updated.version), (2, 1, 2));

    let (live, tombstone) = driver.delete(b"k", 0).unwrap().unwrap();
    assert_eq!(live.revision, 2);
    assert!(tombstone.del);
    assert_eq!(tombstone.revision, 3);
    assert_eq!(tombstone.old_value, Bytes::from_static(b"v2"));

    assert!(driver.delete(b"k", 0).unwrap().is_none());
    assert!(driver.get(b"k").unwrap().unwrap().del);
}

#[test]
fn test_conditional_update_conflict() {
    let Some((_dsn, driver)) = fresh_driver("conflict") else {
        return;
    };
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
    assert_eq!(driver.current_revision().unwrap(), 2);
}

#[test]
fn test_writers_on_separate_connections_share_revisions() {
    let Some((dsn, driver)) = fresh_driver("writers") else {
        return;
    };
    let second = Arc::new(PostgresDriver::open(&dsn, &Config::default()).unwrap());
    let first = Arc::new(driver);

    let handles: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .enumerate()
        .map(|(i, driver)| {
            thread::spawn(move || {
                for j in 0..20 {
                    let key = format!("w{i}/{j}");
                    driver.update(key.as_bytes(), b"v", 0, 0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let rows = first.after(&KeyRange::all(), 0, 0).unwrap();
    let revisions: Vec<i64> = rows.iter().map(|r| r.revision).collect();
    assert_eq!(revisions, (1..=40).collect::<Vec<_>>());
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_list_and_count_latest_per_key() {
    let Some((_dsn, driver)) = fresh_driver("list") else {
        return;
    };
    driver.update(b"a/1", b"x", 0, 0).unwrap();
    driver.update(b"a/2", b"x", 0, 0).unwrap();
    driver.update(b"a/1", b"y", 0, 0).unwrap();
    driver.update(b"b/1", b"x", 0, 0).unwrap();
    driver.delete(b"a/2", 0).unwrap();

    let list = driver.list(0, 0, &prefix("a/")).unwrap();
    assert_eq!(list.revision, 5);
    assert_eq!(list.rows.len(), 1);
    assert_eq!(list.rows[0].value, Bytes::from_static(b"y"));

    let list = driver.list(3, 0, &prefix("a/")).unwrap();
    let names: Vec<_> = list.rows.iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec![Bytes::from_static(b"a/1"), Bytes::from_static(b"a/2")]);
    assert_eq!(list.revision, 5);

    assert_eq!(driver.count(0, &prefix("a/")).unwrap(), (5, 1));
    assert_eq!(driver.count(3, &prefix("a/")).unwrap(), (5, 2));
}

#[test]
fn test_snapshot_reads_check_the_watermark() {
    let Some((_dsn, driver)) = fresh_driver("watermark") else {
        return;
    };
    for i in 1..=6 {
        driver.update(b"k", i.to_string().as_bytes(), 0, 0).unwrap();
    }
    assert_eq!(driver.compact(4).unwrap(), 3);
    assert_eq!(driver.compact_revision().unwrap(), 4);

    let range = KeyRange::Single(Bytes::from_static(b"k"));
    assert!(matches!(driver.list(3, 0, &range), Err(KvError::Compacted { .. })));
    assert!(matches!(driver.count(3, &range), Err(KvError::Compacted { .. })));

    let list = driver.list(4, 0, &range).unwrap();
    assert_eq!(list.rows[0].value, Bytes::from_static(b"4"));

    assert!(matches!(
        driver.count(7, &range),
        Err(KvError::FutureRevision {
            requested: 7,
            current: 6
        })
    ));
}

#[test]
fn test_expired_lists_only_current_live_rows() {
    let Some((_dsn, driver)) = fresh_driver("expired") else {
        return;
    };
    driver.update(b"lease", b"v", 0, 60).unwrap();
    driver.update(b"plain", b"v", 0, 0).unwrap();
    driver.update(b"gone", b"v", 0, 60).unwrap();
    driver.delete(b"gone", 0).unwrap();

    let now = driver.get(b"lease").unwrap().unwrap().ttl;
    let expired = driver.expired(now, 10).unwrap();
    let names: Vec<_> = expired.iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec![Bytes::from_static(b"lease")]);

    assert!(driver.expired(now - 1, 10).unwrap().is_empty());
}
