//! Tests for transactions
//!
//! These tests verify:
//! - Compare evaluation selects the then/otherwise branch
//! - Branch ops run and report their responses
//! - Builder misuse is reported at commit
//! - Concurrent compare-and-swap transactions never lose updates

use std::sync::Arc;
use std::thread;

use kvsql::{
    with_prefix, with_prev_kv, Client, Compare, CompareResult, Config, ConnectionPool, Context,
    Kv, KvError, Op, ResponseOp,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_client() -> (TempDir, ConnectionPool, Client) {
    let temp_dir = TempDir::new().unwrap();
    let endpoint = format!("sqlite://{}", temp_dir.path().join("state.db").display());
    let config = Config::builder()
        .endpoint(endpoint)
        .compact_interval_ms(0)
        .build();
    let pool = ConnectionPool::new();
    let client = Client::new(&pool, config).unwrap();
    (temp_dir, pool, client)
}

fn value_of(client: &Client, key: &str) -> Option<String> {
    client
        .kv()
        .get(&Context::background(), key, &[])
        .unwrap()
        .kvs
        .first()
        .map(|kv| kv.value_str().into_owned())
}

// =============================================================================
// Branch Selection Tests
// =============================================================================

#[test]
fn test_txn_create_if_absent() {
    let (_temp, _pool, client) = setup_temp_client();
    let ctx = Context::background();

    let create = || {
        client
            .kv()
            .txn(&ctx)
            .when([Compare::mod_revision("lock", CompareResult::Equal, 0)])
            .then([Op::put("lock", "owner-1", &[]).unwrap()])
            .otherwise([Op::get("lock", &[]).unwrap()])
            .commit()
            .unwrap()
    };

    let first = create();
    assert!(first.succeeded);
    assert_eq!(first.header.revision, 1);
    assert!(matches!(&first.responses[0], ResponseOp::Put(p) if p.header.revision == 1));

    let second = create();
    assert!(!second.succeeded);
    match &second.responses[0] {
        ResponseOp::Get(get) => assert_eq!(get.kvs[0].value_str(), "owner-1"),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn test_txn_value_compare_and_swap() {
    let (_temp, _pool, client) = setup_temp_client();
    let ctx = Context::background();
    client.kv().put(&ctx, "k", "old", &[]).unwrap();

    let resp = client
        .kv()
        .txn(&ctx)
        .when([Compare::value("k", CompareResult::Equal, "old")])
        .then([Op::put("k", "new", &[with_prev_kv()]).unwrap()])
        .commit()
        .unwrap();
    assert!(resp.succeeded);
    match &resp.responses[0] {
        ResponseOp::Put(put) => assert_eq!(put.prev_kv.as_ref().unwrap().value_str(), "old"),
        other => panic!("unexpected response {other:?}"),
    }

    let resp = client
        .kv()
        .txn(&ctx)
        .when([Compare::value("k", CompareResult::Equal, "old")])
        .then([Op::put("k", "newer", &[]).unwrap()])
        .commit()
        .unwrap();
    assert!(!resp.succeeded);
    assert!(resp.responses.is_empty());
    assert_eq!(value_of(&client, "k").as_deref(), Some("new"));
}

#[test]
fn test_txn_all_compares_must_hold() {
    let (_temp, _pool, client) = setup_temp_client();
    let ctx = Context::background();
    client.kv().put(&ctx, "a", "1", &[]).unwrap();
    client.kv().put(&ctx, "b", "1", &[]).unwrap();

    let resp = client
        .kv()
        .txn(&ctx)
        .when([
            Compare::version("a", CompareResult::Equal, 1),
            Compare::version("b", CompareResult::Greater, 1),
        ])
        .then([Op::delete("a", &[]).unwrap()])
        .otherwise([Op::put("b", "2", &[]).unwrap()])
        .commit()
        .unwrap();

    assert!(!resp.succeeded);
    assert_eq!(value_of(&client, "a").as_deref(), Some("1"));
    assert_eq!(value_of(&client, "b").as_deref(), Some("2"));
}

#[test]
fn test_txn_ops_get_their_own_revisions() {
    let (_temp, _pool, client) = setup_temp_client();
    let ctx = Context::background();
    client.kv().put(&ctx, "dir/x", "1", &[]).unwrap();
    client.kv().put(&ctx, "dir/y", "1", &[]).unwrap();

    let resp = client
        .kv()
        .txn(&ctx)
        .then([
            Op::put("a", "1", &[]).unwrap(),
            Op::put("b", "1", &[]).unwrap(),
            Op::delete("dir/", &[with_prefix()]).unwrap(),
        ])
        .commit()
        .unwrap();

    assert!(resp.succeeded);
    assert_eq!(resp.header.revision, 6);
    let revisions: Vec<i64> = resp
        .responses
        .iter()
        .map(|r| match r {
            ResponseOp::Put(p) => p.header.revision,
            ResponseOp::Delete(d) => d.header.revision,
            ResponseOp::Get(g) => g.header.revision,
        })
        .collect();
    assert_eq!(revisions, vec![3, 4, 6]);
    match &resp.responses[2] {
        ResponseOp::Delete(d) => assert_eq!(d.deleted, 2),
        other => panic!("unexpected response {other:?}"),
    }
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_txn_builder_misuse() {
    let (_temp, _pool, client) = setup_temp_client();
    let ctx = Context::background();

    let err = client
        .kv()
        .txn(&ctx)
        .then([Op::put("a", "1", &[]).unwrap()])
        .when([Compare::version("a", CompareResult::Equal, 0)])
        .commit()
        .unwrap_err();
    assert!(matches!(err, KvError::Validation(_)));

    let err = client
        .kv()
        .txn(&ctx)
        .otherwise(Vec::<Op>::new())
        .otherwise(Vec::<Op>::new())
        .commit()
        .unwrap_err();
    assert!(matches!(err, KvError::Validation(_)));

    assert_eq!(value_of(&client, "a"), None);
}

#[test]
fn test_txn_rejects_watch_ops() {
    let (_temp, _pool, client) = setup_temp_client();
    let ctx = Context::background();

    let err = client
        .kv()
        .txn(&ctx)
        .then([Op::watch("a", &[]).unwrap()])
        .commit()
        .unwrap_err();
    assert!(matches!(err, KvError::Validation(_)));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_cas_counter() {
    let (_temp, _pool, client) = setup_temp_client();
    let client = Arc::new(client);
    client.kv().put(&Context::background(), "counter", "0", &[]).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let ctx = Context::background();
                let mut done = 0;
                while done < 10 {
                    let current = client.kv().get(&ctx, "counter", &[]).unwrap().kvs[0].clone();
                    let next: i64 = current.value_str().parse::<i64>().unwrap() + 1;
                    let resp = client
                        .kv()
                        .txn(&ctx)
                        .when([Compare::mod_revision(
                            "counter",
                            CompareResult::Equal,
                            current.mod_revision,
                        )])
                        .then([Op::put("counter", next.to_string(), &[]).unwrap()])
                        .commit()
                        .unwrap();
                    if resp.succeeded {
                        done += 1;
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(value_of(&client, "counter").as_deref(), Some("40"));
}
