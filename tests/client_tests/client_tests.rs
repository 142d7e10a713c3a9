//! Tests for the client wrapper
//!
//! These tests verify:
//! - Endpoint validation at construction
//! - Backend sharing through the connection pool
//! - Lease and cluster surfaces
//! - Pool close semantics

use kvsql::lease::Lease;
use kvsql::cluster::Cluster;
use kvsql::{with_lease, Client, Config, ConnectionPool, Context, Kv, KvError};
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn temp_endpoint(temp_dir: &TempDir) -> String {
    format!("sqlite://{}", temp_dir.path().join("state.db").display())
}

fn config_for(endpoint: &str) -> Config {
    Config::builder()
        .endpoint(endpoint)
        .compact_interval_ms(0)
        .build()
}

// =============================================================================
// Construction Tests
// =============================================================================

#[test]
fn test_client_requires_exactly_one_endpoint() {
    let pool = ConnectionPool::new();

    let none = Client::new(&pool, Config::default());
    assert!(matches!(none, Err(KvError::Config(_))));

    let two = Config::builder()
        .endpoints(["sqlite://a.db", "sqlite://b.db"])
        .build();
    assert!(matches!(Client::new(&pool, two), Err(KvError::Config(_))));
    assert!(pool.is_empty());
}

#[test]
fn test_client_rejects_malformed_endpoint() {
    let pool = ConnectionPool::new();

    let missing_scheme = Config::builder().endpoint("state.db").build();
    assert!(matches!(Client::new(&pool, missing_scheme), Err(KvError::Config(_))));

    let unknown_engine = Config::builder().endpoint("oracle://db").build();
    assert!(matches!(Client::new(&pool, unknown_engine), Err(KvError::Config(_))));
}

#[test]
fn test_clients_share_backend_per_endpoint() {
    let temp_dir = TempDir::new().unwrap();
    let endpoint = temp_endpoint(&temp_dir);
    let pool = ConnectionPool::new();

    let a = Client::new(&pool, config_for(&endpoint)).unwrap();
    let b = Client::new(&pool, config_for(&endpoint)).unwrap();
    assert!(Arc::ptr_eq(a.backend(), b.backend()));
    assert_eq!(pool.len(), 1);

    let ctx = Context::background();
    a.kv().put(&ctx, "shared", "from-a", &[]).unwrap();
    let got = b.kv().get(&ctx, "shared", &[]).unwrap();
    assert_eq!(got.kvs[0].value_str(), "from-a");

    let other = TempDir::new().unwrap();
    let c = Client::new(&pool, config_for(&temp_endpoint(&other))).unwrap();
    assert!(!Arc::ptr_eq(a.backend(), c.backend()));
    assert_eq!(pool.len(), 2);
}

#[test]
fn test_pool_close_endpoint() {
    let temp_dir = TempDir::new().unwrap();
    let endpoint = temp_endpoint(&temp_dir);
    let pool = ConnectionPool::new();
    let client = Client::new(&pool, config_for(&endpoint)).unwrap();

    assert!(pool.close(&endpoint).unwrap());
    assert!(!pool.close(&endpoint).unwrap());
    assert!(pool.is_empty());
    assert!(client.backend().is_closed());

    let err = client
        .kv()
        .put(&Context::background(), "k", "v", &[])
        .unwrap_err();
    assert!(matches!(err, KvError::Closed));

    // Reopening the endpoint gives a fresh backend over the same data
    let reopened = Client::new(&pool, config_for(&endpoint)).unwrap();
    assert_eq!(reopened.backend().driver().current_revision().unwrap(), 0);
}

#[test]
fn test_pool_open_with_default_config() {
    let temp_dir = TempDir::new().unwrap();
    let endpoint = temp_endpoint(&temp_dir);
    let pool = ConnectionPool::new();

    let backend = pool.open(&endpoint).unwrap();
    assert_eq!(backend.endpoint().to_string(), endpoint);
    pool.close_all().unwrap();
    assert!(backend.is_closed());
}

// =============================================================================
// Lease & Cluster Tests
// =============================================================================

#[test]
fn test_lease_grant_is_ttl_handle() {
    let temp_dir = TempDir::new().unwrap();
    let pool = ConnectionPool::new();
    let client = Client::new(&pool, config_for(&temp_endpoint(&temp_dir))).unwrap();
    let ctx = Context::background();

    let lease = client.lease().grant(&ctx, 30).unwrap();
    assert_eq!(lease.id, 30);
    assert_eq!(lease.ttl, 30);

    client.kv().put(&ctx, "k", "v", &[with_lease(lease.id)]).unwrap();
    assert!(client.kv().get(&ctx, "k", &[]).unwrap().kvs[0].lease > 0);

    assert!(matches!(client.lease().grant(&ctx, 0), Err(KvError::Validation(_))));
}

#[test]
fn test_lease_management_is_unimplemented() {
    let temp_dir = TempDir::new().unwrap();
    let pool = ConnectionPool::new();
    let client = Client::new(&pool, config_for(&temp_endpoint(&temp_dir))).unwrap();
    let ctx = Context::background();
    let lease = client.lease();

    assert!(lease.revoke(&ctx, 30).unwrap_err().is_unimplemented());
    assert!(lease.keep_alive_once(&ctx, 30).unwrap_err().is_unimplemented());
    assert!(lease.time_to_live(&ctx, 30).unwrap_err().is_unimplemented());
    assert!(lease.watch_lease(&ctx, 30).unwrap_err().is_unimplemented());
}

#[test]
fn test_cluster_reports_single_member() {
    let temp_dir = TempDir::new().unwrap();
    let endpoint = temp_endpoint(&temp_dir);
    let pool = ConnectionPool::new();
    let client = Client::new(&pool, config_for(&endpoint)).unwrap();
    let ctx = Context::background();

    let list = client.cluster().member_list(&ctx).unwrap();
    assert_eq!(list.members.len(), 1);
    assert_eq!(list.members[0].name, "kvsql");
    assert_eq!(list.members[0].client_urls, vec![endpoint]);

    assert!(client.cluster().member_add(&ctx, &[]).unwrap_err().is_unimplemented());
    assert!(client.cluster().member_remove(&ctx, 1).unwrap_err().is_unimplemented());
    assert!(client.cluster().member_update(&ctx, 1, &[]).unwrap_err().is_unimplemented());
}
