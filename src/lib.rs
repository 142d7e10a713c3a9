//! # kvsql
//!
//! An etcd v3 style key-value store kept in a single SQL table:
//! - Every put and delete appends a row with the next global revision
//! - Reads pick the newest row per key, optionally as of an older revision
//! - Watches stream appended rows as typed events
//! - One in-flight write per key; different keys proceed in parallel
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Client                               │
//! │            (KV · Watch · Lease stub · Cluster stub)          │
//! └──────────────┬─────────────────────────────┬────────────────┘
//!                │                             │
//!                ▼                             ▼
//!   ┌────────────────────────┐      ┌──────────────────────┐
//!   │         SqlKv          │      │      SqlWatcher      │
//!   │  (per-key KeyLocker)   │      │  (stream per watch)  │
//!   └───────────┬────────────┘      └──────────▲───────────┘
//!               │ writes notify                │ batches
//!               │         ┌────────────────────┴───────────┐
//!               │         │  Broadcaster (poller thread)   │
//!               │         └────────────────────▲───────────┘
//!               ▼                              │ rows after rev
//!   ┌─────────────────────────────────────────────────────────┐
//!   │         Driver (SqliteDriver | PostgresDriver)          │
//!   │          append-only key_value history table            │
//!   └─────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod context;

pub mod types;
pub mod op;
pub mod driver;
pub mod locker;
pub mod kv;
pub mod watch;
pub mod lease;
pub mod cluster;
pub mod cleanup;
pub mod client;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KvError, Result};
pub use config::Config;
pub use context::{CancelHandle, Context};
pub use client::{Backend, Client, ConnectionPool};
pub use kv::{Compare, CompareResult, CompareTarget, Kv, SqlKv, Txn};
pub use watch::{SqlWatcher, WatchChan, Watcher};
pub use lease::Lease;
pub use cluster::Cluster;
pub use op::{
    with_compact_physical, with_count_only, with_created_notify, with_from_key, with_keys_only,
    with_lease, with_limit, with_prefix, with_prev_kv, with_range, with_rev, with_serializable,
    CompactOption, Op, OpOption,
};
pub use types::*;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of kvsql
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
