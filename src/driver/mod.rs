//! Driver Module
//!
//! Storage engines behind one SQL-shaped contract.
//!
//! ## Responsibilities
//! - Persist every key revision in one append-only table
//! - Assign the global revision inside the insert transaction
//! - Answer latest-per-key and as-of-revision range queries
//! - Feed watches with the rows appended after a revision
//! - Remove superseded history on request (compaction)
//!
//! ## Row Lifecycle
//! ```text
//!   put k=v1 ──► rev 1  version 1  create 1
//!   put k=v2 ──► rev 2  version 2  create 1  old=(v1, 1)
//!   del k    ──► rev 3  version 3  create 1  old=(v2, 2)  del
//!   put k=v3 ──► rev 4  version 1  create 4
//! ```
//! The row with the highest revision for a name is the key's state.

mod schema;
pub mod postgres;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::config::Config;
use crate::error::{KvError, Result};
use crate::types::KeyValue;

pub use self::postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

/// One row of the history table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRevision {
    /// Storage-assigned row id, not the logical revision
    pub id: i64,
    pub name: Bytes,
    pub value: Bytes,
    /// Value of the preceding live revision
    pub old_value: Bytes,
    /// Revision of the preceding live revision, 0 if none
    pub old_revision: i64,
    pub create_revision: i64,
    pub revision: i64,
    /// Absolute expiry in Unix seconds, 0 for none
    pub ttl: i64,
    pub version: i64,
    /// Tombstone flag
    pub del: bool,
}

impl KeyRevision {
    /// The caller-facing view of this row
    pub fn to_key_value(&self) -> KeyValue {
        if self.del {
            return KeyValue {
                key: self.name.clone(),
                mod_revision: self.revision,
                ..Default::default()
            };
        }
        KeyValue {
            key: self.name.clone(),
            create_revision: self.create_revision,
            mod_revision: self.revision,
            version: self.version,
            value: self.value.clone(),
            lease: self.ttl,
        }
    }

    /// The preceding live revision, rebuilt from the cached columns
    pub fn prev_key_value(&self) -> Option<KeyValue> {
        if self.version <= 1 || self.old_revision == 0 {
            return None;
        }
        Some(KeyValue {
            key: self.name.clone(),
            create_revision: self.create_revision,
            mod_revision: self.old_revision,
            version: self.version - 1,
            value: self.old_value.clone(),
            lease: 0,
        })
    }
}

/// Keys an operation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Exactly one key
    Single(Bytes),
    /// `[start, end)`; no end means the rest of the keyspace
    Span { start: Bytes, end: Option<Bytes> },
}

impl KeyRange {
    /// Every key
    pub fn all() -> Self {
        KeyRange::Span {
            start: Bytes::new(),
            end: None,
        }
    }

    pub fn start(&self) -> &Bytes {
        match self {
            KeyRange::Single(key) => key,
            KeyRange::Span { start, .. } => start,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            KeyRange::Single(k) => k.as_ref() == key,
            KeyRange::Span { start, end } => {
                key >= start.as_ref() && end.as_ref().map_or(true, |end| key < end.as_ref())
            }
        }
    }
}

/// Rows of a range read plus the revision the read observed
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Store revision when the read ran
    pub revision: i64,
    pub rows: Vec<KeyRevision>,
}

/// Parameterized SQL contract every engine implements.
///
/// Each call is one atomic unit against storage. Callers serialize writes
/// to a single key; the driver only guarantees revision order.
pub trait Driver: Send + Sync {
    /// Newest row for `name`, tombstone or not
    fn get(&self, name: &[u8]) -> Result<Option<KeyRevision>>;

    /// Newest live row per key in `range`, as of `revision` when it is
    /// positive, ordered by key. `limit` 0 is unbounded.
    ///
    /// Fails with `Compacted` or `FutureRevision` when `revision` is outside
    /// the retained history, checked in the same transaction as the read.
    fn list(&self, revision: i64, limit: i64, range: &KeyRange) -> Result<ListResult>;

    /// Number of live keys in `range` as of `revision`, with the store
    /// revision. Fails like [`Driver::list`].
    fn count(&self, revision: i64, range: &KeyRange) -> Result<(i64, i64)>;

    /// Append the next revision of `name`.
    ///
    /// With `prev_revision > 0` the write only happens if that is the key's
    /// current live revision. `lease_ttl` is relative, in seconds.
    /// Returns the replaced live row, if any, and the new row.
    fn update(
        &self,
        name: &[u8],
        value: &[u8],
        prev_revision: i64,
        lease_ttl: i64,
    ) -> Result<(Option<KeyRevision>, KeyRevision)>;

    /// Append a tombstone for `name`.
    ///
    /// Returns the deleted live row and the tombstone, or `None` when the
    /// key was already absent.
    fn delete(&self, name: &[u8], prev_revision: i64)
        -> Result<Option<(KeyRevision, KeyRevision)>>;

    /// Rows in `range` with a revision above `revision`, in revision order
    fn after(&self, range: &KeyRange, revision: i64, limit: i64) -> Result<Vec<KeyRevision>>;

    fn current_revision(&self) -> Result<i64>;

    /// Revision at or below which history has been removed
    fn compact_revision(&self) -> Result<i64>;

    /// Live keys whose expiry is at or before `now` (Unix seconds)
    fn expired(&self, now: i64, limit: i64) -> Result<Vec<KeyRevision>>;

    /// Remove history superseded at or below `target`; returns rows removed
    fn compact(&self, target: i64) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

// =============================================================================
// Row Construction
// =============================================================================

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `Conflict` unless `expected` is 0 or the live row's revision
pub(crate) fn check_prev_revision(
    name: &[u8],
    live: Option<&KeyRevision>,
    expected: i64,
) -> Result<()> {
    if expected <= 0 {
        return Ok(());
    }
    let actual = live.map_or(0, |r| r.revision);
    if actual != expected {
        return Err(KvError::Conflict {
            key: String::from_utf8_lossy(name).into_owned(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// The row a write of `value` appends after `live` at `revision`
pub(crate) fn next_row(
    name: &[u8],
    value: &[u8],
    live: Option<&KeyRevision>,
    revision: i64,
    lease_ttl: i64,
) -> KeyRevision {
    let mut row = match live {
        Some(prev) => KeyRevision {
            create_revision: prev.create_revision,
            version: prev.version + 1,
            old_value: prev.value.clone(),
            old_revision: prev.revision,
            ..Default::default()
        },
        None => KeyRevision {
            create_revision: revision,
            version: 1,
            ..Default::default()
        },
    };
    row.name = Bytes::copy_from_slice(name);
    row.value = Bytes::copy_from_slice(value);
    row.revision = revision;
    row.ttl = if lease_ttl > 0 { now_unix() + lease_ttl } else { 0 };
    row
}

/// The tombstone that deletes `live` at `revision`
pub(crate) fn tombstone(live: &KeyRevision, revision: i64) -> KeyRevision {
    KeyRevision {
        name: live.name.clone(),
        old_value: live.value.clone(),
        old_revision: live.revision,
        create_revision: live.create_revision,
        revision,
        version: live.version + 1,
        del: true,
        ..Default::default()
    }
}

/// Whether a read as of `revision` can be served.
///
/// The watermark itself stays readable: compaction keeps each key's newest
/// row at or below it.
pub(crate) fn check_snapshot(revision: i64, compact_revision: i64, current: i64) -> Result<()> {
    if revision < compact_revision {
        return Err(KvError::Compacted {
            revision,
            compact_revision,
        });
    }
    if revision > current {
        return Err(KvError::FutureRevision {
            requested: revision,
            current,
        });
    }
    Ok(())
}

// =============================================================================
// Engine Selection
// =============================================================================

/// Storage engines a kvsql endpoint can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Embedded single-file engine
    Sqlite,
    /// Client/server engine
    Postgres,
}

impl FromStr for Engine {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite" => Ok(Engine::Sqlite),
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            other => Err(KvError::Config(format!("unknown storage engine {other:?}"))),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Sqlite => f.write_str("sqlite"),
            Engine::Postgres => f.write_str("postgres"),
        }
    }
}

/// A parsed `<engine>://<path-or-dsn>` endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub engine: Engine,
    pub dsn: String,
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let (engine, dsn) = endpoint
            .split_once("://")
            .ok_or_else(|| KvError::Config(format!("invalid kvsql endpoint {endpoint:?}")))?;
        Ok(Self {
            engine: engine.parse()?,
            dsn: dsn.to_string(),
        })
    }

    /// Open the engine this endpoint names
    pub fn open(&self, config: &Config) -> Result<Arc<dyn Driver>> {
        match self.engine {
            Engine::Sqlite => Ok(Arc::new(SqliteDriver::open(&self.dsn, config)?)),
            Engine::Postgres => Ok(Arc::new(PostgresDriver::open(&self.dsn, config)?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.engine, self.dsn)
    }
}
