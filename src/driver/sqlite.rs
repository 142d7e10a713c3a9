//! SQLite Driver
//!
//! Embedded single-file engine. One connection is shared by every caller;
//! each trait call takes the connection lock and runs one transaction.

use std::fs;
use std::path::Path;

use bytes::Bytes;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use rusqlite::types::ToSqlOutput;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, ToSql, TransactionBehavior,
};

use crate::config::Config;
use crate::error::{KvError, Result};

use super::schema::{self, stripped, Param};
use super::{check_prev_revision, next_row, tombstone};
use super::{Driver, KeyRange, KeyRevision, ListResult};

/// Database path used when the endpoint names none
pub const DEFAULT_PATH: &str = "./db/state.db";

pub struct SqliteDriver {
    /// `None` once closed
    conn: Mutex<Option<Connection>>,
}

impl SqliteDriver {
    /// Open (creating if needed) the database at `dsn`.
    ///
    /// `dsn` is a file path, `:memory:`, or empty for [`DEFAULT_PATH`].
    pub fn open(dsn: &str, config: &Config) -> Result<Self> {
        let conn = if dsn == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(if dsn.is_empty() { DEFAULT_PATH } else { dsn });
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path)?;
            let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            tracing::debug!("opened sqlite database {} (journal_mode={})", path.display(), mode);
            conn
        };

        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        conn.execute_batch(schema::SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:", &Config::default())
    }

    fn lock(&self) -> Result<MappedMutexGuard<'_, Connection>> {
        MutexGuard::try_map(self.conn.lock(), Option::as_mut).map_err(|_| KvError::Closed)
    }
}

// =============================================================================
// Statement Helpers
// =============================================================================

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Param::Int(v) => ToSqlOutput::from(*v),
            Param::Bytes(v) => ToSqlOutput::from(v.as_slice()),
        })
    }
}

fn scan(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRevision> {
    let name: Vec<u8> = row.get(1)?;
    let value: Option<Vec<u8>> = row.get(2)?;
    let old_value: Option<Vec<u8>> = row.get(3)?;
    Ok(KeyRevision {
        id: row.get(0)?,
        name: Bytes::from(name),
        value: value.map(Bytes::from).unwrap_or_default(),
        old_value: old_value.map(Bytes::from).unwrap_or_default(),
        old_revision: row.get(4)?,
        create_revision: row.get(5)?,
        revision: row.get(6)?,
        ttl: row.get(7)?,
        version: row.get(8)?,
        del: row.get::<_, i64>(9)? != 0,
    })
}

fn query_rows(conn: &Connection, sql: &str, params: &[Param]) -> Result<Vec<KeyRevision>> {
    tracing::trace!("QUERY {:?} : {}", params, stripped(sql));
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), scan)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn latest(conn: &Connection, name: &[u8]) -> Result<Option<KeyRevision>> {
    tracing::trace!("QUERY [{}] : {}", String::from_utf8_lossy(name), stripped(schema::GET_SQL));
    let row = conn
        .prepare_cached(schema::GET_SQL)?
        .query_row(params![name], scan)
        .optional()?;
    Ok(row)
}

fn compact_revision(conn: &Connection) -> Result<i64> {
    let rev = conn
        .query_row(schema::COMPACT_REVISION_SQL, [], |row| row.get(0))
        .optional()?;
    Ok(rev.unwrap_or(0))
}

fn current_revision(conn: &Connection) -> Result<i64> {
    let max: i64 = conn.query_row(schema::REVISION_SQL, [], |row| row.get(0))?;
    Ok(max.max(compact_revision(conn)?))
}

/// Current revision, once `revision` is known to be readable in this
/// transaction. 0 reads the latest state.
fn check_snapshot(conn: &Connection, revision: i64) -> Result<i64> {
    let current = current_revision(conn)?;
    if revision > 0 {
        super::check_snapshot(revision, compact_revision(conn)?, current)?;
    }
    Ok(current)
}

fn insert(conn: &Connection, row: &KeyRevision) -> Result<i64> {
    tracing::trace!(
        "EXEC insert {:?} rev={} version={} del={}",
        row.name,
        row.revision,
        row.version,
        row.del
    );
    conn.prepare_cached(schema::INSERT_SQL)?.execute(params![
        row.name.as_ref(),
        row.value.as_ref(),
        row.old_value.as_ref(),
        row.old_revision,
        row.create_revision,
        row.revision,
        row.ttl,
        row.version,
        row.del as i64,
    ])?;
    Ok(conn.last_insert_rowid())
}

// =============================================================================
// Driver
// =============================================================================

impl Driver for SqliteDriver {
    fn get(&self, name: &[u8]) -> Result<Option<KeyRevision>> {
        let conn = self.lock()?;
        latest(&conn, name)
    }

    fn list(&self, revision: i64, limit: i64, range: &KeyRange) -> Result<ListResult> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = check_snapshot(&tx, revision)?;
        let mut params = Vec::new();
        let sql = schema::list_sql(range, revision, limit, &mut params);
        let rows = query_rows(&tx, &sql, &params)?;
        tx.commit()?;

        Ok(ListResult {
            revision: current,
            rows,
        })
    }

    fn count(&self, revision: i64, range: &KeyRange) -> Result<(i64, i64)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = check_snapshot(&tx, revision)?;
        let mut params = Vec::new();
        let sql = schema::count_sql(range, revision, &mut params);
        tracing::trace!("QUERY ROW {:?} : {}", params, stripped(&sql));
        let count: i64 = tx.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        tx.commit()?;

        Ok((current, count))
    }

    fn update(
        &self,
        name: &[u8],
        value: &[u8],
        prev_revision: i64,
        lease_ttl: i64,
    ) -> Result<(Option<KeyRevision>, KeyRevision)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let live = latest(&tx, name)?.filter(|r| !r.del);
        check_prev_revision(name, live.as_ref(), prev_revision)?;

        let mut row = next_row(name, value, live.as_ref(), current_revision(&tx)? + 1, lease_ttl);
        row.id = insert(&tx, &row)?;
        tx.commit()?;

        Ok((live, row))
    }

    fn delete(
        &self,
        name: &[u8],
        prev_revision: i64,
    ) -> Result<Option<(KeyRevision, KeyRevision)>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(live) = latest(&tx, name)?.filter(|r| !r.del) else {
            return Ok(None);
        };
        check_prev_revision(name, Some(&live), prev_revision)?;

        let mut row = tombstone(&live, current_revision(&tx)? + 1);
        row.id = insert(&tx, &row)?;
        tx.commit()?;

        Ok(Some((live, row)))
    }

    fn after(&self, range: &KeyRange, revision: i64, limit: i64) -> Result<Vec<KeyRevision>> {
        let conn = self.lock()?;
        let mut params = Vec::new();
        let sql = schema::after_sql(range, revision, limit, &mut params);
        query_rows(&conn, &sql, &params)
    }

    fn current_revision(&self) -> Result<i64> {
        let conn = self.lock()?;
        current_revision(&conn)
    }

    fn compact_revision(&self) -> Result<i64> {
        let conn = self.lock()?;
        compact_revision(&conn)
    }

    fn expired(&self, now: i64, limit: i64) -> Result<Vec<KeyRevision>> {
        let conn = self.lock()?;
        let params = [Param::Int(now), Param::Int(limit.max(1))];
        query_rows(&conn, schema::EXPIRED_SQL, &params)
    }

    fn compact(&self, target: i64) -> Result<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if target <= compact_revision(&tx)? {
            return Ok(0);
        }

        tracing::trace!("EXEC [{}] : {}", target, stripped(schema::COMPACT_SQL));
        let deleted = tx.execute(schema::COMPACT_SQL, params![target])?;
        tx.execute(schema::SET_COMPACT_REVISION_SQL, params![target])?;
        tx.commit()?;

        Ok(deleted as u64)
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, err)| KvError::Storage(err))?;
        }
        Ok(())
    }
}
