//! Postgres Driver
//!
//! Client/server engine over one blocking connection. Writers take an
//! exclusive table lock so revisions stay gapless when several processes
//! share the database; snapshot reads run in a read-only repeatable-read
//! transaction.

use std::str::FromStr;

use ::postgres::error::SqlState;
use ::postgres::types::ToSql;
use ::postgres::{Client, GenericClient, IsolationLevel, NoTls, Row};
use bytes::Bytes;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{KvError, Result};

use super::schema::{self, numbered, stripped, Param};
use super::{check_prev_revision, next_row, tombstone};
use super::{Driver, KeyRange, KeyRevision, ListResult};

/// Database used when the endpoint names none
pub const DEFAULT_DATABASE: &str = "kvsql";

/// Database the driver connects to while creating the target database
const MAINTENANCE_DATABASE: &str = "postgres";

pub struct PostgresDriver {
    /// `None` once closed
    client: Mutex<Option<Client>>,
}

impl PostgresDriver {
    /// Connect to the database at `dsn` (`user:pass@host:port/dbname`),
    /// creating the database and tables if needed.
    pub fn open(dsn: &str, config: &Config) -> Result<Self> {
        let mut pg = ::postgres::Config::from_str(&format!("postgres://{dsn}"))?;
        if pg.get_dbname().is_none() {
            pg.dbname(DEFAULT_DATABASE);
        }
        if config.busy_timeout_ms > 0 {
            pg.connect_timeout(config.busy_timeout());
        }

        create_database(&pg)?;
        let mut client = pg.connect(NoTls)?;
        client.batch_execute(schema::POSTGRES_SCHEMA)?;
        tracing::debug!(
            "opened postgres database {:?} on {:?}",
            pg.get_dbname().unwrap_or(DEFAULT_DATABASE),
            pg.get_hosts()
        );

        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    fn lock(&self) -> Result<MappedMutexGuard<'_, Client>> {
        MutexGuard::try_map(self.client.lock(), Option::as_mut).map_err(|_| KvError::Closed)
    }
}

// =============================================================================
// Database Creation
// =============================================================================

fn create_database(pg: &::postgres::Config) -> Result<()> {
    let Some(name) = pg.get_dbname().map(str::to_owned) else {
        return Ok(());
    };
    let mut admin = pg.clone();
    admin.dbname(MAINTENANCE_DATABASE);
    let mut client = admin.connect(NoTls)?;

    let exists = client
        .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])?
        .is_some();
    if !exists {
        tracing::info!("creating postgres database {:?}", name);
        let sql = format!("CREATE DATABASE \"{}\"", name.replace('"', "\"\""));
        if let Err(err) = client.batch_execute(&sql) {
            if err.code() != Some(&SqlState::DUPLICATE_DATABASE) {
                return Err(err.into());
            }
        }
    }
    client.close()?;
    Ok(())
}

// =============================================================================
// Statement Helpers
// =============================================================================

fn bind(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| match p {
            Param::Int(v) => v as &(dyn ToSql + Sync),
            Param::Bytes(v) => v as &(dyn ToSql + Sync),
        })
        .collect()
}

fn scan(row: &Row) -> Result<KeyRevision> {
    let name: Vec<u8> = row.try_get(1)?;
    let value: Option<Vec<u8>> = row.try_get(2)?;
    let old_value: Option<Vec<u8>> = row.try_get(3)?;
    Ok(KeyRevision {
        id: row.try_get(0)?,
        name: Bytes::from(name),
        value: value.map(Bytes::from).unwrap_or_default(),
        old_value: old_value.map(Bytes::from).unwrap_or_default(),
        old_revision: row.try_get(4)?,
        create_revision: row.try_get(5)?,
        revision: row.try_get(6)?,
        ttl: row.try_get(7)?,
        version: row.try_get(8)?,
        del: row.try_get::<_, i64>(9)? != 0,
    })
}

fn query_rows<C: GenericClient>(
    client: &mut C,
    sql: &str,
    params: &[Param],
) -> Result<Vec<KeyRevision>> {
    let sql = numbered(sql);
    tracing::trace!("QUERY {:?} : {}", params, stripped(&sql));
    client.query(sql.as_str(), &bind(params))?.iter().map(scan).collect()
}

fn latest<C: GenericClient>(client: &mut C, name: &[u8]) -> Result<Option<KeyRevision>> {
    tracing::trace!("QUERY [{}] : {}", String::from_utf8_lossy(name), stripped(schema::GET_SQL));
    client
        .query_opt(numbered(schema::GET_SQL).as_str(), &[&name])?
        .as_ref()
        .map(scan)
        .transpose()
}

fn compact_revision<C: GenericClient>(client: &mut C) -> Result<i64> {
    let row = client.query_opt(schema::COMPACT_REVISION_SQL, &[])?;
    Ok(match row {
        Some(row) => row.try_get(0)?,
        None => 0,
    })
}

fn current_revision<C: GenericClient>(client: &mut C) -> Result<i64> {
    let max: i64 = client.query_one(schema::REVISION_SQL, &[])?.try_get(0)?;
    Ok(max.max(compact_revision(client)?))
}

/// Current revision, once `revision` is known to be readable in this
/// transaction. 0 reads the latest state.
fn check_snapshot<C: GenericClient>(client: &mut C, revision: i64) -> Result<i64> {
    let current = current_revision(client)?;
    if revision > 0 {
        super::check_snapshot(revision, compact_revision(client)?, current)?;
    }
    Ok(current)
}

fn insert<C: GenericClient>(client: &mut C, row: &KeyRevision) -> Result<i64> {
    tracing::trace!(
        "EXEC insert {:?} rev={} version={} del={}",
        row.name,
        row.revision,
        row.version,
        row.del
    );
    let sql = format!("{} RETURNING id", numbered(schema::INSERT_SQL));
    let (name, value, old_value) = (row.name.as_ref(), row.value.as_ref(), row.old_value.as_ref());
    let del = row.del as i64;
    let id = client
        .query_one(
            sql.as_str(),
            &[
                &name,
                &value,
                &old_value,
                &row.old_revision,
                &row.create_revision,
                &row.revision,
                &row.ttl,
                &row.version,
                &del,
            ],
        )?
        .try_get(0)?;
    Ok(id)
}

// =============================================================================
// Driver
// =============================================================================

impl Driver for PostgresDriver {
    fn get(&self, name: &[u8]) -> Result<Option<KeyRevision>> {
        let mut client = self.lock()?;
        latest(&mut *client, name)
    }

    fn list(&self, revision: i64, limit: i64, range: &KeyRange) -> Result<ListResult> {
        let mut client = self.lock()?;
        let mut tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()?;

        let current = check_snapshot(&mut tx, revision)?;
        let mut params = Vec::new();
        let sql = schema::list_sql(range, revision, limit, &mut params);
        let rows = query_rows(&mut tx, &sql, &params)?;
        tx.commit()?;

        Ok(ListResult {
            revision: current,
            rows,
        })
    }

    fn count(&self, revision: i64, range: &KeyRange) -> Result<(i64, i64)> {
        let mut client = self.lock()?;
        let mut tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()?;

        let current = check_snapshot(&mut tx, revision)?;
        let mut params = Vec::new();
        let sql = numbered(&schema::count_sql(range, revision, &mut params));
        tracing::trace!("QUERY ROW {:?} : {}", params, stripped(&sql));
        let count: i64 = tx.query_one(sql.as_str(), &bind(&params))?.try_get(0)?;
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
        let mut client = self.lock()?;
        let mut tx = client.transaction()?;
        tx.batch_execute(schema::POSTGRES_WRITE_LOCK)?;

        let live = latest(&mut tx, name)?.filter(|r| !r.del);
        check_prev_revision(name, live.as_ref(), prev_revision)?;

        let revision = current_revision(&mut tx)? + 1;
        let mut row = next_row(name, value, live.as_ref(), revision, lease_ttl);
        row.id = insert(&mut tx, &row)?;
        tx.commit()?;

        Ok((live, row))
    }

    fn delete(
        &self,
        name: &[u8],
        prev_revision: i64,
    ) -> Result<Option<(KeyRevision, KeyRevision)>> {
        let mut client = self.lock()?;
        let mut tx = client.transaction()?;
        tx.batch_execute(schema::POSTGRES_WRITE_LOCK)?;

        let Some(live) = latest(&mut tx, name)?.filter(|r| !r.del) else {
            return Ok(None);
        };
        check_prev_revision(name, Some(&live), prev_revision)?;

        let revision = current_revision(&mut tx)? + 1;
        let mut row = tombstone(&live, revision);
        row.id = insert(&mut tx, &row)?;
        tx.commit()?;

        Ok(Some((live, row)))
    }

    fn after(&self, range: &KeyRange, revision: i64, limit: i64) -> Result<Vec<KeyRevision>> {
        let mut client = self.lock()?;
        let mut params = Vec::new();
        let sql = schema::after_sql(range, revision, limit, &mut params);
        query_rows(&mut *client, &sql, &params)
    }

    fn current_revision(&self) -> Result<i64> {
        let mut client = self.lock()?;
        current_revision(&mut *client)
    }

    fn compact_revision(&self) -> Result<i64> {
        let mut client = self.lock()?;
        compact_revision(&mut *client)
    }

    fn expired(&self, now: i64, limit: i64) -> Result<Vec<KeyRevision>> {
        let mut client = self.lock()?;
        let params = [Param::Int(now), Param::Int(limit.max(1))];
        query_rows(&mut *client, schema::EXPIRED_SQL, &params)
    }

    fn compact(&self, target: i64) -> Result<u64> {
        let mut client = self.lock()?;
        let mut tx = client.transaction()?;
        tx.batch_execute(schema::POSTGRES_WRITE_LOCK)?;

        if target <= compact_revision(&mut tx)? {
            return Ok(0);
        }

        let sql = numbered(schema::COMPACT_SQL);
        tracing::trace!("EXEC [{}] : {}", target, stripped(&sql));
        let deleted = tx.execute(sql.as_str(), &[&target])?;
        tx.execute(numbered(schema::SET_COMPACT_REVISION_SQL).as_str(), &[&target])?;
        tx.commit()?;

        Ok(deleted)
    }

    fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().take() {
            client.close()?;
        }
        Ok(())
    }
}
