//! SQL text for the history table.
//!
//! Statements are written with `?` placeholders; the Postgres engine runs
//! them through [`numbered`].

use super::KeyRange;

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Param {
    Int(i64),
    Bytes(Vec<u8>),
}

pub(crate) const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS key_value (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name BLOB NOT NULL,
        value BLOB,
        old_value BLOB,
        old_revision INTEGER NOT NULL DEFAULT 0,
        create_revision INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        ttl INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL,
        del INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS key_value_name_index ON key_value (name);
    CREATE UNIQUE INDEX IF NOT EXISTS key_value_revision_index ON key_value (revision);
    CREATE INDEX IF NOT EXISTS key_value_name_revision_index ON key_value (name, revision);
    CREATE TABLE IF NOT EXISTS key_value_meta (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
";

pub(crate) const POSTGRES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS key_value (
        id BIGSERIAL PRIMARY KEY,
        name BYTEA NOT NULL,
        value BYTEA,
        old_value BYTEA,
        old_revision BIGINT NOT NULL DEFAULT 0,
        create_revision BIGINT NOT NULL,
        revision BIGINT NOT NULL,
        ttl BIGINT NOT NULL DEFAULT 0,
        version BIGINT NOT NULL,
        del BIGINT NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS key_value_name_index ON key_value (name);
    CREATE UNIQUE INDEX IF NOT EXISTS key_value_revision_index ON key_value (revision);
    CREATE INDEX IF NOT EXISTS key_value_name_revision_index ON key_value (name, revision);
    CREATE TABLE IF NOT EXISTS key_value_meta (
        name TEXT PRIMARY KEY,
        value BIGINT NOT NULL
    );
";

/// Serializes writers across every connection to the database
pub(crate) const POSTGRES_WRITE_LOCK: &str = "LOCK TABLE key_value IN EXCLUSIVE MODE";

pub(crate) const COLUMNS: &str = "kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, \
     kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del";

pub(crate) const GET_SQL: &str = "
    SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision,
        kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del
    FROM key_value kv
    WHERE kv.name = ?
    ORDER BY kv.revision DESC
    LIMIT 1";

pub(crate) const REVISION_SQL: &str = "SELECT COALESCE(MAX(revision), 0) FROM key_value";

pub(crate) const COMPACT_REVISION_SQL: &str =
    "SELECT value FROM key_value_meta WHERE name = 'compact_revision'";

pub(crate) const SET_COMPACT_REVISION_SQL: &str = "
    INSERT INTO key_value_meta (name, value) VALUES ('compact_revision', ?)
    ON CONFLICT (name) DO UPDATE SET value = excluded.value";

pub(crate) const INSERT_SQL: &str = "
    INSERT INTO key_value
        (name, value, old_value, old_revision, create_revision, revision, ttl, version, del)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub(crate) const EXPIRED_SQL: &str = "
    SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision,
        kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del
    FROM key_value kv
    JOIN (
        SELECT MAX(mkv.revision) AS revision
        FROM key_value mkv
        GROUP BY mkv.name) maxkv
    ON maxkv.revision = kv.revision
    WHERE kv.del = 0 AND kv.ttl > 0 AND kv.ttl <= ?
    ORDER BY kv.revision ASC
    LIMIT ?";

/// Drops every row superseded by a newer row at or below the target, and
/// every tombstone at or below it. The newest state as of the target
/// survives, so reads at or above the target are unaffected.
pub(crate) const COMPACT_SQL: &str = "
    DELETE FROM key_value
    WHERE revision <= ?1 AND (
        del = 1 OR revision < (
            SELECT MAX(ckv.revision)
            FROM key_value ckv
            WHERE ckv.name = key_value.name AND ckv.revision <= ?1))";

/// `WHERE` fragment selecting `range` on the `name` column of `alias`.
pub(crate) fn range_clause(range: &KeyRange, alias: &str, params: &mut Vec<Param>) -> String {
    match range {
        KeyRange::Single(key) => {
            params.push(Param::Bytes(key.to_vec()));
            format!("{alias}.name = ?")
        }
        KeyRange::Span { start, end: None } => {
            params.push(Param::Bytes(start.to_vec()));
            format!("{alias}.name >= ?")
        }
        KeyRange::Span {
            start,
            end: Some(end),
        } => {
            params.push(Param::Bytes(start.to_vec()));
            params.push(Param::Bytes(end.to_vec()));
            format!("{alias}.name >= ? AND {alias}.name < ?")
        }
    }
}

/// Newest live row per name in `range`, optionally as of a revision.
pub(crate) fn list_sql(
    range: &KeyRange,
    revision: i64,
    limit: i64,
    params: &mut Vec<Param>,
) -> String {
    let mut sql = format!(
        "SELECT {COLUMNS} FROM key_value kv {} ORDER BY kv.name ASC",
        latest_join(range, revision, params)
    );
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sql
}

pub(crate) fn count_sql(range: &KeyRange, revision: i64, params: &mut Vec<Param>) -> String {
    format!(
        "SELECT COUNT(*) FROM key_value kv {}",
        latest_join(range, revision, params)
    )
}

pub(crate) fn after_sql(
    range: &KeyRange,
    revision: i64,
    limit: i64,
    params: &mut Vec<Param>,
) -> String {
    let clause = range_clause(range, "kv", params);
    params.push(Param::Int(revision));
    let mut sql = format!(
        "SELECT {COLUMNS} FROM key_value kv WHERE {clause} AND kv.revision > ? \
         ORDER BY kv.revision ASC"
    );
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sql
}

fn latest_join(range: &KeyRange, revision: i64, params: &mut Vec<Param>) -> String {
    let clause = range_clause(range, "mkv", params);
    let bound = if revision > 0 {
        params.push(Param::Int(revision));
        " AND mkv.revision <= ?"
    } else {
        ""
    };
    format!(
        "JOIN (\
            SELECT MAX(mkv.revision) AS revision \
            FROM key_value mkv \
            WHERE {clause}{bound} \
            GROUP BY mkv.name) maxkv \
         ON maxkv.revision = kv.revision \
         WHERE kv.del = 0"
    )
}

/// Collapse whitespace so statements log on one line.
pub(crate) fn stripped(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrite `?` and `?N` placeholders as `$N`
pub(crate) fn numbered(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut next = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '?' {
            out.push(c);
            continue;
        }
        out.push('$');
        if chars.peek().map_or(false, char::is_ascii_digit) {
            while let Some(d) = chars.next_if(char::is_ascii_digit) {
                out.push(d);
            }
        } else {
            next += 1;
            out.push_str(&next.to_string());
        }
    }
    out
}
