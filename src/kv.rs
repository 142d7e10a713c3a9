//! KV Façade
//!
//! etcd-style put/get/delete/txn on top of a [`Backend`].
//!
//! ## Responsibilities
//! - Validate options into an [`Op`]
//! - Serialize writes per key through the backend's [`KeyLocker`]
//! - Translate driver rows into responses
//!
//! Reads take no key lock; every read is a single driver transaction.
//!
//! [`KeyLocker`]: crate::locker::KeyLocker

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::client::Backend;
use crate::context::Context;
use crate::driver::KeyRange;
use crate::error::{KvError, Result};
use crate::op::{CompactOption, Op, OpKind, OpOption};
use crate::types::{
    CompactResponse, DeleteResponse, GetResponse, KeyValue, PutResponse, ResponseHeader,
    ResponseOp, TxnResponse,
};

/// Key-value operations
pub trait Kv {
    fn put(
        &self,
        ctx: &Context,
        key: &str,
        value: impl Into<Bytes>,
        opts: &[OpOption],
    ) -> Result<PutResponse>;

    fn get(&self, ctx: &Context, key: &str, opts: &[OpOption]) -> Result<GetResponse>;

    fn delete(&self, ctx: &Context, key: &str, opts: &[OpOption]) -> Result<DeleteResponse>;

    /// Accepted for compatibility; history is compacted by the cleanup thread
    fn compact(&self, ctx: &Context, rev: i64, opts: &[CompactOption])
        -> Result<CompactResponse>;

    fn txn(&self, ctx: &Context) -> Txn<'_>;

    /// Run a prepared get, put or delete
    fn run(&self, ctx: &Context, op: &Op) -> Result<ResponseOp>;
}

/// [`Kv`] backed by SQL storage
#[derive(Clone)]
pub struct SqlKv {
    backend: Arc<Backend>,
}

impl SqlKv {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    fn key_str(key: &[u8]) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(key)
    }

    // -------------------------------------------------------------------------
    // Unlocked operations; callers hold the key locks they need
    // -------------------------------------------------------------------------

    fn apply_put(&self, op: &Op) -> Result<PutResponse> {
        let (prev, row) = self
            .backend
            .update(op.key(), op.value(), 0, op.lease())?;

        tracing::debug!(
            "PUT {}, value={}, lease={} => rev={}, created={}",
            Self::key_str(op.key()),
            op.value().len(),
            op.lease(),
            row.revision,
            prev.is_none()
        );

        Ok(PutResponse {
            header: ResponseHeader::new(row.revision),
            prev_kv: prev.filter(|_| op.prev_kv()).map(|p| p.to_key_value()),
        })
    }

    fn apply_get(&self, op: &Op) -> Result<GetResponse> {
        let driver = self.backend.driver();
        let rev = op.rev();

        if op.count_only() {
            let (current, count) = driver.count(rev, op.range())?;
            tracing::debug!(
                "COUNT {}, rev={} => rev={}, count={}",
                Self::key_str(op.key()),
                rev,
                current,
                count
            );
            return Ok(GetResponse {
                header: ResponseHeader::new(current),
                count,
                ..Default::default()
            });
        }

        // One extra row tells us whether the limit cut anything off
        let limit = if op.limit() > 0 { op.limit() + 1 } else { 0 };
        let list = driver.list(rev, limit, op.range())?;

        let mut rows = list.rows;
        let more = op.limit() > 0 && rows.len() as i64 > op.limit();
        let count = if more {
            rows.truncate(op.limit() as usize);
            driver.count(rev, op.range())?.1
        } else {
            rows.len() as i64
        };

        let kvs: Vec<KeyValue> = rows
            .iter()
            .map(|row| {
                let mut kv = row.to_key_value();
                if op.keys_only() {
                    kv.value = Bytes::new();
                }
                kv
            })
            .collect();

        tracing::debug!(
            "GET {}, rev={} => rev={}, kvs={}, more={}",
            Self::key_str(op.key()),
            rev,
            list.revision,
            kvs.len(),
            more
        );

        Ok(GetResponse {
            header: ResponseHeader::new(list.revision),
            kvs,
            more,
            count,
        })
    }

    fn apply_delete(&self, op: &Op) -> Result<DeleteResponse> {
        let mut resp = DeleteResponse::default();
        match self.backend.delete(op.key(), 0)? {
            Some((live, tombstone)) => {
                resp.header = ResponseHeader::new(tombstone.revision);
                resp.deleted = 1;
                if op.prev_kv() {
                    resp.prev_kvs.push(live.to_key_value());
                }
            }
            None => {
                resp.header = ResponseHeader::new(self.backend.driver().current_revision()?);
            }
        }

        tracing::debug!(
            "DELETE {} => rev={}, deleted={}",
            Self::key_str(op.key()),
            resp.header.revision,
            resp.deleted
        );
        Ok(resp)
    }

    /// Tombstone every live key in a span.
    ///
    /// With `lock` each key is locked while it is deleted. Without it the
    /// delete is conditional on the revision just listed, and keys written
    /// since are left alone.
    fn delete_span(&self, ctx: &Context, op: &Op, lock: bool) -> Result<DeleteResponse> {
        let list = self.backend.driver().list(0, 0, op.range())?;
        let mut resp = DeleteResponse {
            header: ResponseHeader::new(list.revision),
            ..Default::default()
        };

        for row in list.rows {
            ctx.check()?;
            let deleted = if lock {
                let _guard = self.backend.locker().lock(ctx, &row.name)?;
                self.backend.delete(&row.name, 0)?
            } else {
                match self.backend.delete(&row.name, row.revision) {
                    Err(KvError::Conflict { .. }) => None,
                    other => other?,
                }
            };

            if let Some((live, tombstone)) = deleted {
                resp.header = ResponseHeader::new(tombstone.revision);
                resp.deleted += 1;
                if op.prev_kv() {
                    resp.prev_kvs.push(live.to_key_value());
                }
            }
        }

        tracing::debug!(
            "DELETE RANGE {} => rev={}, deleted={}",
            Self::key_str(op.key()),
            resp.header.revision,
            resp.deleted
        );
        Ok(resp)
    }

    fn locked_put(&self, ctx: &Context, op: &Op) -> Result<PutResponse> {
        let _guard = self.backend.locker().lock(ctx, op.key())?;
        ctx.check()?;
        self.apply_put(op)
    }

    fn locked_delete(&self, ctx: &Context, op: &Op) -> Result<DeleteResponse> {
        ctx.check()?;
        if let KeyRange::Span { .. } = op.range() {
            return self.delete_span(ctx, op, true);
        }
        let _guard = self.backend.locker().lock(ctx, op.key())?;
        ctx.check()?;
        self.apply_delete(op)
    }
}

impl Kv for SqlKv {
    fn put(
        &self,
        ctx: &Context,
        key: &str,
        value: impl Into<Bytes>,
        opts: &[OpOption],
    ) -> Result<PutResponse> {
        let op = Op::put(Bytes::copy_from_slice(key.as_bytes()), value, opts)?;
        self.locked_put(ctx, &op)
    }

    fn get(&self, ctx: &Context, key: &str, opts: &[OpOption]) -> Result<GetResponse> {
        let op = Op::get(Bytes::copy_from_slice(key.as_bytes()), opts)?;
        ctx.check()?;
        self.apply_get(&op)
    }

    fn delete(&self, ctx: &Context, key: &str, opts: &[OpOption]) -> Result<DeleteResponse> {
        let op = Op::delete(Bytes::copy_from_slice(key.as_bytes()), opts)?;
        self.locked_delete(ctx, &op)
    }

    fn compact(
        &self,
        ctx: &Context,
        rev: i64,
        _opts: &[CompactOption],
    ) -> Result<CompactResponse> {
        ctx.check()?;
        let current = self.backend.driver().current_revision()?;
        tracing::debug!("COMPACT {} ignored => rev={}", rev, current);
        Ok(CompactResponse {
            header: ResponseHeader::new(current),
        })
    }

    fn txn(&self, ctx: &Context) -> Txn<'_> {
        Txn::new(self, ctx.clone())
    }

    fn run(&self, ctx: &Context, op: &Op) -> Result<ResponseOp> {
        match op.kind() {
            OpKind::Put => self.locked_put(ctx, op).map(ResponseOp::Put),
            OpKind::Get => {
                ctx.check()?;
                self.apply_get(op).map(ResponseOp::Get)
            }
            OpKind::Delete => self.locked_delete(ctx, op).map(ResponseOp::Delete),
            OpKind::Watch => Err(KvError::validation("watch ops cannot be run as kv ops")),
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Operator of a [`Compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl FromStr for CompareResult {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" | "==" => Ok(CompareResult::Equal),
            "!=" => Ok(CompareResult::NotEqual),
            ">" => Ok(CompareResult::Greater),
            "<" => Ok(CompareResult::Less),
            other => Err(KvError::validation(format!("unknown compare operator {other:?}"))),
        }
    }
}

impl fmt::Display for CompareResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareResult::Equal => "=",
            CompareResult::NotEqual => "!=",
            CompareResult::Greater => ">",
            CompareResult::Less => "<",
        })
    }
}

/// The field of a key a [`Compare`] looks at, with the operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Bytes),
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Lease(i64),
}

/// A guard evaluated against a key's current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    key: Bytes,
    result: CompareResult,
    target: CompareTarget,
}

impl Compare {
    pub fn new(key: impl Into<Bytes>, result: CompareResult, target: CompareTarget) -> Self {
        Self {
            key: key.into(),
            result,
            target,
        }
    }

    pub fn value(key: impl Into<Bytes>, result: CompareResult, value: impl Into<Bytes>) -> Self {
        Self::new(key, result, CompareTarget::Value(value.into()))
    }

    pub fn version(key: impl Into<Bytes>, result: CompareResult, version: i64) -> Self {
        Self::new(key, result, CompareTarget::Version(version))
    }

    pub fn create_revision(key: impl Into<Bytes>, result: CompareResult, rev: i64) -> Self {
        Self::new(key, result, CompareTarget::CreateRevision(rev))
    }

    pub fn mod_revision(key: impl Into<Bytes>, result: CompareResult, rev: i64) -> Self {
        Self::new(key, result, CompareTarget::ModRevision(rev))
    }

    pub fn lease(key: impl Into<Bytes>, result: CompareResult, lease: i64) -> Self {
        Self::new(key, result, CompareTarget::Lease(lease))
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// An absent key compares as version, revisions and lease 0. A value
    /// compare against an absent key never holds.
    fn holds(&self, kv: Option<&KeyValue>) -> bool {
        let absent = KeyValue::default();
        let actual = kv.unwrap_or(&absent);
        let ordering = match &self.target {
            CompareTarget::Value(value) => match kv {
                Some(kv) => kv.value.as_ref().cmp(value.as_ref()),
                None => return false,
            },
            CompareTarget::Version(v) => actual.version.cmp(v),
            CompareTarget::CreateRevision(r) => actual.create_revision.cmp(r),
            CompareTarget::ModRevision(r) => actual.mod_revision.cmp(r),
            CompareTarget::Lease(l) => actual.lease.cmp(l),
        };
        match self.result {
            CompareResult::Equal => ordering.is_eq(),
            CompareResult::NotEqual => ordering.is_ne(),
            CompareResult::Greater => ordering.is_gt(),
            CompareResult::Less => ordering.is_lt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Start,
    When,
    Then,
    Otherwise,
}

/// Conditional multi-op builder: `when(..).then(..).otherwise(..).commit()`.
///
/// Every key the transaction names is locked (in key order) for the whole
/// commit, so compares and the chosen branch see no interleaved writes to
/// those keys.
pub struct Txn<'a> {
    kv: &'a SqlKv,
    ctx: Context,
    stage: Stage,
    misuse: Option<String>,
    compares: Vec<Compare>,
    success: Vec<Op>,
    failure: Vec<Op>,
}

impl<'a> Txn<'a> {
    fn new(kv: &'a SqlKv, ctx: Context) -> Self {
        Self {
            kv,
            ctx,
            stage: Stage::Start,
            misuse: None,
            compares: Vec::new(),
            success: Vec::new(),
            failure: Vec::new(),
        }
    }

    fn advance(&mut self, next: Stage, name: &str) -> bool {
        if self.stage >= next {
            self.misuse
                .get_or_insert_with(|| format!("{name} called out of order or more than once"));
            return false;
        }
        self.stage = next;
        true
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        if self.advance(Stage::When, "when") {
            self.compares.extend(compares);
        }
        self
    }

    pub fn then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        if self.advance(Stage::Then, "then") {
            self.success.extend(ops);
        }
        self
    }

    pub fn otherwise(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        if self.advance(Stage::Otherwise, "otherwise") {
            self.failure.extend(ops);
        }
        self
    }

    pub fn commit(self) -> Result<TxnResponse> {
        if let Some(misuse) = self.misuse {
            return Err(KvError::Validation(misuse));
        }
        if let Some(op) = self
            .success
            .iter()
            .chain(&self.failure)
            .find(|op| op.kind() == OpKind::Watch)
        {
            return Err(KvError::validation(format!(
                "watch on {} cannot be part of a txn",
                SqlKv::key_str(op.key())
            )));
        }
        self.ctx.check()?;

        let backend = &self.kv.backend;
        let write_keys = self
            .success
            .iter()
            .chain(&self.failure)
            .filter(|op| op.kind() != OpKind::Get)
            .filter(|op| matches!(op.range(), KeyRange::Single(_)))
            .map(Op::key);
        let keys: Vec<&Bytes> = self.compares.iter().map(Compare::key).chain(write_keys).collect();
        let _guards = backend.locker().lock_all(&self.ctx, keys)?;
        self.ctx.check()?;

        let mut succeeded = true;
        for cmp in &self.compares {
            let current = backend
                .driver()
                .get(cmp.key())?
                .filter(|row| !row.del)
                .map(|row| row.to_key_value());
            if !cmp.holds(current.as_ref()) {
                succeeded = false;
                break;
            }
        }

        let ops = if succeeded { &self.success } else { &self.failure };
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            self.ctx.check()?;
            let resp = match (op.kind(), op.range()) {
                (OpKind::Put, _) => ResponseOp::Put(self.kv.apply_put(op)?),
                (OpKind::Get, _) => ResponseOp::Get(self.kv.apply_get(op)?),
                (OpKind::Delete, KeyRange::Single(_)) => {
                    ResponseOp::Delete(self.kv.apply_delete(op)?)
                }
                (OpKind::Delete, KeyRange::Span { .. }) => {
                    ResponseOp::Delete(self.kv.delete_span(&self.ctx, op, false)?)
                }
                (OpKind::Watch, _) => continue,
            };
            responses.push(resp);
        }

        let revision = backend.driver().current_revision()?;
        tracing::debug!(
            "TXN compares={}, succeeded={}, ops={} => rev={}",
            self.compares.len(),
            succeeded,
            responses.len(),
            revision
        );

        Ok(TxnResponse {
            header: ResponseHeader::new(revision),
            succeeded,
            responses,
        })
    }
}
