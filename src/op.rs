//! Operation Descriptors
//!
//! Caller-facing option modifiers and the validated [`Op`] they build.
//!
//! Options that make no sense for an operation (a lease on a get, a limit
//! on a delete, ...) are rejected with [`KvError::Validation`] instead of
//! being silently ignored.

use bytes::Bytes;

use crate::driver::KeyRange;
use crate::error::{KvError, Result};

/// Modifier accepted by get, put, delete and watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOption {
    /// Operate on every key starting with the given key
    Prefix,
    /// Operate on `[key, end)`
    Range(Bytes),
    /// Operate on every key `>= key`
    FromKey,
    /// Read as of a revision, or start a watch at it
    Rev(i64),
    Limit(i64),
    CountOnly,
    KeysOnly,
    /// Return (or attach, for watches) the previous value
    PrevKv,
    /// Attach a lease to a put
    Lease(i64),
    /// Accepted for compatibility; reads are always served locally
    Serializable,
    /// Accepted for compatibility; watches always send a created response
    CreatedNotify,
}

pub fn with_prefix() -> OpOption {
    OpOption::Prefix
}

pub fn with_range(end: impl Into<Bytes>) -> OpOption {
    OpOption::Range(end.into())
}

pub fn with_from_key() -> OpOption {
    OpOption::FromKey
}

pub fn with_rev(rev: i64) -> OpOption {
    OpOption::Rev(rev)
}

pub fn with_limit(limit: i64) -> OpOption {
    OpOption::Limit(limit)
}

pub fn with_count_only() -> OpOption {
    OpOption::CountOnly
}

pub fn with_keys_only() -> OpOption {
    OpOption::KeysOnly
}

pub fn with_prev_kv() -> OpOption {
    OpOption::PrevKv
}

pub fn with_lease(id: i64) -> OpOption {
    OpOption::Lease(id)
}

pub fn with_serializable() -> OpOption {
    OpOption::Serializable
}

pub fn with_created_notify() -> OpOption {
    OpOption::CreatedNotify
}

/// Modifier accepted by compact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactOption {
    /// Accepted for compatibility; compaction is a no-op
    Physical,
}

pub fn with_compact_physical() -> CompactOption {
    CompactOption::Physical
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (empty prefix or all `0xff`),
/// meaning the range runs to the end of the keyspace.
pub fn prefix_end(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(Bytes::from(end));
        }
    }
    None
}

enum RangeEnd {
    Prefix,
    FromKey,
    End(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    Delete,
    Watch,
}

impl OpKind {
    fn name(self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Put => "put",
            OpKind::Delete => "delete",
            OpKind::Watch => "watch",
        }
    }
}

/// A validated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    kind: OpKind,
    key: Bytes,
    value: Bytes,
    range: KeyRange,
    rev: i64,
    limit: i64,
    count_only: bool,
    keys_only: bool,
    prev_kv: bool,
    lease: i64,
}

impl Op {
    pub fn get(key: impl Into<Bytes>, opts: &[OpOption]) -> Result<Op> {
        Op::build(OpKind::Get, key.into(), Bytes::new(), opts)
    }

    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, opts: &[OpOption]) -> Result<Op> {
        Op::build(OpKind::Put, key.into(), value.into(), opts)
    }

    pub fn delete(key: impl Into<Bytes>, opts: &[OpOption]) -> Result<Op> {
        Op::build(OpKind::Delete, key.into(), Bytes::new(), opts)
    }

    pub fn watch(key: impl Into<Bytes>, opts: &[OpOption]) -> Result<Op> {
        Op::build(OpKind::Watch, key.into(), Bytes::new(), opts)
    }

    fn build(kind: OpKind, key: Bytes, value: Bytes, opts: &[OpOption]) -> Result<Op> {
        let mut op = Op {
            kind,
            key,
            value,
            range: KeyRange::Single(Bytes::new()),
            rev: 0,
            limit: 0,
            count_only: false,
            keys_only: false,
            prev_kv: false,
            lease: 0,
        };
        let mut end: Option<RangeEnd> = None;

        for opt in opts {
            op.check_allowed(opt)?;
            match opt {
                OpOption::Prefix | OpOption::Range(_) | OpOption::FromKey => {
                    if end.is_some() {
                        return Err(KvError::validation(
                            "only one of prefix, range and from-key may be given",
                        ));
                    }
                    end = Some(match opt {
                        OpOption::Prefix => RangeEnd::Prefix,
                        OpOption::Range(end) => RangeEnd::End(end.clone()),
                        _ => RangeEnd::FromKey,
                    });
                }
                OpOption::Rev(rev) => {
                    if *rev < 0 {
                        return Err(KvError::validation(format!("negative revision {rev}")));
                    }
                    op.rev = *rev;
                }
                OpOption::Limit(limit) => {
                    if *limit < 0 {
                        return Err(KvError::validation(format!("negative limit {limit}")));
                    }
                    op.limit = *limit;
                }
                OpOption::CountOnly => op.count_only = true,
                OpOption::KeysOnly => op.keys_only = true,
                OpOption::PrevKv => op.prev_kv = true,
                OpOption::Lease(id) => {
                    if *id < 0 {
                        return Err(KvError::validation(format!("negative lease {id}")));
                    }
                    op.lease = *id;
                }
                OpOption::Serializable | OpOption::CreatedNotify => {}
            }
        }

        op.range = match end {
            None => KeyRange::Single(op.key.clone()),
            Some(RangeEnd::Prefix) => KeyRange::Span {
                start: op.key.clone(),
                end: prefix_end(&op.key),
            },
            Some(RangeEnd::FromKey) => KeyRange::Span {
                start: op.key.clone(),
                end: None,
            },
            // An empty or "\0" end reads everything from the key on
            Some(RangeEnd::End(end)) if end.is_empty() || end.as_ref() == b"\0" => {
                KeyRange::Span {
                    start: op.key.clone(),
                    end: None,
                }
            }
            Some(RangeEnd::End(end)) => {
                if end <= op.key {
                    return Err(KvError::validation("range end must be greater than key"));
                }
                KeyRange::Span {
                    start: op.key.clone(),
                    end: Some(end),
                }
            }
        };

        if op.key.is_empty() && matches!(op.range, KeyRange::Single(_)) {
            return Err(KvError::validation(format!("empty key in {}", kind.name())));
        }

        Ok(op)
    }

    fn check_allowed(&self, opt: &OpOption) -> Result<()> {
        let allowed = match self.kind {
            OpKind::Get => !matches!(opt, OpOption::Lease(_) | OpOption::PrevKv),
            OpKind::Put => matches!(opt, OpOption::Lease(_) | OpOption::PrevKv),
            OpKind::Delete => matches!(
                opt,
                OpOption::Prefix | OpOption::Range(_) | OpOption::FromKey | OpOption::PrevKv
            ),
            OpKind::Watch => matches!(
                opt,
                OpOption::Prefix
                    | OpOption::Range(_)
                    | OpOption::FromKey
                    | OpOption::Rev(_)
                    | OpOption::PrevKv
                    | OpOption::CreatedNotify
            ),
        };
        if allowed {
            Ok(())
        } else {
            Err(KvError::validation(format!(
                "option {:?} is not allowed in {}",
                opt,
                self.kind.name()
            )))
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn rev(&self) -> i64 {
        self.rev
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn count_only(&self) -> bool {
        self.count_only
    }

    pub fn keys_only(&self) -> bool {
        self.keys_only
    }

    pub fn prev_kv(&self) -> bool {
        self.prev_kv
    }

    pub fn lease(&self) -> i64 {
        self.lease
    }
}
