//! Response Types
//!
//! The value and response shapes handed back to callers. They follow the
//! etcd v3 API so code written against that API ports over directly.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::KvError;

/// One version of a key as seen by callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Bytes,
    /// Revision at which the key's current lineage began
    pub create_revision: i64,
    /// Revision of the write that produced this version
    pub mod_revision: i64,
    /// Writes since creation, starting at 1
    pub version: i64,
    pub value: Bytes,
    /// Expiry of the attached lease in Unix seconds, 0 for none
    pub lease: i64,
}

impl KeyValue {
    /// The key as text, replacing invalid UTF-8
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Store revision when the operation completed
    pub revision: i64,
}

impl ResponseHeader {
    pub fn new(revision: i64) -> Self {
        Self { revision }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    /// Set when `limit` cut the result short
    pub more: bool,
    /// Number of keys in range, regardless of `limit`
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactResponse {
    pub header: ResponseHeader,
}

/// Result of one operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseOp {
    Put(PutResponse),
    Get(GetResponse),
    Delete(DeleteResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    /// Whether every compare held (the `then` branch ran)
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

// =============================================================================
// Watch
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    pub fn is_create(&self) -> bool {
        self.kind == EventType::Put && self.kv.create_revision == self.kv.mod_revision
    }

    pub fn is_modify(&self) -> bool {
        self.kind == EventType::Put && self.kv.create_revision != self.kv.mod_revision
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub events: Vec<Event>,
    /// Set when the requested start revision has been compacted away
    pub compact_revision: i64,
    /// Terminal response; no more responses follow
    pub canceled: bool,
    /// Acknowledges the subscription; sent once, before any events
    pub created: bool,
    #[serde(skip)]
    error: Option<String>,
}

impl WatchResponse {
    pub(crate) fn created(revision: i64) -> Self {
        Self {
            header: ResponseHeader::new(revision),
            created: true,
            ..Default::default()
        }
    }

    pub(crate) fn events(revision: i64, events: Vec<Event>) -> Self {
        Self {
            header: ResponseHeader::new(revision),
            events,
            ..Default::default()
        }
    }

    pub(crate) fn compacted(revision: i64, requested: i64, compact_revision: i64) -> Self {
        Self {
            header: ResponseHeader::new(revision),
            compact_revision,
            canceled: true,
            error: Some(
                KvError::Compacted {
                    revision: requested,
                    compact_revision,
                }
                .to_string(),
            ),
            ..Default::default()
        }
    }

    pub(crate) fn failed(revision: i64, err: &KvError) -> Self {
        Self {
            header: ResponseHeader::new(revision),
            canceled: true,
            error: Some(err.to_string()),
            ..Default::default()
        }
    }

    /// The error that ended the subscription, if any
    pub fn err(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_progress_notify(&self) -> bool {
        self.events.is_empty() && !self.canceled && !self.created && self.compact_revision == 0
    }
}

// =============================================================================
// Lease & Cluster
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub id: i64,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberListResponse {
    pub header: ResponseHeader,
    pub members: Vec<Member>,
}
