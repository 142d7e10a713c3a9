//! Leases
//!
//! A lease here is only a TTL handle: its id is the TTL in seconds, and a
//! put made `with_lease(id)` expires `id` seconds after the write. Leases
//! have no server-side state, so they cannot be renewed, revoked or
//! inspected.

use std::sync::Arc;

use crate::client::Backend;
use crate::context::Context;
use crate::error::{KvError, Result};
use crate::types::{LeaseGrantResponse, ResponseHeader};

pub trait Lease {
    /// A lease whose id is `ttl` seconds
    fn grant(&self, ctx: &Context, ttl: i64) -> Result<LeaseGrantResponse>;

    fn revoke(&self, ctx: &Context, id: i64) -> Result<()>;

    fn keep_alive_once(&self, ctx: &Context, id: i64) -> Result<()>;

    fn time_to_live(&self, ctx: &Context, id: i64) -> Result<i64>;

    fn watch_lease(&self, ctx: &Context, id: i64) -> Result<()>;
}

pub struct SqlLease {
    backend: Arc<Backend>,
}

impl SqlLease {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }
}

impl Lease for SqlLease {
    fn grant(&self, ctx: &Context, ttl: i64) -> Result<LeaseGrantResponse> {
        ctx.check()?;
        if ttl <= 0 {
            return Err(KvError::validation(format!("lease ttl must be positive, got {ttl}")));
        }
        let revision = self.backend.driver().current_revision()?;
        tracing::debug!("LEASE GRANT ttl={} => rev={}", ttl, revision);
        Ok(LeaseGrantResponse {
            header: ResponseHeader::new(revision),
            id: ttl,
            ttl,
        })
    }

    fn revoke(&self, _ctx: &Context, _id: i64) -> Result<()> {
        Err(KvError::Unimplemented("lease revoke"))
    }

    fn keep_alive_once(&self, _ctx: &Context, _id: i64) -> Result<()> {
        Err(KvError::Unimplemented("lease keep-alive"))
    }

    fn time_to_live(&self, _ctx: &Context, _id: i64) -> Result<i64> {
        Err(KvError::Unimplemented("lease time-to-live"))
    }

    fn watch_lease(&self, _ctx: &Context, _id: i64) -> Result<()> {
        Err(KvError::Unimplemented("lease watch"))
    }
}
