//! Cluster membership, reduced to the one member a SQL backend has.

use std::sync::Arc;

use crate::client::Backend;
use crate::context::Context;
use crate::error::{KvError, Result};
use crate::types::{Member, MemberListResponse, ResponseHeader};

/// Name reported for the single member
pub const MEMBER_NAME: &str = "kvsql";

pub trait Cluster {
    fn member_list(&self, ctx: &Context) -> Result<MemberListResponse>;

    fn member_add(&self, ctx: &Context, peer_urls: &[String]) -> Result<Member>;

    fn member_remove(&self, ctx: &Context, id: u64) -> Result<()>;

    fn member_update(&self, ctx: &Context, id: u64, peer_urls: &[String]) -> Result<()>;
}

pub struct SqlCluster {
    backend: Arc<Backend>,
}

impl SqlCluster {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }
}

impl Cluster for SqlCluster {
    fn member_list(&self, ctx: &Context) -> Result<MemberListResponse> {
        ctx.check()?;
        let revision = self.backend.driver().current_revision()?;
        Ok(MemberListResponse {
            header: ResponseHeader::new(revision),
            members: vec![Member {
                id: 1,
                name: MEMBER_NAME.to_string(),
                peer_urls: Vec::new(),
                client_urls: vec![self.backend.endpoint().to_string()],
            }],
        })
    }

    fn member_add(&self, _ctx: &Context, _peer_urls: &[String]) -> Result<Member> {
        Err(KvError::Unimplemented("member add"))
    }

    fn member_remove(&self, _ctx: &Context, _id: u64) -> Result<()> {
        Err(KvError::Unimplemented("member remove"))
    }

    fn member_update(&self, _ctx: &Context, _id: u64, _peer_urls: &[String]) -> Result<()> {
        Err(KvError::Unimplemented("member update"))
    }
}
