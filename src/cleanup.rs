//! Background Cleanup
//!
//! Periodic maintenance of the history table.
//!
//! ## Responsibilities
//! - Tombstone keys whose lease TTL has passed
//! - Compact history older than the retained window
//!
//! ## Compaction Window
//! ```text
//!   compact_rev            target = current - min_retain        current
//!        |---- batch ----|---- batch ----|------- retained -------|
//! ```
//! Each step compacts at most `compact_batch_size` revisions so a long
//! backlog never holds the write lock for one huge delete.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::select;

use crate::client::Backend;
use crate::context::Context;
use crate::error::{KvError, Result};

/// Expired keys tombstoned per pass
const EXPIRE_BATCH: i64 = 1000;

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Keys tombstoned because their TTL passed
    pub expired: usize,
    /// History rows removed
    pub compacted: u64,
    /// Watermark after the pass
    pub compact_revision: i64,
}

/// One expiry pass followed by one compaction pass
pub fn run(backend: &Backend) -> Result<CleanupReport> {
    run_until(backend, &Context::background())
}

/// [`run`], abandoning key lock waits once `ctx` is done
fn run_until(backend: &Backend, ctx: &Context) -> Result<CleanupReport> {
    let expired = expire(backend, ctx)?;
    let (compacted, compact_revision) = compact(backend)?;
    Ok(CleanupReport {
        expired,
        compacted,
        compact_revision,
    })
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn expire(backend: &Backend, ctx: &Context) -> Result<usize> {
    let rows = backend.driver().expired(now_unix(), EXPIRE_BATCH)?;
    let mut expired = 0;

    for row in rows {
        let _guard = backend.locker().lock(ctx, &row.name)?;
        // Only the revision that expired; a newer write keeps the key
        match backend.delete(&row.name, row.revision) {
            Ok(Some((_, tombstone))) => {
                tracing::debug!(
                    "EXPIRE {}, rev={} => rev={}",
                    String::from_utf8_lossy(&row.name),
                    row.revision,
                    tombstone.revision
                );
                expired += 1;
            }
            Ok(None) | Err(KvError::Conflict { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}

fn compact(backend: &Backend) -> Result<(u64, i64)> {
    let config = backend.config();
    let driver = backend.driver();

    let current = driver.current_revision()?;
    let mut compact_rev = driver.compact_revision()?;
    let target = current - config.compact_min_retain.max(0);
    let step = config.compact_batch_size.max(1);

    let mut removed = 0;
    while compact_rev < target {
        let next = (compact_rev + step).min(target);
        let deleted = driver.compact(next)?;
        tracing::debug!("COMPACT rev={} => {} rows removed", next, deleted);
        removed += deleted;
        compact_rev = next;
    }

    Ok((removed, compact_rev))
}

/// Run [`run`] every `interval` until `ctx` is canceled or the backend is gone
pub(crate) fn spawn(
    backend: Weak<Backend>,
    ctx: Context,
    interval: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("kvsql-cleanup".to_string())
        .spawn(move || loop {
            select! {
                recv(ctx.done()) -> _ => break,
                default(interval) => {}
            }
            let Some(backend) = backend.upgrade() else {
                break;
            };
            match run_until(&backend, &ctx) {
                Ok(report) if report.expired > 0 || report.compacted > 0 => {
                    tracing::info!(
                        "cleanup expired {} keys, removed {} rows (compact_rev={})",
                        report.expired,
                        report.compacted,
                        report.compact_revision
                    );
                }
                Ok(_) => {}
                Err(KvError::Closed | KvError::Canceled) => break,
                Err(e) => tracing::error!("cleanup failed: {}", e),
            }
        })
}
