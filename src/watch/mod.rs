//! Watch Module
//!
//! Streams committed changes to subscribers.
//!
//! ## Responsibilities
//! - Acknowledge each subscription with a `created` response
//! - Replay history from a start revision
//! - Stream live changes in revision order, filtered to the watched range
//! - End the stream on compaction, storage errors, or cancellation
//!
//! ## Subscription Flow
//! ```text
//!   watch() ──► subscribe ──► Created ──► replay (with_rev) ──► live events
//!                                │                                  │
//!                                └── start compacted ──► Canceled   ├── error ──► Canceled
//!                                                                   └── ctx done ──► close
//! ```

mod broadcaster;

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

use crate::client::Backend;
use crate::context::{CancelHandle, Context};
use crate::driver::{KeyRange, KeyRevision};
use crate::error::{KvError, Result};
use crate::op::{Op, OpOption};
use crate::types::{Event, EventType, WatchResponse};

pub use broadcaster::{Batch, Broadcaster, Published, Subscription};

/// Responses for one subscription; disconnects when it ends
pub type WatchChan = Receiver<WatchResponse>;

pub trait Watcher {
    /// Subscribe to changes of `key` (or a range, per `opts`).
    ///
    /// Invalid options produce a single canceled response carrying the error.
    fn watch(&self, ctx: &Context, key: &str, opts: &[OpOption]) -> WatchChan;

    /// End every subscription created through this watcher
    fn close(&self) -> Result<()>;
}

/// [`Watcher`] fed by a backend's broadcaster
pub struct SqlWatcher {
    backend: Arc<Backend>,
    ctx: Context,
    cancel: CancelHandle,
}

impl SqlWatcher {
    pub fn new(backend: Arc<Backend>) -> Self {
        let (ctx, cancel) = Context::background().with_cancel();
        Self {
            backend,
            ctx,
            cancel,
        }
    }

    fn start(&self, ctx: &Context, op: Op, tx: Sender<WatchResponse>) -> Result<()> {
        let subscription = self.backend.subscribe()?;
        let stream = Stream {
            backend: Arc::clone(&self.backend),
            ctx: ctx.clone(),
            watcher: self.ctx.clone(),
            range: op.range().clone(),
            start: op.rev(),
            tx,
            last: 0,
        };

        thread::Builder::new()
            .name("kvsql-watch".to_string())
            .spawn(move || stream.run(subscription))?;
        Ok(())
    }
}

impl Watcher for SqlWatcher {
    fn watch(&self, ctx: &Context, key: &str, opts: &[OpOption]) -> WatchChan {
        let (tx, rx) = channel::bounded(self.backend.config().watch_buffer.max(1));

        let started = Op::watch(bytes::Bytes::copy_from_slice(key.as_bytes()), opts)
            .and_then(|op| self.start(ctx, op, tx.clone()));
        if let Err(e) = started {
            tracing::warn!("watch {} failed to start: {}", key, e);
            let _ = tx.try_send(WatchResponse::failed(0, &e));
        }
        rx
    }

    fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for SqlWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turn a history row into a watch event.
///
/// The previous value rides along whenever the row cached one.
pub fn to_event(row: &KeyRevision) -> Event {
    Event {
        kind: if row.del {
            EventType::Delete
        } else {
            EventType::Put
        },
        kv: row.to_key_value(),
        prev_kv: row.prev_key_value(),
    }
}

// =============================================================================
// Per-subscription stream
// =============================================================================

enum Flow {
    Continue,
    Stop,
}

struct Stream {
    backend: Arc<Backend>,
    ctx: Context,
    watcher: Context,
    range: KeyRange,
    start: i64,
    tx: Sender<WatchResponse>,
    /// Highest revision delivered
    last: i64,
}

impl Stream {
    fn run(mut self, subscription: Subscription) {
        if let Err(e) = self.begin() {
            if !matches!(e, KvError::Canceled | KvError::DeadlineExceeded) {
                tracing::warn!("watch stream failed: {}", e);
                self.send(WatchResponse::failed(self.last, &e));
            }
            return;
        }

        let done = self.ctx.done().clone();
        let closed = self.watcher.done().clone();
        let deadline = self.ctx.deadline_timer();
        let feed = subscription.feed().clone();
        loop {
            let flow = select! {
                recv(done) -> _ => Flow::Stop,
                recv(closed) -> _ => Flow::Stop,
                recv(deadline) -> _ => Flow::Stop,
                recv(feed) -> published => match published {
                    Ok(Published::Rows(batch)) => self.deliver(&batch),
                    Ok(Published::Failed(err)) => {
                        self.send(WatchResponse::failed(self.last, &err));
                        Flow::Stop
                    }
                    Err(_) => {
                        self.send(WatchResponse::failed(self.last, &KvError::Closed));
                        Flow::Stop
                    }
                },
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        tracing::debug!("watch stream ended at revision {}", self.last);
    }

    /// Send `created` and replay from the start revision
    fn begin(&mut self) -> Result<()> {
        let driver = self.backend.driver();
        let current = driver.current_revision()?;
        self.last = current;

        if !self.send(WatchResponse::created(current)) {
            return Err(KvError::Canceled);
        }
        if self.start <= 0 {
            return Ok(());
        }

        let compact_revision = driver.compact_revision()?;
        if self.start <= compact_revision {
            tracing::debug!(
                "watch start {} is compacted (compact_rev={})",
                self.start,
                compact_revision
            );
            self.send(WatchResponse::compacted(current, self.start, compact_revision));
            return Err(KvError::Canceled);
        }

        let rows = driver.after(&self.range, self.start - 1, 0)?;
        self.last = 0;
        let flow = self.deliver(&rows);
        // Nothing below the start revision goes out, even when it is ahead
        // of the store
        self.last = self.last.max(current).max(self.start - 1);
        match flow {
            Flow::Continue => Ok(()),
            Flow::Stop => Err(KvError::Canceled),
        }
    }

    fn deliver(&mut self, rows: &[KeyRevision]) -> Flow {
        let events: Vec<Event> = rows
            .iter()
            .filter(|row| row.revision > self.last && self.range.contains(&row.name))
            .map(to_event)
            .collect();
        let Some(revision) = events.last().map(|e| e.kv.mod_revision) else {
            return Flow::Continue;
        };

        self.last = revision;
        if self.send(WatchResponse::events(revision, events)) {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    /// False once the receiver is gone or the subscription is canceled
    fn send(&self, resp: WatchResponse) -> bool {
        if self.ctx.err().is_some() || self.watcher.err().is_some() {
            return false;
        }
        select! {
            send(self.tx, resp) -> res => res.is_ok(),
            recv(self.ctx.done()) -> _ => false,
            recv(self.watcher.done()) -> _ => false,
        }
    }
}
