//! Change Broadcaster
//!
//! One poller per backend reads the rows appended since the last revision
//! it saw and hands the batch to every subscriber.
//!
//! ## Wakeups
//! - a write notifies with its revision (immediate)
//! - otherwise the poller checks every `poll_interval`
//!
//! A full batch means more rows are waiting, so the poller reads again
//! without sleeping.
//!
//! A failed read ends every current subscription with the error; the
//! poller keeps running for later subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::context::Context;
use crate::driver::{Driver, KeyRange, KeyRevision};
use crate::error::{KvError, Result};

/// A batch of rows in revision order
pub type Batch = Arc<[KeyRevision]>;

/// What a subscription receives from the poller
#[derive(Debug, Clone)]
pub enum Published {
    Rows(Batch),
    /// The poller could not read the table; the feed ends after this
    Failed(Arc<KvError>),
}

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: HashMap<u64, Sender<Published>>,
    /// Highest revision published so far
    last: i64,
}

pub struct Broadcaster {
    driver: Arc<dyn Driver>,
    ctx: Context,
    poll_interval: Duration,
    batch_size: i64,
    notify_tx: Sender<i64>,
    notify_rx: Receiver<i64>,
    subscribers: Arc<Mutex<Subscribers>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// A live feed of published batches; unsubscribes on drop
pub struct Subscription {
    id: u64,
    subscribers: Arc<Mutex<Subscribers>>,
    feed: Receiver<Published>,
}

impl Subscription {
    pub fn feed(&self) -> &Receiver<Published> {
        &self.feed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.lock().senders.remove(&self.id);
    }
}

impl Broadcaster {
    pub fn new(driver: Arc<dyn Driver>, ctx: Context, poll_interval: Duration, batch_size: u64) -> Self {
        let (notify_tx, notify_rx) = channel::bounded(NOTIFY_CAPACITY);
        Self {
            driver,
            ctx,
            poll_interval,
            batch_size: batch_size.max(1) as i64,
            notify_tx,
            notify_rx,
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            poller: Mutex::new(None),
        }
    }

    /// Wake the poller after a write at `revision`. Never blocks.
    pub fn notify(&self, revision: i64) {
        let _ = self.notify_tx.try_send(revision);
    }

    /// Register a feed, starting the poller on first use.
    ///
    /// Every row committed after this call returns is delivered on the feed.
    pub fn subscribe(&self) -> Result<Subscription> {
        self.ctx.check().map_err(|_| KvError::Closed)?;
        self.start()?;

        let (tx, rx) = channel::unbounded();
        let mut subs = self.subscribers.lock();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.senders.insert(id, tx);

        Ok(Subscription {
            id,
            subscribers: Arc::clone(&self.subscribers),
            feed: rx,
        })
    }

    fn start(&self) -> Result<()> {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }

        let start = self.driver.current_revision()?;
        self.subscribers.lock().last = start;
        tracing::debug!("starting watch poller at revision {}", start);

        let poll = Poll {
            driver: Arc::clone(&self.driver),
            ctx: self.ctx.clone(),
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            notify: self.notify_rx.clone(),
            subscribers: Arc::clone(&self.subscribers),
        };
        let handle = thread::Builder::new()
            .name("kvsql-poll".to_string())
            .spawn(move || poll.run())?;
        *poller = Some(handle);
        Ok(())
    }

    /// Wait for the poller to exit; the backend context must be canceled first
    pub fn join(&self) {
        if let Some(handle) = self.poller.lock().take() {
            if handle.join().is_err() {
                tracing::error!("watch poller panicked");
            }
        }
        self.subscribers.lock().senders.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().senders.len()
    }
}

struct Poll {
    driver: Arc<dyn Driver>,
    ctx: Context,
    poll_interval: Duration,
    batch_size: i64,
    notify: Receiver<i64>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Poll {
    fn run(self) {
        let range = KeyRange::all();
        let mut wait_for_more = true;

        loop {
            if wait_for_more {
                select! {
                    recv(self.ctx.done()) -> _ => break,
                    recv(self.notify) -> rev => {
                        if let Ok(rev) = rev {
                            if rev <= self.subscribers.lock().last {
                                continue;
                            }
                        }
                    }
                    default(self.poll_interval) => {}
                }
            }
            if self.ctx.err().is_some() {
                break;
            }
            wait_for_more = true;

            let last = self.subscribers.lock().last;
            let rows = match self.driver.after(&range, last, self.batch_size) {
                Ok(rows) => rows,
                Err(KvError::Closed) => break,
                Err(e) => {
                    tracing::error!("fail to list latest changes: {}", e);
                    self.fail(e);
                    continue;
                }
            };
            if rows.is_empty() {
                continue;
            }
            wait_for_more = (rows.len() as i64) < self.batch_size;
            self.publish(rows);
        }

        tracing::debug!("watch poller stopped");
        self.subscribers.lock().senders.clear();
    }

    fn publish(&self, rows: Vec<KeyRevision>) {
        let mut subs = self.subscribers.lock();
        if let Some(row) = rows.last() {
            subs.last = row.revision;
        }
        tracing::trace!("publishing {} rows up to revision {}", rows.len(), subs.last);

        let batch: Batch = rows.into();
        subs.senders
            .retain(|_, tx| tx.send(Published::Rows(Arc::clone(&batch))).is_ok());
    }

    /// End every current subscription with `err`
    fn fail(&self, err: KvError) {
        let err = Arc::new(err);
        let mut subs = self.subscribers.lock();
        for (_, tx) in subs.senders.drain() {
            let _ = tx.send(Published::Failed(Arc::clone(&err)));
        }
    }
}
