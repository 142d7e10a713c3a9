//! Per-key Locking
//!
//! A named mutex: writers to the same key queue up, writers to different
//! keys never contend. Entries live only while someone holds or waits on
//! them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::context::Context;
use crate::error::Result;

/// Longest a waiter sleeps before looking at its context again
const CANCEL_CHECK: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Entry {
    held: bool,
    waiters: usize,
}

#[derive(Default)]
pub struct KeyLocker {
    locks: Mutex<HashMap<Bytes, Entry>>,
    released: Condvar,
}

/// Holds one key locked until dropped
pub struct KeyGuard<'a> {
    locker: &'a KeyLocker,
    key: Bytes,
}

impl KeyLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it.
    ///
    /// Gives up with the context's error once `ctx` is canceled or its
    /// deadline passes.
    pub fn lock(&self, ctx: &Context, key: &Bytes) -> Result<KeyGuard<'_>> {
        let mut locks = self.locks.lock();
        loop {
            let entry = locks.entry(key.clone()).or_default();
            if !entry.held {
                entry.held = true;
                break;
            }
            ctx.check()?;

            entry.waiters += 1;
            let wake = Instant::now() + CANCEL_CHECK;
            let wake = ctx.deadline().map_or(wake, |deadline| deadline.min(wake));
            self.released.wait_until(&mut locks, wake);
            if let Some(entry) = locks.get_mut(key) {
                entry.waiters -= 1;
            }
        }
        Ok(KeyGuard {
            locker: self,
            key: key.clone(),
        })
    }

    /// Lock several keys in ascending order, skipping duplicates
    pub fn lock_all<'k, I>(&self, ctx: &Context, keys: I) -> Result<Vec<KeyGuard<'_>>>
    where
        I: IntoIterator<Item = &'k Bytes>,
    {
        let mut keys: Vec<&Bytes> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        keys.into_iter().map(|key| self.lock(ctx, key)).collect()
    }

    /// Keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locker.locks.lock();
        let waiting = match locks.get_mut(&self.key) {
            Some(entry) => {
                entry.held = false;
                entry.waiters > 0
            }
            None => false,
        };
        if waiting {
            self.locker.released.notify_all();
        } else {
            locks.remove(&self.key);
        }
    }
}
