//! Request Context
//!
//! Cancellation and deadlines for blocking calls.
//!
//! A [`Context`] is cheap to clone. Canceling a context cancels every
//! context derived from it. Cancellation is observable three ways:
//! - [`Context::err`] for a point-in-time check
//! - [`Context::done`], a channel that disconnects on cancel (usable in
//!   `crossbeam::select!`)
//! - [`Context::deadline_timer`], a channel that fires at the deadline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{KvError, Result};

struct CancelState {
    canceled: AtomicBool,
    /// Dropped on cancel so that `done` disconnects.
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn new() -> Arc<Self> {
        let (sender, receiver) = channel::bounded(0);
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().take();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = CancelState::new();
        let mut children = self.children.lock();
        if self.canceled.load(Ordering::SeqCst) {
            drop(children);
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        child
    }
}

/// Carries cancellation and an optional deadline across calls
#[derive(Clone)]
pub struct Context {
    state: Arc<CancelState>,
    deadline: Option<Instant>,
}

/// Cancels the context it was created with
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.state.canceled.load(Ordering::SeqCst))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Context {
    /// A context that is never canceled and has no deadline
    pub fn background() -> Self {
        Self {
            state: CancelState::new(),
            deadline: None,
        }
    }

    /// Derive a context that is canceled by the returned handle or by the parent
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let state = self.state.child();
        let ctx = Context {
            state: Arc::clone(&state),
            deadline: self.deadline,
        };
        (ctx, CancelHandle { state })
    }

    /// Derive a context that expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline` (or the parent's, if earlier)
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        let (mut ctx, handle) = self.with_cancel();
        ctx.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        (ctx, handle)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context is no longer usable, if it isn't
    pub fn err(&self) -> Option<KvError> {
        if self.state.canceled.load(Ordering::SeqCst) {
            return Some(KvError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(KvError::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Ok(())` while the context is live
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Disconnects when the context is canceled
    pub fn done(&self) -> &Receiver<()> {
        &self.state.receiver
    }

    /// Fires once at the deadline; never fires without one
    pub fn deadline_timer(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => channel::at(deadline),
            None => channel::never(),
        }
    }
}
