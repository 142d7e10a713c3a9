//! Connection Pool
//!
//! Opens one [`Backend`] per endpoint and hands it to every client built
//! against that endpoint.
//!
//! ```text
//!   ConnectionPool
//!     └── "sqlite:///var/lib/kv.db" ──► Backend
//!                                        ├── Arc<dyn Driver>
//!                                        ├── KeyLocker
//!                                        ├── Broadcaster ── poller thread
//!                                        └── cleanup thread
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::cleanup;
use crate::config::Config;
use crate::context::{CancelHandle, Context};
use crate::driver::{Driver, Endpoint, KeyRevision};
use crate::error::Result;
use crate::locker::KeyLocker;
use crate::watch::{Broadcaster, Subscription};

// =============================================================================
// Backend
// =============================================================================

/// Everything shared by the clients of one endpoint
pub struct Backend {
    endpoint: Endpoint,
    config: Config,
    driver: Arc<dyn Driver>,
    locker: KeyLocker,
    broadcaster: Broadcaster,
    shutdown: CancelHandle,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Backend {
    /// Open the endpoint's driver and start the cleanup thread
    pub fn open(endpoint: &str, config: &Config) -> Result<Arc<Self>> {
        let endpoint = Endpoint::parse(endpoint)?;
        let driver = endpoint.open(config)?;
        let (ctx, shutdown) = Context::background().with_cancel();
        let broadcaster = Broadcaster::new(
            Arc::clone(&driver),
            ctx.clone(),
            config.poll_interval(),
            config.poll_batch_size,
        );

        let backend = Arc::new(Self {
            endpoint,
            config: config.clone(),
            driver,
            locker: KeyLocker::new(),
            broadcaster,
            shutdown,
            cleanup: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Some(interval) = config.compact_interval() {
            let handle = cleanup::spawn(Arc::downgrade(&backend), ctx, interval)?;
            *backend.cleanup.lock() = Some(handle);
        }

        tracing::info!("opened kvsql backend {}", backend.endpoint);
        Ok(backend)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn locker(&self) -> &KeyLocker {
        &self.locker
    }

    /// [`Driver::update`], waking watchers on success
    pub fn update(
        &self,
        name: &[u8],
        value: &[u8],
        prev_revision: i64,
        lease_ttl: i64,
    ) -> Result<(Option<KeyRevision>, KeyRevision)> {
        let (prev, row) = self.driver.update(name, value, prev_revision, lease_ttl)?;
        self.broadcaster.notify(row.revision);
        Ok((prev, row))
    }

    /// [`Driver::delete`], waking watchers when a tombstone was written
    pub fn delete(
        &self,
        name: &[u8],
        prev_revision: i64,
    ) -> Result<Option<(KeyRevision, KeyRevision)>> {
        let deleted = self.driver.delete(name, prev_revision)?;
        if let Some((_, tombstone)) = &deleted {
            self.broadcaster.notify(tombstone.revision);
        }
        Ok(deleted)
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        self.broadcaster.subscribe()
    }

    pub fn watcher_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    /// Run one expiry and compaction pass now
    pub fn cleanup(&self) -> Result<cleanup::CleanupReport> {
        cleanup::run(self)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the background threads and close the driver. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        if let Some(handle) = self.cleanup.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("cleanup thread panicked");
            }
        }
        self.broadcaster.join();
        self.driver.close()?;

        tracing::info!("closed kvsql backend {}", self.endpoint);
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Open backends keyed by endpoint string
#[derive(Default)]
pub struct ConnectionPool {
    backends: Mutex<HashMap<String, Arc<Backend>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backend for `endpoint`, opened with default settings if needed
    pub fn open(&self, endpoint: &str) -> Result<Arc<Backend>> {
        self.open_with(endpoint, &Config::default())
    }

    /// The backend for `endpoint`, opened with `config` if needed.
    ///
    /// An already open backend keeps the settings it was opened with.
    pub fn open_with(&self, endpoint: &str, config: &Config) -> Result<Arc<Backend>> {
        let mut backends = self.backends.lock();
        if let Some(backend) = backends.get(endpoint) {
            tracing::debug!("reusing kvsql backend {}", endpoint);
            return Ok(Arc::clone(backend));
        }

        let backend = Backend::open(endpoint, config)?;
        backends.insert(endpoint.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Close and forget the backend for `endpoint`; false if none was open
    pub fn close(&self, endpoint: &str) -> Result<bool> {
        let removed = self.backends.lock().remove(endpoint);
        match removed {
            Some(backend) => {
                backend.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every backend, returning the first error after trying them all
    pub fn close_all(&self) -> Result<()> {
        let backends: Vec<_> = self.backends.lock().drain().collect();
        let mut first_err = None;
        for (endpoint, backend) in backends {
            if let Err(e) = backend.close() {
                tracing::error!("failed to close backend {}: {}", endpoint, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
