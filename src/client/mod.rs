//! Client Module
//!
//! One handle bundling the KV, Watch, Lease and Cluster surfaces for a
//! single endpoint.
//!
//! ## Usage
//! ```no_run
//! use kvsql::{Client, Config, ConnectionPool, Context, Kv};
//!
//! let pool = ConnectionPool::new();
//! let config = Config::builder().endpoint("sqlite://./db/state.db").build();
//! let client = Client::new(&pool, config)?;
//!
//! let ctx = Context::background();
//! client.kv().put(&ctx, "/registry/pods/a", "running", &[])?;
//! # Ok::<(), kvsql::KvError>(())
//! ```

mod pool;

use std::sync::Arc;

use crate::cluster::SqlCluster;
use crate::config::Config;
use crate::error::{KvError, Result};
use crate::kv::SqlKv;
use crate::lease::SqlLease;
use crate::watch::{SqlWatcher, Watcher};

pub use pool::{Backend, ConnectionPool};

pub struct Client {
    backend: Arc<Backend>,
    kv: SqlKv,
    watcher: SqlWatcher,
    lease: SqlLease,
    cluster: SqlCluster,
}

impl Client {
    /// Connect to the single endpoint in `config`, sharing the pool's
    /// backend when one is already open for it
    pub fn new(pool: &ConnectionPool, config: Config) -> Result<Self> {
        let endpoint = match config.endpoints.as_slice() {
            [endpoint] => endpoint.clone(),
            endpoints => {
                return Err(KvError::Config(format!(
                    "exactly one endpoint is required, got {}",
                    endpoints.len()
                )))
            }
        };

        let backend = pool.open_with(&endpoint, &config)?;
        Ok(Self::from_backend(backend))
    }

    pub fn from_backend(backend: Arc<Backend>) -> Self {
        Self {
            kv: SqlKv::new(Arc::clone(&backend)),
            watcher: SqlWatcher::new(Arc::clone(&backend)),
            lease: SqlLease::new(Arc::clone(&backend)),
            cluster: SqlCluster::new(Arc::clone(&backend)),
            backend,
        }
    }

    pub fn kv(&self) -> &SqlKv {
        &self.kv
    }

    pub fn watcher(&self) -> &SqlWatcher {
        &self.watcher
    }

    pub fn lease(&self) -> &SqlLease {
        &self.lease
    }

    pub fn cluster(&self) -> &SqlCluster {
        &self.cluster
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// End this client's watches. The backend stays open for the pool.
    pub fn close(&self) -> Result<()> {
        self.watcher.close()
    }
}
