//! Configuration for kvsql
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

/// Main configuration for a kvsql client
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Connection Configuration
    // -------------------------------------------------------------------------
    /// Backing store endpoints, `<engine>://<path-or-dsn>`.
    /// Exactly one is required.
    pub endpoints: Vec<String>,

    /// How long SQLite waits on a locked database, and the Postgres
    /// connect timeout (milliseconds)
    pub busy_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Watch Configuration
    // -------------------------------------------------------------------------
    /// Fallback poll period when no write notification arrives (milliseconds)
    pub poll_interval_ms: u64,

    /// Max rows read per poll
    pub poll_batch_size: u64,

    /// Capacity of each watch response channel
    pub watch_buffer: usize,

    // -------------------------------------------------------------------------
    // Cleanup Configuration
    // -------------------------------------------------------------------------
    /// Period of the expiry/compaction pass (milliseconds, 0 disables it)
    pub compact_interval_ms: u64,

    /// Most recent revisions that are never compacted
    pub compact_min_retain: i64,

    /// Revisions compacted per step
    pub compact_batch_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            busy_timeout_ms: 5000,
            poll_interval_ms: 1000,
            poll_batch_size: 500,
            watch_buffer: 100,
            compact_interval_ms: 5 * 60 * 1000, // 5 minutes
            compact_min_retain: 1000,
            compact_batch_size: 1000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when the background cleanup pass is disabled
    pub fn compact_interval(&self) -> Option<Duration> {
        (self.compact_interval_ms > 0).then(|| Duration::from_millis(self.compact_interval_ms))
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Add a backing store endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoints.push(endpoint.into());
        self
    }

    /// Replace the endpoint list
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Set the SQLite busy timeout (in milliseconds)
    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.config.busy_timeout_ms = ms;
        self
    }

    /// Set the watch poll fallback period (in milliseconds)
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the number of rows read per poll
    pub fn poll_batch_size(mut self, rows: u64) -> Self {
        self.config.poll_batch_size = rows;
        self
    }

    /// Set the capacity of watch response channels
    pub fn watch_buffer(mut self, capacity: usize) -> Self {
        self.config.watch_buffer = capacity;
        self
    }

    /// Set the cleanup period (in milliseconds, 0 disables cleanup)
    pub fn compact_interval_ms(mut self, ms: u64) -> Self {
        self.config.compact_interval_ms = ms;
        self
    }

    /// Set how many recent revisions are never compacted
    pub fn compact_min_retain(mut self, revisions: i64) -> Self {
        self.config.compact_min_retain = revisions;
        self
    }

    /// Set how many revisions a single compaction step covers
    pub fn compact_batch_size(mut self, revisions: i64) -> Self {
        self.config.compact_batch_size = revisions;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
