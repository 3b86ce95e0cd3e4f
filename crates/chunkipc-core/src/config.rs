//! Segment sizing and monitor settings

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Bytes per chunk, header included
pub const CHUNK_SIZE: usize = 4096;

/// Ring slots per channel direction. One slot stays empty, so a queue holds
/// `CHANNEL_SLOTS - 1` chunk indices.
pub const CHANNEL_SLOTS: usize = 256;

/// Ring slots in each scheduler's private chunk pool
pub const PRIVATE_POOL_SLOTS: usize = 1024;

/// Upper bound on channels in a segment. Poll masks and resource maps are
/// sized for this many channels.
pub const MAX_CHANNELS: usize = 256;

/// Upper bound on client slots in a segment
pub const MAX_CLIENTS: usize = 256;

/// Upper bound on schedulers in a segment
pub const MAX_SCHEDULERS: usize = 32;

/// Largest number of chunks a segment can hold; `u32::MAX` is the link
/// terminator.
pub const MAX_CHUNKS: usize = 1 << 24;

/// How a database segment is sized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub chunks: usize,
    pub schedulers: usize,
    pub channels: usize,
    pub clients: usize,
    /// Chunks moved from the shared pool when a private pool runs dry
    pub private_pool_refill_batch: usize,
    /// A private pool holding more than this many chunks is trimmed
    pub private_pool_high_water: usize,
    /// Size a private pool is trimmed down to
    pub private_pool_trim_to: usize,
    /// Chains shorter than this are served from the private pool first
    pub small_chain_threshold: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            chunks: 4096,
            schedulers: 4,
            channels: 256,
            clients: 64,
            private_pool_refill_batch: 64,
            private_pool_high_water: 512,
            private_pool_trim_to: 256,
            small_chain_threshold: 64,
        }
    }
}

impl SegmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(mut self, n: usize) -> Self {
        self.chunks = n;
        self
    }

    pub fn schedulers(mut self, n: usize) -> Self {
        self.schedulers = n;
        self
    }

    pub fn channels(mut self, n: usize) -> Self {
        self.channels = n;
        self
    }

    pub fn clients(mut self, n: usize) -> Self {
        self.clients = n;
        self
    }

    pub fn private_pool(mut self, refill_batch: usize, high_water: usize, trim_to: usize) -> Self {
        self.private_pool_refill_batch = refill_batch;
        self.private_pool_high_water = high_water;
        self.private_pool_trim_to = trim_to;
        self
    }

    pub fn small_chain_threshold(mut self, n: usize) -> Self {
        self.small_chain_threshold = n;
        self
    }

    /// Check the configuration against the layout limits
    pub fn validate(&self) -> Result<()> {
        fn bounded(name: &str, value: usize, max: usize) -> Result<()> {
            if value == 0 || value > max {
                return Err(Error::InvalidConfig(format!(
                    "{} must be in 1..={}, got {}",
                    name, max, value
                )));
            }
            Ok(())
        }

        bounded("chunks", self.chunks, MAX_CHUNKS)?;
        bounded("schedulers", self.schedulers, MAX_SCHEDULERS)?;
        bounded("channels", self.channels, MAX_CHANNELS)?;
        bounded("clients", self.clients, MAX_CLIENTS)?;

        if self.channels < self.schedulers {
            return Err(Error::InvalidConfig(format!(
                "{} channels cannot serve {} schedulers",
                self.channels, self.schedulers
            )));
        }
        if self.private_pool_trim_to > self.private_pool_high_water
            || self.private_pool_high_water >= PRIVATE_POOL_SLOTS
        {
            return Err(Error::InvalidConfig(format!(
                "private pool thresholds must satisfy trim_to <= high_water < {}",
                PRIVATE_POOL_SLOTS
            )));
        }
        if self.private_pool_refill_batch == 0
            || self.private_pool_refill_batch > self.private_pool_high_water
        {
            return Err(Error::InvalidConfig(
                "private pool refill batch must be in 1..=high_water".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the monitor process
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Name of the server instance; prefixes the monitor's named objects
    pub server_name: String,
    /// Directory holding the active databases file
    pub data_dir: PathBuf,
    /// How often registered processes are checked for liveness
    pub poll_interval: Duration,
    /// Time allowed for notifying one scheduler about clean-up
    pub notify_timeout: Duration,
    /// Poll ticks a pending clean-up is retried before it is reported stuck
    pub cleanup_retries: u32,
    /// Time the registrar waits for a request before re-checking for stop
    pub registrar_tick: Duration,
    /// Time a registering process waits for the monitor's answer
    pub registration_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server_name: "personal".to_string(),
            data_dir: std::env::temp_dir(),
            poll_interval: Duration::from_millis(100),
            notify_timeout: Duration::from_millis(64),
            cleanup_retries: 100,
            registrar_tick: Duration::from_millis(50),
            registration_timeout: Duration::from_secs(2),
        }
    }
}

impl MonitorConfig {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            ..Self::default()
        }
    }

    /// Shared memory name of the monitor interface
    pub fn interface_name(&self) -> String {
        format!("chunkipc_{}_monitor_interface", self.server_name)
    }

    /// Path of the file listing active databases
    pub fn active_databases_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}_active_databases", self.server_name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty()
            || !self
                .server_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::InvalidConfig(format!(
                "server name {:?} must be non-empty ASCII alphanumerics or '-'",
                self.server_name
            )));
        }
        if self.poll_interval.is_zero() || self.registrar_tick.is_zero() {
            return Err(Error::InvalidConfig(
                "poll interval and registrar tick must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
