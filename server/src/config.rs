//! Server configuration and its validation

use shared::{MAX_PAYLOAD_LEN, RECORD_COUNT_LEN, RECORD_LEN};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 100;
pub const DEFAULT_IDLE_READ_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BURST_READ_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SPAWN_EXTENT: f64 = 100.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("mailbox capacity must be at least 1")]
    ZeroMailboxCapacity,

    #[error("{0} timeout must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("spawn extent must be a positive finite number, got {0}")]
    InvalidSpawnExtent(f64),

    #[error("payload limit of {0} bytes cannot hold a single record")]
    PayloadLimitTooSmall(usize),
}

/// Tunables for every client actor spawned by a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Snapshot batches a client may have pending before it is dropped.
    pub mailbox_capacity: usize,
    /// How long a connection may stay silent between frames.
    pub idle_read_timeout: Duration,
    /// How long the rest of a frame may take once its length prefix arrived.
    pub burst_read_timeout: Duration,
    /// Deadline for writing one snapshot frame.
    pub write_timeout: Duration,
    /// Initial positions are drawn from `[0, spawn_extent)` on both axes.
    pub spawn_extent: f64,
    /// Largest inbound payload accepted before the connection is dropped.
    pub max_payload_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            idle_read_timeout: DEFAULT_IDLE_READ_TIMEOUT,
            burst_read_timeout: DEFAULT_BURST_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            spawn_extent: DEFAULT_SPAWN_EXTENT,
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroMailboxCapacity);
        }

        let timeouts = [
            ("idle read", self.idle_read_timeout),
            ("burst read", self.burst_read_timeout),
            ("write", self.write_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }

        if !(self.spawn_extent.is_finite() && self.spawn_extent > 0.0) {
            return Err(ConfigError::InvalidSpawnExtent(self.spawn_extent));
        }

        if self.max_payload_len < RECORD_COUNT_LEN + RECORD_LEN {
            return Err(ConfigError::PayloadLimitTooSmall(self.max_payload_len));
        }

        Ok(())
    }
}
