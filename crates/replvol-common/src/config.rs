//! Configuration types for ReplVol
//!
//! A `VolumeConfig` is consumed at attach time. It is an explicit value
//! handed to each session so several sessions with different settings can
//! live in one process.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{ReadLevel, WriteLevel};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-session configuration of the volume I/O path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Memory budget for the write-back cache in bytes
    pub write_cache_bytes: u64,
    /// Memory budget for the read cache in bytes
    pub read_cache_bytes: u64,
    /// Read replication level
    pub read_level: ReadLevel,
    /// Write replication level
    pub write_level: WriteLevel,
    /// Replica client retry and timeout policy
    pub replica: ReplicaConfig,
    /// How long a write may wait for write-back cache space before
    /// failing with a retry-later error
    pub stage_timeout: Duration,
    /// Period of the background re-drive of stalled writes
    pub flush_interval: Duration,
    /// Upper bound on the flush performed at detach
    pub detach_timeout: Duration,
    /// Which replicas serve the read half of a partial-block write
    pub partial_write_read: PartialWritePolicy,
    /// Attach lease lifetime; renewed by the background flusher
    pub lease_ttl: Duration,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            write_cache_bytes: 128 * 1024 * 1024, // 128MiB
            read_cache_bytes: 20 * 1024 * 1024,   // 20MiB
            read_level: ReadLevel::default(),
            write_level: WriteLevel::default(),
            replica: ReplicaConfig::default(),
            stage_timeout: Duration::from_secs(30),
            flush_interval: Duration::from_secs(5),
            detach_timeout: Duration::from_secs(30),
            partial_write_read: PartialWritePolicy::default(),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

impl VolumeConfig {
    /// Validate the configuration against a volume's block size
    pub fn validate(&self, block_size: u64) -> ConfigResult<()> {
        if self.write_cache_bytes < block_size {
            return Err(ConfigError::invalid(format!(
                "write cache of {} bytes cannot hold a single {block_size} byte block",
                self.write_cache_bytes
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid("flush interval must be non-zero"));
        }
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::invalid("lease ttl must be non-zero"));
        }
        self.replica.validate()
    }
}

/// Retry and timeout policy for a single replica channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Timeout of a single request attempt
    pub request_timeout: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each further retry
    pub initial_backoff: Duration,
    /// Cap on the retry delay
    pub max_backoff: Duration,
    /// Requests allowed in flight on one replica channel
    pub max_in_flight: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            max_in_flight: 16,
        }
    }
}

impl ReplicaConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("replica max_attempts must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid("replica max_in_flight must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("replica request timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Read policy for the internal read of a sub-block write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialWritePolicy {
    /// Read in replica priority order regardless of the session read level
    #[default]
    Strict,
    /// Use the session read level
    Configured,
}
