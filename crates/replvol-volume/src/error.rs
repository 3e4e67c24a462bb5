//! Volume I/O error types

use replvol_common::{BlockIndex, ConfigError, Generation, ReplicaId, WriteLevel};
use thiserror::Error;

/// Volume I/O error
#[derive(Error, Debug, Clone)]
pub enum VolumeError {
    /// A single replica could not be reached after retries
    #[error("Replica {replica} unavailable: {reason}")]
    ReplicaUnavailable { replica: ReplicaId, reason: String },

    /// No replica in the set could serve a read
    #[error("Block {block}: no replica could serve the read ({attempts} tried)")]
    ReadUnavailable { block: BlockIndex, attempts: usize },

    /// Not enough replicas acknowledged a write
    #[error("Block {block}: write level '{level}' not met ({acked}/{required} acknowledged)")]
    WriteQuorumFailed {
        block: BlockIndex,
        level: WriteLevel,
        acked: usize,
        required: usize,
    },

    /// A newer generation was already committed for the block
    #[error("Block {block}: generation {attempted:#x} conflicts with committed generation {committed:#x}")]
    StaleGeneration {
        block: BlockIndex,
        attempted: Generation,
        committed: Generation,
    },

    /// Write-back cache full of blocks that are not yet durable
    #[error("Write cache exhausted: {dirty_bytes} of {capacity_bytes} bytes awaiting replication")]
    CacheExhausted {
        dirty_bytes: u64,
        capacity_bytes: u64,
    },

    /// Offset out of bounds
    #[error("Offset {offset} + length {length} exceeds volume size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Volume not found in metadata
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Volume already registered in metadata
    #[error("Volume already exists: {0}")]
    VolumeExists(String),

    /// Another session holds the attach lease
    #[error("Volume {volume} is attached by {holder}")]
    LeaseHeld { volume: String, holder: String },

    /// Metadata service error
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Session has been detached
    #[error("Volume session is detached")]
    Detached,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for volume operations
pub type VolumeResult<T> = Result<T, VolumeError>;

impl VolumeError {
    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Check if the caller should retry later rather than treat the
    /// operation as failed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ReplicaUnavailable { .. } | Self::CacheExhausted { .. }
        )
    }

    /// Errno reported to block protocol clients
    #[must_use]
    pub const fn errno(&self) -> u32 {
        const EIO: u32 = 5;
        const ENOMEM: u32 = 12;
        const EINVAL: u32 = 22;
        const ESHUTDOWN: u32 = 108;

        match self {
            Self::CacheExhausted { .. } => ENOMEM,
            Self::OutOfBounds { .. } | Self::Config(_) => EINVAL,
            Self::Detached => ESHUTDOWN,
            _ => EIO,
        }
    }
}
