//! Replica transport abstraction
//!
//! A transport is the point-to-point request/response channel to a single
//! replica. It owns framing and serialization; it knows nothing about
//! consistency levels or retries. One replica may back many volumes, so
//! every request names the volume; a block is addressed by
//! `(volume, block index)`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use replvol_common::{BlockIndex, Generation, ReplicaId, VolumeName};
use thiserror::Error;

use crate::error::VolumeResult;

/// Block contents as stored on a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub data: Bytes,
    /// Generation of the write that produced `data`; 0 for a never-written block
    pub generation: Generation,
}

/// Transport-level failure talking to one replica
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("corrupt frame: {0}")]
    Corrupt(String),

    /// The replica already holds a newer generation for the block
    #[error("replica holds newer generation {current:#x}")]
    Stale { current: Generation },

    /// The replica refused the request
    #[error("rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Failures worth retrying on the same replica
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Timeout | Self::Corrupt(_)
        )
    }
}

/// Request/response channel to one replica
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Read a whole block
    async fn read_block(
        &self,
        volume: &VolumeName,
        block: BlockIndex,
    ) -> Result<BlockData, TransportError>;

    /// Write a whole block at `generation`
    ///
    /// A replica holding a newer generation answers `TransportError::Stale`;
    /// re-sending the same generation is idempotent.
    async fn write_block(
        &self,
        volume: &VolumeName,
        block: BlockIndex,
        generation: Generation,
        data: Bytes,
    ) -> Result<(), TransportError>;
}

/// Opens transports for the replicas named by a replica set
pub trait ReplicaConnector: Send + Sync {
    fn connect(
        &self,
        replica: &ReplicaId,
        block_size: u64,
    ) -> VolumeResult<Arc<dyn ReplicaTransport>>;
}
