#![allow(clippy::result_large_err)]
//! ReplVol Volume I/O
//!
//! This crate serves block reads and writes for an attached volume against
//! a set of replicated storage nodes. It maps byte ranges onto fixed-size
//! blocks, stages writes in a write-back cache, keeps recently read blocks
//! in an LRU read cache, and fans I/O out to replicas according to the
//! configured read and write levels.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐
//! │  Export front end      │  (NBD)
//! └───────────┬────────────┘
//!             │ read_blocks / write_blocks
//! ┌───────────▼────────────┐
//! │  VolumeCoordinator     │
//! │  - ReadCache           │
//! │  - WriteBackCache      │
//! │  - CatchUpSet          │
//! │  - BlockLocks          │
//! └───────────┬────────────┘
//!             │
//! ┌───────────▼────────────┐
//! │ ConsistencyCoordinator │  ReadLevel / WriteLevel
//! └───────────┬────────────┘
//!             │ fan-out
//! ┌───────────▼────────────┐
//! │  ReplicaClient × N     │  retry, backoff, timeout
//! └───────────┬────────────┘
//!             │
//! ┌───────────▼────────────┐
//! │  ReplicaTransport      │  (TCP / in-memory)
//! └────────────────────────┘
//! ```

pub mod block;
pub mod catch_up;
pub mod consistency;
pub mod coordinator;
pub mod error;
mod flush;
pub mod memory;
pub mod metadata;
pub mod read_cache;
pub mod replica;
pub mod stats;
pub mod tcp;
pub mod transport;
pub mod wire;
pub mod write_cache;

pub use block::{BlockMapper, BlockRange};
pub use catch_up::{CatchUpSet, CatchUpWrite};
pub use consistency::{AckSink, ConsistencyCoordinator, GenerationClock, WriteFanOut};
pub use coordinator::{DetachReport, VolumeCoordinator};
pub use error::{VolumeError, VolumeResult};
pub use memory::{MemoryCluster, MemoryReplica};
pub use metadata::{Lease, MemoryKv, Metadata, MetadataKv, MetadataService, Versioned};
pub use read_cache::{BlockKey, ReadCache, ReadCacheStats};
pub use replica::ReplicaClient;
pub use stats::{FaultEvent, FaultSignal, StatsSnapshot, VolumeStats};
pub use tcp::{TcpConnector, TcpTransport};
pub use transport::{BlockData, ReplicaConnector, ReplicaTransport, TransportError};
pub use write_cache::{DriveState, StalledWrite, WriteBackCache, WriteCacheStats, WriteHandle};

/// Default device block size: 4KB
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
