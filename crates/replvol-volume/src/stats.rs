//! Session statistics and the operational fault signal
//!
//! Failures that the caller never sees (a `Local` write that later fails to
//! propagate, a lease that could not be renewed, a replica that keeps
//! failing) are published as `FaultEvent`s on a broadcast channel. Counters
//! are plain atomics, read through `VolumeStats::snapshot`.

use std::sync::atomic::{AtomicU64, Ordering};

use replvol_common::{BlockIndex, Generation, ReplicaId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the fault channel; slow subscribers observe `Lagged`
const FAULT_CHANNEL_CAPACITY: usize = 1024;

/// Something went wrong that no caller was waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEvent {
    /// A replica write driven after the caller was acknowledged failed
    BackgroundWriteFailed {
        block: BlockIndex,
        generation: Generation,
        replica: ReplicaId,
        reason: String,
    },
    /// A write's fan-out finished without reaching its write level
    WriteLevelUnmet {
        block: BlockIndex,
        generation: Generation,
        acked: usize,
        required: usize,
    },
    /// A replica failed this many operations in a row
    ReplicaFailing {
        replica: ReplicaId,
        consecutive_failures: u32,
    },
    LeaseRenewalFailed {
        reason: String,
    },
    /// Detach gave up with blocks still awaiting replication
    DetachIncomplete {
        dirty_blocks: usize,
        lagging_blocks: usize,
    },
}

/// Publisher side of the fault channel
#[derive(Debug, Clone)]
pub struct FaultSignal {
    tx: broadcast::Sender<FaultEvent>,
}

impl Default for FaultSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody is subscribed
    pub fn emit(&self, event: FaultEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.tx.subscribe()
    }
}

/// Per-session I/O counters
#[derive(Debug, Default)]
pub struct VolumeStats {
    reads: AtomicU64,
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    replica_failures: AtomicU64,
    failovers: AtomicU64,
    stale_reads: AtomicU64,
    background_failures: AtomicU64,
}

/// Point-in-time copy of `VolumeStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub read_hits: u64,
    pub read_misses: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub replica_failures: u64,
    pub failovers: u64,
    pub stale_reads: u64,
    pub background_failures: u64,
}

impl VolumeStats {
    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.read_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.read_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replica_failure(&self) {
        self.replica_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_read(&self) {
        self.stale_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_failure(&self) {
        self.background_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            replica_failures: self.replica_failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fault_signal_delivers_to_subscribers() {
        let signal = FaultSignal::new();
        // No subscriber yet: silently dropped
        signal.emit(FaultEvent::LeaseRenewalFailed {
            reason: "nobody listening".into(),
        });

        let mut rx = signal.subscribe();
        let event = FaultEvent::DetachIncomplete {
            dirty_blocks: 2,
            lagging_blocks: 1,
        };
        signal.emit(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_snapshot() {
        let stats = VolumeStats::default();
        stats.record_read(4096);
        stats.record_read(4096);
        stats.record_hit();
        stats.record_write(512);
        stats.record_failover();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.bytes_read, 8192);
        assert_eq!(snap.read_hits, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.bytes_written, 512);
        assert_eq!(snap.failovers, 1);
        assert_eq!(snap.background_failures, 0);
    }
}
