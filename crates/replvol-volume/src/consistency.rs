//! Consistency coordinator
//!
//! Fans logical block I/O out to the replica set according to the
//! session's read and write levels.
//!
//! Reads go to one replica at a time, picked by the read level, and fail
//! over in replica-set order. A replica answering with a generation older
//! than the newest one this session saw acknowledged is divergent and is
//! skipped like a failed one.
//!
//! Writes are always sent to every target replica concurrently by a
//! detached driver task. The level only decides when the caller is told
//! the outcome; the driver keeps running after that so a replica that
//! recovers within its retry window catches up without a second pass.
//! Whatever fails after the caller was answered is published on the fault
//! signal, and the session queues those replicas for catch-up.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use replvol_common::{
    BlockIndex, Generation, ReadLevel, ReplicaId, VolumeConfig, VolumeName, WriteLevel,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::error::{VolumeError, VolumeResult};
use crate::replica::ReplicaClient;
use crate::stats::{FaultEvent, FaultSignal, VolumeStats};
use crate::transport::BlockData;
use crate::write_cache::WriteHandle;

/// Bits of a generation holding the per-session sequence number
pub const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Issues per-volume write ordering tokens
///
/// A generation is `epoch << 40 | sequence`. The epoch comes from the
/// attach lease, so tokens of a later session always order after every
/// token of an earlier one.
#[derive(Debug)]
pub struct GenerationClock {
    epoch: u64,
    sequence: AtomicU64,
}

impl GenerationClock {
    #[must_use]
    pub const fn new(epoch: u64) -> Self {
        Self {
            epoch,
            sequence: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Next generation, strictly greater than every earlier one
    pub fn next(&self) -> Generation {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        (self.epoch << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK)
    }

    /// Whether `generation` was handed out by this clock
    #[must_use]
    pub fn issued_by_session(&self, generation: Generation) -> bool {
        generation >> SEQUENCE_BITS == self.epoch
            && generation & SEQUENCE_MASK != 0
            && generation & SEQUENCE_MASK <= self.sequence.load(Ordering::SeqCst)
    }
}

/// Receives per-replica outcomes of a write fan-out
pub trait AckSink: Send + Sync {
    fn acked(&self, handle: WriteHandle, replica: &ReplicaId);

    fn failed(&self, handle: WriteHandle, replica: &ReplicaId, error: &VolumeError);

    /// Every target replica answered
    fn finished(&self, handle: WriteHandle, acked: usize);
}

/// Outcome of a write fan-out, resolved once the write level is decided
#[derive(Debug)]
pub struct WriteFanOut {
    handle: WriteHandle,
    rx: oneshot::Receiver<VolumeResult<()>>,
}

impl WriteFanOut {
    #[must_use]
    pub const fn handle(&self) -> WriteHandle {
        self.handle
    }

    /// Wait for the level decision
    pub async fn wait(self) -> VolumeResult<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(VolumeError::Internal("write fan-out dropped".into())))
    }
}

/// Per-volume read/write fan-out over the replica set
pub struct ConsistencyCoordinator {
    volume: VolumeName,
    block_size: u64,
    /// Replica clients in replica-set order
    replicas: Vec<Arc<ReplicaClient>>,
    read_level: ReadLevel,
    write_level: WriteLevel,
    /// Seed for block-sticky replica selection
    volume_seed: u64,
    spread_cursor: AtomicUsize,
    /// Highest generation any replica acknowledged, per block
    committed: Mutex<HashMap<BlockIndex, Generation>>,
    clock: Arc<GenerationClock>,
    stats: Arc<VolumeStats>,
    faults: FaultSignal,
}

impl ConsistencyCoordinator {
    pub fn new(
        volume: VolumeName,
        block_size: u64,
        replicas: Vec<Arc<ReplicaClient>>,
        config: &VolumeConfig,
        clock: Arc<GenerationClock>,
        stats: Arc<VolumeStats>,
        faults: FaultSignal,
    ) -> Self {
        let volume_seed = xxh64(volume.as_str().as_bytes(), 0);
        Self {
            volume,
            block_size,
            replicas,
            read_level: config.read_level,
            write_level: config.write_level,
            volume_seed,
            spread_cursor: AtomicUsize::new(0),
            committed: Mutex::new(HashMap::new()),
            clock,
            stats,
            faults,
        }
    }

    #[must_use]
    pub fn replicas(&self) -> &[Arc<ReplicaClient>] {
        &self.replicas
    }

    #[must_use]
    pub const fn read_level(&self) -> ReadLevel {
        self.read_level
    }

    #[must_use]
    pub const fn write_level(&self) -> WriteLevel {
        self.write_level
    }

    #[must_use]
    pub fn clock(&self) -> &GenerationClock {
        &self.clock
    }

    /// Highest generation acknowledged for a block in this session
    #[must_use]
    pub fn committed(&self, block: BlockIndex) -> Generation {
        self.committed.lock().get(&block).copied().unwrap_or(0)
    }

    fn record_commit(&self, block: BlockIndex, generation: Generation) {
        let mut committed = self.committed.lock();
        let floor = committed.entry(block).or_insert(0);
        if generation > *floor {
            *floor = generation;
        }
    }

    /// Index of the first replica to try for a read
    fn first_replica(&self, block: BlockIndex, level: ReadLevel) -> usize {
        let n = self.replicas.len();
        match level {
            ReadLevel::Sequential => 0,
            ReadLevel::Spread => self.spread_cursor.fetch_add(1, Ordering::Relaxed) % n,
            ReadLevel::Block => {
                let hash = xxh64(&block.to_le_bytes(), self.volume_seed);
                usize::try_from(hash % n as u64).unwrap_or(0)
            }
        }
    }

    /// Read a block at the session read level
    pub async fn read(&self, block: BlockIndex) -> VolumeResult<BlockData> {
        self.read_with_level(block, self.read_level).await
    }

    /// Read a block starting at the replica `level` selects, failing over
    /// in replica-set order
    pub async fn read_with_level(
        &self,
        block: BlockIndex,
        level: ReadLevel,
    ) -> VolumeResult<BlockData> {
        let n = self.replicas.len();
        let start = self.first_replica(block, level);
        let floor = self.committed(block);

        for i in 0..n {
            let replica = &self.replicas[(start + i) % n];
            match replica.read(block).await {
                Ok(read) if read.data.len() as u64 != self.block_size => {
                    warn!(
                        volume = %self.volume,
                        block,
                        replica = %replica.id(),
                        "replica returned {} bytes for a {} byte block",
                        read.data.len(),
                        self.block_size
                    );
                }
                Ok(read) if read.generation < floor => {
                    self.stats.record_stale_read();
                    warn!(
                        volume = %self.volume,
                        block,
                        replica = %replica.id(),
                        "replica holds generation {:#x}, behind committed {floor:#x}",
                        read.generation
                    );
                }
                Ok(read) => return Ok(read),
                Err(e) => {
                    warn!(volume = %self.volume, block, replica = %replica.id(), "read failed: {e}");
                }
            }
            if i + 1 < n {
                self.stats.record_failover();
            }
        }

        Err(VolumeError::ReadUnavailable { block, attempts: n })
    }

    /// Write `data` to the replicas at `targets` (indices into the replica
    /// set) and resolve once `required` of them acknowledged
    ///
    /// The fan-out runs on its own task: dropping the returned handle
    /// does not cancel it. Per-replica outcomes are reported to `sink`.
    pub fn write(
        self: &Arc<Self>,
        handle: WriteHandle,
        data: Bytes,
        targets: Vec<usize>,
        required: usize,
        sink: Arc<dyn AckSink>,
    ) -> WriteFanOut {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(handle, data, targets, required, sink, tx).await;
        });
        WriteFanOut { handle, rx }
    }

    /// Write to every replica at the session write level
    pub fn write_all(
        self: &Arc<Self>,
        handle: WriteHandle,
        data: Bytes,
        sink: Arc<dyn AckSink>,
    ) -> WriteFanOut {
        let targets = (0..self.replicas.len()).collect();
        let required = self.write_level.required_acks(self.replicas.len());
        self.write(handle, data, targets, required, sink)
    }

    async fn drive(
        &self,
        handle: WriteHandle,
        data: Bytes,
        targets: Vec<usize>,
        required: usize,
        sink: Arc<dyn AckSink>,
        tx: oneshot::Sender<VolumeResult<()>>,
    ) {
        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .filter_map(|&idx| self.replicas.get(idx).cloned())
            .map(|replica| {
                let data = data.clone();
                async move {
                    let result = replica.write(handle.block, handle.generation, data).await;
                    (replica, result)
                }
            })
            .collect();
        let total = pending.len();

        let mut tx = Some(tx);
        let mut decided_ok = false;
        let mut acked = 0usize;
        let mut failures: Vec<(ReplicaId, String)> = Vec::new();
        let mut conflict = None;

        if required == 0 {
            decided_ok = true;
            if let Some(tx) = tx.take() {
                let _ = tx.send(Ok(()));
            }
        }

        while let Some((replica, result)) = pending.next().await {
            let result = match result {
                // Superseded by a later write of our own: that one carries
                // newer contents, so this generation counts as delivered
                Err(VolumeError::StaleGeneration { committed, .. })
                    if self.clock.issued_by_session(committed) =>
                {
                    debug!(block = handle.block, replica = %replica.id(), "superseded by {committed:#x}");
                    Ok(())
                }
                other => other,
            };

            match result {
                Ok(()) => {
                    acked += 1;
                    self.record_commit(handle.block, handle.generation);
                    sink.acked(handle, replica.id());
                }
                Err(e) => {
                    sink.failed(handle, replica.id(), &e);
                    if matches!(e, VolumeError::StaleGeneration { .. }) {
                        conflict = Some(e.clone());
                    }
                    let reason = e.to_string();
                    if decided_ok {
                        self.background_failure(handle, replica.id(), &reason);
                    }
                    failures.push((replica.id().clone(), reason));
                }
            }

            if tx.is_some() {
                if acked >= required {
                    decided_ok = true;
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    for (replica, reason) in &failures {
                        self.background_failure(handle, replica, reason);
                    }
                } else if total - failures.len() < required {
                    let err = conflict.clone().unwrap_or(VolumeError::WriteQuorumFailed {
                        block: handle.block,
                        level: self.write_level,
                        acked,
                        required,
                    });
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Err(err));
                    }
                }
            }
        }

        // Fewer targets than required: nothing could ever decide it
        if let Some(tx) = tx.take() {
            let _ = tx.send(Err(VolumeError::WriteQuorumFailed {
                block: handle.block,
                level: self.write_level,
                acked,
                required,
            }));
        }

        debug!(
            volume = %self.volume,
            block = handle.block,
            generation = handle.generation,
            acked,
            failed = failures.len(),
            "write fan-out finished"
        );
        sink.finished(handle, acked);
    }

    fn background_failure(&self, handle: WriteHandle, replica: &ReplicaId, reason: &str) {
        self.stats.record_background_failure();
        warn!(
            volume = %self.volume,
            block = handle.block,
            generation = handle.generation,
            replica = %replica,
            "background replica write failed: {reason}"
        );
        self.faults.emit(FaultEvent::BackgroundWriteFailed {
            block: handle.block,
            generation: handle.generation,
            replica: replica.clone(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::transport::{ReplicaConnector, ReplicaTransport};
    use replvol_common::ReplicaConfig;
    use std::time::Duration;

    const BS: u64 = 512;

    #[derive(Default)]
    struct RecordingSink {
        acked: Mutex<Vec<ReplicaId>>,
        failed: Mutex<Vec<ReplicaId>>,
        finished: Mutex<Option<usize>>,
    }

    impl AckSink for RecordingSink {
        fn acked(&self, _handle: WriteHandle, replica: &ReplicaId) {
            self.acked.lock().push(replica.clone());
        }

        fn failed(&self, _handle: WriteHandle, replica: &ReplicaId, _error: &VolumeError) {
            self.failed.lock().push(replica.clone());
        }

        fn finished(&self, _handle: WriteHandle, acked: usize) {
            *self.finished.lock() = Some(acked);
        }
    }

    struct Harness {
        cluster: MemoryCluster,
        coordinator: Arc<ConsistencyCoordinator>,
        stats: Arc<VolumeStats>,
        faults: FaultSignal,
    }

    fn v1() -> VolumeName {
        VolumeName::new("v1").unwrap()
    }

    fn harness(read_level: ReadLevel, write_level: WriteLevel) -> Harness {
        let cluster = MemoryCluster::with_replicas(BS, ["a", "b"]);
        let stats = Arc::new(VolumeStats::default());
        let faults = FaultSignal::new();
        let replica_config = ReplicaConfig {
            max_attempts: 1,
            ..ReplicaConfig::default()
        };
        let replicas = ["a", "b"]
            .iter()
            .map(|id| {
                let id = ReplicaId::new(*id);
                let transport = cluster.connect(&id, BS).unwrap();
                Arc::new(ReplicaClient::new(
                    id,
                    v1(),
                    transport,
                    replica_config.clone(),
                    stats.clone(),
                    faults.clone(),
                ))
            })
            .collect();
        let config = VolumeConfig {
            read_level,
            write_level,
            ..VolumeConfig::default()
        };
        let coordinator = Arc::new(ConsistencyCoordinator::new(
            v1(),
            BS,
            replicas,
            &config,
            Arc::new(GenerationClock::new(1)),
            stats.clone(),
            faults.clone(),
        ));
        Harness {
            cluster,
            coordinator,
            stats,
            faults,
        }
    }

    fn data(fill: u8) -> Bytes {
        Bytes::from(vec![fill; BS as usize])
    }

    fn handle(h: &Harness, block: BlockIndex) -> WriteHandle {
        WriteHandle {
            block,
            generation: h.coordinator.clock().next(),
        }
    }

    #[test]
    fn test_generation_clock() {
        let clock = GenerationClock::new(3);
        let g1 = clock.next();
        let g2 = clock.next();
        assert!(g2 > g1);
        assert_eq!(g1 >> SEQUENCE_BITS, 3);
        assert!(clock.issued_by_session(g2));
        assert!(!clock.issued_by_session(g2 + 1));
        assert!(!clock.issued_by_session((2 << SEQUENCE_BITS) | 1));
        // A later epoch always orders after
        assert!(GenerationClock::new(4).next() > g2);
    }

    #[tokio::test]
    async fn test_sequential_reads_prefer_first_replica() {
        let h = harness(ReadLevel::Sequential, WriteLevel::All);
        for block in 0..4 {
            h.coordinator.read(block).await.unwrap();
        }
        assert_eq!(h.cluster.replica("a").unwrap().read_count(), 4);
        assert_eq!(h.cluster.replica("b").unwrap().read_count(), 0);
    }

    #[tokio::test]
    async fn test_block_reads_are_sticky() {
        let h = harness(ReadLevel::Block, WriteLevel::All);
        for _ in 0..5 {
            h.coordinator.read(7).await.unwrap();
        }
        let a = h.cluster.replica("a").unwrap().read_count();
        let b = h.cluster.replica("b").unwrap().read_count();
        assert!(a == 5 || b == 5, "block 7 reads split: a={a} b={b}");

        for block in 0..64 {
            h.coordinator.read(block).await.unwrap();
        }
        assert!(h.cluster.replica("a").unwrap().read_count() > a);
        assert!(h.cluster.replica("b").unwrap().read_count() > b);
    }

    #[tokio::test]
    async fn test_spread_reads_rotate() {
        let h = harness(ReadLevel::Spread, WriteLevel::All);
        for _ in 0..4 {
            h.coordinator.read(0).await.unwrap();
        }
        assert_eq!(h.cluster.replica("a").unwrap().read_count(), 2);
        assert_eq!(h.cluster.replica("b").unwrap().read_count(), 2);
    }

    #[tokio::test]
    async fn test_read_fails_over_in_order() {
        let h = harness(ReadLevel::Sequential, WriteLevel::All);
        h.cluster.replica("a").unwrap().set_online(false);

        h.coordinator.read(0).await.unwrap();
        assert_eq!(h.cluster.replica("b").unwrap().read_count(), 1);
        assert_eq!(h.stats.snapshot().failovers, 1);
    }

    #[tokio::test]
    async fn test_read_unavailable_when_all_fail() {
        let h = harness(ReadLevel::Block, WriteLevel::All);
        h.cluster.replica("a").unwrap().set_online(false);
        h.cluster.replica("b").unwrap().set_online(false);

        let err = h.coordinator.read(3).await.unwrap_err();
        assert!(matches!(
            err,
            VolumeError::ReadUnavailable {
                block: 3,
                attempts: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_all_write_waits_for_every_replica() {
        let h = harness(ReadLevel::Block, WriteLevel::All);
        let sink = Arc::new(RecordingSink::default());
        let b = h.cluster.replica("b").unwrap();
        b.hold_writes();

        let fanout = h
            .coordinator
            .write_all(handle(&h, 0), data(0xAA), sink.clone());
        let waiter = tokio::spawn(fanout.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(sink.acked.lock().len(), 1);

        b.release_writes();
        waiter.await.unwrap().unwrap();
        assert_eq!(b.block(&v1(), 0).unwrap().data, data(0xAA));
    }

    #[tokio::test]
    async fn test_all_write_with_replica_down_fails() {
        let h = harness(ReadLevel::Block, WriteLevel::All);
        h.cluster.replica("b").unwrap().set_online(false);
        let sink = Arc::new(RecordingSink::default());

        let err = h
            .coordinator
            .write_all(handle(&h, 0), data(1), sink.clone())
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VolumeError::WriteQuorumFailed {
                acked: 1,
                required: 2,
                level: WriteLevel::All,
                ..
            }
        ));
        // No rollback on the replica that did acknowledge
        assert_eq!(h.cluster.replica("a").unwrap().block(&v1(), 0).unwrap().data, data(1));
    }

    #[tokio::test]
    async fn test_one_write_returns_early_and_catches_up() {
        let h = harness(ReadLevel::Block, WriteLevel::One);
        let a = h.cluster.replica("a").unwrap();
        a.hold_writes();
        let sink = Arc::new(RecordingSink::default());

        h.coordinator
            .write_all(handle(&h, 2), data(2), sink.clone())
            .wait()
            .await
            .unwrap();
        assert!(a.block(&v1(), 2).is_none());

        a.release_writes();
        for _ in 0..100 {
            if sink.finished.lock().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*sink.finished.lock(), Some(2));
        assert_eq!(a.block(&v1(), 2).unwrap().data, data(2));
    }

    #[tokio::test]
    async fn test_local_write_reports_background_failures() {
        let h = harness(ReadLevel::Block, WriteLevel::Local);
        h.cluster.replica("a").unwrap().set_online(false);
        h.cluster.replica("b").unwrap().set_online(false);
        let mut faults = h.faults.subscribe();
        let sink = Arc::new(RecordingSink::default());

        h.coordinator
            .write_all(handle(&h, 1), data(1), sink)
            .wait()
            .await
            .unwrap();

        let event = faults.recv().await.unwrap();
        assert!(matches!(
            event,
            FaultEvent::BackgroundWriteFailed { block: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_foreign_newer_generation_is_a_conflict() {
        let h = harness(ReadLevel::Block, WriteLevel::All);
        let foreign = (9 << SEQUENCE_BITS) | 1;
        for id in ["a", "b"] {
            h.cluster
                .replica(id)
                .unwrap()
                .write_block(&v1(), 0, foreign, data(9))
                .await
                .unwrap();
        }

        let err = h
            .coordinator
            .write_all(handle(&h, 0), data(1), Arc::new(RecordingSink::default()))
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VolumeError::StaleGeneration {
                committed, ..
            } if committed == foreign
        ));
    }

    #[tokio::test]
    async fn test_superseded_by_own_write_counts_as_ack() {
        let h = harness(ReadLevel::Block, WriteLevel::All);
        let older = handle(&h, 0);
        let newer = handle(&h, 0);
        for id in ["a", "b"] {
            h.cluster
                .replica(id)
                .unwrap()
                .write_block(&v1(), 0, newer.generation, data(2))
                .await
                .unwrap();
        }

        h.coordinator
            .write_all(older, data(1), Arc::new(RecordingSink::default()))
            .wait()
            .await
            .unwrap();
        assert_eq!(h.cluster.replica("a").unwrap().block(&v1(), 0).unwrap().data, data(2));
    }

    #[tokio::test]
    async fn test_read_skips_replica_behind_committed_generation() {
        let h = harness(ReadLevel::Sequential, WriteLevel::One);
        let a = h.cluster.replica("a").unwrap();
        a.set_online(false);

        let sink = Arc::new(RecordingSink::default());
        h.coordinator
            .write_all(handle(&h, 5), data(5), sink.clone())
            .wait()
            .await
            .unwrap();

        // `a` comes back without the write
        a.set_online(true);
        let read = h.coordinator.read(5).await.unwrap();
        assert_eq!(read.data, data(5));
        assert_eq!(h.stats.snapshot().stale_reads, 1);

        // Only a stale copy left: refuse rather than serve old data
        h.cluster.replica("b").unwrap().set_online(false);
        assert!(matches!(
            h.coordinator.read(5).await,
            Err(VolumeError::ReadUnavailable { .. })
        ));
    }
}
