//! Volume I/O coordinator
//!
//! One `VolumeCoordinator` per attached volume. It owns the session's read
//! cache, write-back cache and consistency coordinator, maps byte ranges
//! from the export front end onto blocks, and serializes writes to the
//! same block.
//!
//! # Write path
//!
//! ```text
//! write_blocks ─► per-block lock ─► (read-modify-write) ─► next generation
//!              ─► stage in write-back cache ─► fan out to every replica
//!              ─► wait for the write level (not for `local`)
//! ```
//!
//! # Read path
//!
//! ```text
//! read_blocks ─► write-back cache ─► read cache ─► replica (read level)
//! ```
//!
//! Replicas that miss a write which still reached its level are queued for
//! catch-up (see `catch_up`) and re-driven by the background flusher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use replvol_common::{
    BlockIndex, PartialWritePolicy, ReadLevel, ReplicaId, VolumeConfig, VolumeDescriptor,
    VolumeName, WriteLevel,
};
use tokio::sync::{OwnedMutexGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::block::{BlockMapper, BlockRange};
use crate::catch_up::CatchUpSet;
use crate::consistency::{AckSink, ConsistencyCoordinator, GenerationClock, WriteFanOut};
use crate::error::{VolumeError, VolumeResult};
use crate::flush;
use crate::metadata::{Lease, MetadataService};
use crate::read_cache::{BlockKey, ReadCache};
use crate::replica::ReplicaClient;
use crate::stats::{FaultEvent, FaultSignal, StatsSnapshot, VolumeStats};
use crate::transport::{BlockData, ReplicaConnector};
use crate::write_cache::{DriveState, WriteBackCache, WriteCacheStats, WriteHandle};

/// Per-block write serialization
#[derive(Default)]
struct BlockLocks {
    locks: Mutex<HashMap<BlockIndex, Arc<tokio::sync::Mutex<()>>>>,
}

struct BlockGuard<'a> {
    locks: &'a BlockLocks,
    block: BlockIndex,
    guard: Option<OwnedMutexGuard<()>>,
}

impl BlockLocks {
    async fn lock(&self, block: BlockIndex) -> BlockGuard<'_> {
        let lock = Arc::clone(self.locks.lock().entry(block).or_default());
        let guard = lock.lock_owned().await;
        BlockGuard {
            locks: self,
            block,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock();
        // Nobody else holds or waits on this block: forget the lock
        if locks
            .get(&self.block)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.block);
        }
    }
}

/// Routes replica outcomes into the session caches
struct CacheSink {
    volume: VolumeName,
    /// Replica set, in priority order
    replicas: Vec<ReplicaId>,
    write_cache: Arc<WriteBackCache>,
    read_cache: Arc<ReadCache>,
    catch_up: Arc<CatchUpSet>,
    faults: FaultSignal,
}

impl AckSink for CacheSink {
    fn acked(&self, handle: WriteHandle, replica: &ReplicaId) {
        if let Some(data) = self.write_cache.mark_acked(handle, replica) {
            // Durable: serve later reads of this generation from the read cache
            self.read_cache.put(
                BlockKey::new(self.volume.clone(), handle.block),
                data,
                handle.generation,
            );
        }
    }

    fn failed(&self, handle: WriteHandle, replica: &ReplicaId, error: &VolumeError) {
        self.write_cache
            .mark_failed(handle, replica, error.to_string());
    }

    fn finished(&self, handle: WriteHandle, acked: usize) {
        match self.write_cache.finish_drive(handle) {
            DriveState::Stalled => {
                let required = self.write_cache.durable_acks();
                let failures = self.write_cache.failures(handle.block);
                warn!(
                    volume = %self.volume,
                    block = handle.block,
                    generation = handle.generation,
                    acked,
                    required,
                    ?failures,
                    "write left short of its level, will be re-driven"
                );
                self.faults.emit(FaultEvent::WriteLevelUnmet {
                    block: handle.block,
                    generation: handle.generation,
                    acked,
                    required,
                });
            }
            DriveState::Lagging { data, acked: holders } => {
                let missing: HashSet<ReplicaId> = self
                    .replicas
                    .iter()
                    .filter(|r| !holders.contains(*r))
                    .cloned()
                    .collect();
                debug!(
                    volume = %self.volume,
                    block = handle.block,
                    generation = handle.generation,
                    behind = missing.len(),
                    "queued replicas for catch-up"
                );
                self.catch_up.record(handle, data, missing);
            }
            DriveState::Replicated => self.catch_up.replicated(handle),
            DriveState::Pending => {}
        }
    }
}

/// Routes outcomes of catch-up fan-outs into the catch-up set
struct CatchUpSink {
    volume: VolumeName,
    catch_up: Arc<CatchUpSet>,
}

impl AckSink for CatchUpSink {
    fn acked(&self, handle: WriteHandle, replica: &ReplicaId) {
        self.catch_up.caught_up(handle, replica);
    }

    fn failed(&self, handle: WriteHandle, replica: &ReplicaId, error: &VolumeError) {
        if matches!(error, VolumeError::StaleGeneration { .. }) {
            // Another writer moved the block on; nothing left to deliver
            warn!(
                volume = %self.volume,
                block = handle.block,
                replica = %replica,
                "catch-up superseded: {error}"
            );
            self.catch_up.caught_up(handle, replica);
        }
    }

    fn finished(&self, handle: WriteHandle, _acked: usize) {
        self.catch_up.finish(handle);
    }
}

/// Outcome of `VolumeCoordinator::detach`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachReport {
    /// Blocks still short of their write level when detach gave up
    pub dirty_blocks: usize,
    /// Blocks at their level but still missing from some replicas
    pub lagging_blocks: usize,
    pub lease_released: bool,
}

impl DetachReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.dirty_blocks == 0 && self.lagging_blocks == 0 && self.lease_released
    }
}

/// I/O session for one attached volume
pub struct VolumeCoordinator {
    descriptor: VolumeDescriptor,
    config: VolumeConfig,
    mapper: BlockMapper,
    read_cache: Arc<ReadCache>,
    write_cache: Arc<WriteBackCache>,
    consistency: Arc<ConsistencyCoordinator>,
    sink: Arc<CacheSink>,
    catch_up: Arc<CatchUpSet>,
    catch_up_sink: Arc<CatchUpSink>,
    locks: BlockLocks,
    metadata: Arc<dyn MetadataService>,
    lease: Mutex<Lease>,
    stats: Arc<VolumeStats>,
    faults: FaultSignal,
    detached: AtomicBool,
    shutdown: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl VolumeCoordinator {
    /// Attach a volume
    ///
    /// Resolves the replica set, takes the exclusive attach lease and
    /// connects every replica. The lease epoch seeds the session's
    /// generation clock.
    pub async fn attach(
        name: &VolumeName,
        config: VolumeConfig,
        metadata: Arc<dyn MetadataService>,
        connector: &dyn ReplicaConnector,
    ) -> VolumeResult<Arc<Self>> {
        let descriptor = metadata.resolve(name).await?;
        config.validate(descriptor.block_size)?;

        let lease = metadata
            .acquire_lease(name, Uuid::new_v4(), config.lease_ttl)
            .await?;

        let stats = Arc::new(VolumeStats::default());
        let faults = FaultSignal::new();
        let replicas: VolumeResult<Vec<_>> = descriptor
            .replicas
            .iter()
            .map(|id| -> VolumeResult<Arc<ReplicaClient>> {
                let transport = connector.connect(id, descriptor.block_size)?;
                Ok(Arc::new(ReplicaClient::new(
                    id.clone(),
                    name.clone(),
                    transport,
                    config.replica.clone(),
                    Arc::clone(&stats),
                    faults.clone(),
                )))
            })
            .collect();
        let replicas = match replicas {
            Ok(replicas) => replicas,
            Err(e) => {
                if let Err(release) = metadata.release_lease(&lease).await {
                    warn!(volume = %name, "failed to release lease after attach error: {release}");
                }
                return Err(e);
            }
        };

        let replica_count = replicas.len();
        let consistency = Arc::new(ConsistencyCoordinator::new(
            name.clone(),
            descriptor.block_size,
            replicas,
            &config,
            Arc::new(GenerationClock::new(lease.epoch)),
            Arc::clone(&stats),
            faults.clone(),
        ));
        let read_cache = Arc::new(ReadCache::new(config.read_cache_bytes));
        let write_cache = Arc::new(WriteBackCache::new(
            config.write_cache_bytes,
            config.write_level,
            replica_count,
            config.stage_timeout,
        ));
        let catch_up = Arc::new(CatchUpSet::new());
        let sink = Arc::new(CacheSink {
            volume: name.clone(),
            replicas: descriptor.replicas.iter().cloned().collect(),
            write_cache: Arc::clone(&write_cache),
            read_cache: Arc::clone(&read_cache),
            catch_up: Arc::clone(&catch_up),
            faults: faults.clone(),
        });
        let catch_up_sink = Arc::new(CatchUpSink {
            volume: name.clone(),
            catch_up: Arc::clone(&catch_up),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            volume = %name,
            epoch = lease.epoch,
            replicas = replica_count,
            block_size = descriptor.block_size,
            block_count = descriptor.block_count,
            read_level = %config.read_level,
            write_level = %config.write_level,
            "attached volume"
        );

        let coordinator = Arc::new(Self {
            mapper: BlockMapper::new(descriptor.block_size, descriptor.block_count),
            descriptor,
            read_cache,
            write_cache,
            consistency,
            sink,
            catch_up,
            catch_up_sink,
            locks: BlockLocks::default(),
            metadata,
            lease: Mutex::new(lease),
            stats,
            faults,
            detached: AtomicBool::new(false),
            shutdown,
            flusher: Mutex::new(None),
            config,
        });

        let flusher = flush::spawn(
            &coordinator,
            coordinator.config.flush_interval,
            coordinator.write_cache.pressure_signal(),
            shutdown_rx,
        );
        *coordinator.flusher.lock() = Some(flusher);

        Ok(coordinator)
    }

    #[must_use]
    pub const fn name(&self) -> &VolumeName {
        &self.descriptor.name
    }

    #[must_use]
    pub const fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.descriptor.block_size
    }

    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.mapper.size_bytes()
    }

    #[must_use]
    pub const fn read_level(&self) -> ReadLevel {
        self.config.read_level
    }

    #[must_use]
    pub const fn write_level(&self) -> WriteLevel {
        self.config.write_level
    }

    /// Epoch of the attach lease held by this session
    #[must_use]
    pub fn lease_epoch(&self) -> u64 {
        self.lease.lock().epoch
    }

    /// Subscribe to faults nobody was waiting for
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<FaultEvent> {
        self.faults.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn write_cache_stats(&self) -> WriteCacheStats {
        self.write_cache.stats()
    }

    /// Blocks whose newest write some replicas still miss
    #[must_use]
    pub fn lagging_blocks(&self) -> usize {
        self.catch_up.len()
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn check_attached(&self) -> VolumeResult<()> {
        if self.is_detached() {
            Err(VolumeError::Detached)
        } else {
            Ok(())
        }
    }

    fn key(&self, block: BlockIndex) -> BlockKey {
        BlockKey::new(self.descriptor.name.clone(), block)
    }

    /// Read `length` bytes at `offset`
    pub async fn read_blocks(&self, offset: u64, length: u64) -> VolumeResult<Bytes> {
        self.check_attached()?;
        self.mapper.check_bounds(offset, length)?;

        let ranges = self.mapper.byte_range_to_blocks(offset, length);
        let blocks = try_join_all(ranges.iter().map(|range| self.read_block(range.block))).await?;

        let mut out = BytesMut::with_capacity(usize::try_from(length).unwrap_or(0));
        for (range, block) in ranges.iter().zip(blocks) {
            let start = usize::try_from(range.offset_in_block).unwrap_or(usize::MAX);
            let end = start.saturating_add(usize::try_from(range.length).unwrap_or(usize::MAX));
            let slice = block.data.get(start..end).ok_or_else(|| {
                VolumeError::Internal(format!(
                    "block {} holds {} bytes, expected {}",
                    range.block,
                    block.data.len(),
                    self.block_size()
                ))
            })?;
            out.extend_from_slice(slice);
        }

        self.stats.record_read(length);
        Ok(out.freeze())
    }

    /// Read one whole block: staged writes first, then the read cache,
    /// then a replica chosen by the read level
    pub async fn read_block(&self, block: BlockIndex) -> VolumeResult<BlockData> {
        self.read_block_with(block, self.config.read_level).await
    }

    async fn read_block_with(&self, block: BlockIndex, level: ReadLevel) -> VolumeResult<BlockData> {
        if let Some(staged) = self.write_cache.get(block) {
            self.stats.record_hit();
            return Ok(staged);
        }
        let key = self.key(block);
        if let Some(cached) = self.read_cache.get(&key) {
            self.stats.record_hit();
            return Ok(cached);
        }

        self.stats.record_miss();
        let read = self.consistency.read_with_level(block, level).await?;
        if read.generation >= self.consistency.committed(block) {
            self.read_cache.put(key, read.data.clone(), read.generation);
        }
        Ok(read)
    }

    /// Write `data` at `offset`
    ///
    /// Every touched block is staged (and readable) before this returns.
    /// Under `all` and `one` the call waits until each block reached its
    /// write level; under `local` it returns once staged.
    pub async fn write_blocks(&self, offset: u64, data: Bytes) -> VolumeResult<()> {
        self.check_attached()?;
        let length = data.len() as u64;
        self.mapper.check_bounds(offset, length)?;

        let mut fanouts = Vec::new();
        let mut cursor = 0usize;
        for range in self.mapper.byte_range_to_blocks(offset, length) {
            let len = usize::try_from(range.length).unwrap_or(usize::MAX);
            let chunk = data.slice(cursor..cursor + len);
            cursor += len;
            fanouts.push(self.write_range(&range, chunk).await?);
        }

        self.stats.record_write(length);
        if self.config.write_level == WriteLevel::Local {
            return Ok(());
        }
        try_join_all(fanouts.into_iter().map(WriteFanOut::wait)).await?;
        Ok(())
    }

    async fn write_range(&self, range: &BlockRange, chunk: Bytes) -> VolumeResult<WriteFanOut> {
        let _guard = self.locks.lock(range.block).await;

        let data = if range.is_full(self.block_size()) {
            chunk
        } else {
            let current = self.read_for_merge(range.block).await?;
            let mut merged = BytesMut::from(current.data.as_ref());
            let start = usize::try_from(range.offset_in_block).unwrap_or(usize::MAX);
            let target = merged.get_mut(start..start + chunk.len()).ok_or_else(|| {
                VolumeError::Internal(format!("short block {} during merge", range.block))
            })?;
            target.copy_from_slice(&chunk);
            merged.freeze()
        };

        let generation = self.consistency.clock().next();
        let handle = self
            .write_cache
            .stage(range.block, data.clone(), generation)
            .await?;
        self.read_cache.invalidate(&self.key(range.block));
        debug!(
            volume = %self.descriptor.name,
            block = range.block,
            generation,
            "staged write"
        );

        Ok(self
            .consistency
            .write_all(handle, data, Arc::clone(&self.sink) as Arc<dyn AckSink>))
    }

    /// Current contents of a block for the read half of a partial write
    async fn read_for_merge(&self, block: BlockIndex) -> VolumeResult<BlockData> {
        let level = match self.config.partial_write_read {
            PartialWritePolicy::Strict => ReadLevel::Sequential,
            PartialWritePolicy::Configured => self.config.read_level,
        };
        self.read_block_with(block, level).await
    }

    /// Drive every staged write to its write level
    ///
    /// Writes whose fan-out already ended short of the level are sent again
    /// to the replicas that have not acknowledged them. Fails with
    /// `WriteQuorumFailed` if a block still cannot reach its level; that
    /// block stays staged and keeps being retried in the background.
    pub async fn flush(&self) -> VolumeResult<()> {
        self.check_attached()?;
        self.flush_dirty().await
    }

    async fn flush_dirty(&self) -> VolumeResult<()> {
        let handles = self.write_cache.dirty_handles();
        if handles.is_empty() {
            return Ok(());
        }
        debug!(volume = %self.descriptor.name, dirty = handles.len(), "flushing");

        // Let running fan-outs settle so whatever they leave short is re-driven
        join_all(handles.iter().map(|&h| self.write_cache.flush(h))).await;
        self.redrive_stalled();

        let results = join_all(handles.into_iter().map(|h| self.write_cache.flush(h))).await;
        results.into_iter().collect::<VolumeResult<Vec<()>>>()?;
        Ok(())
    }

    /// Re-send stalled writes to the replicas that have not acknowledged
    /// them; returns how many writes were re-driven
    pub(crate) fn redrive_stalled(&self) -> usize {
        let stalled = self.write_cache.take_stalled();
        for write in &stalled {
            let targets: Vec<usize> = self
                .consistency
                .replicas()
                .iter()
                .enumerate()
                .filter(|(_, replica)| !write.acked.contains(replica.id()))
                .map(|(idx, _)| idx)
                .collect();
            debug!(
                volume = %self.descriptor.name,
                block = write.handle.block,
                generation = write.handle.generation,
                targets = targets.len(),
                "re-driving write"
            );
            let required = targets.len();
            // Progress is tracked by the write-back cache; nobody waits here
            drop(self.consistency.write(
                write.handle,
                write.data.clone(),
                targets,
                required,
                Arc::clone(&self.sink) as Arc<dyn AckSink>,
            ));
        }
        stalled.len()
    }

    /// Re-send writes to replicas that fell behind; the fan-outs resolve
    /// once every targeted replica answered or one of them failed
    pub(crate) fn drive_catch_up(&self) -> Vec<WriteFanOut> {
        let replicas = self.consistency.replicas();
        self.catch_up
            .take()
            .into_iter()
            .map(|write| {
                let targets: Vec<usize> = replicas
                    .iter()
                    .enumerate()
                    .filter(|(_, replica)| write.missing.contains(replica.id()))
                    .map(|(idx, _)| idx)
                    .collect();
                debug!(
                    volume = %self.descriptor.name,
                    block = write.handle.block,
                    generation = write.handle.generation,
                    targets = targets.len(),
                    "catching up replicas"
                );
                let required = targets.len();
                self.consistency.write(
                    write.handle,
                    write.data,
                    targets,
                    required,
                    Arc::clone(&self.catch_up_sink) as Arc<dyn AckSink>,
                )
            })
            .collect()
    }

    /// Renew the attach lease once half its lifetime has passed
    pub(crate) async fn renew_lease_if_due(&self) {
        let lease = self.lease.lock().clone();
        let ttl = self.config.lease_ttl;
        let half = chrono::Duration::from_std(ttl / 2).unwrap_or(chrono::Duration::MAX);
        let due = Utc::now()
            .checked_add_signed(half)
            .is_none_or(|at| at >= lease.expires_at);
        if !due {
            return;
        }

        match self.metadata.renew_lease(&lease, ttl).await {
            Ok(renewed) => *self.lease.lock() = renewed,
            Err(e) => {
                error!(volume = %self.descriptor.name, "failed to renew attach lease: {e}");
                self.faults.emit(FaultEvent::LeaseRenewalFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Detach the volume
    ///
    /// New I/O is refused from here on. Staged writes are flushed and
    /// lagging replicas caught up, retried every flush interval until the
    /// detach timeout; whatever is still missing after that is reported,
    /// not waited for. The background flusher is stopped and the lease
    /// released.
    pub async fn detach(&self) -> VolumeResult<DetachReport> {
        if self.detached.swap(true, Ordering::SeqCst) {
            return Err(VolumeError::Detached);
        }
        info!(volume = %self.descriptor.name, "detaching volume");

        let flushed = tokio::time::timeout(self.config.detach_timeout, async {
            loop {
                match self.flush_dirty().await {
                    Ok(()) => {
                        // Fan-outs still running may yet leave replicas behind
                        self.write_cache.settled().await;
                        join_all(self.drive_catch_up().into_iter().map(WriteFanOut::wait)).await;
                        if self.catch_up.is_empty() {
                            break;
                        }
                        debug!(
                            volume = %self.descriptor.name,
                            lagging = self.catch_up.len(),
                            "detach catch-up incomplete"
                        );
                    }
                    Err(e) => {
                        debug!(volume = %self.descriptor.name, "detach flush incomplete: {e}");
                    }
                }
                tokio::time::sleep(self.config.flush_interval).await;
            }
        })
        .await;

        let dirty_blocks = self.write_cache.dirty_handles().len();
        let lagging_blocks = self.catch_up.len();
        if flushed.is_err() || dirty_blocks > 0 || lagging_blocks > 0 {
            warn!(
                volume = %self.descriptor.name,
                dirty_blocks,
                lagging_blocks,
                "detach timed out with writes awaiting replication"
            );
            self.faults.emit(FaultEvent::DetachIncomplete {
                dirty_blocks,
                lagging_blocks,
            });
        }

        self.shutdown.send_replace(true);
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher
            && let Err(e) = flusher.await
        {
            warn!(volume = %self.descriptor.name, "flusher task failed: {e}");
        }

        let lease = self.lease.lock().clone();
        let lease_released = match self.metadata.release_lease(&lease).await {
            Ok(()) => true,
            Err(e) => {
                error!(volume = %self.descriptor.name, "failed to release attach lease: {e}");
                false
            }
        };

        let stats = self.stats.snapshot();
        info!(
            volume = %self.descriptor.name,
            dirty_blocks,
            lagging_blocks,
            reads = stats.reads,
            writes = stats.writes,
            read_hits = stats.read_hits,
            read_misses = stats.read_misses,
            failovers = stats.failovers,
            background_failures = stats.background_failures,
            read_cache_evictions = self.read_cache.stats().evictions,
            write_cache_evictions = self.write_cache.stats().evictions,
            "detached volume"
        );
        Ok(DetachReport {
            dirty_blocks,
            lagging_blocks,
            lease_released,
        })
    }
}

impl Drop for VolumeCoordinator {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::metadata::{MemoryKv, Metadata};
    use replvol_common::ReplicaSet;
    use std::time::Duration;

    const BS: u64 = 4096;

    async fn setup(replicas: &[&str]) -> (Arc<Metadata<MemoryKv>>, MemoryCluster) {
        let metadata = Arc::new(Metadata::new(MemoryKv::new()));
        metadata
            .register_volume(&VolumeDescriptor {
                name: VolumeName::new("v1").unwrap(),
                block_size: BS,
                block_count: 64,
                replicas: ReplicaSet::new(replicas.iter().map(|r| ReplicaId::new(*r)).collect())
                    .unwrap(),
            })
            .await
            .unwrap();
        (metadata, MemoryCluster::with_replicas(BS, replicas.iter().copied()))
    }

    fn v1() -> VolumeName {
        VolumeName::new("v1").unwrap()
    }

    #[tokio::test]
    async fn test_block_locks_are_released() {
        let locks = BlockLocks::default();
        {
            let _a = locks.lock(1).await;
            let _b = locks.lock(2).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_second_attach_is_refused() {
        let (metadata, cluster) = setup(&["a", "b"]).await;
        let first = VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata.clone(), &cluster)
            .await
            .unwrap();
        assert_eq!(first.lease_epoch(), 1);

        let second =
            VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata.clone(), &cluster)
                .await;
        assert!(matches!(second, Err(VolumeError::LeaseHeld { .. })));

        let report = first.detach().await.unwrap();
        assert!(report.is_clean());

        let again = VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata, &cluster)
            .await
            .unwrap();
        assert_eq!(again.lease_epoch(), 2);
    }

    #[tokio::test]
    async fn test_unknown_replica_releases_lease() {
        let (metadata, _) = setup(&["a", "b"]).await;
        let partial = MemoryCluster::with_replicas(BS, ["a"]);

        let result =
            VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata.clone(), &partial)
                .await;
        assert!(matches!(result, Err(VolumeError::ReplicaUnavailable { .. })));

        // Lease was given back
        let full = MemoryCluster::with_replicas(BS, ["a", "b"]);
        assert!(
            VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata, &full)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_io_after_detach_is_refused() {
        let (metadata, cluster) = setup(&["a"]).await;
        let volume = VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata, &cluster)
            .await
            .unwrap();
        volume.detach().await.unwrap();

        assert!(matches!(
            volume.read_blocks(0, 512).await,
            Err(VolumeError::Detached)
        ));
        assert!(matches!(
            volume.write_blocks(0, Bytes::from_static(&[1; 512])).await,
            Err(VolumeError::Detached)
        ));
        assert!(matches!(volume.detach().await, Err(VolumeError::Detached)));
    }

    #[tokio::test]
    async fn test_out_of_bounds_is_rejected() {
        let (metadata, cluster) = setup(&["a"]).await;
        let volume = VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata, &cluster)
            .await
            .unwrap();

        let end = volume.size_bytes();
        assert!(matches!(
            volume.read_blocks(end - 10, 20).await,
            Err(VolumeError::OutOfBounds { .. })
        ));
        assert!(volume.read_blocks(end - 10, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_hits_and_misses_are_counted_once() {
        let (metadata, cluster) = setup(&["a", "b"]).await;
        let volume = VolumeCoordinator::attach(&v1(), VolumeConfig::default(), metadata, &cluster)
            .await
            .unwrap();

        volume.read_blocks(3 * BS, BS).await.unwrap();
        volume.read_blocks(3 * BS, BS).await.unwrap();
        volume
            .write_blocks(4 * BS, Bytes::from(vec![1; BS as usize]))
            .await
            .unwrap();
        volume.read_blocks(4 * BS, BS).await.unwrap();

        let stats = volume.stats();
        assert_eq!((stats.read_hits, stats.read_misses), (2, 1));
        let replica_reads: u64 = ["a", "b"]
            .iter()
            .map(|id| cluster.replica(id).unwrap().read_count())
            .sum();
        assert_eq!(replica_reads, 1);
        volume.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_write_read_follows_policy() {
        // Under spread the first read goes to "a" and the next to "b"
        for (policy, expected) in [
            (PartialWritePolicy::Strict, (2, 0)),
            (PartialWritePolicy::Configured, (1, 1)),
        ] {
            let (metadata, cluster) = setup(&["a", "b"]).await;
            let config = VolumeConfig {
                read_level: ReadLevel::Spread,
                write_level: WriteLevel::All,
                partial_write_read: policy,
                ..VolumeConfig::default()
            };
            let volume = VolumeCoordinator::attach(&v1(), config, metadata, &cluster)
                .await
                .unwrap();

            volume.read_blocks(5 * BS, BS).await.unwrap();
            volume
                .write_blocks(10 * BS, Bytes::from_static(&[7; 100]))
                .await
                .unwrap();

            let a = cluster.replica("a").unwrap();
            let b = cluster.replica("b").unwrap();
            assert_eq!((a.read_count(), b.read_count()), expected, "{policy:?}");

            let merged = volume.read_blocks(10 * BS, BS).await.unwrap();
            assert!(merged[..100].iter().all(|&x| x == 7));
            assert!(merged[100..].iter().all(|&x| x == 0));
            volume.detach().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_is_renewed_in_background() {
        let (metadata, cluster) = setup(&["a"]).await;
        let config = VolumeConfig {
            flush_interval: Duration::from_millis(100),
            lease_ttl: Duration::from_millis(2),
            ..VolumeConfig::default()
        };
        let volume = VolumeCoordinator::attach(&v1(), config, metadata, &cluster)
            .await
            .unwrap();
        let first_expiry = volume.lease.lock().expires_at;

        // Lease expiry is wall-clock: let it pass half the ttl for real
        std::thread::sleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(250)).await;

        let renewed = volume.lease.lock().expires_at;
        assert!(renewed > first_expiry);
        assert_eq!(volume.lease_epoch(), 1);
    }
}
