//! Write-back cache
//!
//! Staging area for writes that are not yet replicated to their write
//! level. A staged block is immediately visible to reads of the same
//! session. An entry stays in the cache until it is durable (enough
//! replicas acknowledged its generation) and its replica fan-out has
//! finished; only then may it be evicted to make room.
//!
//! When the cache is full of entries that cannot be evicted, `stage`
//! blocks until space frees up, and fails with `CacheExhausted` after the
//! configured stage timeout. A dirty block is never dropped.
//!
//! ```text
//!   stage ──► dirty, driving ──► durable ──► evictable
//!                  │                 ▲
//!                  ▼                 │
//!               stalled ── re-drive ─┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use replvol_common::{BlockIndex, Generation, ReplicaId, WriteLevel};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{VolumeError, VolumeResult};
use crate::transport::BlockData;

/// Identifies one staged write: the block and the generation it was staged at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle {
    pub block: BlockIndex,
    pub generation: Generation,
}

/// Replica acknowledgments collected for the current generation of a block
#[derive(Debug, Default)]
struct PendingWrite {
    acked: HashSet<ReplicaId>,
    failed: HashMap<ReplicaId, String>,
    /// Fan-outs currently driving this generation
    in_flight: usize,
}

#[derive(Debug)]
struct Entry {
    data: Bytes,
    generation: Generation,
    pending: PendingWrite,
    durable: bool,
    /// Logical time of the last stage or read
    last_touch: u64,
}

impl Entry {
    fn evictable(&self) -> bool {
        self.durable && self.pending.in_flight == 0
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<BlockIndex, Entry>,
    used_bytes: u64,
    clock: u64,
    evictions: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn dirty_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| !e.durable)
            .map(|e| e.data.len() as u64)
            .sum()
    }

    /// Evict evictable entries other than `keep`, oldest first, until
    /// `needed` more bytes fit
    fn make_room(&mut self, keep: BlockIndex, needed: u64, capacity: u64) -> bool {
        while self.used_bytes + needed > capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(block, e)| **block != keep && e.evictable())
                .min_by_key(|(_, e)| e.last_touch)
                .map(|(block, _)| *block);
            let Some(block) = victim else {
                return false;
            };
            if let Some(entry) = self.entries.remove(&block) {
                self.used_bytes -= entry.data.len() as u64;
                self.evictions += 1;
            }
        }
        true
    }
}

/// Where a staged write stands once one of its fan-outs finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveState {
    /// Replaced by a newer generation, or still driven by another fan-out
    Pending,
    /// Short of its write level with no fan-out driving it
    Stalled,
    /// At its level, but not every replica acknowledged it
    Lagging {
        data: Bytes,
        acked: HashSet<ReplicaId>,
    },
    /// Every replica acknowledged it
    Replicated,
}

/// A staged write whose fan-out finished without reaching its write level
#[derive(Debug, Clone)]
pub struct StalledWrite {
    pub handle: WriteHandle,
    pub data: Bytes,
    /// Replicas that already hold this generation
    pub acked: HashSet<ReplicaId>,
}

/// Point-in-time cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCacheStats {
    pub entries: usize,
    pub dirty_entries: usize,
    pub used_bytes: u64,
    pub dirty_bytes: u64,
    pub capacity_bytes: u64,
    pub evictions: u64,
}

/// Bounded write-back cache for one volume session
pub struct WriteBackCache {
    inner: Mutex<Inner>,
    capacity_bytes: u64,
    level: WriteLevel,
    replica_count: usize,
    stage_timeout: Duration,
    /// Signalled on every state change that can unblock a waiter
    changed: Notify,
    /// Signalled when staging is blocked, to wake the background flusher
    pressure: Arc<Notify>,
}

impl WriteBackCache {
    pub fn new(
        capacity_bytes: u64,
        level: WriteLevel,
        replica_count: usize,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity_bytes,
            level,
            replica_count,
            stage_timeout,
            changed: Notify::new(),
            pressure: Arc::new(Notify::new()),
        }
    }

    /// Acknowledgments that make an entry durable
    #[must_use]
    pub const fn durable_acks(&self) -> usize {
        self.level.durable_acks(self.replica_count)
    }

    /// Notified whenever a writer is blocked on a full cache
    #[must_use]
    pub fn pressure_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.pressure)
    }

    /// Stage a block at `generation`
    ///
    /// The new entry replaces any previous generation of the block and is
    /// marked as being driven; the caller must start the replica fan-out
    /// and report its end with `finish_drive`. Blocks while the cache is
    /// full of entries that cannot be evicted.
    pub async fn stage(
        &self,
        block: BlockIndex,
        data: Bytes,
        generation: Generation,
    ) -> VolumeResult<WriteHandle> {
        let deadline = Instant::now() + self.stage_timeout;
        let size = data.len() as u64;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let dirty_bytes = {
                let mut inner = self.inner.lock();
                let touch = inner.tick();

                if let Some(entry) = inner.entries.get(&block)
                    && entry.generation > generation
                {
                    return Err(VolumeError::StaleGeneration {
                        block,
                        attempted: generation,
                        committed: entry.generation,
                    });
                }

                let replaced = inner
                    .entries
                    .get(&block)
                    .map_or(0, |e| e.data.len() as u64);
                if inner.make_room(block, size.saturating_sub(replaced), self.capacity_bytes) {
                    let old = inner.entries.insert(
                        block,
                        Entry {
                            data,
                            generation,
                            pending: PendingWrite {
                                in_flight: 1,
                                ..PendingWrite::default()
                            },
                            durable: false,
                            last_touch: touch,
                        },
                    );
                    inner.used_bytes = inner.used_bytes + size
                        - old.map_or(0, |e| e.data.len() as u64);
                    return Ok(WriteHandle { block, generation });
                }
                inner.dirty_bytes()
            };

            debug!(block, dirty_bytes, "write cache full, waiting for space");
            self.pressure.notify_one();
            if tokio::time::timeout_at(deadline, &mut notified).await.is_err() {
                return Err(VolumeError::CacheExhausted {
                    dirty_bytes,
                    capacity_bytes: self.capacity_bytes,
                });
            }
        }
    }

    /// Latest staged contents of a block (read-your-writes)
    pub fn get(&self, block: BlockIndex) -> Option<BlockData> {
        let mut inner = self.inner.lock();
        let touch = inner.tick();
        inner.entries.get_mut(&block).map(|entry| {
            entry.last_touch = touch;
            BlockData {
                data: entry.data.clone(),
                generation: entry.generation,
            }
        })
    }

    /// Record a replica acknowledgment
    ///
    /// Acknowledgments for a generation that has since been replaced are
    /// ignored. Returns the block data when this acknowledgment made the
    /// entry durable.
    pub fn mark_acked(&self, handle: WriteHandle, replica: &ReplicaId) -> Option<Bytes> {
        let required = self.durable_acks();
        let became_durable = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&handle.block)
                .filter(|e| e.generation == handle.generation)?;
            entry.pending.failed.remove(replica);
            entry.pending.acked.insert(replica.clone());
            if !entry.durable && entry.pending.acked.len() >= required {
                entry.durable = true;
                Some(entry.data.clone())
            } else {
                None
            }
        };
        if became_durable.is_some() {
            self.changed.notify_waiters();
        }
        became_durable
    }

    /// Record a replica failure for a staged generation
    pub fn mark_failed(&self, handle: WriteHandle, replica: &ReplicaId, reason: String) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .entries
            .get_mut(&handle.block)
            .filter(|e| e.generation == handle.generation)
        {
            entry.pending.failed.insert(replica.clone(), reason);
        }
    }

    /// Report that a fan-out started by `stage` or `take_stalled` finished
    ///
    /// Once the last fan-out of the current generation is done, the result
    /// tells whether the write stalled, reached only part of the replica
    /// set, or every replica.
    pub fn finish_drive(&self, handle: WriteHandle) -> DriveState {
        let state = {
            let mut inner = self.inner.lock();
            match inner
                .entries
                .get_mut(&handle.block)
                .filter(|e| e.generation == handle.generation)
            {
                None => DriveState::Pending,
                Some(entry) => {
                    entry.pending.in_flight = entry.pending.in_flight.saturating_sub(1);
                    if entry.pending.in_flight > 0 {
                        DriveState::Pending
                    } else if !entry.durable {
                        DriveState::Stalled
                    } else if entry.pending.acked.len() < self.replica_count {
                        DriveState::Lagging {
                            data: entry.data.clone(),
                            acked: entry.pending.acked.clone(),
                        }
                    } else {
                        DriveState::Replicated
                    }
                }
            }
        };
        self.changed.notify_waiters();
        state
    }

    /// Wait until no fan-out is driving any staged write
    pub async fn settled(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self
                .inner
                .lock()
                .entries
                .values()
                .all(|e| e.pending.in_flight == 0)
            {
                return;
            }
            notified.await;
        }
    }

    /// Whether the staged write reached its durability level
    ///
    /// A write that has left the cache, or was superseded by a newer
    /// generation that is durable, counts as durable.
    #[must_use]
    pub fn is_durable(&self, handle: WriteHandle) -> bool {
        let inner = self.inner.lock();
        match inner.entries.get(&handle.block) {
            None => true,
            Some(entry) => entry.durable && entry.generation >= handle.generation,
        }
    }

    /// Wait until the write's fan-out settles
    ///
    /// Returns once the write is durable, or fails with `WriteQuorumFailed`
    /// when no fan-out is driving it and it is still short of its level.
    /// Stalled entries are re-driven by the session (`take_stalled`).
    pub async fn flush(&self, handle: WriteHandle) -> VolumeResult<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                match inner.entries.get(&handle.block) {
                    None => return Ok(()),
                    Some(entry) if entry.durable && entry.generation >= handle.generation => {
                        return Ok(());
                    }
                    Some(entry) if entry.pending.in_flight == 0 => {
                        return Err(VolumeError::WriteQuorumFailed {
                            block: handle.block,
                            level: self.level,
                            acked: entry.pending.acked.len(),
                            required: self.durable_acks(),
                        });
                    }
                    Some(_) => {}
                }
            }

            notified.await;
        }
    }

    /// Claim every entry that is short of its level with no fan-out running
    ///
    /// Claimed entries are marked as being driven; the caller re-drives them
    /// and reports each with `finish_drive`.
    pub fn take_stalled(&self) -> Vec<StalledWrite> {
        let mut inner = self.inner.lock();
        inner
            .entries
            .iter_mut()
            .filter(|(_, e)| !e.durable && e.pending.in_flight == 0)
            .map(|(block, entry)| {
                entry.pending.in_flight += 1;
                StalledWrite {
                    handle: WriteHandle {
                        block: *block,
                        generation: entry.generation,
                    },
                    data: entry.data.clone(),
                    acked: entry.pending.acked.clone(),
                }
            })
            .collect()
    }

    /// Handles of all entries not yet durable
    pub fn dirty_handles(&self) -> Vec<WriteHandle> {
        let inner = self.inner.lock();
        let mut handles: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.durable)
            .map(|(block, e)| WriteHandle {
                block: *block,
                generation: e.generation,
            })
            .collect();
        handles.sort_by_key(|h| h.block);
        handles
    }

    /// Failures recorded against the current generation of a block
    pub fn failures(&self, block: BlockIndex) -> Vec<(ReplicaId, String)> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&block)
            .map(|e| {
                e.pending
                    .failed
                    .iter()
                    .map(|(r, reason)| (r.clone(), reason.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> WriteCacheStats {
        let inner = self.inner.lock();
        WriteCacheStats {
            entries: inner.entries.len(),
            dirty_entries: inner.entries.values().filter(|e| !e.durable).count(),
            used_bytes: inner.used_bytes,
            dirty_bytes: inner.dirty_bytes(),
            capacity_bytes: self.capacity_bytes,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = 1024;

    fn block(fill: u8) -> Bytes {
        Bytes::from(vec![fill; BS as usize])
    }

    fn cache(blocks: u64, level: WriteLevel, replicas: usize) -> WriteBackCache {
        WriteBackCache::new(blocks * BS, level, replicas, Duration::from_secs(5))
    }

    fn r(id: &str) -> ReplicaId {
        ReplicaId::new(id)
    }

    #[tokio::test]
    async fn test_staged_write_is_visible() {
        let cache = cache(4, WriteLevel::All, 2);
        let handle = cache.stage(3, block(0xAA), 1).await.unwrap();

        let staged = cache.get(3).unwrap();
        assert_eq!(staged.data, block(0xAA));
        assert_eq!(staged.generation, 1);
        assert!(!cache.is_durable(handle));
        assert_eq!(cache.dirty_handles(), vec![handle]);
    }

    #[tokio::test]
    async fn test_durable_after_all_acks() {
        let cache = cache(4, WriteLevel::All, 2);
        let handle = cache.stage(0, block(1), 1).await.unwrap();

        assert!(cache.mark_acked(handle, &r("a")).is_none());
        assert!(!cache.is_durable(handle));
        // Duplicate ack does not count twice
        assert!(cache.mark_acked(handle, &r("a")).is_none());
        assert_eq!(cache.mark_acked(handle, &r("b")), Some(block(1)));
        assert!(cache.is_durable(handle));
        assert!(cache.dirty_handles().is_empty());
    }

    #[tokio::test]
    async fn test_local_needs_one_ack_before_eviction() {
        let cache = cache(1, WriteLevel::Local, 3);
        let handle = cache.stage(0, block(1), 1).await.unwrap();
        cache.finish_drive(handle);
        assert!(!cache.is_durable(handle));

        cache.mark_acked(handle, &r("a"));
        assert!(cache.is_durable(handle));
    }

    #[tokio::test]
    async fn test_replacement_resets_pending_acks() {
        let cache = cache(4, WriteLevel::All, 2);
        let first = cache.stage(0, block(1), 1).await.unwrap();
        cache.mark_acked(first, &r("a"));

        let second = cache.stage(0, block(2), 2).await.unwrap();
        // Late ack for the replaced generation is ignored
        assert!(cache.mark_acked(first, &r("b")).is_none());
        assert!(!cache.is_durable(second));
        assert_eq!(cache.get(0).unwrap().data, block(2));
        assert_eq!(cache.stats().used_bytes, BS);
    }

    #[tokio::test]
    async fn test_older_generation_is_refused() {
        let cache = cache(4, WriteLevel::All, 1);
        cache.stage(0, block(5), 5).await.unwrap();
        let err = cache.stage(0, block(4), 4).await.unwrap_err();
        assert!(matches!(
            err,
            VolumeError::StaleGeneration {
                attempted: 4,
                committed: 5,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_cache_blocks_until_entry_is_durable() {
        let cache = Arc::new(cache(2, WriteLevel::One, 1));
        let h0 = cache.stage(0, block(0), 1).await.unwrap();
        let _h1 = cache.stage(1, block(1), 2).await.unwrap();

        let blocked = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.stage(2, block(2), 3).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Durable but still driving: not yet evictable
        cache.mark_acked(h0, &r("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        cache.finish_drive(h0);
        blocked.await.unwrap().unwrap();

        assert!(cache.get(0).is_none());
        assert_eq!(cache.get(1).unwrap().data, block(1));
        assert_eq!(cache.get(2).unwrap().data, block(2));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_cache_keeps_dirty_data() {
        let cache = cache(1, WriteLevel::All, 2);
        let pressure = cache.pressure_signal();
        cache.stage(0, block(9), 1).await.unwrap();

        let err = cache.stage(1, block(1), 2).await.unwrap_err();
        assert!(matches!(
            err,
            VolumeError::CacheExhausted {
                dirty_bytes: BS,
                capacity_bytes: BS
            }
        ));
        assert!(err.is_transient());
        assert_eq!(cache.get(0).unwrap().data, block(9));
        // The blocked writer poked the flusher
        tokio::time::timeout(Duration::from_millis(1), pressure.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_flush_reports_stalled_write() {
        let cache = cache(4, WriteLevel::All, 2);
        let handle = cache.stage(0, block(1), 1).await.unwrap();
        cache.mark_acked(handle, &r("a"));
        cache.mark_failed(handle, &r("b"), "offline".into());
        assert_eq!(cache.finish_drive(handle), DriveState::Stalled);

        let err = cache.flush(handle).await.unwrap_err();
        assert!(matches!(
            err,
            VolumeError::WriteQuorumFailed {
                acked: 1,
                required: 2,
                ..
            }
        ));
        assert_eq!(cache.failures(0), vec![(r("b"), "offline".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_waits_for_in_flight_fanout() {
        let cache = Arc::new(cache(4, WriteLevel::One, 2));
        let handle = cache.stage(0, block(1), 1).await.unwrap();

        let flusher = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.flush(handle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flusher.is_finished());

        cache.mark_acked(handle, &r("b"));
        flusher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finish_reports_replicas_left_behind() {
        let cache = cache(4, WriteLevel::One, 2);
        let handle = cache.stage(0, block(1), 1).await.unwrap();
        cache.mark_acked(handle, &r("a"));
        cache.mark_failed(handle, &r("b"), "offline".into());

        match cache.finish_drive(handle) {
            DriveState::Lagging { data, acked } => {
                assert_eq!(data, block(1));
                assert_eq!(acked, HashSet::from([r("a")]));
            }
            other => panic!("unexpected state: {other:?}"),
        }
        // Lagging entries are at their level and may leave the cache
        assert!(cache.is_durable(handle));

        let full = cache.stage(1, block(2), 2).await.unwrap();
        cache.mark_acked(full, &r("a"));
        cache.mark_acked(full, &r("b"));
        assert_eq!(cache.finish_drive(full), DriveState::Replicated);
    }

    #[tokio::test]
    async fn test_replaced_write_finishes_pending() {
        let cache = cache(4, WriteLevel::One, 2);
        let first = cache.stage(0, block(1), 1).await.unwrap();
        let _second = cache.stage(0, block(2), 2).await.unwrap();
        assert_eq!(cache.finish_drive(first), DriveState::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_settled_waits_for_running_fanouts() {
        let cache = Arc::new(cache(4, WriteLevel::One, 2));
        let handle = cache.stage(0, block(1), 1).await.unwrap();
        // Durable does not mean settled
        cache.mark_acked(handle, &r("a"));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.settled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cache.finish_drive(handle);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_take_stalled_claims_entries() {
        let cache = cache(4, WriteLevel::All, 2);
        let handle = cache.stage(0, block(1), 1).await.unwrap();
        assert!(cache.take_stalled().is_empty());

        cache.mark_acked(handle, &r("a"));
        cache.finish_drive(handle);

        let stalled = cache.take_stalled();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].handle, handle);
        assert!(stalled[0].acked.contains(&r("a")));
        // Claimed: not handed out twice
        assert!(cache.take_stalled().is_empty());

        cache.mark_acked(handle, &r("b"));
        cache.finish_drive(handle);
        cache.flush(handle).await.unwrap();
    }
}
