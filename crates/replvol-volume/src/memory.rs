//! In-process replicas
//!
//! `MemoryReplica` keeps blocks in a map keyed by volume and block index
//! and honours generations the same way a storage node does. It can be taken offline, slowed down, or told
//! to hold writes, which makes it the transport used by the test suites
//! and by single-process setups.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use replvol_common::{BlockIndex, Generation, ReplicaId, VolumeName};
use tokio::sync::watch;

use crate::error::{VolumeError, VolumeResult};
use crate::transport::{BlockData, ReplicaConnector, ReplicaTransport, TransportError};

/// A replica whose blocks live in memory
pub struct MemoryReplica {
    id: ReplicaId,
    block_size: u64,
    blocks: Mutex<HashMap<(VolumeName, BlockIndex), BlockData>>,
    online: AtomicBool,
    latency: Mutex<Duration>,
    /// `true` while writes are held back
    hold: watch::Sender<bool>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryReplica {
    pub fn new(id: ReplicaId, block_size: u64) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            id,
            block_size,
            blocks: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            hold,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// Take the replica on- or offline; offline requests fail as unreachable
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delay added to every request
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Hold writes until `release_writes` is called
    pub fn hold_writes(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.hold.send_replace(false);
    }

    /// Stored contents of a volume's block, if it was ever written
    #[must_use]
    pub fn block(&self, volume: &VolumeName, block: BlockIndex) -> Option<BlockData> {
        self.blocks.lock().get(&(volume.clone(), block)).cloned()
    }

    /// Number of read requests that reached the replica
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write requests applied or rejected by the replica
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Unreachable(format!("{} is offline", self.id)))
        }
    }
}

#[async_trait]
impl ReplicaTransport for MemoryReplica {
    async fn read_block(
        &self,
        volume: &VolumeName,
        block: BlockIndex,
    ) -> Result<BlockData, TransportError> {
        self.delay().await;
        self.check_online()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let stored = self.block(volume, block);
        Ok(stored.unwrap_or_else(|| BlockData {
            data: Bytes::from(vec![0u8; self.block_size as usize]),
            generation: 0,
        }))
    }

    async fn write_block(
        &self,
        volume: &VolumeName,
        block: BlockIndex,
        generation: Generation,
        data: Bytes,
    ) -> Result<(), TransportError> {
        self.delay().await;
        let mut hold = self.hold.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = hold.wait_for(|held| !*held).await;
        self.check_online()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        if data.len() as u64 != self.block_size {
            return Err(TransportError::Rejected(format!(
                "write of {} bytes to a {} byte block",
                data.len(),
                self.block_size
            )));
        }

        let key = (volume.clone(), block);
        let mut blocks = self.blocks.lock();
        if let Some(existing) = blocks.get(&key)
            && existing.generation > generation
        {
            return Err(TransportError::Stale {
                current: existing.generation,
            });
        }
        blocks.insert(key, BlockData { data, generation });
        Ok(())
    }
}

/// A set of in-memory replicas addressable by id
pub struct MemoryCluster {
    block_size: u64,
    replicas: RwLock<HashMap<ReplicaId, Arc<MemoryReplica>>>,
}

impl MemoryCluster {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            replicas: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cluster with one replica per id
    pub fn with_replicas<I, S>(block_size: u64, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = Self::new(block_size);
        for id in ids {
            cluster.add(ReplicaId::new(id));
        }
        cluster
    }

    /// Add a replica; an existing replica with the same id is returned as is
    pub fn add(&self, id: ReplicaId) -> Arc<MemoryReplica> {
        self.replicas
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MemoryReplica::new(id, self.block_size)))
            .clone()
    }

    #[must_use]
    pub fn replica(&self, id: &str) -> Option<Arc<MemoryReplica>> {
        self.replicas.read().get(&ReplicaId::new(id)).cloned()
    }
}

impl ReplicaConnector for MemoryCluster {
    fn connect(
        &self,
        replica: &ReplicaId,
        block_size: u64,
    ) -> VolumeResult<Arc<dyn ReplicaTransport>> {
        if block_size != self.block_size {
            return Err(VolumeError::ReplicaUnavailable {
                replica: replica.clone(),
                reason: format!(
                    "replica block size {} does not match volume block size {block_size}",
                    self.block_size
                ),
            });
        }
        self.replicas
            .read()
            .get(replica)
            .cloned()
            .map(|r| r as Arc<dyn ReplicaTransport>)
            .ok_or_else(|| VolumeError::ReplicaUnavailable {
                replica: replica.clone(),
                reason: "no such replica".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> VolumeName {
        VolumeName::new("v1").unwrap()
    }

    #[tokio::test]
    async fn test_unwritten_block_reads_zeros() {
        let replica = MemoryReplica::new(ReplicaId::new("r1"), 512);
        let read = replica.read_block(&v1(), 9).await.unwrap();
        assert_eq!(read.generation, 0);
        assert_eq!(read.data.len(), 512);
        assert!(read.data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_older_generation_is_stale() {
        let replica = MemoryReplica::new(ReplicaId::new("r1"), 4);
        replica
            .write_block(&v1(), 0, 5, Bytes::from_static(&[5; 4]))
            .await
            .unwrap();

        let result = replica
            .write_block(&v1(), 0, 3, Bytes::from_static(&[3; 4]))
            .await;
        assert_eq!(result, Err(TransportError::Stale { current: 5 }));

        // Same generation again is accepted
        replica
            .write_block(&v1(), 0, 5, Bytes::from_static(&[5; 4]))
            .await
            .unwrap();
        assert_eq!(replica.block(&v1(), 0).unwrap().data.as_ref(), &[5; 4]);
    }

    #[tokio::test]
    async fn test_offline_replica_is_unreachable() {
        let replica = MemoryReplica::new(ReplicaId::new("r1"), 4);
        replica.set_online(false);
        assert!(matches!(
            replica.read_block(&v1(), 0).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_held_writes_complete_on_release() {
        let replica = Arc::new(MemoryReplica::new(ReplicaId::new("r1"), 4));
        replica.hold_writes();

        let writer = {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move {
                replica
                    .write_block(&v1(), 1, 1, Bytes::from_static(&[1; 4]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert!(replica.block(&v1(), 1).is_none());

        replica.release_writes();
        writer.await.unwrap().unwrap();
        assert_eq!(replica.block(&v1(), 1).unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_blocks_are_kept_per_volume() {
        let replica = MemoryReplica::new(ReplicaId::new("r1"), 4);
        let v2 = VolumeName::new("v2").unwrap();
        replica
            .write_block(&v1(), 0, 1, Bytes::from_static(&[1; 4]))
            .await
            .unwrap();
        // Same generation in another volume is not a conflict
        replica
            .write_block(&v2, 0, 1, Bytes::from_static(&[2; 4]))
            .await
            .unwrap();

        assert_eq!(replica.block(&v1(), 0).unwrap().data.as_ref(), &[1; 4]);
        assert_eq!(replica.block(&v2, 0).unwrap().data.as_ref(), &[2; 4]);
    }

    #[test]
    fn test_connector_rejects_unknown_replica() {
        let cluster = MemoryCluster::with_replicas(4096, ["a", "b"]);
        assert!(cluster.connect(&ReplicaId::new("a"), 4096).is_ok());
        assert!(cluster.connect(&ReplicaId::new("c"), 4096).is_err());
        assert!(cluster.connect(&ReplicaId::new("a"), 512).is_err());
    }
}
