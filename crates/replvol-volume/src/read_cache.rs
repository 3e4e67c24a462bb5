//! Read cache for replica-backed blocks
//!
//! Bounded by a byte budget with least-recently-used eviction, tracked by a
//! logical clock. Entries carry the generation they were read at so a slow
//! read can never replace newer contents. Not durable: a new session starts
//! cold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use replvol_common::{BlockIndex, Generation, VolumeName};
use serde::Serialize;

use crate::transport::BlockData;

/// Cache key identifying a block of a volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub volume: VolumeName,
    pub block: BlockIndex,
}

impl BlockKey {
    #[must_use]
    pub const fn new(volume: VolumeName, block: BlockIndex) -> Self {
        Self { volume, block }
    }
}

struct CachedBlock {
    data: Bytes,
    generation: Generation,
    /// Last access time on the logical clock
    last_access: AtomicU64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<BlockKey, CachedBlock>,
    used_bytes: u64,
}

/// Point-in-time cache occupancy
///
/// Hits and misses are counted per session in `VolumeStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadCacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub evictions: u64,
}

/// LRU cache of recently read blocks
pub struct ReadCache {
    entries: RwLock<Entries>,
    capacity_bytes: u64,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl ReadCache {
    /// Create a cache holding at most `capacity_bytes` of block data;
    /// a zero budget disables caching
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            capacity_bytes,
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ReadCacheStats {
        let entries = self.entries.read();
        ReadCacheStats {
            entries: entries.map.len(),
            used_bytes: entries.used_bytes,
            capacity_bytes: self.capacity_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a block
    pub fn get(&self, key: &BlockKey) -> Option<BlockData> {
        let entries = self.entries.read();
        entries.map.get(key).map(|entry| {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            BlockData {
                data: entry.data.clone(),
                generation: entry.generation,
            }
        })
    }

    /// Insert or refresh a block
    ///
    /// A `put` older than the cached generation is ignored. Returns whether
    /// the data was stored.
    pub fn put(&self, key: BlockKey, data: Bytes, generation: Generation) -> bool {
        let size = data.len() as u64;
        if size > self.capacity_bytes {
            return false;
        }

        let clock = self.tick();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.map.get(&key) {
            if existing.generation > generation {
                return false;
            }
            let old = existing.data.len() as u64;
            entries.used_bytes -= old;
            entries.map.remove(&key);
        }

        while entries.used_bytes + size > self.capacity_bytes {
            let Some(victim) = Self::find_lru_entry(&entries.map) else {
                break;
            };
            if let Some(evicted) = entries.map.remove(&victim) {
                entries.used_bytes -= evicted.data.len() as u64;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.used_bytes += size;
        entries.map.insert(
            key,
            CachedBlock {
                data,
                generation,
                last_access: AtomicU64::new(clock),
            },
        );
        true
    }

    /// Drop a block
    pub fn invalidate(&self, key: &BlockKey) -> bool {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.map.remove(key) {
            entries.used_bytes -= entry.data.len() as u64;
            true
        } else {
            false
        }
    }

    fn find_lru_entry(map: &HashMap<BlockKey, CachedBlock>) -> Option<BlockKey> {
        map.iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone())
    }
}
