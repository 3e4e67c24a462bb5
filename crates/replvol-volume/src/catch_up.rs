//! Replica catch-up
//!
//! `one` and `local` writes reach their level on the first acknowledgment,
//! so a replica that is down for longer than the retry window misses them.
//! The set below remembers, per block, the newest such write and the
//! replicas still missing it. The flusher keeps re-sending it until each of
//! those replicas holds it, or until a newer generation of the block
//! reaches every replica.
//!
//! Catch-up state lives for one session; detach reports what is left.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use parking_lot::Mutex;
use replvol_common::{BlockIndex, Generation, ReplicaId};

use crate::write_cache::WriteHandle;

#[derive(Debug)]
struct Lagging {
    generation: Generation,
    data: Bytes,
    missing: HashSet<ReplicaId>,
    /// A catch-up fan-out is running for this generation
    driving: bool,
}

/// A write to re-send to the replicas that miss it
#[derive(Debug, Clone)]
pub struct CatchUpWrite {
    pub handle: WriteHandle,
    pub data: Bytes,
    pub missing: HashSet<ReplicaId>,
}

/// Blocks whose newest write is missing from some replicas
#[derive(Debug, Default)]
pub struct CatchUpSet {
    entries: Mutex<HashMap<BlockIndex, Lagging>>,
}

impl CatchUpSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the replicas that did not acknowledge `handle`
    ///
    /// Replaces the entry of an older generation of the block. Ignored when
    /// a newer generation is already tracked.
    pub fn record(&self, handle: WriteHandle, data: Bytes, missing: HashSet<ReplicaId>) {
        if missing.is_empty() {
            self.replicated(handle);
            return;
        }
        let mut entries = self.entries.lock();
        if entries
            .get(&handle.block)
            .is_some_and(|e| e.generation > handle.generation)
        {
            return;
        }
        entries.insert(
            handle.block,
            Lagging {
                generation: handle.generation,
                data,
                missing,
                driving: false,
            },
        );
    }

    /// `handle` reached every replica; older catch-up of the block is moot
    pub fn replicated(&self, handle: WriteHandle) {
        let mut entries = self.entries.lock();
        if entries
            .get(&handle.block)
            .is_some_and(|e| e.generation <= handle.generation)
        {
            entries.remove(&handle.block);
        }
    }

    /// `replica` now holds `handle` (or something newer)
    pub fn caught_up(&self, handle: WriteHandle, replica: &ReplicaId) {
        let mut entries = self.entries.lock();
        if let Entry::Occupied(mut entry) = entries.entry(handle.block)
            && entry.get().generation == handle.generation
        {
            entry.get_mut().missing.remove(replica);
            if entry.get().missing.is_empty() {
                entry.remove();
            }
        }
    }

    /// A catch-up fan-out started by `take` finished
    pub fn finish(&self, handle: WriteHandle) {
        if let Some(entry) = self
            .entries
            .lock()
            .get_mut(&handle.block)
            .filter(|e| e.generation == handle.generation)
        {
            entry.driving = false;
        }
    }

    /// Claim every entry no fan-out is driving
    ///
    /// The caller re-sends each write and reports the end with `finish`.
    pub fn take(&self) -> Vec<CatchUpWrite> {
        let mut entries = self.entries.lock();
        let mut writes: Vec<_> = entries
            .iter_mut()
            .filter(|(_, e)| !e.driving)
            .map(|(block, e)| {
                e.driving = true;
                CatchUpWrite {
                    handle: WriteHandle {
                        block: *block,
                        generation: e.generation,
                    },
                    data: e.data.clone(),
                    missing: e.missing.clone(),
                }
            })
            .collect();
        writes.sort_by_key(|w| w.handle.block);
        writes
    }

    /// Number of blocks with replicas still behind
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
