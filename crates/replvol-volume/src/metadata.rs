//! Metadata access
//!
//! The metadata service is a small key-value store with compare-and-swap.
//! Volume records and attach leases are JSON documents on top of it:
//!
//! ```text
//! volumes/{name}  -> VolumeDescriptor
//! leases/{name}   -> LeaseRecord { holder, epoch, expires_at }
//! ```
//!
//! Every successful acquire bumps the lease epoch. The epoch seeds the
//! session's generation clock, so writes of a later session always order
//! after writes of an earlier one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use replvol_common::{VolumeDescriptor, VolumeName};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{VolumeError, VolumeResult};

/// CAS attempts before giving up on a contended key
const MAX_CAS_ATTEMPTS: usize = 8;

/// A stored value and its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    /// Incremented on every successful write, starting at 1
    pub version: u64,
}

/// Key-value store with compare-and-swap
#[async_trait]
pub trait MetadataKv: Send + Sync {
    async fn get(&self, key: &str) -> VolumeResult<Option<Versioned>>;

    /// Store `value` if the key's current version is `expected` (`None`
    /// meaning the key must not exist)
    ///
    /// Returns the new version, or `None` when the expectation failed.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> VolumeResult<Option<u64>>;
}

/// In-process key-value store
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataKv for MemoryKv {
    async fn get(&self, key: &str) -> VolumeResult<Option<Versioned>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> VolumeResult<Option<u64>> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|v| v.version);
        if current != expected {
            return Ok(None);
        }
        let version = current.unwrap_or(0) + 1;
        entries.insert(key.to_string(), Versioned { value, version });
        Ok(Some(version))
    }
}

/// Stored attach lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    holder: Uuid,
    epoch: u64,
    /// Unix time in milliseconds; 0 once released
    expires_at: i64,
}

/// Exclusive attach lease held by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub volume: VolumeName,
    pub holder: Uuid,
    pub epoch: u64,
    pub expires_at: DateTime<Utc>,
}

/// Metadata operations needed by an attach session
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Look up a volume's geometry and replica set
    async fn resolve(&self, volume: &VolumeName) -> VolumeResult<VolumeDescriptor>;

    /// Take the exclusive attach lease, bumping its epoch
    async fn acquire_lease(
        &self,
        volume: &VolumeName,
        holder: Uuid,
        ttl: Duration,
    ) -> VolumeResult<Lease>;

    /// Extend a held lease; fails if it was taken over
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> VolumeResult<Lease>;

    /// Give the lease up; a lease no longer held is left alone
    async fn release_lease(&self, lease: &Lease) -> VolumeResult<()>;
}

/// Volume records and leases stored in a `MetadataKv`
pub struct Metadata<K> {
    kv: K,
}

fn volume_key(volume: &VolumeName) -> String {
    format!("volumes/{volume}")
}

fn lease_key(volume: &VolumeName) -> String {
    format!("leases/{volume}")
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl<K: MetadataKv> Metadata<K> {
    pub const fn new(kv: K) -> Self {
        Self { kv }
    }

    pub const fn kv(&self) -> &K {
        &self.kv
    }

    /// Store a new volume record; fails if the name is taken
    pub async fn register_volume(&self, descriptor: &VolumeDescriptor) -> VolumeResult<()> {
        descriptor.validate()?;
        let value = serde_json::to_vec(descriptor).map_err(|e| VolumeError::metadata(e.to_string()))?;
        match self
            .kv
            .compare_and_swap(&volume_key(&descriptor.name), None, value)
            .await?
        {
            Some(_) => {
                info!(volume = %descriptor.name, replicas = descriptor.replicas.len(), "registered volume");
                Ok(())
            }
            None => Err(VolumeError::VolumeExists(descriptor.name.to_string())),
        }
    }

    async fn load_lease(&self, volume: &VolumeName) -> VolumeResult<Option<(LeaseRecord, u64)>> {
        let Some(stored) = self.kv.get(&lease_key(volume)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&stored.value)
            .map_err(|e| VolumeError::metadata(format!("corrupt lease for {volume}: {e}")))?;
        Ok(Some((record, stored.version)))
    }

    async fn store_lease(
        &self,
        volume: &VolumeName,
        expected: Option<u64>,
        record: &LeaseRecord,
    ) -> VolumeResult<bool> {
        let value = serde_json::to_vec(record).map_err(|e| VolumeError::metadata(e.to_string()))?;
        Ok(self
            .kv
            .compare_and_swap(&lease_key(volume), expected, value)
            .await?
            .is_some())
    }
}

fn lease_lost(lease: &Lease, current: Option<&LeaseRecord>) -> VolumeError {
    VolumeError::LeaseHeld {
        volume: lease.volume.to_string(),
        holder: current.map_or_else(|| "nobody".to_string(), |r| r.holder.to_string()),
    }
}

#[async_trait]
impl<K: MetadataKv> MetadataService for Metadata<K> {
    async fn resolve(&self, volume: &VolumeName) -> VolumeResult<VolumeDescriptor> {
        let stored = self
            .kv
            .get(&volume_key(volume))
            .await?
            .ok_or_else(|| VolumeError::VolumeNotFound(volume.to_string()))?;
        let descriptor: VolumeDescriptor = serde_json::from_slice(&stored.value)
            .map_err(|e| VolumeError::metadata(format!("corrupt record for {volume}: {e}")))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    async fn acquire_lease(
        &self,
        volume: &VolumeName,
        holder: Uuid,
        ttl: Duration,
    ) -> VolumeResult<Lease> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now().timestamp_millis();
            let current = self.load_lease(volume).await?;

            if let Some((record, _)) = &current
                && record.holder != holder
                && record.expires_at > now
            {
                return Err(VolumeError::LeaseHeld {
                    volume: volume.to_string(),
                    holder: record.holder.to_string(),
                });
            }

            let record = LeaseRecord {
                holder,
                epoch: current.as_ref().map_or(0, |(r, _)| r.epoch) + 1,
                expires_at: now.saturating_add(ttl_millis(ttl)),
            };
            let expected = current.map(|(_, version)| version);
            if self.store_lease(volume, expected, &record).await? {
                info!(volume = %volume, epoch = record.epoch, "acquired attach lease");
                return Ok(Lease {
                    volume: volume.clone(),
                    holder,
                    epoch: record.epoch,
                    expires_at: to_datetime(record.expires_at),
                });
            }
            debug!(volume = %volume, "lease update raced, retrying");
        }
        Err(VolumeError::metadata(format!("lease for {volume} is contended")))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> VolumeResult<Lease> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load_lease(&lease.volume).await?;
            let Some((record, version)) = current else {
                return Err(lease_lost(lease, None));
            };
            if record.holder != lease.holder || record.epoch != lease.epoch {
                return Err(lease_lost(lease, Some(&record)));
            }

            let renewed = LeaseRecord {
                expires_at: Utc::now().timestamp_millis().saturating_add(ttl_millis(ttl)),
                ..record
            };
            if self.store_lease(&lease.volume, Some(version), &renewed).await? {
                debug!(volume = %lease.volume, epoch = lease.epoch, "renewed attach lease");
                return Ok(Lease {
                    expires_at: to_datetime(renewed.expires_at),
                    ..lease.clone()
                });
            }
        }
        Err(VolumeError::metadata(format!(
            "lease for {} is contended",
            lease.volume
        )))
    }

    async fn release_lease(&self, lease: &Lease) -> VolumeResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((record, version)) = self.load_lease(&lease.volume).await? else {
                return Ok(());
            };
            if record.holder != lease.holder || record.epoch != lease.epoch {
                return Ok(());
            }

            // Keep the epoch so the next holder moves past it
            let released = LeaseRecord {
                expires_at: 0,
                ..record
            };
            if self.store_lease(&lease.volume, Some(version), &released).await? {
                info!(volume = %lease.volume, epoch = lease.epoch, "released attach lease");
                return Ok(());
            }
        }
        Err(VolumeError::metadata(format!(
            "lease for {} is contended",
            lease.volume
        )))
    }
}
