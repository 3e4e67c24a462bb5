//! Persistent metadata store using Redb
//!
//! Volume records and attach leases live in a single table so they
//! survive restarts of the mount daemon.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use replvol_volume::{MetadataKv, VolumeError, VolumeResult, Versioned};

// ── Table definitions ─────────────────────────────────────────────────────────

/// Metadata: key (str) → (version, JSON document)
const METADATA: TableDefinition<&str, (u64, &[u8])> = TableDefinition::new("metadata");

fn kv_error(e: impl std::fmt::Display) -> VolumeError {
    VolumeError::metadata(e.to_string())
}

// ── RedbKv ────────────────────────────────────────────────────────────────────

/// Versioned key-value store backed by Redb.
pub struct RedbKv {
    db: Database,
}

impl RedbKv {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure the table exists so readers never race its creation
        let wtx = db.begin_write()?;
        wtx.open_table(METADATA)?;
        wtx.commit()?;

        Ok(Self { db })
    }
}

#[async_trait]
impl MetadataKv for RedbKv {
    async fn get(&self, key: &str) -> VolumeResult<Option<Versioned>> {
        let rtx = self.db.begin_read().map_err(kv_error)?;
        let table = rtx.open_table(METADATA).map_err(kv_error)?;
        let entry = table.get(key).map_err(kv_error)?;
        Ok(entry.map(|guard| {
            let (version, value) = guard.value();
            Versioned {
                value: value.to_vec(),
                version,
            }
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> VolumeResult<Option<u64>> {
        // Redb serializes write transactions, which makes the check-and-set atomic
        let wtx = self.db.begin_write().map_err(kv_error)?;
        let version = {
            let mut table = wtx.open_table(METADATA).map_err(kv_error)?;
            let current = table
                .get(key)
                .map_err(kv_error)?
                .map(|guard| guard.value().0);
            if current != expected {
                return Ok(None);
            }
            let version = current.unwrap_or(0) + 1;
            table
                .insert(key, (version, value.as_slice()))
                .map_err(kv_error)?;
            version
        };
        wtx.commit().map_err(kv_error)?;
        Ok(Some(version))
    }
}
