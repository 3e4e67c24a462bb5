//! Core type definitions for ReplVol
//!
//! Identifiers for volumes and replicas, the ordered replica set backing an
//! attach session, and the read/write consistency levels.

use crate::error::{ConfigError, ConfigResult};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Index of a block within a volume
pub type BlockIndex = u64;

/// Per-block ordering token; higher generations supersede lower ones
pub type Generation = u64;

/// Name of a logical volume
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct VolumeName(String);

impl VolumeName {
    /// Create a validated volume name
    pub fn new(name: impl Into<String>) -> ConfigResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::InvalidVolumeName("empty name".into()));
        }
        if name.len() > 255 {
            return Err(ConfigError::InvalidVolumeName(format!(
                "'{name}' is longer than 255 bytes"
            )));
        }
        if name.chars().any(|c| c == '/' || c.is_control()) {
            return Err(ConfigError::InvalidVolumeName(format!(
                "'{name}' contains '/' or control characters"
            )));
        }
        Ok(Self(name))
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeName({})", self.0)
    }
}

impl FromStr for VolumeName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of a storage replica (its endpoint address)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Ordered set of replicas backing a volume
///
/// The order is the priority order used for sequential reads and for
/// failover. It is fixed for the lifetime of an attach session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ReplicaId>", into = "Vec<ReplicaId>")]
pub struct ReplicaSet {
    replicas: Vec<ReplicaId>,
}

impl ReplicaSet {
    /// Create a replica set; it must be non-empty and free of duplicates
    pub fn new(replicas: Vec<ReplicaId>) -> ConfigResult<Self> {
        if replicas.is_empty() {
            return Err(ConfigError::InvalidReplicaSet("no replicas".into()));
        }
        let mut seen = HashSet::with_capacity(replicas.len());
        for replica in &replicas {
            if !seen.insert(replica) {
                return Err(ConfigError::InvalidReplicaSet(format!(
                    "duplicate replica {replica}"
                )));
            }
        }
        Ok(Self { replicas })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ReplicaId> {
        self.replicas.get(index)
    }

    /// Position of a replica in priority order
    #[must_use]
    pub fn position(&self, replica: &ReplicaId) -> Option<usize> {
        self.replicas.iter().position(|r| r == replica)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaId> {
        self.replicas.iter()
    }
}

impl TryFrom<Vec<ReplicaId>> for ReplicaSet {
    type Error = ConfigError;

    fn try_from(replicas: Vec<ReplicaId>) -> Result<Self, Self::Error> {
        Self::new(replicas)
    }
}

impl From<ReplicaSet> for Vec<ReplicaId> {
    fn from(set: ReplicaSet) -> Self {
        set.replicas
    }
}

/// Which replica(s) serve a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadLevel {
    /// Round-robin across all replicas, not sticky per block
    Spread,
    /// Always the first replica in priority order
    #[serde(alias = "seq")]
    Sequential,
    /// One replica per block, chosen by hashing the block
    #[default]
    Block,
}

impl ReadLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spread => "spread",
            Self::Sequential => "seq",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for ReadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spread" => Ok(Self::Spread),
            "seq" | "sequential" => Ok(Self::Sequential),
            "block" => Ok(Self::Block),
            _ => Err(ConfigError::InvalidLevel {
                kind: "read",
                value: s.to_string(),
                expected: "'spread', 'seq', or 'block'",
            }),
        }
    }
}

/// How many replicas must acknowledge before a write completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteLevel {
    /// Every replica in the set
    #[default]
    All,
    /// Any single replica
    One,
    /// Staged locally; replicas are written in the background
    Local,
}

impl WriteLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::One => "one",
            Self::Local => "local",
        }
    }

    /// Acknowledgments required before the caller is told the write succeeded
    #[must_use]
    pub const fn required_acks(&self, replicas: usize) -> usize {
        match self {
            Self::All => replicas,
            Self::One => 1,
            Self::Local => 0,
        }
    }

    /// Acknowledgments required before a staged block may leave the write-back cache
    ///
    /// `Local` still needs one durable copy somewhere before the local copy
    /// can be dropped.
    #[must_use]
    pub const fn durable_acks(&self, replicas: usize) -> usize {
        match self {
            Self::All => replicas,
            Self::One | Self::Local => 1,
        }
    }
}

impl fmt::Display for WriteLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "one" => Ok(Self::One),
            "local" => Ok(Self::Local),
            _ => Err(ConfigError::InvalidLevel {
                kind: "write",
                value: s.to_string(),
                expected: "'one', 'all', or 'local'",
            }),
        }
    }
}

/// Volume record resolved from the metadata service at attach time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub name: VolumeName,
    /// Block size in bytes
    pub block_size: u64,
    /// Number of blocks in the volume
    pub block_count: u64,
    pub replicas: ReplicaSet,
}

impl VolumeDescriptor {
    /// Total addressable size in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.block_count)
    }

    /// Check geometry invariants
    pub fn validate(&self) -> ConfigResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ConfigError::invalid(format!(
                "block size {} must be a non-zero power of two",
                self.block_size
            )));
        }
        if self.block_count == 0 {
            return Err(ConfigError::invalid("volume has no blocks"));
        }
        if self.block_size.checked_mul(self.block_count).is_none() {
            return Err(ConfigError::invalid(format!(
                "{} blocks of {} bytes overflow a 64-bit byte offset",
                self.block_count, self.block_size
            )));
        }
        Ok(())
    }
}
