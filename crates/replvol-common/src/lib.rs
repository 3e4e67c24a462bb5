//! ReplVol Common - Shared types and configuration
//!
//! This crate provides the identifiers, consistency levels and
//! configuration records shared by the volume coordinator and the
//! daemon that exports volumes.

pub mod config;
pub mod error;
pub mod size;
pub mod types;

pub use config::{PartialWritePolicy, ReplicaConfig, VolumeConfig};
pub use error::{ConfigError, ConfigResult};
pub use size::{format_size, parse_size};
pub use types::*;
