//! Configuration error types
//!
//! Invalid consistency levels, sizes and replica sets are rejected when the
//! configuration is built, never at I/O time.

use thiserror::Error;

/// Result type for configuration parsing and validation
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {kind} level '{value}'; use one of {expected}")]
    InvalidLevel {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid size: '{0}'")]
    InvalidSize(String),

    #[error("invalid volume name: {0}")]
    InvalidVolumeName(String),

    #[error("invalid replica set: {0}")]
    InvalidReplicaSet(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid configuration error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
