//! Error types for platoon protocol operations
//!
//! Channel timeouts, uncorrectable heartbeats and congestion losses are part of
//! normal operation and never surface here. These variants cover API misuse:
//! bad configuration, malformed payloads, registry lookups for vehicles that
//! do not exist, and tasks that failed to join at shutdown.
use thiserror::Error;

use crate::contracts::VehicleId;

/// Result type alias for platoon operations
pub type Result<T> = std::result::Result<T, PlatoonError>;

/// Platoon protocol error enumeration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatoonError {
    /// A configuration value is out of its valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A payload string or value cannot be represented at the requested width
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No vehicle with this id is registered
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(VehicleId),

    /// A vehicle with this id is already registered
    #[error("Duplicate vehicle: {0}")]
    DuplicateVehicle(VehicleId),

    /// An agent or sender task panicked or was cancelled
    #[error("Task join failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for PlatoonError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
