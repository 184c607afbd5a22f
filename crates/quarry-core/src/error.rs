//! Error types for Quarry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Request validation errors
    #[error("Unknown parameter field: {0}")]
    UnknownField(String),

    #[error("Invalid value for parameter '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    // Cache errors
    #[error("Fingerprint collision on key {key}: stored parameters differ from request")]
    FingerprintCollision { key: String },

    #[error("Cache entry not found: {0}")]
    CacheEntryNotFound(String),

    #[error("Cache entry {key} is not in state {expected}")]
    InvalidCacheState { key: String, expected: String },

    #[error("Timed out waiting for in-flight computation on key {key} after {waited_ms}ms")]
    WaitTimeout { key: String, waited_ms: u64 },

    // Computation errors
    #[error("Analysis computation failed: {0}")]
    ComputationFailed(String),

    // Section errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Section write incomplete for job {job_id}: {reason}")]
    SectionWriteIncomplete { job_id: String, reason: String },

    #[error("Sections already committed for job {job_id} with different content")]
    SectionConflict { job_id: String },

    // Materialization errors
    #[error("Cycle detected in materialization graph")]
    CycleDetected,

    #[error("Unknown source for node '{node}': {source_name}")]
    UnknownSource { node: String, source_name: String },

    #[error("Materialization node not found: {0}")]
    NodeNotFound(String),

    #[error("Refresh validation mismatch for node '{node}': {detail}")]
    RefreshValidationMismatch { node: String, detail: String },

    #[error("A refresh cascade is already running")]
    RefreshInProgress,

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Alert delivery failed: {0}")]
    AlertDelivery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error came from request validation (rejected before
    /// fingerprinting, never cached).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownField(_) | Error::InvalidValue { .. } | Error::UnknownApplication(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
