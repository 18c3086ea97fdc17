//! Error taxonomy for the ingestion pipeline.
//!
//! Each layer has its own error enum. [`IngestError`] is the per-URL failure
//! that ends up in the outbound record; its [`IngestError::kind`] string is
//! stable and is what operators grep the logs for.

use rusqlite::ErrorCode;
use thiserror::Error;

/// The page does not have the shape the extraction engine expects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("statistics container not found")]
    MissingContainer,
    #[error("statistics container has no table")]
    MissingTable,
}

/// Failures raised by the persistence gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A required key was missing; nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl StoreError {
    /// True when the backend itself is gone, as opposed to a single rejected
    /// write. The session stops the batch on these.
    pub fn is_backend_lost(&self) -> bool {
        match self {
            StoreError::Persistence(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}

/// Low-level failure of a single HTTP attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection resets, DNS hiccups.
    #[error("network error: {0}")]
    Transient(String),
}

/// Terminal per-URL failure.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transient network error after retries: {0}")]
    TransientNetwork(String),
    #[error("rate limited (HTTP {status}) with no egress path left")]
    RateLimited { status: u16 },
    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },
    #[error("page shape not recognised: {0}")]
    ExtractionShape(#[from] ExtractionError),
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::TransientNetwork(_) => "transient_network",
            IngestError::RateLimited { .. } => "rate_limited",
            IngestError::HttpStatus { .. } => "http_status",
            IngestError::ExtractionShape(_) => "extraction_shape",
            IngestError::Store(StoreError::Validation(_)) => "validation",
            IngestError::Store(StoreError::Persistence(_)) => "persistence",
        }
    }

    /// HTTP status that triggered the failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            IngestError::RateLimited { status } | IngestError::HttpStatus { status } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Invalid crawl configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("concurrency cap must be greater than 0, got {0}")]
    InvalidConcurrency(usize),
    #[error("delay range is inverted: min {min}s > max {max}s")]
    InvertedDelay { min: f64, max: f64 },
    #[error("delay bounds must be finite and non-negative")]
    NegativeDelay,
    #[error("failed to read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },
}
