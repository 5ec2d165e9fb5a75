//! Error types for slidewin.

use thiserror::Error;

use crate::ratelimit::Timestamp;

/// A request timestamp older than the entity's most recent recorded request.
///
/// Retrying with the same timestamp fails the same way; the caller decides
/// whether to drop the request or clamp its timestamp.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("time travel not allowed: timestamp {timestamp} for entity {entity:?} is before most recent timestamp {latest}")]
pub struct OutOfOrderTimestamp<K> {
    /// The entity the write was for
    pub entity: K,
    /// The rejected timestamp
    pub timestamp: Timestamp,
    /// The newest timestamp already recorded for the entity
    pub latest: Timestamp,
}

/// Main error type for slidewin operations outside the admission hot path.
#[derive(Error, Debug)]
pub enum SlidewinError {
    /// Window or capacity outside the accepted range
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed replay input
    #[error("Parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON output errors
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<config::ConfigError> for SlidewinError {
    fn from(err: config::ConfigError) -> Self {
        SlidewinError::Config(err.to_string())
    }
}

/// Result type alias for slidewin operations.
pub type Result<T> = std::result::Result<T, SlidewinError>;
