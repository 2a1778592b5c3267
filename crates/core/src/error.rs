//! Error types for the resilience layer.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`ErrorKind`] is the
//! flattened, serializable taxonomy that crosses context boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextRef;

/// The top-level error type for all resilink operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Delivery errors ---
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    // --- Cache errors ---
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // --- Fetch errors ---
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    // --- Transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy as seen by a caller in another context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    Timeout,
    InvalidRange,
    NotFound,
    Exhausted,
    Transport,
    Rejected,
    Malformed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InvalidRange => "InvalidRange",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Exhausted => "Exhausted",
            ErrorKind::Transport => "Transport",
            ErrorKind::Rejected => "Rejected",
            ErrorKind::Malformed => "Malformed",
        };
        f.write_str(s)
    }
}

// --- Bounded context errors ---

/// Raw failures of the message bus itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No receiver registered for {0}")]
    NoReceiver(ContextRef),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Injection into {context} failed: {reason}")]
    InjectionFailed { context: ContextRef, reason: String },
}

/// Failures of a supervised delivery to another context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Context unreachable: {context}")]
    Unreachable { context: ContextRef },

    #[error("Request to {context} timed out after {after_ms}ms")]
    Timeout { context: ContextRef, after_ms: u64 },

    #[error("Retry budget exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Remote rejected request: {0}")]
    Rejected(String),

    #[error("Malformed reply: {0}")]
    Malformed(String),
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Unreachable { .. } => ErrorKind::Unreachable,
            DeliveryError::Timeout { .. } => ErrorKind::Timeout,
            DeliveryError::Exhausted { .. } => ErrorKind::Exhausted,
            DeliveryError::Transport(_) => ErrorKind::Transport,
            DeliveryError::Rejected(_) => ErrorKind::Rejected,
            DeliveryError::Malformed(_) => ErrorKind::Malformed,
        }
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Invalid chunk range: {id} index {index}")]
    InvalidRange { id: String, index: u64 },
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::InvalidRange { .. } => ErrorKind::InvalidRange,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Non-success status; `preview` holds the start of the body.
    #[error("HTTP {status}")]
    Http { status: u16, preview: String },

    #[error("URL not allowed: {0}")]
    NotAllowed(String),

    #[error("Failed to read local file: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::InvalidUrl(_) | FetchError::Http { .. } | FetchError::NotAllowed(_) => {
                ErrorKind::Rejected
            }
            FetchError::Io(_) => ErrorKind::NotFound,
            FetchError::Network(_) => ErrorKind::Transport,
        }
    }
}
