//! Error types for the filter graph engine

use thiserror::Error;

/// Result type alias for filter graph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while building or running a filter graph
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument passed to an engine or filter operation
    #[error("Bad parameter: {0}")]
    BadParam(String),

    /// Buffer allocation failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not supported by the filter or backend
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Filter internal state or payload is corrupted
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// No filter (or filter chain) satisfies the request
    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    /// A collaborator callback (I/O backend, responder, host task) failed
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Capability negotiation pending, try again on the next scheduling tick
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Packet mutated after it was sent, discarded or received as input
    #[error("Detached packet: {0}")]
    DetachedPacket(String),

    /// Packet already sent or discarded
    #[error("Packet already finalized")]
    AlreadyFinalized,

    /// Offset or length outside of a buffer
    #[error("Invalid range: offset {offset} + length {length} exceeds size {size}")]
    InvalidRange {
        /// Requested offset
        offset: usize,
        /// Requested length
        length: usize,
        /// Size of the referenced buffer
        size: usize,
    },

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Session aborted
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Scheduler found no runnable filter while some filters are not done
    #[error("Deadlock: no runnable filter, stalled: {}", .filters.join(", "))]
    Deadlock {
        /// Names of the filters that can make no progress
        filters: Vec<String>,
    },

    /// Configuration or manifest parsing error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors the scheduler retries on the next tick instead of failing the filter
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }

    /// True for errors that leave the filter's internal state unusable
    pub fn is_fatal_for_filter(&self) -> bool {
        matches!(self, Error::OutOfMemory(_) | Error::CorruptedData(_))
    }

    pub(crate) fn range(offset: usize, length: usize, size: usize) -> Self {
        Error::InvalidRange {
            offset,
            length,
            size,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(format!("JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(format!("YAML: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML: {}", err))
    }
}

/// Clonable summary of an error, kept by the session for the first connect/process failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    /// Name of the filter the error is attributed to
    pub filter: String,
    /// Rendered error message
    pub message: String,
    /// Error kind, as the variant name
    pub kind: &'static str,
}

impl FilterError {
    pub(crate) fn new(filter: &str, err: &Error) -> Self {
        Self {
            filter: filter.to_string(),
            message: err.to_string(),
            kind: err.kind_name(),
        }
    }
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.filter, self.message)
    }
}

impl Error {
    /// Variant name, stable across messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::BadParam(_) => "BadParam",
            Error::OutOfMemory(_) => "OutOfMemory",
            Error::Io(_) => "IoError",
            Error::NotSupported(_) => "NotSupported",
            Error::CorruptedData(_) => "CorruptedData",
            Error::FilterNotFound(_) => "FilterNotFound",
            Error::ServiceError(_) => "ServiceError",
            Error::NotReady(_) => "NotReady",
            Error::DetachedPacket(_) => "DetachedPacket",
            Error::AlreadyFinalized => "AlreadyFinalized",
            Error::InvalidRange { .. } => "InvalidRange",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled(_) => "Cancelled",
            Error::Deadlock { .. } => "Deadlock",
            Error::Config(_) => "Config",
            Error::Other(_) => "Other",
        }
    }
}
