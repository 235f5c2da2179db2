//! Error types for the storage, serialization and delivery seams.

use std::fmt;

/// Failure to read a column from the persistent store.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    // The record exists but could not be decoded
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error while reading column: {}", e),
            Self::Corrupt(reason) => write!(f, "corrupt column record: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self { Self::Io(error) }
}

/// A section that cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    DataTooLarge { len: usize, max: usize },
    DimensionTooLong { len: usize, max: usize },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataTooLarge { len, max } => {
                write!(f, "section payload of {} bytes exceeds {} bytes", len, max)
            },
            Self::DimensionTooLong { len, max } => {
                write!(f, "dimension id of {} bytes exceeds {} bytes", len, max)
            },
        }
    }
}

impl std::error::Error for SerializeError {}

/// The host could not hand a message to a client's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
    Other(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "client disconnected"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for SendError {}

/// Failure to bring up the request processor.
#[derive(Debug)]
pub enum InitError {
    Metrics(prometheus::Error),
    ThreadPool(rayon::ThreadPoolBuildError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metrics(e) => write!(f, "failed to register metrics: {}", e),
            Self::ThreadPool(e) => write!(f, "failed to start disk reader threads: {}", e),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Metrics(e) => Some(e),
            Self::ThreadPool(e) => Some(e),
        }
    }
}

impl From<prometheus::Error> for InitError {
    fn from(error: prometheus::Error) -> Self { Self::Metrics(error) }
}

impl From<rayon::ThreadPoolBuildError> for InitError {
    fn from(error: rayon::ThreadPoolBuildError) -> Self { Self::ThreadPool(error) }
}
