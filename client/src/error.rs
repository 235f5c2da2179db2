use std::{fmt, io};

/// Failure to read or write the on-disk column timestamp cache.
#[derive(Debug)]
pub enum CacheError {
    Io(io::Error),
    UnsupportedVersion(i32),
    /// Declared entry count is negative or implausibly large.
    BadCount(i32),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "column cache I/O error: {}", e),
            Self::UnsupportedVersion(v) => write!(f, "unsupported column cache version {}", v),
            Self::BadCount(n) => write!(f, "column cache declares {} entries", n),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self { Self::Io(err) }
}

impl From<atomicwrites::Error<io::Error>> for CacheError {
    fn from(err: atomicwrites::Error<io::Error>) -> Self {
        match err {
            atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => Self::Io(e),
        }
    }
}
