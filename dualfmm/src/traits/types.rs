//! Utility types for trait definitions.
use std::fmt;

/// Type to handle FMM related errors.
#[derive(Debug)]
pub enum FmmError {
    /// Failure to run some business logic.
    Failed(String),

    /// I/O failure.
    Io(std::io::Error),

    /// A distributed exchange produced inconsistent payloads. Fatal: a
    /// partially corrupted exchange invalidates every rank's tree.
    Communication(String),
}

impl fmt::Display for FmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmmError::Failed(e) => write!(f, "Failed: {}", e),
            FmmError::Io(e) => write!(f, "I/O error: {}", e),
            FmmError::Communication(e) => write!(f, "Communication error: {}", e),
        }
    }
}

impl std::error::Error for FmmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FmmError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FmmError {
    fn from(e: std::io::Error) -> Self {
        FmmError::Io(e)
    }
}
