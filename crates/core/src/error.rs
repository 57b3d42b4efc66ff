//! Error types for the Ravel engine.

use std::fmt;

/// Result type alias for Ravel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for engine operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A row or operand violates a scheme constraint.
    SchemeViolation { message: String },
    /// A storage adapter failed (I/O, corruption, missing file).
    Storage { message: String },
    /// Data could not be serialized or deserialized.
    Serialization { message: String },
    /// An internal invariant was broken. Aborts in debug builds.
    InvariantViolation { message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SchemeViolation { message } => {
                write!(f, "Scheme violation: {}", message)
            }
            Error::Storage { message } => {
                write!(f, "Storage error: {}", message)
            }
            Error::Serialization { message } => {
                write!(f, "Serialization error: {}", message)
            }
            Error::InvariantViolation { message } => {
                write!(f, "Invariant violation: {}", message)
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates a scheme violation error.
    pub fn scheme_violation(message: impl Into<String>) -> Self {
        Error::SchemeViolation {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Error::InvariantViolation {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::scheme_violation("row does not match scheme");
        assert!(err.to_string().contains("Scheme violation"));

        let err = Error::storage("file missing");
        assert!(err.to_string().contains("file missing"));

        let err = Error::serialization("bad plist");
        assert!(err.to_string().contains("bad plist"));
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Storage { .. }));
    }
}
