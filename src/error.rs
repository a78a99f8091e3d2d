//! Error types for the calluna crate.
//!
//! The storage core distinguishes exactly two failure classes at its buffered
//! I/O boundary: allocation failure while growing a buffer, and failure of an
//! underlying read/write/seek. Everything above the buffer layer propagates
//! these with `?`; nothing is retried and nothing panics.

use thiserror::Error;

/// Errors that can occur in calluna operations.
#[derive(Error, Debug)]
pub enum CallunaError {
    /// A buffer could not acquire memory.
    #[error("memory allocation failed: {0}")]
    Memory(String),

    /// An underlying read, write or seek failed. A truncated stream (for
    /// example a VInt cut off at end of file) also surfaces here.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied value was rejected (oversized term, out-of-order
    /// dictionary insert, unbound reader).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CallunaError {
    /// Create a memory error.
    pub fn memory<S: Into<String>>(msg: S) -> Self {
        CallunaError::Memory(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        CallunaError::InvalidArgument(msg.into())
    }

    /// Create an I/O error from a message.
    pub fn io<S: Into<String>>(msg: S) -> Self {
        CallunaError::Io(std::io::Error::other(msg.into()))
    }
}

/// Result type for calluna operations.
pub type Result<T> = std::result::Result<T, CallunaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CallunaError::memory("bank stack limit reached");
        assert_eq!(
            err.to_string(),
            "memory allocation failed: bank stack limit reached"
        );

        let err = CallunaError::invalid_argument("term too long");
        assert_eq!(err.to_string(), "invalid argument: term too long");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        let err: CallunaError = io_err.into();
        assert!(matches!(err, CallunaError::Io(_)));
    }
}
