use std::{error::Error, fmt, io};

use backtrace::Backtrace;

/// Coarse classification of every error the engine can surface.
///
/// The kind decides the recovery policy at the session boundary:
/// constraint / semantic / conflict errors abort the current statement
/// (and its transaction when running in auto-commit) but leave the
/// session usable; `Storage` and `Internal` mark the database
/// read-only until restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, raised by the (external) parser and propagated.
    Syntax,
    /// Unknown table/column, type mismatch, ambiguous reference.
    Semantic,
    /// PK/unique duplicate, FK violation, NOT NULL violation, CHECK failure.
    ConstraintViolation,
    /// Deadlock victim, lock timeout, serialization failure. Retriable.
    TxnConflict,
    /// Operation on a transaction that is no longer active.
    TxnNotActive,
    /// Disk I/O failure or corruption (checksum mismatch, invalid node).
    Storage,
    /// Memory budget exceeded with no spill option remaining.
    Capacity,
    /// Statement timeout or explicit cancellation.
    Cancelled,
    /// Invariant violated. Must never be observable under well-formed input.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Semantic => "semantic",
            ErrorKind::ConstraintViolation => "constraint violation",
            ErrorKind::TxnConflict => "transaction conflict",
            ErrorKind::TxnNotActive => "transaction not active",
            ErrorKind::Storage => "storage",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct GraniteError {
    kind: ErrorKind,
    details: String,
}

impl GraniteError {
    pub fn new(kind: ErrorKind, msg: &str) -> GraniteError {
        GraniteError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn semantic(msg: &str) -> GraniteError {
        Self::new(ErrorKind::Semantic, msg)
    }

    pub fn constraint(msg: &str) -> GraniteError {
        Self::new(ErrorKind::ConstraintViolation, msg)
    }

    pub fn conflict(msg: &str) -> GraniteError {
        Self::new(ErrorKind::TxnConflict, msg)
    }

    pub fn storage(msg: &str) -> GraniteError {
        Self::new(ErrorKind::Storage, msg)
    }

    pub fn internal(msg: &str) -> GraniteError {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn cancelled(msg: &str) -> GraniteError {
        Self::new(ErrorKind::Cancelled, msg)
    }

    pub fn get_kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn get_details(&self) -> &str {
        &self.details
    }

    /// Conflicts are safe to retry from the caller's side; everything
    /// else is not.
    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::TxnConflict
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        log::error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for GraniteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.details)
    }
}

impl Error for GraniteError {}

impl From<io::Error> for GraniteError {
    fn from(e: io::Error) -> Self {
        GraniteError::new(ErrorKind::Storage, &e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraniteError::constraint("duplicate key 42");
        assert_eq!(format!("{}", err), "[constraint violation] duplicate key 42");
        assert!(!err.is_retriable());

        let err = GraniteError::conflict("deadlock victim");
        assert!(err.is_retriable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: GraniteError = io_err.into();
        assert_eq!(err.get_kind(), ErrorKind::Storage);
    }
}
