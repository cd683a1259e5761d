//! Core error types.

use thiserror::Error;

/// Errors raised by the writer, observers, and observations.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The writer was closed.
    #[error("writer is closed")]
    Closed,

    /// A write was started from inside the writer's serialized context.
    ///
    /// Use `reentrant_write` to write from inside a transaction or an
    /// observer callback.
    #[error("reentrant write: the writer is already executing a write on this thread")]
    ReentrantWrite,

    /// A region was requested for a statement that modifies the database.
    #[error("statement is not read-only: {0}")]
    NotReadOnly(String),

    /// Registering an observer failed.
    #[error("registration failed: {0}")]
    Registration(#[source] Box<Error>),

    /// A consumer callback failed while handling a change notification.
    #[error("callback failed: {0}")]
    Callback(#[source] Box<Error>),

    /// The consumer of a subscription went away.
    #[error("subscriber disconnected")]
    Disconnected,
}

impl Error {
    /// Returns `true` if this error means the writer can no longer be used.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Registration(inner) | Error::Callback(inner) => inner.is_closed(),
            _ => false,
        }
    }
}

/// Result type for regionwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_closed_sees_through_wrappers() {
        assert!(Error::Closed.is_closed());
        assert!(Error::Registration(Box::new(Error::Closed)).is_closed());
        assert!(!Error::Callback(Box::new(Error::Disconnected)).is_closed());
        assert!(!Error::ReentrantWrite.is_closed());
    }

    #[test]
    fn test_display() {
        let err = Error::Registration(Box::new(Error::Closed));
        assert_eq!(err.to_string(), "registration failed: writer is closed");

        let err = Error::NotReadOnly("DELETE FROM player".to_string());
        assert_eq!(err.to_string(), "statement is not read-only: DELETE FROM player");
    }
}
