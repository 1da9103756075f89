//! Error types for the gridstore workspace
//!
//! A single taxonomy shared by the grid substrate, the durable persistence
//! layer, and the engine. We use `thiserror` for the `Display`/`Error`
//! implementations.

use std::io;
use thiserror::Error;

/// Result type alias for gridstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the persistence engine
#[derive(Debug, Error)]
pub enum Error {
    /// Re-commit attempted on an already-committed transaction.
    /// Programmer error, not recoverable.
    #[error("transaction already committed")]
    Committed,

    /// An optimistic update's stored copy is newer than the in-hand copy.
    /// Recoverable: the whole transaction is abandoned, nothing is applied.
    #[error("stale optimistic update: {unit_name}/{id}")]
    Stale {
        /// Unit the conflicting record lives in
        unit_name: String,
        /// Conflicting record ID
        id: i64,
    },

    /// A filter references a field absent from the entity's field registry.
    /// Fails fast before any I/O.
    #[error("unknown field '{field}' for entity '{entity}'")]
    UnknownField {
        /// Field name referenced by the filter
        field: String,
        /// Entity type the filter was validated against
        entity: String,
    },

    /// An insert collided with an existing key. Fatal defect in ID
    /// generation, not retried.
    #[error("bad ID generator: key {unit_name}/{id} already exists")]
    BadIdGenerator {
        /// Unit the collision happened in
        unit_name: String,
        /// Colliding record ID
        id: i64,
    },

    /// A conventional operation was staged before a later-numbered in-place
    /// update. The in-place path executes first and cannot be reordered.
    #[error("in-place updates must precede all conventional operations")]
    InPlaceOrdering,

    /// Durable (disk) persistence provider failure
    #[error("persistence provider error: {0}")]
    Provider(String),

    /// Grid storage provider failure
    #[error("grid storage error: {0}")]
    Grid(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (backup files, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid engine or persister configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_stale() {
        let err = Error::Stale {
            unit_name: "Account___0".to_string(),
            id: 42,
        };
        let msg = err.to_string();
        assert!(msg.contains("stale"));
        assert!(msg.contains("Account___0/42"));
    }

    #[test]
    fn test_display_unknown_field() {
        let err = Error::UnknownField {
            field: "nickname".to_string(),
            entity: "Account".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nickname"));
        assert!(msg.contains("Account"));
    }

    #[test]
    fn test_display_bad_id_generator() {
        let err = Error::BadIdGenerator {
            unit_name: "Account___0".to_string(),
            id: 7,
        };
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing backup");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_serde_json() {
        let result: std::result::Result<i64, serde_json::Error> =
            serde_json::from_str("not json");
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_committed_matches() {
        fn commit_twice() -> Result<()> {
            Err(Error::Committed)
        }
        assert!(matches!(commit_twice(), Err(Error::Committed)));
    }
}
