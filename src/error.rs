//! Error types for mbxport.

use thiserror::Error;

/// Main error type for mbxport.
#[derive(Error, Debug)]
pub enum MbxError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The mailbox for a work unit does not exist. Non-fatal: the unit is
    /// skipped with a zero count.
    #[error("No such mailbox: {0}")]
    NoSuchMailbox(String),

    /// A transient upstream fault (timeout, transient server error).
    /// Retried inside the exporter up to the attempt budget.
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// A fault local to one item or attachment. Logged and skipped,
    /// never aborts the enclosing range.
    #[error("Content fault: {0}")]
    Content(String),

    /// The retry budget for a sub-range was exhausted. Fatal for the
    /// whole folder export; the worker re-enqueues the unit.
    #[error("Export failed for {folder}: retry budget exhausted after {attempts} attempts")]
    ExportFailed { folder: String, attempts: u32 },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid user list {path}: {reason}")]
    InvalidUserList { path: String, reason: String },
}

/// Result type alias for mbxport operations.
pub type Result<T> = std::result::Result<T, MbxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_export_failed_message() {
        let err = MbxError::ExportFailed {
            folder: "Inbox".to_string(),
            attempts: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("Inbox"));
        assert!(msg.contains("5 attempts"));
    }

    #[test]
    fn test_no_such_mailbox_message() {
        let err = MbxError::NoSuchMailbox("carol@example.org".to_string());
        assert!(err.to_string().contains("carol@example.org"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: MbxError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_database_error_conversion() {
        // Opening a directory as a database is a reliable rusqlite error
        if let Err(db_err) = rusqlite::Connection::open("/") {
            let err: MbxError = db_err.into();
            assert!(err.to_string().contains("Database"));
        }
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<i32> {
            Err(MbxError::Worker("boom".to_string()))
        }
        assert!(returns_err().is_err());
    }
}
