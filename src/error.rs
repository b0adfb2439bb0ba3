//! Error taxonomy for the capture core
//!
//! Every fallible core operation returns [`Error`]. Driver errors from the two
//! persistence backends are folded into the same small set of kinds so callers
//! (and the HTTP layer) can decide on retry or status code without knowing which
//! backend is active.

use thiserror::Error;

/// Main error type for the capture core
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-supplied data violates a documented contract
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persistence rejected a write (uniqueness or foreign key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Network, file or disk hiccup; safe to retry
    #[error("transient I/O error: {0}")]
    TransientIO(String),

    /// The in-memory replay window is over its cap
    #[error("queue backpressure exceeded: {len} items (cap {cap})")]
    BackpressureExceeded { len: usize, cap: usize },

    /// A dependent subsystem has not finished initialising
    #[error("backend not ready: {0}")]
    BackendNotReady(String),

    /// Read of a non-existent id
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's deadline elapsed
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Anything else (encoding bugs, unexpected driver errors)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for the capture core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the operation that produced this error may be retried as-is
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIO(_))
    }

    /// Short machine-friendly name of the kind, used in logs and JSON bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "InvalidInput",
            Error::ConstraintViolation(_) => "ConstraintViolation",
            Error::TransientIO(_) => "TransientIO",
            Error::BackpressureExceeded { .. } => "BackpressureExceeded",
            Error::BackendNotReady(_) => "BackendNotReady",
            Error::NotFound(_) => "NotFound",
            Error::Timeout(_) => "Timeout",
            Error::Internal(_) => "Internal",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::ConstraintViolation => Error::ConstraintViolation(err.to_string()),
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen => Error::TransientIO(err.to_string()),
                _ => Error::Internal(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<postgres::Error> for Error {
    fn from(err: postgres::Error) -> Self {
        use postgres::error::SqlState;

        if err.is_closed() {
            return Error::TransientIO(err.to_string());
        }
        match err.code() {
            Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
                Error::ConstraintViolation(err.to_string())
            }
            Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
                Error::ConstraintViolation(err.to_string())
            }
            Some(code)
                if *code == SqlState::CONNECTION_EXCEPTION
                    || *code == SqlState::CONNECTION_FAILURE
                    || *code == SqlState::ADMIN_SHUTDOWN
                    || *code == SqlState::T_R_SERIALIZATION_FAILURE =>
            {
                Error::TransientIO(err.to_string())
            }
            Some(_) => Error::Internal(err.to_string()),
            // No SQLSTATE means the failure happened on the wire
            None => Error::TransientIO(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        // r2d2 only fails on checkout timeout / connection establishment
        Error::TransientIO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::TransientIO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_constraint_maps_to_constraint_violation() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY, name TEXT UNIQUE);")
            .unwrap();
        conn.execute("INSERT INTO t VALUES ('a', 'x')", []).unwrap();
        let err: Error = conn
            .execute("INSERT INTO t VALUES ('b', 'x')", [])
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "ConstraintViolation");
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: Error = conn
            .query_row("SELECT 1 WHERE 0", [], |row| row.get::<_, i64>(0))
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_transient_flag() {
        assert!(Error::TransientIO("x".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }
}
