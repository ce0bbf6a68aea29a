use thiserror::Error;

use crate::api::ApiError;
use crate::session::ConnectionId;

/// Failures of the connection lifecycle. Surfaced to the user immediately and
/// never retried; the affected query tab ends up unbound.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("Query tab is not bound to a connection")]
    Unbound,

    #[error("Failed to connect to {target}: {message}")]
    OpenFailed {
        target: String,
        code: Option<String>,
        message: String,
    },

    #[error("Connection {0} is no longer alive")]
    Dead(ConnectionId),

    #[error("Connection {0} is owned by another worksheet")]
    InUse(ConnectionId),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistenceError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Failed to serialize workspace state: {0}")]
    Serialize(String),

    #[error("Persisted workspace state is corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialize(err.to_string())
    }
}

/// Error type of every workspace operation.
///
/// Statement failures (`QueryError`) and per-object ETL failures
/// (`EtlObjectError`) are not in here: they are data attached to entities.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Request to the management API failed: {0}")]
    Api(#[from] ApiError),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl WorkspaceError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        WorkspaceError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
