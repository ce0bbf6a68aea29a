//! Interface to the proxy's REST management API.
//!
//! Only the calls the workspace needs are modelled: SQL connections, query
//! execution and cancellation, schema introspection and ETL steps.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod http;
#[cfg(test)]
pub mod mock;

pub use http::HttpApi;

/// Handle returned by the proxy when a SQL connection is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub id: String,
    pub token: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub db: Option<String>,
    /// Server-side idle timeout of the connection in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Credentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            db: None,
            timeout: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"*****")
            .field("db", &self.db)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Table,
    View,
}

/// A schema object that can be browsed or migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaObject {
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
}

impl SchemaObject {
    pub fn table(schema: &str, name: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            kind: ObjectKind::Table,
        }
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// `data.attributes` of a query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Option<Vec<StatementPayload>>,
    #[serde(default)]
    pub execution_time: Option<f64>,
    /// Set instead of `results` when the proxy reports a request-level
    /// failure or an interrupted query.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errno: Option<i64>,
}

/// Outcome of one statement as the proxy reports it. Exactly one of the
/// row-set, affected-rows or error groups is expected to be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementPayload {
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub data: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default)]
    pub complete: Option<bool>,
    #[serde(default)]
    pub affected_rows: Option<u64>,
    #[serde(default)]
    pub last_insert_id: Option<u64>,
    #[serde(default)]
    pub warnings: Option<u64>,
    #[serde(default)]
    pub errno: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub sqlstate: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("Management API is unreachable: {0}")]
    Unreachable(String),

    /// A control request got no answer in time. The connection itself may
    /// still be fine.
    #[error("Request timed out: {0}")]
    TimedOut(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("SQL connection no longer exists on the proxy")]
    ConnectionGone,

    #[error("Unexpected response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// True when the failure means the connection token cannot be used again.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ApiError::Unreachable(_) | ApiError::ConnectionGone)
    }

    pub fn code(&self) -> Option<String> {
        match self {
            ApiError::Rejected { code, status, .. } => {
                code.clone().or_else(|| Some(status.to_string()))
            }
            ApiError::Unauthorized(_) => Some("401".to_string()),
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Open a SQL connection to `target` (a server, service or listener name).
    async fn open_connection(
        &self,
        target: &str,
        credentials: &Credentials,
    ) -> ApiResult<ConnectionHandle>;

    /// Liveness check. `Ok(false)` means the proxy no longer knows the token.
    async fn ping(&self, conn: &ConnectionHandle) -> ApiResult<bool>;

    async fn close_connection(&self, conn: &ConnectionHandle) -> ApiResult<()>;

    async fn execute(
        &self,
        conn: &ConnectionHandle,
        sql: &str,
        max_rows: u64,
    ) -> ApiResult<QueryResponse>;

    /// Ask the proxy to kill the statement running on `conn`.
    async fn cancel(&self, conn: &ConnectionHandle) -> ApiResult<()>;

    async fn list_schema_objects(&self, conn: &ConnectionHandle) -> ApiResult<Vec<SchemaObject>>;

    /// Create `object` on the destination from the source definition.
    async fn etl_create(
        &self,
        source: &ConnectionHandle,
        destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()>;

    /// Copy the rows of `object` from source to destination.
    async fn etl_migrate(
        &self,
        source: &ConnectionHandle,
        destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()>;
}
