use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, QueryResponse, StatementPayload};
use crate::error::WorkspaceError;

/// Message the proxy reports for a statement killed by a cancel request.
pub const QUERY_CANCELED: &str = "Query execution was interrupted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub fields: Vec<String>,
    pub data: Vec<Vec<serde_json::Value>>,
    /// False when the row limit truncated the result.
    pub complete: bool,
}

/// A statement-level failure. Attached to the tab's result, never returned
/// as an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub errno: Option<i64>,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl QueryError {
    pub fn describe(&self) -> String {
        let mut text = match self.errno {
            Some(errno) => format!("Error {}: {}", errno, self.message),
            None => format!("Error: {}", self.message),
        };
        if let Some(sqlstate) = &self.sqlstate {
            text.push_str(&format!(" (SQLSTATE {})", sqlstate));
        }
        text
    }
}

impl From<&ApiError> for QueryError {
    fn from(err: &ApiError) -> Self {
        QueryError {
            errno: None,
            sqlstate: None,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOutcome {
    ResultSet(ResultSet),
    RowCount {
        affected_rows: u64,
        last_insert_id: Option<u64>,
        warnings: u64,
    },
    Error(QueryError),
    Canceled,
}

impl QueryOutcome {
    fn from_statement(payload: StatementPayload) -> Result<Self, WorkspaceError> {
        if payload.message.as_deref() == Some(QUERY_CANCELED) {
            return Ok(QueryOutcome::Canceled);
        }
        if let Some(data) = payload.data {
            return Ok(QueryOutcome::ResultSet(ResultSet {
                fields: payload.fields.unwrap_or_default(),
                data,
                complete: payload.complete.unwrap_or(true),
            }));
        }
        if payload.errno.is_some() {
            return Ok(QueryOutcome::Error(QueryError {
                errno: payload.errno,
                sqlstate: payload.sqlstate,
                message: payload.message.unwrap_or_default(),
            }));
        }
        if let Some(affected_rows) = payload.affected_rows {
            return Ok(QueryOutcome::RowCount {
                affected_rows,
                last_insert_id: payload.last_insert_id,
                warnings: payload.warnings.unwrap_or(0),
            });
        }
        Err(WorkspaceError::MalformedResponse(
            "statement result has neither rows, an affected-row count nor an error".into(),
        ))
    }
}

/// Snapshot of the last finished execution of a query tab. Replaced as a
/// whole by the next execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub sql: String,
    pub started_at: DateTime<Utc>,
    /// Seconds, as measured by the proxy. Absent for interrupted queries.
    pub execution_time: Option<f64>,
    pub outcomes: Vec<QueryOutcome>,
}

impl QueryResult {
    pub fn canceled(sql: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            sql: sql.to_string(),
            started_at,
            execution_time: None,
            outcomes: vec![QueryOutcome::Canceled],
        }
    }

    pub fn from_api_error(sql: &str, started_at: DateTime<Utc>, err: &ApiError) -> Self {
        Self {
            sql: sql.to_string(),
            started_at,
            execution_time: None,
            outcomes: vec![QueryOutcome::Error(QueryError::from(err))],
        }
    }

    pub fn from_response(
        sql: &str,
        started_at: DateTime<Utc>,
        response: QueryResponse,
    ) -> Result<Self, WorkspaceError> {
        let outcomes = match response.results {
            Some(results) => results
                .into_iter()
                .map(QueryOutcome::from_statement)
                .collect::<Result<Vec<_>, _>>()?,
            None => match response.message {
                Some(message) if message == QUERY_CANCELED => vec![QueryOutcome::Canceled],
                Some(message) => vec![QueryOutcome::Error(QueryError {
                    errno: response.errno,
                    sqlstate: None,
                    message,
                })],
                None => {
                    return Err(WorkspaceError::MalformedResponse(
                        "query response has neither results nor a message".into(),
                    ))
                }
            },
        };

        Ok(Self {
            sql: sql.to_string(),
            started_at,
            execution_time: response.execution_time,
            outcomes,
        })
    }

    pub fn is_canceled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, QueryOutcome::Canceled))
    }

    pub fn has_error(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, QueryOutcome::Error(_)))
    }

    pub fn result_sets(&self) -> impl Iterator<Item = &ResultSet> {
        self.outcomes.iter().filter_map(|o| match o {
            QueryOutcome::ResultSet(rs) => Some(rs),
            _ => None,
        })
    }

    /// One line per statement, the form kept in the query history.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.outcomes.len());
        let mut result_sets = 0;
        let mut counts = 0;
        for outcome in &self.outcomes {
            match outcome {
                QueryOutcome::Canceled => lines.push(format!("INTERRUPT: {}", QUERY_CANCELED)),
                QueryOutcome::ResultSet(rs) => {
                    result_sets += 1;
                    lines.push(format!(
                        "Result set {}: {} rows in set.",
                        result_sets,
                        rs.data.len()
                    ));
                }
                QueryOutcome::Error(err) => lines.push(format!("Error: {}", err.describe())),
                QueryOutcome::RowCount { affected_rows, .. } => {
                    counts += 1;
                    lines.push(format!("Result {}: {} rows affected.", counts, affected_rows));
                }
            }
        }
        lines.join("\n")
    }
}
