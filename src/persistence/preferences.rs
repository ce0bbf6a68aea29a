use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Days the query history is kept before it is cleared automatically.
pub const HISTORY_EXPIRY_DAYS: i64 = 30;

pub fn history_expiry_from(now: DateTime<Utc>) -> i64 {
    (now + Duration::days(HISTORY_EXPIRY_DAYS)).timestamp()
}

/// User preference scalars kept across reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Sent as `max_rows` with every query.
    pub query_row_limit: u64,
    /// Ask before running destructive statements.
    pub query_confirm_flag: bool,
    /// Unix time (seconds) at which the history is cleared.
    pub query_history_expired_time: i64,
    pub query_show_sys_schemas_flag: bool,
    pub tab_moves_focus: bool,
    pub max_statements: u64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            query_row_limit: 10000,
            query_confirm_flag: true,
            query_history_expired_time: history_expiry_from(Utc::now()),
            query_show_sys_schemas_flag: true,
            tab_moves_focus: false,
            max_statements: 1000,
        }
    }
}
