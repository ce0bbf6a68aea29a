use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::preferences::{history_expiry_from, Preferences};
use crate::query::{mask_query_pwd, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLogType {
    /// Statements the user ran.
    UserLogs,
    /// Statements the workspace ran on the user's behalf (ETL, schema loads).
    ActionLogs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogAction {
    /// Masked SQL, or the action name for `ActionLogs`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub response: String,
    /// Seconds with four decimals. Absent for interrupted queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<String>,
    #[serde(rename = "type")]
    pub log_type: QueryLogType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHistoryEntry {
    /// Unix time in milliseconds.
    pub date: i64,
    pub connection_name: String,
    /// Local `HH:MM:SS` of `date`.
    pub time: String,
    pub action: QueryLogAction,
}

fn local_time(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

impl QueryHistoryEntry {
    pub fn from_result(result: &QueryResult, connection_name: &str) -> Self {
        let date = result.started_at.timestamp_millis();
        Self {
            date,
            connection_name: connection_name.to_string(),
            time: local_time(date),
            action: QueryLogAction {
                name: mask_query_pwd(&result.sql),
                sql: None,
                response: result.summary(),
                execution_time: result.execution_time.map(|t| format!("{:.4}", t)),
                log_type: QueryLogType::UserLogs,
            },
        }
    }

    pub fn action(
        name: &str,
        sql: &str,
        response: &str,
        connection_name: &str,
        at: DateTime<Utc>,
    ) -> Self {
        let date = at.timestamp_millis();
        Self {
            date,
            connection_name: connection_name.to_string(),
            time: local_time(date),
            action: QueryLogAction {
                name: name.to_string(),
                sql: Some(mask_query_pwd(sql)),
                response: response.to_string(),
                execution_time: None,
                log_type: QueryLogType::ActionLogs,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySnippet {
    pub date: i64,
    pub time: String,
    pub name: String,
    pub sql: String,
}

impl QuerySnippet {
    pub fn new(name: &str, sql: &str, at: DateTime<Utc>) -> Self {
        let date = at.timestamp_millis();
        Self {
            date,
            time: local_time(date),
            name: name.to_string(),
            sql: mask_query_pwd(sql),
        }
    }
}

/// Query history and snippets, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryLog {
    pub history: Vec<QueryHistoryEntry>,
    pub snippets: Vec<QuerySnippet>,
}

impl QueryLog {
    pub fn push_history(&mut self, entry: QueryHistoryEntry, max_entries: usize) {
        self.history.insert(0, entry);
        self.history.truncate(max_entries);
    }

    pub fn push_snippet(&mut self, snippet: QuerySnippet) {
        self.snippets.insert(0, snippet);
    }

    pub fn remove_snippet(&mut self, index: usize) -> Option<QuerySnippet> {
        (index < self.snippets.len()).then(|| self.snippets.remove(index))
    }

    pub fn remove_history(&mut self, index: usize) -> Option<QueryHistoryEntry> {
        (index < self.history.len()).then(|| self.history.remove(index))
    }

    /// Empties the history once its expiry time has passed and starts a new
    /// expiry period. Returns whether anything was cleared.
    pub fn auto_clear(&mut self, preferences: &mut Preferences, now: DateTime<Utc>) -> bool {
        if now.timestamp() < preferences.query_history_expired_time {
            return false;
        }
        self.history.clear();
        preferences.query_history_expired_time = history_expiry_from(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryOutcome;
    use chrono::Duration;

    fn result(sql: &str) -> QueryResult {
        QueryResult {
            sql: sql.to_string(),
            started_at: Utc::now(),
            execution_time: Some(0.123456),
            outcomes: vec![QueryOutcome::RowCount {
                affected_rows: 0,
                last_insert_id: None,
                warnings: 0,
            }],
        }
    }

    #[test]
    fn test_history_entry_masks_sql() {
        let entry = QueryHistoryEntry::from_result(
            &result("CREATE USER 'a'@'%' IDENTIFIED BY 'topsecret'"),
            "server1",
        );
        assert!(!entry.action.name.contains("topsecret"));
        assert_eq!(entry.action.execution_time.as_deref(), Some("0.1235"));
        assert_eq!(entry.action.response, "Result 1: 0 rows affected.");
        assert_eq!(entry.action.log_type, QueryLogType::UserLogs);
        assert_eq!(entry.time.len(), 8);
    }

    #[test]
    fn test_history_is_capped_newest_first() {
        let mut log = QueryLog::default();
        for i in 0..5 {
            log.push_history(
                QueryHistoryEntry::from_result(&result(&format!("SELECT {}", i)), "s"),
                3,
            );
        }
        let names: Vec<_> = log.history.iter().map(|e| e.action.name.as_str()).collect();
        assert_eq!(names, vec!["SELECT 4", "SELECT 3", "SELECT 2"]);
    }

    #[test]
    fn test_auto_clear_after_expiry() {
        let mut log = QueryLog::default();
        log.push_history(QueryHistoryEntry::from_result(&result("SELECT 1"), "s"), 10);
        let mut prefs = Preferences::default();
        let now = Utc::now();

        assert!(!log.auto_clear(&mut prefs, now));
        assert_eq!(log.history.len(), 1);

        let later = now + Duration::days(31);
        assert!(log.auto_clear(&mut prefs, later));
        assert!(log.history.is_empty());
        assert_eq!(prefs.query_history_expired_time, history_expiry_from(later));
    }

    #[test]
    fn test_snippets() {
        let mut log = QueryLog::default();
        log.push_snippet(QuerySnippet::new("first", "SELECT 1", Utc::now()));
        log.push_snippet(QuerySnippet::new("second", "SET PASSWORD = 'x'", Utc::now()));
        assert_eq!(log.snippets[0].name, "second");
        assert_eq!(log.snippets[0].sql, "SET PASSWORD = '*****'");
        assert!(log.remove_snippet(5).is_none());
        assert_eq!(log.remove_snippet(1).unwrap().name, "first");
        assert_eq!(log.snippets.len(), 1);
    }
}
