//! Durable workspace state: layout, query history, snippets, preferences and
//! the file-handle side table.
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

pub mod file_handles;
pub mod history;
pub mod preferences;
pub mod snapshot;
pub mod storage;

pub use file_handles::{FileHandle, FileHandleTable};
pub use history::{QueryHistoryEntry, QueryLog, QueryLogAction, QueryLogType, QuerySnippet};
pub use preferences::Preferences;
pub use snapshot::DurableSnapshot;
pub use storage::{FileStore, KeyValueStore, MemoryStore};

use crate::error::PersistenceError;
use crate::logging;
use crate::query::QueryResult;
use crate::session::{QueryTab, QueryTabId, SessionStore};

pub const WORKSPACE_KEY: &str = "querydeck/workspace";
pub const FILE_HANDLES_KEY: &str = "querydeck/file_handles";

/// Serializes the durable subset of a session and owns the state that lives
/// beside it (history, snippets, preferences, file handles).
pub struct PersistenceAdapter {
    backend: Arc<dyn KeyValueStore>,
    log: Mutex<QueryLog>,
    preferences: Mutex<Preferences>,
    file_handles: Mutex<FileHandleTable>,
    history_max_entries: usize,
}

impl PersistenceAdapter {
    pub fn new(backend: Arc<dyn KeyValueStore>, history_max_entries: usize) -> Self {
        Self {
            backend,
            log: Mutex::new(QueryLog::default()),
            preferences: Mutex::new(Preferences::default()),
            file_handles: Mutex::new(FileHandleTable::default()),
            history_max_entries,
        }
    }

    pub fn snapshot(&self, store: &SessionStore) -> DurableSnapshot {
        DurableSnapshot::capture(store, &self.log.lock(), &self.preferences.lock())
    }

    /// Installs history and preferences from `snapshot` and returns the
    /// rebuilt session. Expired history is cleared on the way in.
    pub fn restore(&self, snapshot: DurableSnapshot) -> SessionStore {
        let (store, mut log, mut preferences) = snapshot.into_session();
        if log.auto_clear(&mut preferences, Utc::now()) {
            logging::info("Query history expired and was cleared");
        }
        log.history.truncate(self.history_max_entries);
        *self.log.lock() = log;
        *self.preferences.lock() = preferences;
        store
    }

    /// Reads persisted state. Never fails: unreadable state is logged and
    /// replaced by defaults.
    pub async fn load(&self) -> SessionStore {
        match self.backend.get(FILE_HANDLES_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<FileHandleTable>(&raw) {
                Ok(table) => *self.file_handles.lock() = table,
                Err(err) => logging::warn(&format!("Ignoring unreadable file handles: {}", err)),
            },
            Ok(None) => {}
            Err(err) => logging::handle_non_critical_error(&err),
        }

        let snapshot = match self.backend.get(WORKSPACE_KEY).await {
            Ok(Some(raw)) => DurableSnapshot::from_json(&raw).unwrap_or_else(|err| {
                logging::error(&format!("Starting with a blank workspace: {}", err));
                DurableSnapshot::default()
            }),
            Ok(None) => DurableSnapshot::default(),
            Err(err) => {
                logging::handle_non_critical_error(&err);
                DurableSnapshot::default()
            }
        };
        self.restore(snapshot)
    }

    pub async fn save(&self, store: &Mutex<SessionStore>) -> Result<(), PersistenceError> {
        let raw = {
            let store = store.lock();
            self.snapshot(&store).to_json()?
        };
        self.backend.set(WORKSPACE_KEY, &raw).await?;
        logging::debug(&format!("Saved workspace state ({} bytes)", raw.len()));
        Ok(())
    }

    /// An empty table removes the key instead of storing `{}`.
    async fn save_file_handles(&self) -> Result<(), PersistenceError> {
        let raw = {
            let table = self.file_handles.lock();
            if table.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&*table)?)
            }
        };
        match raw {
            Some(raw) => self.backend.set(FILE_HANDLES_KEY, &raw).await,
            None => self.backend.remove(FILE_HANDLES_KEY).await,
        }
    }

    // ---- query log ----

    pub fn record_query(&self, result: &QueryResult, connection_name: &str) {
        let entry = QueryHistoryEntry::from_result(result, connection_name);
        self.log.lock().push_history(entry, self.history_max_entries);
    }

    /// Logs a statement the workspace ran on its own behalf.
    pub fn record_action(&self, name: &str, sql: &str, response: &str, connection_name: &str) {
        let entry = QueryHistoryEntry::action(name, sql, response, connection_name, Utc::now());
        self.log.lock().push_history(entry, self.history_max_entries);
    }

    pub fn history(&self) -> Vec<QueryHistoryEntry> {
        self.log.lock().history.clone()
    }

    pub fn remove_history_entry(&self, index: usize) -> Option<QueryHistoryEntry> {
        self.log.lock().remove_history(index)
    }

    pub fn clear_history(&self) {
        self.log.lock().history.clear();
    }

    pub fn snippets(&self) -> Vec<QuerySnippet> {
        self.log.lock().snippets.clone()
    }

    pub fn add_snippet(&self, name: &str, sql: &str) -> QuerySnippet {
        let snippet = QuerySnippet::new(name, sql, Utc::now());
        self.log.lock().push_snippet(snippet.clone());
        snippet
    }

    pub fn remove_snippet(&self, index: usize) -> Option<QuerySnippet> {
        self.log.lock().remove_snippet(index)
    }

    // ---- preferences ----

    pub fn preferences(&self) -> Preferences {
        self.preferences.lock().clone()
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        *self.preferences.lock() = preferences;
    }

    // ---- file handles ----

    pub fn file_handle(&self, tab_id: &QueryTabId) -> Option<FileHandle> {
        self.file_handles.lock().get(tab_id).cloned()
    }

    pub async fn set_file_handle(
        &self,
        tab_id: &QueryTabId,
        handle: FileHandle,
    ) -> Result<(), PersistenceError> {
        self.file_handles.lock().set(tab_id.clone(), handle);
        self.save_file_handles().await
    }

    /// Drops side-table entries of closed tabs. Failures are logged only.
    pub async fn drop_file_handles(&self, tab_ids: &[QueryTabId]) {
        if !self.file_handles.lock().remove(tab_ids) {
            return;
        }
        if let Err(err) = self.save_file_handles().await {
            logging::handle_non_critical_error(&err);
        }
    }

    pub fn is_query_tab_unsaved(&self, tab: &QueryTab) -> bool {
        self.file_handles.lock().is_unsaved(tab)
    }
}
