use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::history::{QueryHistoryEntry, QueryLog, QuerySnippet};
use super::preferences::Preferences;
use crate::error::PersistenceError;
use crate::logging;
use crate::session::{
    EtlLogEntry, EtlTask, EtlTaskId, EtlTaskStage, QueryEditor, QueryEditorId, QueryTab,
    QueryTabId, QueryTabStatus, SchemaSidebar, SessionStore, Worksheet, WorksheetId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTabLayout {
    pub id: QueryTabId,
    pub name: String,
    #[serde(default)]
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEditorLayout {
    pub id: QueryEditorId,
    #[serde(default)]
    pub active_query_tab_id: Option<QueryTabId>,
    #[serde(default)]
    pub query_tabs: Vec<QueryTabLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlTaskLayout {
    pub id: EtlTaskId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub logs: Vec<EtlLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorksheetLayout {
    pub id: WorksheetId,
    pub name: String,
    #[serde(default)]
    pub query_editor: Option<QueryEditorLayout>,
    #[serde(default)]
    pub etl_task: Option<EtlTaskLayout>,
}

/// Everything that survives a reload. Connection tokens, results, run status
/// and schema trees are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableSnapshot {
    pub worksheets: Vec<WorksheetLayout>,
    pub active_worksheet_id: Option<WorksheetId>,
    pub query_history: Vec<QueryHistoryEntry>,
    pub query_snippets: Vec<QuerySnippet>,
    pub preferences: Preferences,
}

fn field<T: DeserializeOwned + Default>(
    object: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> T {
    let Some(value) = object.remove(key) else {
        return T::default();
    };
    serde_json::from_value(value).unwrap_or_else(|err| {
        logging::warn(&format!("Ignoring unreadable persisted `{}`: {}", key, err));
        T::default()
    })
}

impl DurableSnapshot {
    pub fn capture(store: &SessionStore, log: &QueryLog, preferences: &Preferences) -> Self {
        let worksheets = store
            .worksheets()
            .map(|wke| WorksheetLayout {
                id: wke.id.clone(),
                name: wke.name.clone(),
                query_editor: wke
                    .query_editor_id
                    .as_ref()
                    .and_then(|id| store.query_editor(id).ok())
                    .map(|editor| QueryEditorLayout {
                        id: editor.id.clone(),
                        active_query_tab_id: editor.active_query_tab_id.clone(),
                        query_tabs: store
                            .query_tabs_of(&editor.id)
                            .unwrap_or_default()
                            .into_iter()
                            .map(|tab| QueryTabLayout {
                                id: tab.id.clone(),
                                name: tab.name.clone(),
                                sql: tab.sql.clone(),
                            })
                            .collect(),
                    }),
                etl_task: wke
                    .etl_task_id
                    .as_ref()
                    .and_then(|id| store.etl_task(id).ok())
                    .map(|task| EtlTaskLayout {
                        id: task.id.clone(),
                        name: task.name.clone(),
                        created_at: task.created_at,
                        logs: task.logs.clone(),
                    }),
            })
            .collect();

        Self {
            worksheets,
            active_worksheet_id: store.active_worksheet_id().cloned(),
            query_history: log.history.clone(),
            query_snippets: log.snippets.clone(),
            preferences: preferences.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Lenient parse: a missing or unreadable key falls back to its default
    /// without discarding the others.
    pub fn from_json(raw: &str) -> Result<Self, PersistenceError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let serde_json::Value::Object(mut object) = value else {
            return Err(PersistenceError::Corrupt("expected a JSON object".into()));
        };
        Ok(Self {
            worksheets: field(&mut object, "worksheets"),
            active_worksheet_id: field(&mut object, "active_worksheet_id"),
            query_history: field(&mut object, "query_history"),
            query_snippets: field(&mut object, "query_snippets"),
            preferences: field(&mut object, "preferences"),
        })
    }

    /// Rebuilds a session from the layout, repairing what does not hold
    /// together: duplicate ids are dropped, an editor without tabs gets a
    /// blank one, stale active pointers are reset, and an empty layout
    /// yields the default worksheet.
    pub fn into_session(self) -> (SessionStore, QueryLog, Preferences) {
        let mut store = SessionStore::new();
        let mut seen: HashSet<String> = HashSet::new();

        for layout in self.worksheets {
            if !seen.insert(layout.id.to_string()) {
                logging::warn(&format!("Dropping duplicate worksheet {}", layout.id));
                continue;
            }
            let editor = layout
                .query_editor
                .filter(|el| seen.insert(el.id.to_string()))
                .map(|el| restore_editor(el, &layout.id, &mut seen));
            let etl_task = layout
                .etl_task
                .filter(|tl| seen.insert(tl.id.to_string()))
                .map(|tl| EtlTask {
                    id: tl.id,
                    worksheet_id: layout.id.clone(),
                    name: tl.name,
                    created_at: tl.created_at,
                    source_connection_id: None,
                    destination_connection_id: None,
                    stage: EtlTaskStage::Init,
                    objects: Vec::new(),
                    logs: tl.logs,
                });

            let worksheet = Worksheet {
                id: layout.id,
                name: layout.name,
                query_editor_id: editor.as_ref().map(|(e, _)| e.id.clone()),
                etl_task_id: etl_task.as_ref().map(|t| t.id.clone()),
            };
            store.insert_restored(worksheet, editor, etl_task);
        }

        if store.worksheet_count() == 0 {
            store = SessionStore::with_default_worksheet();
        } else {
            store.restore_active_worksheet(self.active_worksheet_id);
        }

        let log = QueryLog {
            history: self.query_history,
            snippets: self.query_snippets,
        };
        (store, log, self.preferences)
    }
}

fn restore_editor(
    layout: QueryEditorLayout,
    worksheet_id: &WorksheetId,
    seen: &mut HashSet<String>,
) -> (QueryEditor, Vec<QueryTab>) {
    let mut tabs: Vec<QueryTab> = layout
        .query_tabs
        .into_iter()
        .filter(|tl| seen.insert(tl.id.to_string()))
        .map(|tl| QueryTab {
            id: tl.id,
            query_editor_id: layout.id.clone(),
            name: tl.name,
            sql: tl.sql,
            connection_id: None,
            status: QueryTabStatus::Idle,
            result: None,
        })
        .collect();
    if tabs.is_empty() {
        tabs.push(QueryTab::new(layout.id.clone(), "Query Tab 1".to_string()));
    }

    let active_query_tab_id = layout
        .active_query_tab_id
        .filter(|id| tabs.iter().any(|t| &t.id == id))
        .or_else(|| tabs.first().map(|t| t.id.clone()));
    let editor = QueryEditor {
        id: layout.id,
        worksheet_id: worksheet_id.clone(),
        query_tab_ids: tabs.iter().map(|t| t.id.clone()).collect(),
        active_query_tab_id,
        schema_sidebar: SchemaSidebar::default(),
    };
    (editor, tabs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionId, ConnectionOwner};

    fn sample_store() -> SessionStore {
        let mut store = SessionStore::new();
        let first = store.add_query_worksheet("Reports");
        let editor = store.worksheet(&first).unwrap().query_editor_id.clone().unwrap();
        let tab = store.add_query_tab(&editor, Some("daily")).unwrap();
        store.set_query_tab_sql(&tab, "SELECT * FROM orders").unwrap();
        store
            .set_owner_connection(&ConnectionOwner::QueryTab(tab), Some(ConnectionId::from("c1")))
            .unwrap();
        store.add_etl_worksheet("Migration");
        store.set_active_worksheet(&first).unwrap();
        store
    }

    #[test]
    fn test_capture_restore_capture_is_stable() {
        let store = sample_store();
        let log = QueryLog::default();
        let prefs = Preferences::default();

        let snapshot = DurableSnapshot::capture(&store, &log, &prefs);
        let parsed = DurableSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);

        let (restored, log2, prefs2) = parsed.into_session();
        assert!(restored.is_consistent());
        assert_eq!(DurableSnapshot::capture(&restored, &log2, &prefs2), snapshot);
    }

    #[test]
    fn test_restore_drops_transient_state() {
        let store = sample_store();
        let snapshot = DurableSnapshot::capture(&store, &QueryLog::default(), &Preferences::default());
        let (restored, _, _) = snapshot.into_session();

        let tabs: Vec<_> = restored
            .active_query_editor()
            .map(|e| restored.query_tabs_of(&e.id).unwrap())
            .unwrap();
        assert_eq!(tabs.len(), 2);
        assert!(tabs.iter().all(|t| t.connection_id.is_none() && t.result.is_none()));
        assert_eq!(tabs[1].sql, "SELECT * FROM orders");
        assert!(restored.etl_tasks().all(|t| t.stage == EtlTaskStage::Init));
    }

    #[test]
    fn test_missing_keys_default() {
        let snapshot = DurableSnapshot::from_json(r#"{"query_snippets": []}"#).unwrap();
        assert!(snapshot.query_history.is_empty());
        assert!(snapshot.worksheets.is_empty());

        let (store, log, _) = snapshot.into_session();
        assert_eq!(store.worksheet_count(), 1);
        assert_eq!(store.active_worksheet().unwrap().name, "WORKSHEET");
        assert!(log.history.is_empty());
    }

    #[test]
    fn test_unreadable_key_keeps_the_rest() {
        let raw = r#"{
            "worksheets": 42,
            "query_snippets": [{"date": 0, "time": "00:00:00", "name": "s", "sql": "SELECT 1"}]
        }"#;
        let snapshot = DurableSnapshot::from_json(raw).unwrap();
        assert!(snapshot.worksheets.is_empty());
        assert_eq!(snapshot.query_snippets.len(), 1);

        assert!(DurableSnapshot::from_json("not json").is_err());
        assert!(DurableSnapshot::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_restore_repairs_layout() {
        let raw = r#"{
            "worksheets": [
                {"id": "w1", "name": "A", "query_editor": {"id": "e1", "active_query_tab_id": "gone", "query_tabs": []}},
                {"id": "w1", "name": "dup"},
                {"id": "w2", "name": "B", "query_editor": {"id": "e2", "active_query_tab_id": "t2",
                    "query_tabs": [{"id": "t1", "name": "one"}, {"id": "t1", "name": "dup"}, {"id": "t2", "name": "two"}]}}
            ],
            "active_worksheet_id": "missing"
        }"#;
        let (store, _, _) = DurableSnapshot::from_json(raw).unwrap().into_session();

        assert!(store.is_consistent());
        assert_eq!(store.worksheet_count(), 2);
        assert_eq!(store.active_worksheet_id(), Some(&WorksheetId::from("w1")));
        assert_eq!(store.active_query_tab().unwrap().name, "Query Tab 1");

        let tabs = store.query_tabs_of(&QueryEditorId::from("e2")).unwrap();
        let names: Vec<_> = tabs.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert_eq!(
            store.query_editor(&QueryEditorId::from("e2")).unwrap().active_query_tab_id,
            Some(QueryTabId::from("t2"))
        );
    }
}
