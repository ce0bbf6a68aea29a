//! The workspace facade: every mutation of a session goes through here.
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::api::{Credentials, ManagementApi, SchemaObject};
use crate::config::WorkspaceSettings;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{ConnectionError, PersistenceError, WorkspaceError, WorkspaceResult};
use crate::etl::EtlOrchestrator;
use crate::logging;
use crate::persistence::{
    FileHandle, KeyValueStore, PersistenceAdapter, Preferences, QueryHistoryEntry, QuerySnippet,
};
use crate::query::{Execution, QueryEngine};
use crate::session::{
    ConnectionId, ConnectionOwner, EtlTaskId, EtlTaskStage, QueryEditorId, QueryTabId,
    Removal, SchemaNode, SessionEvent, SessionStore, WorksheetId, DEFAULT_WORKSHEET_NAME,
};

const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

pub struct Workspace {
    api: Arc<dyn ManagementApi>,
    store: Mutex<SessionStore>,
    registry: ConnectionRegistry,
    engine: QueryEngine,
    etl: EtlOrchestrator,
    persistence: PersistenceAdapter,
}

impl Workspace {
    fn with_store(
        api: Arc<dyn ManagementApi>,
        store: SessionStore,
        persistence: PersistenceAdapter,
        settings: &WorkspaceSettings,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(api.clone(), settings.probe_after_idle()),
            engine: QueryEngine::new(api.clone(), settings.cancel_timeout()),
            etl: EtlOrchestrator::new(
                api.clone(),
                settings.etl_concurrency,
                settings.cancel_timeout(),
            ),
            api,
            store: Mutex::new(store),
            persistence,
        }
    }

    /// A fresh session with one blank worksheet. Nothing is read from storage.
    pub fn new(
        api: Arc<dyn ManagementApi>,
        backend: Arc<dyn KeyValueStore>,
        settings: &WorkspaceSettings,
    ) -> Self {
        let persistence = PersistenceAdapter::new(backend, settings.history_max_entries);
        Self::with_store(api, SessionStore::with_default_worksheet(), persistence, settings)
    }

    /// Restores the persisted session, or a blank one if there is none.
    pub async fn open(
        api: Arc<dyn ManagementApi>,
        backend: Arc<dyn KeyValueStore>,
        settings: &WorkspaceSettings,
    ) -> Self {
        let persistence = PersistenceAdapter::new(backend, settings.history_max_entries);
        let store = persistence.load().await;
        logging::info(&format!(
            "Workspace opened with {} worksheets",
            store.worksheet_count()
        ));
        Self::with_store(api, store, persistence, settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.lock().subscribe()
    }

    /// Read access to the entity graph.
    pub fn read<R>(&self, f: impl FnOnce(&SessionStore) -> R) -> R {
        f(&self.store.lock())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.registry.connections()
    }

    // ---- worksheets ----

    pub fn new_query_worksheet(&self, name: Option<&str>) -> WorksheetId {
        self.store
            .lock()
            .add_query_worksheet(name.unwrap_or(DEFAULT_WORKSHEET_NAME))
    }

    pub fn new_etl_worksheet(&self, name: &str) -> (WorksheetId, EtlTaskId) {
        self.store.lock().add_etl_worksheet(name)
    }

    pub fn set_active_worksheet(&self, id: &WorksheetId) -> WorkspaceResult<()> {
        self.store.lock().set_active_worksheet(id)
    }

    pub fn rename_worksheet(&self, id: &WorksheetId, name: &str) -> WorkspaceResult<()> {
        self.store.lock().rename_worksheet(id, name)
    }

    /// Closes a worksheet and everything it owns, releasing its connections.
    pub async fn close_worksheet(&self, id: &WorksheetId) -> WorkspaceResult<()> {
        let removal = self.store.lock().remove_worksheet(id)?;
        self.dispose(removal).await;
        Ok(())
    }

    async fn dispose(&self, removal: Removal) {
        self.engine.forget(&removal.query_tab_ids);
        self.etl.forget(&removal.etl_task_ids);
        for conn_id in &removal.connection_ids {
            self.registry.release(conn_id).await;
        }
        self.persistence
            .drop_file_handles(&removal.query_tab_ids)
            .await;
    }

    // ---- query tabs ----

    pub fn add_query_tab(
        &self,
        editor_id: &QueryEditorId,
        name: Option<&str>,
    ) -> WorkspaceResult<QueryTabId> {
        self.store.lock().add_query_tab(editor_id, name)
    }

    pub fn set_active_query_tab(&self, tab_id: &QueryTabId) -> WorkspaceResult<()> {
        self.store.lock().set_active_query_tab(tab_id)
    }

    pub fn rename_query_tab(&self, tab_id: &QueryTabId, name: &str) -> WorkspaceResult<()> {
        self.store.lock().rename_query_tab(tab_id, name)
    }

    pub fn set_query_tab_sql(&self, tab_id: &QueryTabId, sql: &str) -> WorkspaceResult<()> {
        self.store.lock().set_query_tab_sql(tab_id, sql)
    }

    pub async fn close_query_tab(&self, tab_id: &QueryTabId) -> WorkspaceResult<()> {
        let removal = self.store.lock().remove_query_tab(tab_id)?;
        self.dispose(removal).await;
        Ok(())
    }

    /// Opens a connection to `target` and binds it to the tab, releasing
    /// whatever the tab held before.
    pub async fn connect_query_tab(
        &self,
        tab_id: &QueryTabId,
        target: &str,
        credentials: &Credentials,
    ) -> WorkspaceResult<ConnectionId> {
        self.store.lock().query_tab(tab_id)?;
        if self.engine.is_running(tab_id) {
            return Err(WorkspaceError::InvalidState(
                "Cannot change the connection of a running query tab".into(),
            ));
        }
        let connection = self.registry.open(target, credentials).await?;
        let owner = ConnectionOwner::QueryTab(tab_id.clone());
        if let Err(err) = self.registry.bind(&self.store, owner, &connection.id).await {
            self.registry.release(&connection.id).await;
            return Err(err);
        }
        Ok(connection.id)
    }

    /// Releases the tab's connection. A query still running on it is
    /// canceled first, so the tab ends up `Canceled` rather than `Running`.
    pub async fn disconnect_query_tab(&self, tab_id: &QueryTabId) -> WorkspaceResult<()> {
        self.store.lock().query_tab(tab_id)?;
        if self.engine.is_running(tab_id) {
            self.engine.cancel(&self.store, tab_id)?;
        }
        let previous = self
            .store
            .lock()
            .set_owner_connection(&ConnectionOwner::QueryTab(tab_id.clone()), None)?;
        if let Some(conn_id) = previous {
            self.registry.release(&conn_id).await;
        }
        Ok(())
    }

    pub async fn run_query(&self, tab_id: &QueryTabId, sql: &str) -> WorkspaceResult<Execution> {
        self.engine
            .run(&self.store, &self.registry, &self.persistence, tab_id, sql)
            .await
    }

    /// Runs the tab's own editor text.
    pub async fn run_query_tab(&self, tab_id: &QueryTabId) -> WorkspaceResult<Execution> {
        let sql = self.store.lock().query_tab(tab_id)?.sql.clone();
        self.run_query(tab_id, &sql).await
    }

    pub fn cancel_query(&self, tab_id: &QueryTabId) -> WorkspaceResult<()> {
        self.engine.cancel(&self.store, tab_id)
    }

    // ---- schema sidebar ----

    /// Loads the schema tree of the editor's active tab connection.
    pub async fn refresh_schema(&self, editor_id: &QueryEditorId) -> WorkspaceResult<()> {
        let (tab_id, conn_id) = {
            let store = self.store.lock();
            let editor = store.query_editor(editor_id)?;
            let tab_id = editor
                .active_query_tab_id
                .clone()
                .ok_or(ConnectionError::Unbound)?;
            let conn_id = store
                .query_tab(&tab_id)?
                .connection_id
                .clone()
                .ok_or(ConnectionError::Unbound)?;
            (tab_id, conn_id)
        };
        let handle = self.registry.live_handle(&conn_id)?;
        let target = self.registry.get(&conn_id).map(|c| c.target);

        self.store.lock().update_query_editor(editor_id, |editor| {
            editor.schema_sidebar.loading_db_tree = true
        })?;
        let listed = self.api.list_schema_objects(&handle).await;

        let show_system = self.persistence.preferences().query_show_sys_schemas_flag;
        match listed {
            Ok(objects) => {
                let mut schemas: IndexMap<String, Vec<SchemaObject>> = IndexMap::new();
                for object in objects {
                    if !show_system && SYSTEM_SCHEMAS.contains(&object.schema.to_lowercase().as_str()) {
                        continue;
                    }
                    schemas.entry(object.schema.clone()).or_default().push(object);
                }
                let tree = schemas
                    .into_iter()
                    .map(|(schema, objects)| SchemaNode { schema, objects })
                    .collect();
                self.store.lock().update_query_editor(editor_id, |editor| {
                    editor.schema_sidebar.db_tree = tree;
                    editor.schema_sidebar.db_tree_of_conn = target;
                    editor.schema_sidebar.loading_db_tree = false;
                })?;
                self.registry.touch(&conn_id);
                Ok(())
            }
            Err(err) => {
                self.store.lock().update_query_editor(editor_id, |editor| {
                    editor.schema_sidebar.loading_db_tree = false
                })?;
                if err.is_connection_lost() {
                    let owner = ConnectionOwner::QueryTab(tab_id);
                    self.registry.drop_lost(&self.store, &owner, &conn_id).await;
                }
                Err(err.into())
            }
        }
    }

    // ---- ETL ----

    /// Opens a connection not yet owned by anything, for use as an ETL side.
    pub async fn open_connection(
        &self,
        target: &str,
        credentials: &Credentials,
    ) -> WorkspaceResult<Connection> {
        Ok(self.registry.open(target, credentials).await?)
    }

    pub async fn init_etl(
        &self,
        task_id: &EtlTaskId,
        source: &ConnectionId,
        destination: &ConnectionId,
    ) -> WorkspaceResult<()> {
        self.etl
            .init(&self.store, &self.registry, task_id, source, destination)
            .await
    }

    pub async fn list_etl_objects(&self, task_id: &EtlTaskId) -> WorkspaceResult<Vec<SchemaObject>> {
        self.etl.list_objects(&self.store, &self.registry, task_id).await
    }

    pub fn select_etl_objects(
        &self,
        task_id: &EtlTaskId,
        objects: Vec<SchemaObject>,
    ) -> WorkspaceResult<()> {
        self.etl.select_objects(&self.store, task_id, objects)
    }

    pub async fn start_etl(&self, task_id: &EtlTaskId) -> WorkspaceResult<EtlTaskStage> {
        let stage = self.etl.start(&self.store, &self.registry, task_id).await?;

        let (summary, source) = self.read(|store| {
            let task = store.etl_task(task_id).ok()?;
            let source = task
                .source_connection_id
                .as_ref()
                .and_then(|id| self.registry.get(id))
                .map(|c| c.target)
                .unwrap_or_default();
            let objects: Vec<String> = task.objects.iter().map(|o| o.id()).collect();
            Some((format!("{:?}: {}", stage, objects.join(", ")), source))
        })
        .unwrap_or_default();
        self.persistence
            .record_action(&format!("Migrate objects ({})", task_id), "", &summary, &source);
        Ok(stage)
    }

    pub fn cancel_etl(&self, task_id: &EtlTaskId) -> WorkspaceResult<()> {
        self.etl.cancel(&self.store, &self.registry, task_id)
    }

    /// Drops the ETL task and releases both of its connections. The worksheet
    /// stays open.
    pub async fn discard_etl_task(&self, task_id: &EtlTaskId) -> WorkspaceResult<()> {
        self.etl.forget(std::slice::from_ref(task_id));
        let removal = self.store.lock().remove_etl_task(task_id)?;
        self.dispose(removal).await;
        Ok(())
    }

    // ---- persistence ----

    /// Writes the durable state. A failure is logged and returned but leaves
    /// the in-memory session untouched.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        self.persistence.save(&self.store).await.map_err(|err| {
            logging::handle_non_critical_error(&err);
            err
        })
    }

    pub fn history(&self) -> Vec<QueryHistoryEntry> {
        self.persistence.history()
    }

    pub fn remove_history_entry(&self, index: usize) -> WorkspaceResult<QueryHistoryEntry> {
        self.persistence
            .remove_history_entry(index)
            .ok_or_else(|| WorkspaceError::not_found("History entry", index))
    }

    pub fn clear_history(&self) {
        self.persistence.clear_history()
    }

    pub fn snippets(&self) -> Vec<QuerySnippet> {
        self.persistence.snippets()
    }

    pub fn add_snippet(&self, name: &str, sql: &str) -> QuerySnippet {
        self.persistence.add_snippet(name, sql)
    }

    pub fn remove_snippet(&self, index: usize) -> WorkspaceResult<QuerySnippet> {
        self.persistence
            .remove_snippet(index)
            .ok_or_else(|| WorkspaceError::not_found("Snippet", index))
    }

    pub fn preferences(&self) -> Preferences {
        self.persistence.preferences()
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        self.persistence.set_preferences(preferences)
    }

    /// Loads a SQL file into the tab and remembers where it came from.
    pub async fn open_file(&self, tab_id: &QueryTabId, path: &Path) -> WorkspaceResult<()> {
        self.store.lock().query_tab(tab_id)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(PersistenceError::from)?;
        self.store.lock().set_query_tab_sql(tab_id, &text)?;
        self.persistence
            .set_file_handle(
                tab_id,
                FileHandle {
                    path: path.to_path_buf(),
                    saved_text: text,
                },
            )
            .await?;
        Ok(())
    }

    /// Writes the tab's text to its file, or to `path` when given.
    pub async fn save_file(&self, tab_id: &QueryTabId, path: Option<&Path>) -> WorkspaceResult<()> {
        let text = self.store.lock().query_tab(tab_id)?.sql.clone();
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self
                .persistence
                .file_handle(tab_id)
                .map(|h| h.path)
                .ok_or_else(|| {
                    WorkspaceError::InvalidState(format!("Query tab {} has no file", tab_id))
                })?,
        };
        tokio::fs::write(&path, &text)
            .await
            .map_err(PersistenceError::from)?;
        self.persistence
            .set_file_handle(tab_id, FileHandle { path, saved_text: text })
            .await?;
        Ok(())
    }

    pub fn is_query_tab_unsaved(&self, tab_id: &QueryTabId) -> WorkspaceResult<bool> {
        let tab = self.store.lock().query_tab(tab_id)?.clone();
        Ok(self.persistence.is_query_tab_unsaved(&tab))
    }

    /// Persists the session and releases every connection.
    pub async fn shutdown(&self) {
        let _ = self.persist().await;
        self.registry.release_all().await;
        logging::info("Workspace shut down");
    }
}
