use indexmap::IndexMap;
use std::collections::HashMap;
use tokio::sync::broadcast;

use super::entities::*;
use super::ids::{ConnectionId, EtlTaskId, QueryEditorId, QueryTabId, WorksheetId};
use crate::error::{WorkspaceError, WorkspaceResult};

const EVENT_CAPACITY: usize = 256;

/// What a delete took with it. The caller releases the connections and
/// drops side-table entries of the listed query tabs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Removal {
    pub connection_ids: Vec<ConnectionId>,
    pub query_tab_ids: Vec<QueryTabId>,
    pub etl_task_ids: Vec<EtlTaskId>,
}

impl Removal {
    fn take_tab(&mut self, tab: &mut QueryTab) {
        if let Some(conn) = tab.connection_id.take() {
            self.connection_ids.push(conn);
        }
        self.query_tab_ids.push(tab.id.clone());
    }

    fn take_etl_task(&mut self, task: &mut EtlTask) {
        self.connection_ids
            .extend(task.source_connection_id.take());
        self.connection_ids
            .extend(task.destination_connection_id.take());
        self.etl_task_ids.push(task.id.clone());
    }
}

/// Entity graph of one workspace session: worksheets, query editors, query
/// tabs and ETL tasks, addressed by id.
///
/// Performs no I/O. Every active pointer is either `None` or names a live
/// entity; deleting an active entity moves the pointer to a sibling.
pub struct SessionStore {
    worksheets: IndexMap<WorksheetId, Worksheet>,
    query_editors: HashMap<QueryEditorId, QueryEditor>,
    query_tabs: HashMap<QueryTabId, QueryTab>,
    etl_tasks: HashMap<EtlTaskId, EtlTask>,
    active_worksheet_id: Option<WorksheetId>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            worksheets: IndexMap::new(),
            query_editors: HashMap::new(),
            query_tabs: HashMap::new(),
            etl_tasks: HashMap::new(),
            active_worksheet_id: None,
            events,
        }
    }

    /// A session with one blank query worksheet, the startup fallback.
    pub fn with_default_worksheet() -> Self {
        let mut store = Self::new();
        store.add_query_worksheet(DEFAULT_WORKSHEET_NAME);
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    // ---- reads ----

    pub fn worksheets(&self) -> impl Iterator<Item = &Worksheet> {
        self.worksheets.values()
    }

    pub fn worksheet_count(&self) -> usize {
        self.worksheets.len()
    }

    pub fn worksheet(&self, id: &WorksheetId) -> WorkspaceResult<&Worksheet> {
        self.worksheets
            .get(id)
            .ok_or_else(|| WorkspaceError::not_found("Worksheet", id))
    }

    pub fn query_editor(&self, id: &QueryEditorId) -> WorkspaceResult<&QueryEditor> {
        self.query_editors
            .get(id)
            .ok_or_else(|| WorkspaceError::not_found("Query editor", id))
    }

    pub fn query_tab(&self, id: &QueryTabId) -> WorkspaceResult<&QueryTab> {
        self.query_tabs
            .get(id)
            .ok_or_else(|| WorkspaceError::not_found("Query tab", id))
    }

    pub fn etl_task(&self, id: &EtlTaskId) -> WorkspaceResult<&EtlTask> {
        self.etl_tasks
            .get(id)
            .ok_or_else(|| WorkspaceError::not_found("ETL task", id))
    }

    /// Tabs of an editor in tab order.
    pub fn query_tabs_of(&self, editor_id: &QueryEditorId) -> WorkspaceResult<Vec<&QueryTab>> {
        let editor = self.query_editor(editor_id)?;
        Ok(editor
            .query_tab_ids
            .iter()
            .filter_map(|id| self.query_tabs.get(id))
            .collect())
    }

    pub fn active_worksheet_id(&self) -> Option<&WorksheetId> {
        self.active_worksheet_id.as_ref()
    }

    pub fn active_worksheet(&self) -> Option<&Worksheet> {
        self.active_worksheet_id
            .as_ref()
            .and_then(|id| self.worksheets.get(id))
    }

    pub fn active_query_editor(&self) -> Option<&QueryEditor> {
        self.active_worksheet()
            .and_then(|wke| wke.query_editor_id.as_ref())
            .and_then(|id| self.query_editors.get(id))
    }

    pub fn active_query_tab(&self) -> Option<&QueryTab> {
        self.active_query_editor()
            .and_then(|editor| editor.active_query_tab_id.as_ref())
            .and_then(|id| self.query_tabs.get(id))
    }

    pub fn query_tab_count(&self) -> usize {
        self.query_tabs.len()
    }

    pub fn etl_tasks(&self) -> impl Iterator<Item = &EtlTask> {
        self.etl_tasks.values()
    }

    // ---- entity creation ----

    fn insert_worksheet(&mut self, worksheet: Worksheet) -> WorksheetId {
        let id = worksheet.id.clone();
        self.worksheets.insert(id.clone(), worksheet);
        self.emit(SessionEvent::WorksheetAdded(id.clone()));
        self.active_worksheet_id = Some(id.clone());
        self.emit(SessionEvent::ActiveWorksheetChanged(Some(id.clone())));
        id
    }

    /// New worksheet with a query editor holding one blank tab. Becomes active.
    pub fn add_query_worksheet(&mut self, name: &str) -> WorksheetId {
        let worksheet_id = WorksheetId::new();
        let editor_id = QueryEditorId::new();
        let tab = QueryTab::new(editor_id.clone(), "Query Tab 1".to_string());
        let editor = QueryEditor {
            id: editor_id.clone(),
            worksheet_id: worksheet_id.clone(),
            query_tab_ids: vec![tab.id.clone()],
            active_query_tab_id: Some(tab.id.clone()),
            schema_sidebar: SchemaSidebar::default(),
        };
        self.query_tabs.insert(tab.id.clone(), tab);
        self.query_editors.insert(editor_id.clone(), editor);
        self.insert_worksheet(Worksheet {
            id: worksheet_id,
            name: name.to_string(),
            query_editor_id: Some(editor_id),
            etl_task_id: None,
        })
    }

    /// New worksheet holding an ETL task in `Init`. Becomes active.
    pub fn add_etl_worksheet(&mut self, name: &str) -> (WorksheetId, EtlTaskId) {
        let worksheet_id = WorksheetId::new();
        let task = EtlTask::new(worksheet_id.clone(), name.to_string());
        let task_id = task.id.clone();
        self.etl_tasks.insert(task_id.clone(), task);
        let worksheet_id = self.insert_worksheet(Worksheet {
            id: worksheet_id,
            name: name.to_string(),
            query_editor_id: None,
            etl_task_id: Some(task_id.clone()),
        });
        (worksheet_id, task_id)
    }

    pub fn add_query_tab(
        &mut self,
        editor_id: &QueryEditorId,
        name: Option<&str>,
    ) -> WorkspaceResult<QueryTabId> {
        let editor = self
            .query_editors
            .get_mut(editor_id)
            .ok_or_else(|| WorkspaceError::not_found("Query editor", editor_id))?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Query Tab {}", editor.query_tab_ids.len() + 1));
        let tab = QueryTab::new(editor_id.clone(), name);
        let tab_id = tab.id.clone();
        editor.query_tab_ids.push(tab_id.clone());
        editor.active_query_tab_id = Some(tab_id.clone());
        self.query_tabs.insert(tab_id.clone(), tab);

        self.emit(SessionEvent::QueryTabAdded(tab_id.clone()));
        self.emit(SessionEvent::ActiveQueryTabChanged {
            query_editor_id: editor_id.clone(),
            query_tab_id: Some(tab_id.clone()),
        });
        Ok(tab_id)
    }

    // ---- simple edits ----

    pub fn set_active_worksheet(&mut self, id: &WorksheetId) -> WorkspaceResult<()> {
        self.worksheet(id)?;
        self.active_worksheet_id = Some(id.clone());
        self.emit(SessionEvent::ActiveWorksheetChanged(Some(id.clone())));
        Ok(())
    }

    pub fn rename_worksheet(&mut self, id: &WorksheetId, name: &str) -> WorkspaceResult<()> {
        let worksheet = self
            .worksheets
            .get_mut(id)
            .ok_or_else(|| WorkspaceError::not_found("Worksheet", id))?;
        worksheet.name = name.to_string();
        self.emit(SessionEvent::WorksheetChanged(id.clone()));
        Ok(())
    }

    pub fn set_active_query_tab(&mut self, tab_id: &QueryTabId) -> WorkspaceResult<()> {
        let editor_id = self.query_tab(tab_id)?.query_editor_id.clone();
        let editor = self
            .query_editors
            .get_mut(&editor_id)
            .ok_or_else(|| WorkspaceError::not_found("Query editor", &editor_id))?;
        editor.active_query_tab_id = Some(tab_id.clone());
        self.emit(SessionEvent::ActiveQueryTabChanged {
            query_editor_id: editor_id,
            query_tab_id: Some(tab_id.clone()),
        });
        Ok(())
    }

    pub fn rename_query_tab(&mut self, tab_id: &QueryTabId, name: &str) -> WorkspaceResult<()> {
        self.update_query_tab(tab_id, |tab| tab.name = name.to_string())
    }

    pub fn set_query_tab_sql(&mut self, tab_id: &QueryTabId, sql: &str) -> WorkspaceResult<()> {
        self.update_query_tab(tab_id, |tab| tab.sql = sql.to_string())
    }

    // ---- deletes ----

    /// Removes a query tab. The last tab of an editor is reset in place
    /// instead, so an editor never ends up without tabs.
    pub fn remove_query_tab(&mut self, tab_id: &QueryTabId) -> WorkspaceResult<Removal> {
        let editor_id = self.query_tab(tab_id)?.query_editor_id.clone();
        let mut removal = Removal::default();
        let editor = self
            .query_editors
            .get_mut(&editor_id)
            .ok_or_else(|| WorkspaceError::not_found("Query editor", &editor_id))?;

        if editor.query_tab_ids.len() <= 1 {
            if let Some(tab) = self.query_tabs.get_mut(tab_id) {
                removal.take_tab(tab);
                tab.reset();
            }
            self.emit(SessionEvent::QueryTabChanged(tab_id.clone()));
            return Ok(removal);
        }

        let index = editor
            .query_tab_ids
            .iter()
            .position(|id| id == tab_id)
            .unwrap_or(0);
        editor.query_tab_ids.retain(|id| id != tab_id);
        let reassigned = if editor.active_query_tab_id.as_ref() == Some(tab_id) {
            let next = editor
                .query_tab_ids
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|i| editor.query_tab_ids.get(i)))
                .cloned();
            editor.active_query_tab_id = next.clone();
            Some(next)
        } else {
            None
        };

        if let Some(mut tab) = self.query_tabs.remove(tab_id) {
            removal.take_tab(&mut tab);
        }
        self.emit(SessionEvent::QueryTabRemoved(tab_id.clone()));
        if let Some(query_tab_id) = reassigned {
            self.emit(SessionEvent::ActiveQueryTabChanged {
                query_editor_id: editor_id,
                query_tab_id,
            });
        }
        Ok(removal)
    }

    /// Removes a worksheet with its query editor, query tabs and ETL task.
    pub fn remove_worksheet(&mut self, id: &WorksheetId) -> WorkspaceResult<Removal> {
        let index = self
            .worksheets
            .get_index_of(id)
            .ok_or_else(|| WorkspaceError::not_found("Worksheet", id))?;
        let worksheet = self
            .worksheets
            .shift_remove(id)
            .ok_or_else(|| WorkspaceError::not_found("Worksheet", id))?;
        let mut removal = Removal::default();

        if let Some(editor) = worksheet
            .query_editor_id
            .as_ref()
            .and_then(|editor_id| self.query_editors.remove(editor_id))
        {
            for tab_id in &editor.query_tab_ids {
                if let Some(mut tab) = self.query_tabs.remove(tab_id) {
                    removal.take_tab(&mut tab);
                    self.emit(SessionEvent::QueryTabRemoved(tab_id.clone()));
                }
            }
        }
        if let Some(mut task) = worksheet
            .etl_task_id
            .as_ref()
            .and_then(|task_id| self.etl_tasks.remove(task_id))
        {
            removal.take_etl_task(&mut task);
            self.emit(SessionEvent::EtlTaskRemoved(task.id.clone()));
        }

        self.emit(SessionEvent::WorksheetRemoved(id.clone()));
        if self.active_worksheet_id.as_ref() == Some(id) {
            let next = self
                .worksheets
                .get_index(index)
                .or_else(|| index.checked_sub(1).and_then(|i| self.worksheets.get_index(i)))
                .map(|(id, _)| id.clone());
            self.active_worksheet_id = next.clone();
            self.emit(SessionEvent::ActiveWorksheetChanged(next));
        }
        Ok(removal)
    }

    /// Discards an ETL task; its worksheet stays.
    pub fn remove_etl_task(&mut self, task_id: &EtlTaskId) -> WorkspaceResult<Removal> {
        let mut task = self
            .etl_tasks
            .remove(task_id)
            .ok_or_else(|| WorkspaceError::not_found("ETL task", task_id))?;
        if let Some(worksheet) = self.worksheets.get_mut(&task.worksheet_id) {
            worksheet.etl_task_id = None;
        }
        let mut removal = Removal::default();
        removal.take_etl_task(&mut task);
        self.emit(SessionEvent::EtlTaskRemoved(task_id.clone()));
        self.emit(SessionEvent::WorksheetChanged(task.worksheet_id.clone()));
        Ok(removal)
    }

    // ---- mutation paths for the workspace components ----

    pub(crate) fn update_query_tab<R>(
        &mut self,
        tab_id: &QueryTabId,
        f: impl FnOnce(&mut QueryTab) -> R,
    ) -> WorkspaceResult<R> {
        let tab = self
            .query_tabs
            .get_mut(tab_id)
            .ok_or_else(|| WorkspaceError::not_found("Query tab", tab_id))?;
        let out = f(tab);
        self.emit(SessionEvent::QueryTabChanged(tab_id.clone()));
        Ok(out)
    }

    pub(crate) fn update_query_editor<R>(
        &mut self,
        editor_id: &QueryEditorId,
        f: impl FnOnce(&mut QueryEditor) -> R,
    ) -> WorkspaceResult<R> {
        let editor = self
            .query_editors
            .get_mut(editor_id)
            .ok_or_else(|| WorkspaceError::not_found("Query editor", editor_id))?;
        let out = f(editor);
        self.emit(SessionEvent::QueryEditorChanged(editor_id.clone()));
        Ok(out)
    }

    pub(crate) fn update_etl_task<R>(
        &mut self,
        task_id: &EtlTaskId,
        f: impl FnOnce(&mut EtlTask) -> R,
    ) -> WorkspaceResult<R> {
        let task = self
            .etl_tasks
            .get_mut(task_id)
            .ok_or_else(|| WorkspaceError::not_found("ETL task", task_id))?;
        let out = f(task);
        self.emit(SessionEvent::EtlTaskChanged(task_id.clone()));
        Ok(out)
    }

    pub(crate) fn owner_connection(
        &self,
        owner: &ConnectionOwner,
    ) -> WorkspaceResult<Option<ConnectionId>> {
        Ok(match owner {
            ConnectionOwner::QueryTab(id) => self.query_tab(id)?.connection_id.clone(),
            ConnectionOwner::EtlSource(id) => self.etl_task(id)?.source_connection_id.clone(),
            ConnectionOwner::EtlDestination(id) => {
                self.etl_task(id)?.destination_connection_id.clone()
            }
        })
    }

    /// Points `owner` at `connection`, returning what it held before.
    pub(crate) fn set_owner_connection(
        &mut self,
        owner: &ConnectionOwner,
        connection: Option<ConnectionId>,
    ) -> WorkspaceResult<Option<ConnectionId>> {
        match owner {
            ConnectionOwner::QueryTab(id) => self.update_query_tab(id, |tab| {
                std::mem::replace(&mut tab.connection_id, connection)
            }),
            ConnectionOwner::EtlSource(id) => self.update_etl_task(id, |task| {
                std::mem::replace(&mut task.source_connection_id, connection)
            }),
            ConnectionOwner::EtlDestination(id) => self.update_etl_task(id, |task| {
                std::mem::replace(&mut task.destination_connection_id, connection)
            }),
        }
    }

    /// Rebuilds entities from persisted layout. Used by the persistence
    /// adapter only; the caller guarantees ids are unique.
    pub(crate) fn insert_restored(
        &mut self,
        worksheet: Worksheet,
        editor: Option<(QueryEditor, Vec<QueryTab>)>,
        etl_task: Option<EtlTask>,
    ) {
        if let Some((editor, tabs)) = editor {
            for tab in tabs {
                self.query_tabs.insert(tab.id.clone(), tab);
            }
            self.query_editors.insert(editor.id.clone(), editor);
        }
        if let Some(task) = etl_task {
            self.etl_tasks.insert(task.id.clone(), task);
        }
        self.worksheets.insert(worksheet.id.clone(), worksheet);
    }

    pub(crate) fn restore_active_worksheet(&mut self, id: Option<WorksheetId>) {
        self.active_worksheet_id = id
            .filter(|id| self.worksheets.contains_key(id))
            .or_else(|| self.worksheets.keys().next().cloned());
    }

    /// Checks every relationship and active pointer.
    pub fn is_consistent(&self) -> bool {
        let active_ok = match &self.active_worksheet_id {
            Some(id) => self.worksheets.contains_key(id),
            None => self.worksheets.is_empty(),
        };
        let worksheets_ok = self.worksheets.values().all(|wke| {
            wke.query_editor_id
                .as_ref()
                .map_or(true, |id| self.query_editors.get(id).map_or(false, |e| e.worksheet_id == wke.id))
                && wke
                    .etl_task_id
                    .as_ref()
                    .map_or(true, |id| self.etl_tasks.contains_key(id))
        });
        let editors_ok = self.query_editors.values().all(|editor| {
            !editor.query_tab_ids.is_empty()
                && editor.query_tab_ids.iter().all(|id| {
                    self.query_tabs
                        .get(id)
                        .map_or(false, |tab| tab.query_editor_id == editor.id)
                })
                && editor
                    .active_query_tab_id
                    .as_ref()
                    .map_or(false, |id| editor.query_tab_ids.contains(id))
        });
        let no_orphans = self
            .query_tabs
            .values()
            .all(|tab| self.query_editors.contains_key(&tab.query_editor_id))
            && self
                .etl_tasks
                .values()
                .all(|task| self.worksheets.contains_key(&task.worksheet_id));
        active_ok && worksheets_ok && editors_ok && no_orphans
    }
}
