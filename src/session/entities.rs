use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConnectionId, EtlTaskId, QueryEditorId, QueryTabId, WorksheetId};
use crate::api::SchemaObject;
use crate::query::QueryResult;

pub const DEFAULT_WORKSHEET_NAME: &str = "WORKSHEET";

/// A tab of the workspace. Owns either a query editor or an ETL task.
#[derive(Debug, Clone, PartialEq)]
pub struct Worksheet {
    pub id: WorksheetId,
    pub name: String,
    pub query_editor_id: Option<QueryEditorId>,
    pub etl_task_id: Option<EtlTaskId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryEditor {
    pub id: QueryEditorId,
    pub worksheet_id: WorksheetId,
    /// Tab order.
    pub query_tab_ids: Vec<QueryTabId>,
    pub active_query_tab_id: Option<QueryTabId>,
    pub schema_sidebar: SchemaSidebar,
}

/// Schema browser state. Entirely transient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSidebar {
    pub loading_db_tree: bool,
    /// Name of the connection target the tree was fetched from.
    pub db_tree_of_conn: Option<String>,
    pub db_tree: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub schema: String,
    pub objects: Vec<SchemaObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTabStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl QueryTabStatus {
    pub fn is_running(self) -> bool {
        self == QueryTabStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTab {
    pub id: QueryTabId,
    pub query_editor_id: QueryEditorId,
    pub name: String,
    pub sql: String,
    pub connection_id: Option<ConnectionId>,
    pub status: QueryTabStatus,
    pub result: Option<QueryResult>,
}

impl QueryTab {
    pub(crate) fn new(query_editor_id: QueryEditorId, name: String) -> Self {
        Self {
            id: QueryTabId::new(),
            query_editor_id,
            name,
            sql: String::new(),
            connection_id: None,
            status: QueryTabStatus::Idle,
            result: None,
        }
    }

    /// Back to a blank, unbound tab. Keeps id and name.
    pub(crate) fn reset(&mut self) {
        self.sql.clear();
        self.connection_id = None;
        self.status = QueryTabStatus::Idle;
        self.result = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EtlTaskStage {
    #[default]
    Init,
    SelectingObjects,
    Creating,
    Migrating,
    Complete,
    Failed,
    Canceled,
}

impl EtlTaskStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EtlTaskStage::Complete | EtlTaskStage::Failed | EtlTaskStage::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EtlObjectStage {
    Pending,
    Creating,
    Migrating,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlObjectError {
    pub object_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EtlObject {
    pub object: SchemaObject,
    pub stage: EtlObjectStage,
    pub error: Option<EtlObjectError>,
}

impl EtlObject {
    pub fn id(&self) -> String {
        self.object.id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EtlTask {
    pub id: EtlTaskId,
    pub worksheet_id: WorksheetId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub source_connection_id: Option<ConnectionId>,
    pub destination_connection_id: Option<ConnectionId>,
    pub stage: EtlTaskStage,
    pub objects: Vec<EtlObject>,
    pub logs: Vec<EtlLogEntry>,
}

impl EtlTask {
    pub(crate) fn new(worksheet_id: WorksheetId, name: String) -> Self {
        Self {
            id: EtlTaskId::new(),
            worksheet_id,
            name,
            created_at: Utc::now(),
            source_connection_id: None,
            destination_connection_id: None,
            stage: EtlTaskStage::Init,
            objects: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub(crate) fn log(&mut self, message: impl Into<String>) {
        self.logs.push(EtlLogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    pub fn object(&self, object_id: &str) -> Option<&EtlObject> {
        self.objects.iter().find(|o| o.id() == object_id)
    }

    pub(crate) fn object_mut(&mut self, object_id: &str) -> Option<&mut EtlObject> {
        self.objects.iter_mut().find(|o| o.id() == object_id)
    }

    /// Objects that ended in `Error` and need a manual retry.
    pub fn failed_objects(&self) -> impl Iterator<Item = &EtlObject> {
        self.objects
            .iter()
            .filter(|o| o.stage == EtlObjectStage::Error)
    }
}

/// Who holds a connection. A connection has at most one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionOwner {
    QueryTab(QueryTabId),
    EtlSource(EtlTaskId),
    EtlDestination(EtlTaskId),
}

/// Change notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    WorksheetAdded(WorksheetId),
    WorksheetChanged(WorksheetId),
    WorksheetRemoved(WorksheetId),
    ActiveWorksheetChanged(Option<WorksheetId>),
    QueryEditorChanged(QueryEditorId),
    QueryTabAdded(QueryTabId),
    QueryTabChanged(QueryTabId),
    QueryTabRemoved(QueryTabId),
    ActiveQueryTabChanged {
        query_editor_id: QueryEditorId,
        query_tab_id: Option<QueryTabId>,
    },
    EtlTaskChanged(EtlTaskId),
    EtlTaskRemoved(EtlTaskId),
}
