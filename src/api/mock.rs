//! Scriptable in-memory `ManagementApi` for tests.
use super::{
    ApiError, ApiResult, ConnectionHandle, Credentials, ManagementApi, QueryResponse,
    SchemaObject, StatementPayload,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

#[derive(Default)]
struct MockState {
    next_id: u64,
    open: HashSet<String>,
    dead: HashSet<String>,
    closed: Vec<String>,
    cancels: Vec<String>,
    executed: Vec<String>,
    /// Executes and cancels in the order the proxy saw them.
    timeline: Vec<String>,
    open_failures: HashMap<String, ApiError>,
    replies: HashMap<String, ApiResult<QueryResponse>>,
    gates: HashMap<String, oneshot::Receiver<()>>,
    hang_cancel: bool,
    objects: Vec<SchemaObject>,
    create_failures: HashSet<String>,
    migrate_failures: HashSet<String>,
    etl_gates: HashMap<String, oneshot::Receiver<()>>,
    close_gates: HashMap<String, oneshot::Receiver<()>>,
    etl_log: Vec<String>,
}

#[derive(Default)]
pub struct MockApi {
    state: Mutex<MockState>,
}

pub fn rows_reply(fields: &[&str], rows: Vec<Vec<serde_json::Value>>) -> QueryResponse {
    QueryResponse {
        results: Some(vec![StatementPayload {
            fields: Some(fields.iter().map(|f| f.to_string()).collect()),
            data: Some(rows),
            complete: Some(true),
            ..StatementPayload::default()
        }]),
        execution_time: Some(0.0012),
        ..QueryResponse::default()
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, target: &str, err: ApiError) {
        self.state.lock().open_failures.insert(target.to_string(), err);
    }

    pub fn reply(&self, sql: &str, reply: ApiResult<QueryResponse>) {
        self.state.lock().replies.insert(sql.to_string(), reply);
    }

    /// Holds the response to `sql` until the returned sender fires.
    pub fn gate(&self, sql: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().gates.insert(sql.to_string(), rx);
        tx
    }

    pub fn gate_etl(&self, object_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().etl_gates.insert(object_id.to_string(), rx);
        tx
    }

    /// Holds the close of `conn_id` until the returned sender fires.
    pub fn gate_close(&self, conn_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().close_gates.insert(conn_id.to_string(), rx);
        tx
    }

    pub fn hang_cancel(&self) {
        self.state.lock().hang_cancel = true;
    }

    pub fn kill(&self, conn_id: &str) {
        self.state.lock().dead.insert(conn_id.to_string());
    }

    pub fn set_objects(&self, objects: Vec<SchemaObject>) {
        self.state.lock().objects = objects;
    }

    pub fn fail_create(&self, object_id: &str) {
        self.state.lock().create_failures.insert(object_id.to_string());
    }

    pub fn fail_migrate(&self, object_id: &str) {
        self.state.lock().migrate_failures.insert(object_id.to_string());
    }

    pub fn closed(&self) -> Vec<String> {
        self.state.lock().closed.clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().cancels.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.state.lock().timeline.clone()
    }

    pub fn etl_log(&self) -> Vec<String> {
        self.state.lock().etl_log.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    fn is_alive(&self, conn: &ConnectionHandle) -> bool {
        let state = self.state.lock();
        state.open.contains(&conn.id) && !state.dead.contains(&conn.id)
    }

    async fn etl_step(&self, step: &str, object: &SchemaObject) -> ApiResult<()> {
        let id = object.id();
        let gate = {
            let mut state = self.state.lock();
            state.etl_log.push(format!("{} {}", step, id));
            if step == "create" {
                state.etl_gates.remove(&id)
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let state = self.state.lock();
        let failures = if step == "create" {
            &state.create_failures
        } else {
            &state.migrate_failures
        };
        if failures.contains(&id) {
            return Err(ApiError::Rejected {
                status: 200,
                code: None,
                message: format!("{} of {} failed", step, id),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for MockApi {
    async fn open_connection(
        &self,
        target: &str,
        _credentials: &Credentials,
    ) -> ApiResult<ConnectionHandle> {
        let mut state = self.state.lock();
        if let Some(err) = state.open_failures.get(target) {
            return Err(err.clone());
        }
        state.next_id += 1;
        let handle = ConnectionHandle {
            id: format!("conn-{}", state.next_id),
            token: format!("token-{}", state.next_id),
        };
        state.open.insert(handle.id.clone());
        Ok(handle)
    }

    async fn ping(&self, conn: &ConnectionHandle) -> ApiResult<bool> {
        Ok(self.is_alive(conn))
    }

    async fn close_connection(&self, conn: &ConnectionHandle) -> ApiResult<()> {
        let gate = self.state.lock().close_gates.remove(&conn.id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut state = self.state.lock();
        state.open.remove(&conn.id);
        state.closed.push(conn.id.clone());
        Ok(())
    }

    async fn execute(
        &self,
        conn: &ConnectionHandle,
        sql: &str,
        _max_rows: u64,
    ) -> ApiResult<QueryResponse> {
        if !self.is_alive(conn) {
            return Err(ApiError::ConnectionGone);
        }
        let gate = {
            let mut state = self.state.lock();
            state.executed.push(sql.to_string());
            state.timeline.push(format!("execute {}", sql));
            state.gates.remove(sql)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let reply = self.state.lock().replies.get(sql).cloned();
        reply.unwrap_or_else(|| Ok(rows_reply(&["sql"], vec![vec![serde_json::json!(sql)]])))
    }

    async fn cancel(&self, conn: &ConnectionHandle) -> ApiResult<()> {
        let hang = {
            let mut state = self.state.lock();
            state.cancels.push(conn.id.clone());
            state.timeline.push(format!("cancel {}", conn.id));
            state.hang_cancel
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn list_schema_objects(&self, conn: &ConnectionHandle) -> ApiResult<Vec<SchemaObject>> {
        if !self.is_alive(conn) {
            return Err(ApiError::ConnectionGone);
        }
        Ok(self.state.lock().objects.clone())
    }

    async fn etl_create(
        &self,
        _source: &ConnectionHandle,
        _destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()> {
        self.etl_step("create", object).await
    }

    async fn etl_migrate(
        &self,
        _source: &ConnectionHandle,
        _destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()> {
        self.etl_step("migrate", object).await
    }
}
