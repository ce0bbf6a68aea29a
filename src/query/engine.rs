use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::result::QueryResult;
use crate::api::{ConnectionHandle, ManagementApi};
use crate::connection::ConnectionRegistry;
use crate::error::{ConnectionError, WorkspaceError, WorkspaceResult};
use crate::logging;
use crate::persistence::PersistenceAdapter;
use crate::session::{ConnectionId, ConnectionOwner, QueryTabId, QueryTabStatus, SessionStore};

/// How a call to [`QueryEngine::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The result was attached to the tab. It may still carry statement
    /// errors or a proxy-side interruption.
    Completed(QueryResult),
    /// Canceled by the user before a response arrived.
    Canceled,
    /// A newer execution on the same tab took over; nothing was attached.
    Superseded,
}

struct InFlight {
    seq: u64,
    token: CancellationToken,
    handle: ConnectionHandle,
    sql: String,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Executions {
    in_flight: HashMap<QueryTabId, InFlight>,
    /// Sequence number of the newest execution started on each tab.
    latest: HashMap<QueryTabId, u64>,
}

/// Runs SQL on behalf of query tabs, one in-flight execution per tab.
pub struct QueryEngine {
    api: Arc<dyn ManagementApi>,
    executions: Mutex<Executions>,
    next_seq: AtomicU64,
    cancel_timeout: Duration,
}

impl QueryEngine {
    pub fn new(api: Arc<dyn ManagementApi>, cancel_timeout: Duration) -> Self {
        Self {
            api,
            executions: Mutex::new(Executions::default()),
            next_seq: AtomicU64::new(0),
            cancel_timeout,
        }
    }

    pub fn is_running(&self, tab_id: &QueryTabId) -> bool {
        self.executions.lock().in_flight.contains_key(tab_id)
    }

    /// Executes `sql` on the tab's connection and attaches the normalized
    /// result. Starting a run while another is in flight on the same tab
    /// cancels the older one; its late response is discarded.
    pub async fn run(
        &self,
        store: &Mutex<SessionStore>,
        registry: &ConnectionRegistry,
        persistence: &PersistenceAdapter,
        tab_id: &QueryTabId,
        sql: &str,
    ) -> WorkspaceResult<Execution> {
        let conn_id = store
            .lock()
            .query_tab(tab_id)?
            .connection_id
            .clone()
            .ok_or(ConnectionError::Unbound)?;

        if registry.needs_probe(&conn_id) && !registry.probe(&conn_id).await {
            self.drop_connection(store, registry, tab_id, &conn_id).await;
            return Err(ConnectionError::Dead(conn_id).into());
        }
        let handle = match registry.live_handle(&conn_id) {
            Ok(handle) => handle,
            Err(err) => {
                self.drop_connection(store, registry, tab_id, &conn_id).await;
                return Err(err.into());
            }
        };
        let target = registry
            .get(&conn_id)
            .map(|c| c.target)
            .unwrap_or_default();

        let started_at = Utc::now();
        let token = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = {
            let mut executions = self.executions.lock();
            executions.latest.insert(tab_id.clone(), seq);
            executions.in_flight.insert(
                tab_id.clone(),
                InFlight {
                    seq,
                    token: token.clone(),
                    handle: handle.clone(),
                    sql: sql.to_string(),
                    started_at,
                },
            )
        };
        store
            .lock()
            .update_query_tab(tab_id, |tab| tab.status = QueryTabStatus::Running)?;
        if let Some(previous) = previous {
            logging::debug(&format!(
                "Query on tab {} superseded by a newer execution",
                tab_id
            ));
            previous.token.cancel();
            // The proxy kills whatever runs on the connection, so the kill
            // must land before the new statement is sent.
            send_cancel(self.api.clone(), previous.handle, self.cancel_timeout).await;
        }
        registry.touch(&conn_id);
        let max_rows = persistence.preferences().query_row_limit;
        logging::debug(&format!("Running query on tab {} via {}", tab_id, conn_id));

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            response = self.api.execute(&handle, sql, max_rows) => Some(response),
        };

        {
            let mut executions = self.executions.lock();
            let current = executions.in_flight.get(tab_id).map(|f| f.seq) == Some(seq);
            if current {
                executions.in_flight.remove(tab_id);
            } else if executions.latest.get(tab_id).map_or(false, |latest| *latest != seq) {
                logging::debug(&format!("Discarding stale response for tab {}", tab_id));
                return Ok(Execution::Superseded);
            } else {
                // Removed by `cancel` or `forget`; both fire the token.
                return Ok(Execution::Canceled);
            }
        }
        let Some(response) = response else {
            return Ok(Execution::Canceled);
        };

        let result = match response {
            Ok(response) => match QueryResult::from_response(sql, started_at, response) {
                Ok(result) => result,
                Err(err) => {
                    store.lock().update_query_tab(tab_id, |tab| {
                        tab.status = QueryTabStatus::Failed;
                        tab.result = None;
                    })?;
                    return Err(err);
                }
            },
            Err(err) => {
                logging::error(&format!("Query on tab {} failed: {}", tab_id, err));
                if err.is_connection_lost() {
                    self.drop_connection(store, registry, tab_id, &conn_id).await;
                    if self.is_superseded(tab_id, seq) {
                        return Ok(Execution::Superseded);
                    }
                }
                QueryResult::from_api_error(sql, started_at, &err)
            }
        };

        let status = if result.is_canceled() {
            QueryTabStatus::Canceled
        } else if result.has_error() {
            QueryTabStatus::Failed
        } else {
            QueryTabStatus::Completed
        };
        store.lock().update_query_tab(tab_id, |tab| {
            tab.status = status;
            tab.result = Some(result.clone());
        })?;
        if !result.is_canceled() {
            persistence.record_query(&result, &target);
        }
        Ok(Execution::Completed(result))
    }

    /// Marks the tab canceled right away and asks the proxy to kill the
    /// statement in the background. The proxy's answer is not awaited.
    pub fn cancel(&self, store: &Mutex<SessionStore>, tab_id: &QueryTabId) -> WorkspaceResult<()> {
        let in_flight = self.executions.lock().in_flight.remove(tab_id).ok_or_else(|| {
            WorkspaceError::InvalidState(format!("No query is running on tab {}", tab_id))
        })?;
        in_flight.token.cancel();
        store.lock().update_query_tab(tab_id, |tab| {
            tab.status = QueryTabStatus::Canceled;
            tab.result = Some(QueryResult::canceled(&in_flight.sql, in_flight.started_at));
        })?;
        logging::info(&format!("Canceled query on tab {}", tab_id));
        self.abort_on_proxy(in_flight.handle);
        Ok(())
    }

    /// Abandons executions of closed tabs.
    pub fn forget(&self, tab_ids: &[QueryTabId]) {
        let mut executions = self.executions.lock();
        for id in tab_ids {
            executions.latest.remove(id);
            if let Some(entry) = executions.in_flight.remove(id) {
                entry.token.cancel();
            }
        }
    }

    fn abort_on_proxy(&self, handle: ConnectionHandle) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            logging::warn("No runtime available to send a cancel request");
            return;
        };
        runtime.spawn(send_cancel(self.api.clone(), handle, self.cancel_timeout));
    }

    /// True once a newer execution than `seq` was started on the tab.
    fn is_superseded(&self, tab_id: &QueryTabId, seq: u64) -> bool {
        self.executions.lock().latest.get(tab_id) != Some(&seq)
    }

    async fn drop_connection(
        &self,
        store: &Mutex<SessionStore>,
        registry: &ConnectionRegistry,
        tab_id: &QueryTabId,
        conn_id: &ConnectionId,
    ) {
        let owner = ConnectionOwner::QueryTab(tab_id.clone());
        registry.drop_lost(store, &owner, conn_id).await;
    }
}

async fn send_cancel(api: Arc<dyn ManagementApi>, handle: ConnectionHandle, timeout: Duration) {
    match tokio::time::timeout(timeout, api.cancel(&handle)).await {
        Ok(Ok(())) => logging::debug(&format!("Proxy canceled query on {}", handle.id)),
        Ok(Err(err)) => logging::warn(&format!("Cancel request for {} failed: {}", handle.id, err)),
        Err(_) => logging::warn(&format!(
            "Cancel request for {} timed out after {:?}",
            handle.id, timeout
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockApi;
    use crate::api::{ApiError, Credentials, QueryResponse, StatementPayload};
    use crate::persistence::MemoryStore;
    use crate::query::QUERY_CANCELED;

    struct Harness {
        api: Arc<MockApi>,
        store: Mutex<SessionStore>,
        registry: ConnectionRegistry,
        persistence: PersistenceAdapter,
        engine: QueryEngine,
        tab: QueryTabId,
    }

    async fn harness(probe_after_idle: Duration) -> Harness {
        let api = Arc::new(MockApi::new());
        let store = Mutex::new(SessionStore::with_default_worksheet());
        let registry = ConnectionRegistry::new(api.clone(), probe_after_idle);
        let persistence = PersistenceAdapter::new(Arc::new(MemoryStore::new()), 100);
        let engine = QueryEngine::new(api.clone(), Duration::from_millis(100));
        let tab = store.lock().active_query_tab().unwrap().id.clone();
        let conn = registry
            .open("server1", &Credentials::new("maxuser", "maxpwd"))
            .await
            .unwrap();
        registry
            .bind(&store, ConnectionOwner::QueryTab(tab.clone()), &conn.id)
            .await
            .unwrap();
        Harness {
            api,
            store,
            registry,
            persistence,
            engine,
            tab,
        }
    }

    impl Harness {
        async fn run(&self, sql: &str) -> WorkspaceResult<Execution> {
            self.engine
                .run(&self.store, &self.registry, &self.persistence, &self.tab, sql)
                .await
        }

        fn status(&self) -> QueryTabStatus {
            self.store.lock().query_tab(&self.tab).unwrap().status
        }

        fn bound(&self) -> Option<ConnectionId> {
            self.store.lock().query_tab(&self.tab).unwrap().connection_id.clone()
        }

        fn result_sql(&self) -> Option<String> {
            self.store
                .lock()
                .query_tab(&self.tab)
                .unwrap()
                .result
                .as_ref()
                .map(|r| r.sql.clone())
        }
    }

    #[tokio::test]
    async fn test_run_attaches_result_and_records_history() {
        let h = harness(Duration::from_secs(300)).await;
        let outcome = h.run("SELECT 1").await.unwrap();

        assert!(matches!(outcome, Execution::Completed(ref r) if r.result_sets().count() == 1));
        assert_eq!(h.status(), QueryTabStatus::Completed);
        assert_eq!(h.result_sql().as_deref(), Some("SELECT 1"));
        let history = h.persistence.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].connection_name, "server1");
        assert!(!h.engine.is_running(&h.tab));
    }

    #[tokio::test]
    async fn test_newer_run_supersedes_older() {
        let h = harness(Duration::from_secs(300)).await;
        let gate = h.api.gate("SELECT 1");

        let (first, second) = tokio::join!(h.run("SELECT 1"), async {
            let second = h.run("SELECT 2").await;
            let _ = gate.send(());
            second
        });

        assert_eq!(first.unwrap(), Execution::Superseded);
        assert!(matches!(second.unwrap(), Execution::Completed(_)));
        assert_eq!(h.result_sql().as_deref(), Some("SELECT 2"));
        assert_eq!(h.status(), QueryTabStatus::Completed);
        assert_eq!(h.persistence.history().len(), 1);
        assert_eq!(
            h.api.timeline(),
            vec!["execute SELECT 1", "cancel conn-1", "execute SELECT 2"]
        );
    }

    #[tokio::test]
    async fn test_hung_cancel_delays_newer_run_by_at_most_the_timeout() {
        let h = harness(Duration::from_secs(300)).await;
        h.api.hang_cancel();
        let _gate = h.api.gate("SELECT 1");

        let (first, second) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(h.run("SELECT 1"), async {
                tokio::task::yield_now().await;
                h.run("SELECT 2").await
            })
        })
        .await
        .unwrap();

        assert_eq!(first.unwrap(), Execution::Superseded);
        assert!(matches!(second.unwrap(), Execution::Completed(_)));
        assert_eq!(h.status(), QueryTabStatus::Completed);
        assert_eq!(
            h.api.timeline(),
            vec!["execute SELECT 1", "cancel conn-1", "execute SELECT 2"]
        );
    }

    #[tokio::test]
    async fn test_cancel_is_immediate_even_if_proxy_hangs() {
        let h = harness(Duration::from_secs(300)).await;
        h.api.hang_cancel();
        let _gate = h.api.gate("SELECT SLEEP(100)");

        let (outcome, canceled) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(h.run("SELECT SLEEP(100)"), async {
                tokio::task::yield_now().await;
                h.engine.cancel(&h.store, &h.tab)
            })
        })
        .await
        .unwrap();

        canceled.unwrap();
        assert_eq!(outcome.unwrap(), Execution::Canceled);
        assert_eq!(h.status(), QueryTabStatus::Canceled);
        let tab = h.store.lock().query_tab(&h.tab).unwrap().clone();
        assert!(tab.result.unwrap().is_canceled());
        assert!(h.persistence.history().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_without_running_query() {
        let h = harness(Duration::from_secs(300)).await;
        let err = h.engine.cancel(&h.store, &h.tab).unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_unbound_tab_is_rejected() {
        let h = harness(Duration::from_secs(300)).await;
        let editor = h.store.lock().active_query_editor().unwrap().id.clone();
        let other = h.store.lock().add_query_tab(&editor, None).unwrap();
        let err = h
            .engine
            .run(&h.store, &h.registry, &h.persistence, &other, "SELECT 1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Connection(ConnectionError::Unbound)));
    }

    #[tokio::test]
    async fn test_lost_connection_unbinds_tab() {
        let h = harness(Duration::from_secs(300)).await;
        h.api.kill("conn-1");

        let outcome = h.run("SELECT 1").await.unwrap();
        assert!(matches!(outcome, Execution::Completed(ref r) if r.has_error()));
        assert_eq!(h.status(), QueryTabStatus::Failed);
        assert!(h.store.lock().query_tab(&h.tab).unwrap().connection_id.is_none());
        assert!(h.registry.is_released(&ConnectionId::from("conn-1")));

        let err = h.run("SELECT 1").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Connection(ConnectionError::Unbound)));
    }

    #[tokio::test]
    async fn test_run_started_while_lost_connection_is_released() {
        let h = harness(Duration::from_secs(300)).await;
        h.api.kill("conn-1");
        let close = h.api.gate_close("conn-1");
        let second_gate = h.api.gate("SELECT 2");
        let first_done = std::cell::Cell::new(false);

        let (first, second, ()) = tokio::join!(
            async {
                let outcome = h.run("SELECT 1").await;
                first_done.set(true);
                outcome
            },
            async {
                while h.bound().is_some() {
                    tokio::task::yield_now().await;
                }
                let conn = h
                    .registry
                    .open("server1", &Credentials::new("maxuser", "maxpwd"))
                    .await
                    .unwrap();
                h.registry
                    .bind(&h.store, ConnectionOwner::QueryTab(h.tab.clone()), &conn.id)
                    .await
                    .unwrap();
                h.run("SELECT 2").await
            },
            async {
                while !h.api.executed().contains(&"SELECT 2".to_string()) {
                    tokio::task::yield_now().await;
                }
                let _ = close.send(());
                while !first_done.get() {
                    tokio::task::yield_now().await;
                }
                assert_eq!(h.status(), QueryTabStatus::Running);
                let _ = second_gate.send(());
            }
        );

        assert_eq!(first.unwrap(), Execution::Superseded);
        assert!(matches!(second.unwrap(), Execution::Completed(_)));
        assert_eq!(h.status(), QueryTabStatus::Completed);
        assert_eq!(h.result_sql().as_deref(), Some("SELECT 2"));
        assert_eq!(h.bound(), Some(ConnectionId::from("conn-2")));
    }

    #[tokio::test]
    async fn test_idle_connection_is_probed_first() {
        let h = harness(Duration::ZERO).await;
        h.api.kill("conn-1");

        let err = h.run("SELECT 1").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Connection(ConnectionError::Dead(_))));
        assert!(h.api.executed().is_empty());
        assert!(h.store.lock().query_tab(&h.tab).unwrap().connection_id.is_none());
    }

    #[tokio::test]
    async fn test_statement_error_and_proxy_interrupt() {
        let h = harness(Duration::from_secs(300)).await;
        h.api.reply(
            "SELEC 1",
            Ok(QueryResponse {
                results: Some(vec![StatementPayload {
                    errno: Some(1064),
                    message: Some("syntax error".into()),
                    sqlstate: Some("42000".into()),
                    ..StatementPayload::default()
                }]),
                ..QueryResponse::default()
            }),
        );
        h.run("SELEC 1").await.unwrap();
        assert_eq!(h.status(), QueryTabStatus::Failed);
        assert_eq!(h.persistence.history().len(), 1);

        h.api.reply(
            "SELECT SLEEP(5)",
            Ok(QueryResponse {
                message: Some(QUERY_CANCELED.into()),
                ..QueryResponse::default()
            }),
        );
        h.run("SELECT SLEEP(5)").await.unwrap();
        assert_eq!(h.status(), QueryTabStatus::Canceled);
        assert_eq!(h.persistence.history().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_request_keeps_connection() {
        let h = harness(Duration::from_secs(300)).await;
        h.api.reply(
            "SELECT 1",
            Err(ApiError::Rejected {
                status: 400,
                code: None,
                message: "bad request".into(),
            }),
        );
        h.run("SELECT 1").await.unwrap();
        assert_eq!(h.status(), QueryTabStatus::Failed);
        assert!(h.store.lock().query_tab(&h.tab).unwrap().connection_id.is_some());
    }
}
