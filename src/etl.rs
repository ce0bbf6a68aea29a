//! Multi-stage data migration between two connections.
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::{ConnectionHandle, ManagementApi, SchemaObject};
use crate::connection::ConnectionRegistry;
use crate::error::{ConnectionError, WorkspaceError, WorkspaceResult};
use crate::logging;
use crate::session::{
    ConnectionId, ConnectionOwner, EtlObject, EtlObjectError, EtlObjectStage, EtlTask, EtlTaskId,
    EtlTaskStage, SessionStore,
};

pub struct EtlOrchestrator {
    api: Arc<dyn ManagementApi>,
    concurrency: usize,
    cancel_timeout: Duration,
    tokens: Mutex<HashMap<EtlTaskId, CancellationToken>>,
}

fn invalid_stage(task: &EtlTask, action: &str) -> WorkspaceError {
    WorkspaceError::InvalidState(format!(
        "Cannot {} ETL task {} in stage {:?}",
        action, task.id, task.stage
    ))
}

impl EtlOrchestrator {
    pub fn new(api: Arc<dyn ManagementApi>, concurrency: usize, cancel_timeout: Duration) -> Self {
        Self {
            api,
            concurrency: concurrency.max(1),
            cancel_timeout,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Binds the source and destination after checking both are alive.
    pub async fn init(
        &self,
        store: &Mutex<SessionStore>,
        registry: &ConnectionRegistry,
        task_id: &EtlTaskId,
        source: &ConnectionId,
        destination: &ConnectionId,
    ) -> WorkspaceResult<()> {
        {
            let store = store.lock();
            let task = store.etl_task(task_id)?;
            if task.stage != EtlTaskStage::Init {
                return Err(invalid_stage(task, "initialize"));
            }
        }
        if source == destination {
            return Err(WorkspaceError::InvalidState(
                "Source and destination must be different connections".into(),
            ));
        }

        for (conn_id, owner) in [
            (source, ConnectionOwner::EtlSource(task_id.clone())),
            (destination, ConnectionOwner::EtlDestination(task_id.clone())),
        ] {
            let connection = registry
                .get(conn_id)
                .ok_or_else(|| ConnectionError::Dead(conn_id.clone()))?;
            if connection.owner.as_ref().map_or(false, |o| *o != owner) {
                return Err(ConnectionError::InUse(conn_id.clone()).into());
            }
            if !registry.probe(conn_id).await {
                return Err(ConnectionError::Dead(conn_id.clone()).into());
            }
        }

        registry
            .bind(store, ConnectionOwner::EtlSource(task_id.clone()), source)
            .await?;
        registry
            .bind(store, ConnectionOwner::EtlDestination(task_id.clone()), destination)
            .await?;

        let describe = |id: &ConnectionId| {
            registry
                .get(id)
                .map(|c| c.target)
                .unwrap_or_else(|| id.to_string())
        };
        let message = format!(
            "Connected to source {} and destination {}",
            describe(source),
            describe(destination)
        );
        store.lock().update_etl_task(task_id, |task| {
            task.stage = EtlTaskStage::SelectingObjects;
            task.log(message);
        })?;
        logging::info(&format!("ETL task {} initialized", task_id));
        Ok(())
    }

    /// Schema objects available on the task's source. Read-only.
    pub async fn list_objects(
        &self,
        store: &Mutex<SessionStore>,
        registry: &ConnectionRegistry,
        task_id: &EtlTaskId,
    ) -> WorkspaceResult<Vec<SchemaObject>> {
        let source = store
            .lock()
            .etl_task(task_id)?
            .source_connection_id
            .clone()
            .ok_or(ConnectionError::Unbound)?;
        let handle = registry.live_handle(&source)?;
        match self.api.list_schema_objects(&handle).await {
            Ok(objects) => {
                registry.touch(&source);
                Ok(objects)
            }
            Err(err) => {
                if err.is_connection_lost() {
                    let owner = ConnectionOwner::EtlSource(task_id.clone());
                    registry.drop_lost(store, &owner, &source).await;
                }
                Err(err.into())
            }
        }
    }

    pub fn select_objects(
        &self,
        store: &Mutex<SessionStore>,
        task_id: &EtlTaskId,
        objects: Vec<SchemaObject>,
    ) -> WorkspaceResult<()> {
        let mut store = store.lock();
        let task = store.etl_task(task_id)?;
        if task.stage != EtlTaskStage::SelectingObjects {
            return Err(invalid_stage(task, "select objects for"));
        }
        if objects.is_empty() {
            return Err(WorkspaceError::InvalidState(
                "Select at least one object to migrate".into(),
            ));
        }

        let mut seen = HashSet::new();
        let selected: Vec<EtlObject> = objects
            .into_iter()
            .filter(|o| seen.insert(o.id()))
            .map(|object| EtlObject {
                object,
                stage: EtlObjectStage::Pending,
                error: None,
            })
            .collect();
        store.update_etl_task(task_id, |task| {
            task.log(format!("Selected {} objects", selected.len()));
            task.objects = selected;
        })
    }

    /// Creates then migrates every selected object, several objects at a
    /// time. A failing object is recorded and does not stop the others.
    pub async fn start(
        &self,
        store: &Mutex<SessionStore>,
        registry: &ConnectionRegistry,
        task_id: &EtlTaskId,
    ) -> WorkspaceResult<EtlTaskStage> {
        let (source, destination, objects) = {
            let store = store.lock();
            let task = store.etl_task(task_id)?;
            if task.stage != EtlTaskStage::SelectingObjects || task.objects.is_empty() {
                return Err(invalid_stage(task, "start"));
            }
            (
                task.source_connection_id.clone().ok_or(ConnectionError::Unbound)?,
                task.destination_connection_id
                    .clone()
                    .ok_or(ConnectionError::Unbound)?,
                task.objects
                    .iter()
                    .map(|o| o.object.clone())
                    .collect::<Vec<_>>(),
            )
        };
        let source_handle = registry.live_handle(&source)?;
        let destination_handle = registry.live_handle(&destination)?;

        let token = CancellationToken::new();
        self.tokens.lock().insert(task_id.clone(), token.clone());
        store.lock().update_etl_task(task_id, |task| {
            task.stage = EtlTaskStage::Creating;
            task.log(format!("Migration of {} objects started", task.objects.len()));
        })?;
        logging::info(&format!(
            "ETL task {} started with {} objects",
            task_id,
            objects.len()
        ));

        stream::iter(objects)
            .map(|object| {
                self.migrate_object(
                    store,
                    task_id,
                    &source_handle,
                    &destination_handle,
                    object,
                    &token,
                )
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<()>>()
            .await;

        self.tokens.lock().remove(task_id);
        registry.touch(&source);
        registry.touch(&destination);

        let stage = store.lock().update_etl_task(task_id, |task| {
            if task.stage == EtlTaskStage::Canceled {
                task.log("Migration stopped after cancellation");
                return task.stage;
            }
            let done = task
                .objects
                .iter()
                .filter(|o| o.stage == EtlObjectStage::Done)
                .count();
            let failed = task.failed_objects().count();
            task.stage = if done == 0 && failed > 0 {
                EtlTaskStage::Failed
            } else {
                EtlTaskStage::Complete
            };
            task.log(format!(
                "Migration finished: {} succeeded, {} failed",
                done, failed
            ));
            task.stage
        })?;
        logging::info(&format!("ETL task {} ended in {:?}", task_id, stage));
        Ok(stage)
    }

    async fn migrate_object(
        &self,
        store: &Mutex<SessionStore>,
        task_id: &EtlTaskId,
        source: &ConnectionHandle,
        destination: &ConnectionHandle,
        object: SchemaObject,
        token: &CancellationToken,
    ) {
        if token.is_cancelled() {
            return;
        }
        let object_id = object.id();
        self.update_object(store, task_id, &object_id, |_, o| {
            o.stage = EtlObjectStage::Creating
        });

        let outcome = match self.api.etl_create(source, destination, &object).await {
            Ok(()) => {
                self.update_object(store, task_id, &object_id, |stage, o| {
                    if *stage == EtlTaskStage::Creating {
                        *stage = EtlTaskStage::Migrating;
                    }
                    o.stage = EtlObjectStage::Migrating;
                });
                self.api.etl_migrate(source, destination, &object).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => self.update_object(store, task_id, &object_id, |_, o| {
                o.stage = EtlObjectStage::Done
            }),
            Err(err) => {
                logging::warn(&format!("ETL object {} failed: {}", object_id, err));
                let message = err.to_string();
                let _ = store.lock().update_etl_task(task_id, |task| {
                    task.log(format!("{}: {}", object_id, message));
                    if let Some(o) = task.object_mut(&object_id) {
                        o.stage = EtlObjectStage::Error;
                        o.error = Some(EtlObjectError {
                            object_id: object_id.clone(),
                            message,
                        });
                    }
                });
            }
        }
    }

    fn update_object(
        &self,
        store: &Mutex<SessionStore>,
        task_id: &EtlTaskId,
        object_id: &str,
        f: impl FnOnce(&mut EtlTaskStage, &mut EtlObject),
    ) {
        // The task may have been discarded while the object was in flight.
        let _ = store.lock().update_etl_task(task_id, |task| {
            let mut stage = task.stage;
            if let Some(object) = task.object_mut(object_id) {
                f(&mut stage, object);
            }
            task.stage = stage;
        });
    }

    /// Stops scheduling further objects. Objects already in flight finish
    /// on their own; nothing is rolled back.
    pub fn cancel(
        &self,
        store: &Mutex<SessionStore>,
        registry: &ConnectionRegistry,
        task_id: &EtlTaskId,
    ) -> WorkspaceResult<()> {
        let destination = {
            let mut store = store.lock();
            let task = store.etl_task(task_id)?;
            if task.stage.is_terminal() {
                return Err(invalid_stage(task, "cancel"));
            }
            let running = matches!(task.stage, EtlTaskStage::Creating | EtlTaskStage::Migrating);
            store.update_etl_task(task_id, |task| {
                task.stage = EtlTaskStage::Canceled;
                task.log("Canceled by user");
                task.destination_connection_id.clone().filter(|_| running)
            })?
        };
        if let Some(token) = self.tokens.lock().remove(task_id) {
            token.cancel();
        }
        logging::info(&format!("Canceled ETL task {}", task_id));

        if let Some(handle) = destination.and_then(|id| registry.live_handle(&id).ok()) {
            self.abort_on_proxy(handle);
        }
        Ok(())
    }

    pub fn forget(&self, task_ids: &[EtlTaskId]) {
        let mut tokens = self.tokens.lock();
        for id in task_ids {
            if let Some(token) = tokens.remove(id) {
                token.cancel();
            }
        }
    }

    fn abort_on_proxy(&self, handle: ConnectionHandle) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let api = self.api.clone();
        let timeout = self.cancel_timeout;
        runtime.spawn(async move {
            match tokio::time::timeout(timeout, api.cancel(&handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => logging::warn(&format!("ETL cancel on {} failed: {}", handle.id, err)),
                Err(_) => logging::warn(&format!("ETL cancel on {} timed out", handle.id)),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockApi;
    use crate::api::Credentials;

    struct Harness {
        api: Arc<MockApi>,
        store: Mutex<SessionStore>,
        registry: ConnectionRegistry,
        etl: EtlOrchestrator,
        task: EtlTaskId,
        source: ConnectionId,
        destination: ConnectionId,
    }

    async fn harness(concurrency: usize) -> Harness {
        let api = Arc::new(MockApi::new());
        let mut store = SessionStore::new();
        let (_, task) = store.add_etl_worksheet("Migration");
        let registry = ConnectionRegistry::new(api.clone(), Duration::from_secs(300));
        let creds = Credentials::new("maxuser", "maxpwd");
        let source = registry.open("server1", &creds).await.unwrap().id;
        let destination = registry.open("server2", &creds).await.unwrap().id;
        Harness {
            etl: EtlOrchestrator::new(api.clone(), concurrency, Duration::from_millis(100)),
            api,
            store: Mutex::new(store),
            registry,
            task,
            source,
            destination,
        }
    }

    impl Harness {
        async fn prepared(concurrency: usize, objects: &[&str]) -> Self {
            let h = harness(concurrency).await;
            h.etl
                .init(&h.store, &h.registry, &h.task, &h.source, &h.destination)
                .await
                .unwrap();
            let objects = objects.iter().map(|name| SchemaObject::table("shop", name)).collect();
            h.etl.select_objects(&h.store, &h.task, objects).unwrap();
            h
        }

        fn task(&self) -> EtlTask {
            self.store.lock().etl_task(&self.task).unwrap().clone()
        }

        fn object_stage(&self, id: &str) -> EtlObjectStage {
            self.task().object(id).unwrap().stage
        }
    }

    #[tokio::test]
    async fn test_partial_failure_completes() {
        let h = Harness::prepared(4, &["a", "b"]).await;
        h.api.fail_migrate("shop.a");

        let stage = h.etl.start(&h.store, &h.registry, &h.task).await.unwrap();

        assert_eq!(stage, EtlTaskStage::Complete);
        assert_eq!(h.object_stage("shop.a"), EtlObjectStage::Error);
        assert_eq!(h.object_stage("shop.b"), EtlObjectStage::Done);
        let task = h.task();
        let failed: Vec<_> = task.failed_objects().map(|o| o.id()).collect();
        assert_eq!(failed, vec!["shop.a".to_string()]);
        assert!(task.object("shop.a").unwrap().error.as_ref().unwrap().message.contains("shop.a"));
        assert!(task.logs.iter().any(|l| l.message.contains("1 succeeded, 1 failed")));
    }

    #[tokio::test]
    async fn test_all_failed() {
        let h = Harness::prepared(2, &["a", "b"]).await;
        h.api.fail_create("shop.a");
        h.api.fail_migrate("shop.b");

        let stage = h.etl.start(&h.store, &h.registry, &h.task).await.unwrap();
        assert_eq!(stage, EtlTaskStage::Failed);

        // A failed create never reaches the migrate step.
        assert!(!h.api.etl_log().contains(&"migrate shop.a".to_string()));
    }

    #[tokio::test]
    async fn test_init_rejects_dead_or_shared_connections() {
        let h = harness(1).await;
        let err = h
            .etl
            .init(&h.store, &h.registry, &h.task, &h.source, &h.source)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidState(_)));

        h.api.kill(h.destination.as_str());
        let err = h
            .etl
            .init(&h.store, &h.registry, &h.task, &h.source, &h.destination)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Connection(ConnectionError::Dead(_))));
        assert_eq!(h.task().stage, EtlTaskStage::Init);

        let tab_owner = {
            let mut store = h.store.lock();
            store.add_query_worksheet("Q");
            ConnectionOwner::QueryTab(store.active_query_tab().unwrap().id.clone())
        };
        h.registry.bind(&h.store, tab_owner, &h.source).await.unwrap();
        let replacement = h
            .registry
            .open("server3", &Credentials::new("maxuser", "maxpwd"))
            .await
            .unwrap()
            .id;
        let err = h
            .etl
            .init(&h.store, &h.registry, &h.task, &h.source, &replacement)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Connection(ConnectionError::InUse(_))));
    }

    #[tokio::test]
    async fn test_selection_rules() {
        let h = harness(1).await;
        let err = h
            .etl
            .select_objects(&h.store, &h.task, vec![SchemaObject::table("shop", "a")])
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidState(_)));

        h.etl
            .init(&h.store, &h.registry, &h.task, &h.source, &h.destination)
            .await
            .unwrap();
        assert!(h.etl.select_objects(&h.store, &h.task, vec![]).is_err());

        let a = SchemaObject::table("shop", "a");
        h.etl
            .select_objects(&h.store, &h.task, vec![a.clone(), a])
            .unwrap();
        assert_eq!(h.task().objects.len(), 1);
        assert_eq!(h.task().stage, EtlTaskStage::SelectingObjects);
    }

    #[tokio::test]
    async fn test_list_objects_does_not_touch_task() {
        let h = harness(1).await;
        h.api.set_objects(vec![SchemaObject::table("shop", "a")]);
        h.etl
            .init(&h.store, &h.registry, &h.task, &h.source, &h.destination)
            .await
            .unwrap();
        let before = h.task();

        let objects = h.etl.list_objects(&h.store, &h.registry, &h.task).await.unwrap();
        assert_eq!(objects, vec![SchemaObject::table("shop", "a")]);
        assert_eq!(h.task(), before);
    }

    #[tokio::test]
    async fn test_lost_source_is_unbound_while_listing() {
        let h = harness(1).await;
        h.etl
            .init(&h.store, &h.registry, &h.task, &h.source, &h.destination)
            .await
            .unwrap();
        h.api.kill(h.source.as_str());

        let err = h.etl.list_objects(&h.store, &h.registry, &h.task).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Api(_)));
        let task = h.task();
        assert!(task.source_connection_id.is_none());
        assert_eq!(task.destination_connection_id, Some(h.destination.clone()));
        assert!(h.registry.is_released(&h.source));
        assert!(h.api.closed().contains(&h.source.to_string()));
    }

    #[tokio::test]
    async fn test_cancel_stops_scheduling() {
        let h = Harness::prepared(1, &["a", "b", "c"]).await;
        let gate = h.api.gate_etl("shop.a");

        let (stage, canceled) = tokio::join!(h.etl.start(&h.store, &h.registry, &h.task), async {
            tokio::task::yield_now().await;
            let canceled = h.etl.cancel(&h.store, &h.registry, &h.task);
            let _ = gate.send(());
            canceled
        });

        canceled.unwrap();
        assert_eq!(stage.unwrap(), EtlTaskStage::Canceled);
        assert_eq!(h.object_stage("shop.a"), EtlObjectStage::Done);
        assert_eq!(h.object_stage("shop.b"), EtlObjectStage::Pending);
        assert_eq!(h.object_stage("shop.c"), EtlObjectStage::Pending);

        let err = h.etl.cancel(&h.store, &h.registry, &h.task).unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidState(_)));
    }
}
