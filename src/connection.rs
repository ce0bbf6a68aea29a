use crate::api::{ConnectionHandle, Credentials, ManagementApi};
use crate::error::{ConnectionError, WorkspaceResult};
use crate::logging;
use crate::session::{ConnectionId, ConnectionOwner, SessionStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A live SQL session on the proxy.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub handle: ConnectionHandle,
    /// Server, service or listener the connection was opened against.
    pub target: String,
    pub alive: bool,
    pub owner: Option<ConnectionOwner>,
    pub last_used: Instant,
}

/// Owns every connection handle of a workspace and is the only place that
/// opens or releases them.
pub struct ConnectionRegistry {
    api: Arc<dyn ManagementApi>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    released: Mutex<HashSet<ConnectionId>>,
    probe_after_idle: Duration,
}

impl ConnectionRegistry {
    pub fn new(api: Arc<dyn ManagementApi>, probe_after_idle: Duration) -> Self {
        Self {
            api,
            connections: Mutex::new(HashMap::new()),
            released: Mutex::new(HashSet::new()),
            probe_after_idle,
        }
    }

    /// Requests a new connection token. Failures are returned as-is and
    /// never retried.
    pub async fn open(
        &self,
        target: &str,
        credentials: &Credentials,
    ) -> Result<Connection, ConnectionError> {
        logging::debug(&format!("Opening connection to {} as {}", target, credentials.user));
        let handle = self
            .api
            .open_connection(target, credentials)
            .await
            .map_err(|err| {
                logging::error(&format!("Failed to connect to {}: {}", target, err));
                ConnectionError::OpenFailed {
                    target: target.to_string(),
                    code: err.code(),
                    message: err.to_string(),
                }
            })?;

        let connection = Connection {
            id: ConnectionId::from(handle.id.clone()),
            handle,
            target: target.to_string(),
            alive: true,
            owner: None,
            last_used: Instant::now(),
        };
        self.connections
            .lock()
            .insert(connection.id.clone(), connection.clone());
        logging::info(&format!("Opened connection {} to {}", connection.id, target));
        Ok(connection)
    }

    /// Gives `owner` exclusive use of `conn_id`. A connection previously held
    /// by `owner` is released; a previous owner of `conn_id` loses it.
    pub async fn bind(
        &self,
        store: &Mutex<SessionStore>,
        owner: ConnectionOwner,
        conn_id: &ConnectionId,
    ) -> WorkspaceResult<()> {
        // Fails early if the owner entity does not exist.
        store.lock().owner_connection(&owner)?;

        let previous_owner = {
            let mut connections = self.connections.lock();
            let connection = connections
                .get_mut(conn_id)
                .filter(|c| c.alive)
                .ok_or_else(|| ConnectionError::Dead(conn_id.clone()))?;
            connection.last_used = Instant::now();
            connection.owner.replace(owner.clone())
        };

        let previous_connection = {
            let mut store = store.lock();
            if let Some(previous_owner) = previous_owner.filter(|o| *o != owner) {
                let _ = store.set_owner_connection(&previous_owner, None);
            }
            store.set_owner_connection(&owner, Some(conn_id.clone()))?
        };

        logging::debug(&format!("Bound connection {} to {:?}", conn_id, owner));
        if let Some(previous) = previous_connection.filter(|p| p != conn_id) {
            self.release(&previous).await;
        }
        Ok(())
    }

    /// Lightweight liveness check. A failed probe marks the token dead for good.
    pub async fn probe(&self, conn_id: &ConnectionId) -> bool {
        let handle = match self.connections.lock().get(conn_id).filter(|c| c.alive) {
            Some(connection) => connection.handle.clone(),
            None => return false,
        };

        let alive = match self.api.ping(&handle).await {
            Ok(alive) => alive,
            Err(err) => {
                logging::warn(&format!("Probe of connection {} failed: {}", conn_id, err));
                false
            }
        };

        if let Some(connection) = self.connections.lock().get_mut(conn_id) {
            if alive {
                connection.last_used = Instant::now();
            } else {
                connection.alive = false;
            }
        }
        if !alive {
            logging::warn(&format!("Connection {} is no longer alive", conn_id));
        }
        alive
    }

    /// Invalidates the token on the proxy. Releasing twice is a no-op.
    pub async fn release(&self, conn_id: &ConnectionId) {
        let connection = {
            let mut connections = self.connections.lock();
            let removed = connections.remove(conn_id);
            if removed.is_some() {
                self.released.lock().insert(conn_id.clone());
            }
            removed
        };
        let Some(connection) = connection else {
            logging::debug(&format!("Connection {} already released", conn_id));
            return;
        };

        if let Err(err) = self.api.close_connection(&connection.handle).await {
            logging::warn(&format!(
                "Failed to close connection {} on the proxy: {}",
                conn_id, err
            ));
        }
        logging::info(&format!("Released connection {} to {}", conn_id, connection.target));
    }

    pub async fn release_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.lock().keys().cloned().collect();
        for id in ids {
            self.release(&id).await;
        }
    }

    pub fn get(&self, conn_id: &ConnectionId) -> Option<Connection> {
        self.connections.lock().get(conn_id).cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn is_released(&self, conn_id: &ConnectionId) -> bool {
        self.released.lock().contains(conn_id)
    }

    /// Handle of a connection that may still be used for statements.
    pub fn live_handle(&self, conn_id: &ConnectionId) -> Result<ConnectionHandle, ConnectionError> {
        self.connections
            .lock()
            .get(conn_id)
            .filter(|c| c.alive)
            .map(|c| c.handle.clone())
            .ok_or_else(|| ConnectionError::Dead(conn_id.clone()))
    }

    pub fn mark_dead(&self, conn_id: &ConnectionId) {
        if let Some(connection) = self.connections.lock().get_mut(conn_id) {
            connection.alive = false;
        }
    }

    /// Marks a lost token dead and releases it. `owner` is unbound first if
    /// it still holds the token.
    pub async fn drop_lost(
        &self,
        store: &Mutex<SessionStore>,
        owner: &ConnectionOwner,
        conn_id: &ConnectionId,
    ) {
        self.mark_dead(conn_id);
        {
            let mut store = store.lock();
            if store.owner_connection(owner).ok().flatten().as_ref() == Some(conn_id) {
                let _ = store.set_owner_connection(owner, None);
            }
        }
        logging::warn(&format!("Connection {} lost, unbound from {:?}", conn_id, owner));
        self.release(conn_id).await;
    }

    pub fn touch(&self, conn_id: &ConnectionId) {
        if let Some(connection) = self.connections.lock().get_mut(conn_id) {
            connection.last_used = Instant::now();
        }
    }

    /// True once the connection has been idle long enough to warrant a probe.
    pub fn needs_probe(&self, conn_id: &ConnectionId) -> bool {
        self.connections
            .lock()
            .get(conn_id)
            .map_or(false, |c| c.last_used.elapsed() >= self.probe_after_idle)
    }
}
