//! Dispatcher / Public API: `start`, `delete`, `signal`, `get_fd_data`,
//! `list`, `reconnect_process` — the caller-visible surface that couples
//! the registry and tracker under concurrent access.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use procstar_protocol::{
    Message, ProcDeleteRequest, ProcFdData, ProcFdDataRequest, ProcSignalRequest, ProcStart,
    ProcidListRequest,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{uniform_random_strategy, ConnectionRegistry};
use crate::tracker::{Process, ProcessTracker};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Selects an index into a slice of currently-open connections in a group.
pub type SelectionStrategy = Arc<dyn Fn(&[Arc<crate::registry::Connection>]) -> usize + Send + Sync>;

/// Couples the Connection Registry and Process Tracker behind the public
/// operations a caller actually invokes.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    tracker: Arc<ProcessTracker>,
    dispatch_retry_max: u32,
    strategy: SelectionStrategy,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry, tracker: Arc<ProcessTracker>, config: &ServerConfig) -> Self {
        Self {
            registry,
            tracker,
            dispatch_retry_max: config.dispatch_retry_max,
            strategy: Arc::new(uniform_random_strategy),
        }
    }

    /// Overrides the connection-selection strategy (for deterministic
    /// tests); the default is uniform random over open connections.
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    pub fn tracker_handle(&self) -> Arc<ProcessTracker> {
        Arc::clone(&self.tracker)
    }

    /// Starts a new process in `group_id`, retrying selection up to
    /// `dispatch_retry_max` times if the chosen connection's socket closes
    /// between selection and send.
    pub async fn start(
        &self,
        proc_id: &str,
        spec: Value,
        group_id: &str,
    ) -> Result<Arc<Process>, ServerError> {
        let mut specs = BTreeMap::new();
        specs.insert(proc_id.to_owned(), spec);
        let msg = Message::ProcStart(ProcStart { specs });

        let mut attempts = 0;
        let conn = loop {
            let conn = self.registry.choose(group_id, self.strategy.as_ref()).await?;
            match conn.send(&msg).await {
                Ok(()) => break conn,
                Err(ServerError::TransportClosed) if attempts < self.dispatch_retry_max => {
                    attempts += 1;
                    warn!(group_id, attempts, "dispatch send failed, re-selecting");
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        self.tracker.create(&conn.conn_id, proc_id).await
    }

    /// Creates a tracker entry for a process assumed already running on a
    /// known connection, without sending any message to the agent.
    pub async fn reconnect_process(
        &self,
        conn_id: &str,
        proc_id: &str,
    ) -> Result<Arc<Process>, ServerError> {
        if self.registry.get(conn_id).await.is_none() {
            return Err(ServerError::NoConnectionError(conn_id.to_owned()));
        }
        self.tracker.create(conn_id, proc_id).await
    }

    pub async fn delete(&self, proc_id: &str) -> Result<(), ServerError> {
        let process = self
            .tracker
            .get(proc_id)
            .await
            .ok_or_else(|| ServerError::NoProcessError(proc_id.to_owned()))?;
        let conn = self
            .registry
            .get(&process.conn_id)
            .await
            .ok_or_else(|| ServerError::NoConnectionError(process.conn_id.clone()))?;
        conn.send(&Message::ProcDeleteRequest(ProcDeleteRequest {
            proc_id: proc_id.to_owned(),
        }))
        .await
    }

    pub async fn signal(&self, proc_id: &str, signum: i32) -> Result<(), ServerError> {
        let process = self
            .tracker
            .get(proc_id)
            .await
            .ok_or_else(|| ServerError::NoProcessError(proc_id.to_owned()))?;
        let conn = self
            .registry
            .get(&process.conn_id)
            .await
            .ok_or_else(|| ServerError::NoConnectionError(process.conn_id.clone()))?;
        conn.send(&Message::ProcSignalRequest(ProcSignalRequest {
            proc_id: proc_id.to_owned(),
            signum,
        }))
        .await
    }

    /// Requests, then awaits, the next `ProcFdData` reply for `(proc_id,
    /// fd)` covering `[start, stop)`.
    pub async fn get_fd_data(
        &self,
        proc_id: &str,
        fd: &str,
        start: u64,
        stop: Option<u64>,
    ) -> Result<ProcFdData, ServerError> {
        let process = self
            .tracker
            .get(proc_id)
            .await
            .ok_or_else(|| ServerError::NoProcessError(proc_id.to_owned()))?;
        let conn = self
            .registry
            .get(&process.conn_id)
            .await
            .ok_or_else(|| ServerError::NoConnectionError(process.conn_id.clone()))?;

        let mut rx: broadcast::Receiver<ProcFdData> = process.subscribe_fd().await;
        conn.send(&Message::ProcFdDataRequest(ProcFdDataRequest {
            proc_id: proc_id.to_owned(),
            fd: fd.to_owned(),
            start,
            stop,
        }))
        .await?;

        tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, async {
            loop {
                match rx.recv().await {
                    Ok(chunk) if chunk.proc_id == proc_id && chunk.fd == fd && chunk.start == start => {
                        return Ok(chunk);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(ServerError::TransportClosed),
                }
            }
        })
        .await
        .map_err(|_| ServerError::TransportClosed)?
    }

    /// Requests, then awaits, the agent's next `ProcidList` reply.
    pub async fn list(&self, conn_id: &str) -> Result<Vec<String>, ServerError> {
        let conn = self
            .registry
            .get(conn_id)
            .await
            .ok_or_else(|| ServerError::NoConnectionError(conn_id.to_owned()))?;

        let mut rx = conn.subscribe_list();
        conn.send(&Message::ProcidListRequest(ProcidListRequest {}))
            .await?;

        tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, rx.recv())
            .await
            .map_err(|_| ServerError::TransportClosed)?
            .map_err(|_| ServerError::TransportClosed)
    }
}
