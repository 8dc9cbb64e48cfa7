//! Process Tracker: the table mapping remote process IDs to result streams,
//! fed asynchronously by inbound agent messages.

use std::collections::HashMap;
use std::sync::Arc;

use procstar_protocol::{Message, ProcFdData};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, warn};

use crate::error::ServerError;

const HISTORY_CAP: usize = 1024;
const WAIT_CHANNEL_CAP: usize = 256;

/// Why an agent-reported error attached to a process.
#[derive(Debug, Clone)]
pub enum ErrorSource {
    ProcUnknown,
    IncomingMessageError { msg: String },
}

#[derive(Debug, Clone)]
pub struct ProcessError {
    pub message: String,
    pub source: ErrorSource,
}

/// One event in a process's result sequence: a new result, the deleted
/// sentinel, or an attached error. `wait()` resolves to the next of these;
/// `results()` replays the whole sequence from wherever the caller left off.
#[derive(Debug, Clone)]
pub enum WaitEvent {
    Result(Value),
    Deleted,
    Error(ProcessError),
}

struct Inner {
    latest_result: Option<Value>,
    errors: Vec<ProcessError>,
    history: Vec<WaitEvent>,
    tx: broadcast::Sender<WaitEvent>,
    fd_chunks: HashMap<String, Vec<ProcFdData>>,
    fd_tx: broadcast::Sender<ProcFdData>,
    deleted: bool,
}

/// Server-side handle for one remote OS process.
pub struct Process {
    pub proc_id: String,
    pub conn_id: String,
    state: Mutex<Inner>,
}

impl Process {
    fn new(conn_id: &str, proc_id: &str) -> Arc<Self> {
        let (tx, _) = broadcast::channel(WAIT_CHANNEL_CAP);
        let (fd_tx, _) = broadcast::channel(WAIT_CHANNEL_CAP);
        Arc::new(Self {
            proc_id: proc_id.to_owned(),
            conn_id: conn_id.to_owned(),
            state: Mutex::new(Inner {
                latest_result: None,
                errors: Vec::new(),
                history: Vec::new(),
                tx,
                fd_chunks: HashMap::new(),
                fd_tx,
                deleted: false,
            }),
        })
    }

    pub async fn latest_result(&self) -> Option<Value> {
        self.state.lock().await.latest_result.clone()
    }

    pub async fn errors(&self) -> Vec<ProcessError> {
        self.state.lock().await.errors.clone()
    }

    pub async fn is_deleted(&self) -> bool {
        self.state.lock().await.deleted
    }

    async fn push_event(&self, event: WaitEvent) {
        let mut inner = self.state.lock().await;
        if inner.history.len() >= HISTORY_CAP {
            inner.history.remove(0);
        }
        inner.history.push(event.clone());
        let _ = inner.tx.send(event);
    }

    pub async fn record_result(&self, res: Value) {
        {
            let mut inner = self.state.lock().await;
            inner.latest_result = Some(res.clone());
        }
        self.push_event(WaitEvent::Result(res)).await;
    }

    pub async fn record_error(&self, error: ProcessError) {
        {
            let mut inner = self.state.lock().await;
            inner.errors.push(error.clone());
        }
        self.push_event(WaitEvent::Error(error)).await;
    }

    pub async fn record_fd_data(&self, chunk: ProcFdData) {
        let mut inner = self.state.lock().await;
        inner
            .fd_chunks
            .entry(chunk.fd.clone())
            .or_default()
            .push(chunk.clone());
        let _ = inner.fd_tx.send(chunk);
    }

    pub async fn mark_deleted(&self) {
        {
            let mut inner = self.state.lock().await;
            inner.deleted = true;
        }
        self.push_event(WaitEvent::Deleted).await;
    }

    /// Resolves to the next event affecting this process. Multiple
    /// concurrent callers all resolve to the *same* next event.
    pub async fn wait(self: &Arc<Self>) -> WaitEvent {
        let mut rx = {
            let inner = self.state.lock().await;
            inner.tx.subscribe()
        };
        loop {
            match rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return WaitEvent::Deleted,
            }
        }
    }

    /// A lazy, restartable iterator over this process's result sequence.
    pub fn results(self: &Arc<Self>) -> ResultsStream {
        ResultsStream {
            process: Arc::clone(self),
            cursor: 0,
        }
    }

    /// Subscribes to live FD-data chunks, for use by `get_fd_data`.
    pub(crate) async fn subscribe_fd(&self) -> broadcast::Receiver<ProcFdData> {
        self.state.lock().await.fd_tx.subscribe()
    }
}

/// Restartable cursor over a [`Process`]'s result history. Drains the
/// bounded in-memory history first, then transparently switches to awaiting
/// the live broadcast channel once caught up.
pub struct ResultsStream {
    process: Arc<Process>,
    cursor: usize,
}

impl ResultsStream {
    pub async fn next(&mut self) -> WaitEvent {
        loop {
            let mut rx = {
                let inner = self.process.state.lock().await;
                if self.cursor < inner.history.len() {
                    let event = inner.history[self.cursor].clone();
                    self.cursor += 1;
                    return event;
                }
                inner.tx.subscribe()
            };
            match rx.recv().await {
                Ok(event) => {
                    self.cursor += 1;
                    return event;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return WaitEvent::Deleted,
            }
        }
    }
}

/// Table of tracked processes, keyed by `proc_id`.
pub struct ProcessTracker {
    processes: RwLock<HashMap<String, Arc<Process>>>,
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, conn_id: &str, proc_id: &str) -> Result<Arc<Process>, ServerError> {
        let mut map = self.processes.write().await;
        if map.contains_key(proc_id) {
            return Err(ServerError::ProcessAlreadyExists(proc_id.to_owned()));
        }
        let process = Process::new(conn_id, proc_id);
        map.insert(proc_id.to_owned(), Arc::clone(&process));
        Ok(process)
    }

    pub async fn get_or_create(&self, conn_id: &str, proc_id: &str) -> Arc<Process> {
        if let Some(process) = self.processes.read().await.get(proc_id) {
            return Arc::clone(process);
        }
        let mut map = self.processes.write().await;
        if let Some(process) = map.get(proc_id) {
            return Arc::clone(process);
        }
        let process = Process::new(conn_id, proc_id);
        map.insert(proc_id.to_owned(), Arc::clone(&process));
        process
    }

    pub async fn get(&self, proc_id: &str) -> Option<Arc<Process>> {
        self.processes.read().await.get(proc_id).cloned()
    }

    pub async fn remove(&self, proc_id: &str) -> Option<Arc<Process>> {
        self.processes.write().await.remove(proc_id)
    }

    /// Type-routes one inbound per-process message, per the wire tag.
    pub async fn on_message(&self, conn_id: &str, tag: &str, msg: Message) {
        match msg {
            Message::ProcidList(list) => {
                for proc_id in list.proc_ids {
                    self.get_or_create(conn_id, &proc_id).await;
                }
            }
            Message::ProcResult(m) => {
                let process = self.get_or_create(conn_id, &m.proc_id).await;
                process.record_result(m.res).await;
            }
            Message::ProcFdData(chunk) => {
                let process = self.get_or_create(conn_id, &chunk.proc_id).await;
                process.record_fd_data(chunk).await;
            }
            Message::ProcDelete(m) => {
                if let Some(process) = self.remove(&m.proc_id).await {
                    process.mark_deleted().await;
                }
            }
            Message::ProcUnknown(m) => {
                let process = self.get_or_create(conn_id, &m.proc_id).await;
                process
                    .record_error(ProcessError {
                        message: format!("agent does not recognize process {}", m.proc_id),
                        source: ErrorSource::ProcUnknown,
                    })
                    .await;
            }
            Message::IncomingMessageError(m) => {
                let proc_id = m
                    .msg
                    .get("proc_id")
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned);
                match proc_id {
                    Some(proc_id) => {
                        let process = self.get_or_create(conn_id, &proc_id).await;
                        process
                            .record_error(ProcessError {
                                message: m.err.clone(),
                                source: ErrorSource::IncomingMessageError { msg: m.err },
                            })
                            .await;
                    }
                    None => warn!(conn_id, err = %m.err, "incoming message error with no proc_id"),
                }
            }
            Message::Register(_) => {
                error!(conn_id, "unexpected Register after handshake");
            }
            other => {
                warn!(conn_id, tag, ?other, "message not routable to tracker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procstar_protocol::{ProcDelete, ProcResult, ProcUnknown, ProcidList};

    #[tokio::test]
    async fn create_fails_on_duplicate_proc_id() {
        let tracker = ProcessTracker::new();
        tracker.create("c1", "p1").await.unwrap();
        let err = tracker.create("c1", "p1").await.unwrap_err();
        assert!(matches!(err, ServerError::ProcessAlreadyExists(p) if p == "p1"));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let tracker = ProcessTracker::new();
        let a = tracker.get_or_create("c1", "p1").await;
        let b = tracker.get_or_create("c1", "p1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn proc_result_resolves_current_waiters_and_updates_latest() {
        let tracker = ProcessTracker::new();
        let process = tracker.create("c1", "p1").await.unwrap();
        let waiter = tokio::spawn({
            let process = Arc::clone(&process);
            async move { process.wait().await }
        });
        tokio::task::yield_now().await;

        tracker
            .on_message(
                "c1",
                "ProcResult",
                Message::ProcResult(ProcResult {
                    proc_id: "p1".into(),
                    res: serde_json::json!({"pid": 1}),
                }),
            )
            .await;

        let event = waiter.await.unwrap();
        assert!(matches!(event, WaitEvent::Result(v) if v == serde_json::json!({"pid": 1})));
        assert_eq!(
            process.latest_result().await,
            Some(serde_json::json!({"pid": 1}))
        );
    }

    #[tokio::test]
    async fn proc_delete_resolves_waiters_with_deleted_sentinel_and_removes_entry() {
        let tracker = ProcessTracker::new();
        let process = tracker.create("c1", "p1").await.unwrap();
        let waiter = tokio::spawn({
            let process = Arc::clone(&process);
            async move { process.wait().await }
        });
        tokio::task::yield_now().await;

        tracker
            .on_message(
                "c1",
                "ProcDelete",
                Message::ProcDelete(ProcDelete {
                    proc_id: "p1".into(),
                }),
            )
            .await;

        assert!(matches!(waiter.await.unwrap(), WaitEvent::Deleted));
        assert!(tracker.get("p1").await.is_none());
    }

    #[tokio::test]
    async fn procid_list_creates_entries_implicitly() {
        let tracker = ProcessTracker::new();
        tracker
            .on_message(
                "c1",
                "ProcidList",
                Message::ProcidList(ProcidList {
                    proc_ids: vec!["p1".into(), "p2".into()],
                }),
            )
            .await;
        assert!(tracker.get("p1").await.is_some());
        assert!(tracker.get("p2").await.is_some());
    }

    #[tokio::test]
    async fn proc_unknown_attaches_error() {
        let tracker = ProcessTracker::new();
        tracker.create("c1", "p1").await.unwrap();
        tracker
            .on_message(
                "c1",
                "ProcUnknown",
                Message::ProcUnknown(ProcUnknown {
                    proc_id: "p1".into(),
                }),
            )
            .await;
        let process = tracker.get("p1").await.unwrap();
        let errors = process.errors().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].source, ErrorSource::ProcUnknown));
    }

    #[tokio::test]
    async fn results_stream_replays_history_then_switches_to_live() {
        let tracker = ProcessTracker::new();
        let process = tracker.create("c1", "p1").await.unwrap();
        process.record_result(serde_json::json!({"n": 1})).await;
        process.record_result(serde_json::json!({"n": 2})).await;

        let mut stream = process.results();
        assert!(matches!(stream.next().await, WaitEvent::Result(v) if v["n"] == 1));
        assert!(matches!(stream.next().await, WaitEvent::Result(v) if v["n"] == 2));

        let process_clone = Arc::clone(&process);
        let handle = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        process_clone
            .record_result(serde_json::json!({"n": 3}))
            .await;
        assert!(matches!(handle.await.unwrap(), WaitEvent::Result(v) if v["n"] == 3));
    }
}
