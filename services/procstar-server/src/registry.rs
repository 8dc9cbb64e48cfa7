//! Connection Registry: an addressable set of agent connections whose
//! identity persists across socket drops and reconnects.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use procstar_protocol::{Message, ProcessInfo};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};

use crate::error::ServerError;
use crate::transport::WsSink;

/// Point-in-time, `Clone`-able view of a [`Connection`], for subscribers.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub conn_id: String,
    pub group_id: String,
    pub info: SocketAddr,
    pub agent_info: ProcessInfo,
    pub restricted_exe: Option<String>,
}

struct ConnectionState {
    info: SocketAddr,
    agent_info: ProcessInfo,
    restricted_exe: Option<String>,
    socket: Option<WsSink>,
    /// Bumped on every `rebind`. Lets a handler whose socket has since been
    /// superseded tell, at its own Closed stage, that it must not clear the
    /// newer socket that replaced it.
    generation: u64,
}

/// Stable identity for one agent across reconnects. `conn_id` and `group_id`
/// never change after construction; `info`, `agent_info`, and `socket` are
/// swapped in place on rebind.
pub struct Connection {
    pub conn_id: String,
    pub group_id: String,
    state: AsyncMutex<ConnectionState>,
    /// Fan-out for `ProcidList` replies from this agent, so `Dispatcher::list`
    /// can await the next one without a protocol-level correlation id.
    list_tx: tokio::sync::broadcast::Sender<Vec<String>>,
}

impl Connection {
    pub fn new(
        conn_id: impl Into<String>,
        group_id: impl Into<String>,
        info: SocketAddr,
        agent_info: ProcessInfo,
        restricted_exe: Option<String>,
        socket: WsSink,
    ) -> Arc<Self> {
        let (list_tx, _) = tokio::sync::broadcast::channel(16);
        Arc::new(Self {
            conn_id: conn_id.into(),
            group_id: group_id.into(),
            state: AsyncMutex::new(ConnectionState {
                info,
                agent_info,
                restricted_exe,
                socket: Some(socket),
                generation: 0,
            }),
            list_tx,
        })
    }

    /// Subscribes to this connection's `ProcidList` replies.
    pub fn subscribe_list(&self) -> tokio::sync::broadcast::Receiver<Vec<String>> {
        self.list_tx.subscribe()
    }

    /// Publishes a `ProcidList` reply to anyone awaiting `Dispatcher::list`.
    pub fn record_list(&self, proc_ids: Vec<String>) {
        let _ = self.list_tx.send(proc_ids);
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock().await;
        ConnectionSnapshot {
            conn_id: self.conn_id.clone(),
            group_id: self.group_id.clone(),
            info: state.info,
            agent_info: state.agent_info.clone(),
            restricted_exe: state.restricted_exe.clone(),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.socket.is_some()
    }

    /// Swaps in a new peer address, agent snapshot, and socket, returning
    /// whatever socket was previously attached (the caller — the handler —
    /// decides how to log and close it) and the new generation number the
    /// caller should remember for its own eventual `close_if_current`.
    pub async fn rebind(
        &self,
        info: SocketAddr,
        agent_info: ProcessInfo,
        restricted_exe: Option<String>,
        socket: WsSink,
    ) -> (Option<WsSink>, u64) {
        let mut state = self.state.lock().await;
        let old_socket = state.socket.take();
        state.info = info;
        state.agent_info = agent_info;
        state.restricted_exe = restricted_exe;
        state.socket = Some(socket);
        state.generation += 1;
        (old_socket, state.generation)
    }

    /// Closes and clears the current socket, but only if it is still at
    /// `generation` — i.e. no rebind has superseded it since the caller last
    /// attached a socket. Otherwise a no-op: the record now belongs to a
    /// newer handler, which will close it in turn.
    pub async fn close_if_current(&self, generation: u64) {
        use futures_util::SinkExt;
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        if let Some(mut sink) = state.socket.take() {
            let _ = sink.close().await;
        }
    }

    /// Encodes and writes one message, serializing with any concurrent send
    /// on this connection. Clears the socket and returns `TransportClosed`
    /// on failure.
    pub async fn send(&self, msg: &Message) -> Result<(), ServerError> {
        use futures_util::SinkExt;
        let bytes = procstar_protocol::encode(msg)?;
        let mut state = self.state.lock().await;
        let Some(sink) = state.socket.as_mut() else {
            return Err(ServerError::TransportClosed);
        };
        if sink
            .send(tokio_tungstenite::tungstenite::Message::Binary(
                bytes.into(),
            ))
            .await
            .is_err()
        {
            state.socket = None;
            return Err(ServerError::TransportClosed);
        }
        Ok(())
    }
}

type SubscriberEntry = (u64, mpsc::UnboundedSender<(String, Option<ConnectionSnapshot>)>);

struct SubscriberList {
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
}

/// A scoped acquisition of the registry's event stream. Dropping it
/// synchronously removes the subscriber so no further events are buffered
/// for it.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<(String, Option<ConnectionSnapshot>)>,
    subscribers: Arc<std::sync::Mutex<SubscriberList>>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<(String, Option<ConnectionSnapshot>)> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut list = self.subscribers.lock().unwrap();
        list.subscribers.retain(|(id, _)| *id != self.id);
    }
}

/// Mapping keyed by `conn_id`, plus a `group_id -> {conn_id}` index and a
/// subscription bus.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
    groups: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    subscribers: Arc<std::sync::Mutex<SubscriberList>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(std::sync::Mutex::new(SubscriberList {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    async fn publish(&self, conn_id: String, snapshot: Option<ConnectionSnapshot>) {
        let subscribers = self.subscribers.lock().unwrap();
        for (_, tx) in &subscribers.subscribers {
            let _ = tx.send((conn_id.clone(), snapshot.clone()));
        }
    }

    /// Inserts a brand-new connection. Asserts `conn_id` is not already
    /// present — callers rebind existing records via [`Connection::rebind`]
    /// instead of calling `add` again.
    pub async fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id.clone();
        let group_id = conn.group_id.clone();
        {
            let mut connections = self.connections.write().await;
            debug_assert!(
                !connections.contains_key(&conn_id),
                "add() called for an already-registered conn_id"
            );
            connections.insert(conn_id.clone(), Arc::clone(&conn));
        }
        {
            let mut groups = self.groups.write().await;
            groups.entry(group_id).or_default().insert(conn_id.clone());
        }
        let snapshot = conn.snapshot().await;
        self.publish(conn_id, Some(snapshot)).await;
    }

    /// Removes a connection entirely. Only used at server shutdown — a
    /// socket closing mid-session leaves the record in place so the agent
    /// can rebind.
    pub async fn remove(&self, conn_id: &str) {
        let removed = self.connections.write().await.remove(conn_id);
        if let Some(conn) = removed {
            let mut groups = self.groups.write().await;
            if let Some(set) = groups.get_mut(&conn.group_id) {
                set.remove(conn_id);
                if set.is_empty() {
                    groups.remove(&conn.group_id);
                }
            }
        }
        self.publish(conn_id.to_owned(), None).await;
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Selects one open connection from `group_id` using `strategy`, which
    /// picks an index into the slice of currently-open members.
    pub async fn choose(
        &self,
        group_id: &str,
        strategy: &(dyn Fn(&[Arc<Connection>]) -> usize + Send + Sync),
    ) -> Result<Arc<Connection>, ServerError> {
        let conn_ids: Vec<String> = {
            let groups = self.groups.read().await;
            match groups.get(group_id) {
                Some(set) if !set.is_empty() => set.iter().cloned().collect(),
                _ => return Err(ServerError::NoGroupError(group_id.to_owned())),
            }
        };

        let connections = self.connections.read().await;
        let mut open = Vec::new();
        for conn_id in &conn_ids {
            if let Some(conn) = connections.get(conn_id) {
                if conn.is_open().await {
                    open.push(Arc::clone(conn));
                }
            }
        }
        drop(connections);

        if open.is_empty() {
            return Err(ServerError::NoOpenConnectionInGroup(group_id.to_owned()));
        }
        let idx = strategy(&open).min(open.len() - 1);
        Ok(Arc::clone(&open[idx]))
    }

    /// Scoped acquisition of the event stream: every `add`/`remove` after
    /// this call, in commit order, until the returned [`Subscription`] is
    /// dropped.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut subscribers = self.subscribers.lock().unwrap();
            let id = subscribers.next_id;
            subscribers.next_id += 1;
            subscribers.subscribers.push((id, tx));
            id
        };
        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

/// Default connection-selection strategy: uniform random over open members.
pub fn uniform_random_strategy(open: &[Arc<Connection>]) -> usize {
    use rand::Rng;
    rand::thread_rng().gen_range(0..open.len())
}
