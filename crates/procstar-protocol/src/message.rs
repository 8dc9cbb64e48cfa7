//! Wire message types for the procstar agent protocol.
//!
//! Every variant name below is also its wire tag (the `"type"` field of the
//! encoded MessagePack map) — see [`crate::codec`].

use serde::{Deserialize, Serialize};

/// Default TCP port procstar agents dial.
pub const DEFAULT_PORT: u16 = 18782;
/// Group an agent joins when it does not specify one.
pub const DEFAULT_GROUP: &str = "default";

/// Identity of one agent connection, supplied at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub conn_id: String,
    #[serde(default = "default_group")]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_exe: Option<String>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_owned()
}

/// Snapshot of the agent process's identity, supplied at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub euid: u32,
    pub username: String,
    pub gid: u32,
    pub egid: u32,
    pub groupname: String,
    pub hostname: String,
}

// ---------------------------------------------------------------------------
// Agent -> server
// ---------------------------------------------------------------------------

/// Mandatory first frame from an agent. Carries identity and the bearer
/// token; an empty `access_token` is only accepted when the server was
/// configured with no token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub conn: ConnectionInfo,
    pub proc: ProcessInfo,
    #[serde(default)]
    pub access_token: String,
}

/// Full list of processes the agent currently tracks, sent unprompted after
/// reconnect so the server can reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcidList {
    pub proc_ids: Vec<String>,
}

/// New result snapshot for one process. `res` is opaque to the server and
/// handed to waiters verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcResult {
    pub proc_id: String,
    pub res: serde_json::Value,
}

/// A byte range of one captured file descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcFdData {
    pub proc_id: String,
    pub fd: String,
    pub start: u64,
    pub stop: u64,
    pub encoding: String,
    pub data: String,
}

/// The agent has removed this process; the server forgets it too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcDelete {
    pub proc_id: String,
}

/// The agent does not recognize `proc_id` (e.g. a stale `ProcResultRequest`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcUnknown {
    pub proc_id: String,
}

/// The agent rejected a message the server sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessageError {
    pub msg: serde_json::Value,
    pub err: String,
}

// ---------------------------------------------------------------------------
// Server -> agent
// ---------------------------------------------------------------------------

/// Acknowledges a successful `Register`. Carries no fields, but is a
/// braced empty struct rather than a unit struct: serde derive serializes
/// a unit struct as a bare `nil`, which the codec's map-shaped wire format
/// can't round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registered {}

/// Start one or more new processes. Keyed by `proc_id`; `spec` is opaque and
/// passed through to the agent verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcStart {
    pub specs: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Request the agent's full process list. Carries no fields; see
/// [`Registered`] for why this is a braced empty struct, not a unit struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcidListRequest {}

/// Request the current result for a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcResultRequest {
    pub proc_id: String,
}

/// Send a signal to a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcSignalRequest {
    pub proc_id: String,
    pub signum: i32,
}

/// Request a byte range of captured FD data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcFdDataRequest {
    pub proc_id: String,
    pub fd: String,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub stop: Option<u64>,
}

/// Request that the agent delete a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcDeleteRequest {
    pub proc_id: String,
}

// ---------------------------------------------------------------------------
// Top-level union
// ---------------------------------------------------------------------------

/// Every message kind the protocol defines, tagged by its wire `"type"`.
///
/// Unlike a `#[serde(tag = "type")]` derive, encoding/decoding is hand-rolled
/// in [`crate::codec`] so that malformed frames produce the specific
/// `ProtocolError` variants the handshake and receive loop distinguish on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Register(Register),
    Registered(Registered),
    ProcStart(ProcStart),
    ProcidListRequest(ProcidListRequest),
    ProcResultRequest(ProcResultRequest),
    ProcSignalRequest(ProcSignalRequest),
    ProcFdDataRequest(ProcFdDataRequest),
    ProcDeleteRequest(ProcDeleteRequest),
    ProcidList(ProcidList),
    ProcResult(ProcResult),
    ProcFdData(ProcFdData),
    ProcDelete(ProcDelete),
    ProcUnknown(ProcUnknown),
    IncomingMessageError(IncomingMessageError),
}

impl Message {
    /// The wire tag for this message, i.e. the value of its `"type"` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Register(_) => "Register",
            Message::Registered(_) => "Registered",
            Message::ProcStart(_) => "ProcStart",
            Message::ProcidListRequest(_) => "ProcidListRequest",
            Message::ProcResultRequest(_) => "ProcResultRequest",
            Message::ProcSignalRequest(_) => "ProcSignalRequest",
            Message::ProcFdDataRequest(_) => "ProcFdDataRequest",
            Message::ProcDeleteRequest(_) => "ProcDeleteRequest",
            Message::ProcidList(_) => "ProcidList",
            Message::ProcResult(_) => "ProcResult",
            Message::ProcFdData(_) => "ProcFdData",
            Message::ProcDelete(_) => "ProcDelete",
            Message::ProcUnknown(_) => "ProcUnknown",
            Message::IncomingMessageError(_) => "IncomingMessageError",
        }
    }
}
