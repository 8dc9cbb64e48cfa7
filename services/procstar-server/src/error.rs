//! Error types surfaced by the dispatcher and its supporting components.

use procstar_protocol::ProtocolError;
use thiserror::Error;

/// Everything a caller of the public API (`Dispatcher`) can get back.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no such group: {0}")]
    NoGroupError(String),
    #[error("no open connection in group: {0}")]
    NoOpenConnectionInGroup(String),
    #[error("no such connection: {0}")]
    NoConnectionError(String),
    #[error("no such process: {0}")]
    NoProcessError(String),
    #[error("process already tracked: {0}")]
    ProcessAlreadyExists(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport closed")]
    TransportClosed,
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
