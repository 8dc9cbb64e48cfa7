//! Encoding and decoding of [`Message`] to/from length-framed MessagePack.
//!
//! The codec is purely functional: no I/O, no knowledge of the transport.
//! Decoding goes through a generic [`rmpv::Value`] first (mirroring the
//! original implementation's two-step `msgpack.loads` then dataclass
//! construction) so that each failure mode gets its own error variant
//! instead of collapsing into one generic "deserialize failed".

use crate::message::*;
use rmpv::Value;
use thiserror::Error;

/// Classifies the raw WebSocket frame payload handed to [`decode`].
///
/// Only binary frames carry protocol messages; a text frame is always a
/// protocol error, but the distinction has to be made before the bytes are
/// even attempted as MessagePack.
pub enum WireFrame<'a> {
    Binary(&'a [u8]),
    Text(&'a str),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("wrong frame type")]
    WrongFrameType,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("msg not a map")]
    NotAMap,
    #[error("missing type")]
    MissingType,
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("invalid {tag}: {detail}")]
    InvalidField { tag: String, detail: String },
}

/// Encodes a message as `{"type": <tag>, ...fields}` MessagePack bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let tag = msg.tag();
    let mut entries = match msg {
        Message::Register(m) => to_map(m)?,
        Message::Registered(m) => to_map(m)?,
        Message::ProcStart(m) => to_map(m)?,
        Message::ProcidListRequest(m) => to_map(m)?,
        Message::ProcResultRequest(m) => to_map(m)?,
        Message::ProcSignalRequest(m) => to_map(m)?,
        Message::ProcFdDataRequest(m) => to_map(m)?,
        Message::ProcDeleteRequest(m) => to_map(m)?,
        Message::ProcidList(m) => to_map(m)?,
        Message::ProcResult(m) => to_map(m)?,
        Message::ProcFdData(m) => to_map(m)?,
        Message::ProcDelete(m) => to_map(m)?,
        Message::ProcUnknown(m) => to_map(m)?,
        Message::IncomingMessageError(m) => to_map(m)?,
    };
    entries.insert(0, (Value::from("type"), Value::from(tag)));
    rmp_serde::to_vec(&Value::Map(entries)).map_err(|e| ProtocolError::Decode(e.to_string()))
}

fn to_map<T: serde::Serialize>(value: &T) -> Result<Vec<(Value, Value)>, ProtocolError> {
    match rmpv::ext::to_value(value).map_err(|e| ProtocolError::Decode(e.to_string()))? {
        Value::Map(entries) => Ok(entries),
        _ => Err(ProtocolError::NotAMap),
    }
}

/// Decodes a raw frame into its wire tag and typed [`Message`].
pub fn decode(frame: WireFrame<'_>) -> Result<(String, Message), ProtocolError> {
    let bytes = match frame {
        WireFrame::Binary(b) => b,
        WireFrame::Text(_) => return Err(ProtocolError::WrongFrameType),
    };

    let value: Value =
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let mut entries = match value {
        Value::Map(entries) => entries,
        _ => return Err(ProtocolError::NotAMap),
    };

    let type_idx = entries
        .iter()
        .position(|(k, _)| k.as_str() == Some("type"))
        .ok_or(ProtocolError::MissingType)?;
    let (_, type_value) = entries.remove(type_idx);
    let tag = type_value
        .as_str()
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    let rest = Value::Map(entries);
    let msg = match tag.as_str() {
        "Register" => Message::Register(from_map(&tag, rest)?),
        "Registered" => Message::Registered(from_map(&tag, rest)?),
        "ProcStart" => Message::ProcStart(from_map(&tag, rest)?),
        "ProcidListRequest" => Message::ProcidListRequest(from_map(&tag, rest)?),
        "ProcResultRequest" => Message::ProcResultRequest(from_map(&tag, rest)?),
        "ProcSignalRequest" => Message::ProcSignalRequest(from_map(&tag, rest)?),
        "ProcFdDataRequest" => Message::ProcFdDataRequest(from_map(&tag, rest)?),
        "ProcDeleteRequest" => Message::ProcDeleteRequest(from_map(&tag, rest)?),
        "ProcidList" => Message::ProcidList(from_map(&tag, rest)?),
        "ProcResult" => Message::ProcResult(from_map(&tag, rest)?),
        "ProcFdData" => Message::ProcFdData(from_map(&tag, rest)?),
        "ProcDelete" => Message::ProcDelete(from_map(&tag, rest)?),
        "ProcUnknown" => Message::ProcUnknown(from_map(&tag, rest)?),
        "IncomingMessageError" => Message::IncomingMessageError(from_map(&tag, rest)?),
        other => return Err(ProtocolError::UnknownType(other.to_owned())),
    };

    Ok((tag, msg))
}

fn from_map<T: serde::de::DeserializeOwned>(tag: &str, value: Value) -> Result<T, ProtocolError> {
    rmpv::ext::from_value(value).map_err(|e| ProtocolError::InvalidField {
        tag: tag.to_owned(),
        detail: e.to_string(),
    })
}
