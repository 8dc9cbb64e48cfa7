//! procstar agent wire protocol: message types and a length-framed
//! MessagePack codec.
//!
//! All messages are tagged maps: `{"type": <tag>, ...fields}`. See
//! [`codec`] for the encode/decode entry points and [`message`] for the
//! variant definitions.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError, WireFrame};
pub use message::*;
