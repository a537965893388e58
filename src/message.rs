//! # Wire Message
//!
//! The message carried over the stream once authentication completes. Routing and
//! schema validation of the full D-Bus type system are out of scope; a message here
//! carries only the header fields needed for framing and delivery accounting plus an
//! opaque payload, which is exactly as much structure as this transport layer needs.

use serde::{Deserialize, Serialize};

/// How a message expects to be handled once delivered — enough to let a Connection
/// route a reply without this crate understanding D-Bus's interface/method schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Method call, no reply expected (`NO_REPLY_EXPECTED` semantics).
    MethodCallNoReply,
    /// Method call, reply expected.
    MethodCall,
    /// Reply to a prior method call.
    MethodReturn,
    /// Reply indicating the prior method call failed.
    Error,
    /// Broadcast signal, no reply possible.
    Signal,
}

/// A framed message: the unit the Message Loader produces and the backend writes.
///
/// `serial` is the sender-assigned correlation id (method calls/returns/errors use it
/// to pair up); `reply_serial` is populated on `MethodReturn`/`Error` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub kind: MessageKind,
    /// Opaque message body. This crate does not interpret its contents.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(serial: u32, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            serial,
            reply_serial: None,
            kind,
            payload,
        }
    }

    pub fn reply_to(serial: u32, reply_serial: u32, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            serial,
            reply_serial: Some(reply_serial),
            kind,
            payload,
        }
    }

    /// Size in bytes as accounted by the live-byte counter: header fields plus payload,
    /// not the encoded wire size (which also carries bincode's own framing overhead).
    pub fn accounted_size(&self) -> usize {
        4 + // serial
        5 + // reply_serial (Option<u32> discriminant + value, approximated)
        1 + // kind discriminant
        self.payload.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
