//! # Connection Handle
//!
//! The contract a `Transport` needs from whatever object owns it. This crate does not
//! implement that owner — a real bus daemon or client library would — so only the
//! surface the transport calls into is modeled here. The CLI harness binary provides a
//! minimal implementation to exercise the transport end to end.

use crate::live_bytes::LiveMessage;
use crate::message::Message;
use crate::watch::{TimeoutId, WatchCondition, WatchId};

/// Callback a server-side transport consults to approve or reject the connecting uid,
/// when no out-of-band policy already settled the question.
pub type UnixUserFn = std::sync::Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// What a `Transport` requires of its owner.
///
/// Implementors must not call back into the `Transport` that invoked them from within
/// these methods — the transport's lock may already be held by the caller.
pub trait ConnectionHandle: Send + Sync {
    /// Hand a fully parsed, authenticated message to the owner, wrapped so its byte
    /// size stays counted against the live-message backpressure threshold for as long
    /// as the implementation holds onto it. The counted bytes are released exactly
    /// when this value is dropped (or unwrapped via `LiveMessage::into_inner`) — an
    /// implementation that queues messages for later processing rather than dropping
    /// them immediately is the intended source of backpressure, not a side effect to
    /// work around.
    fn deliver_message(&self, message: LiveMessage<Message>);

    /// The transport has moved to `Disconnected`. Idempotent from the transport's side;
    /// implementations should tolerate being called more than once.
    fn notify_disconnected(&self);

    /// Register a readiness watch on the given raw fd with the host's event loop.
    fn add_watch(&self, fd: std::os::raw::c_int, condition: WatchCondition) -> WatchId;

    fn toggle_watch(&self, id: WatchId, enabled: bool);

    fn remove_watch(&self, id: WatchId);

    fn add_timeout(&self, interval_ms: u32) -> TimeoutId;

    fn remove_timeout(&self, id: TimeoutId);
}
