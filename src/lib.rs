//! # D-Bus-Style Message Transport
//!
//! An authenticated, credential-aware message transport layer for a D-Bus-style IPC
//! bus: SASL `EXTERNAL` handshake, an incremental length-prefixed frame loader, and a
//! backpressure-aware live-message byte counter, all behind a small set of pluggable
//! backends (unix domain socket, TCP, autolaunch, and an in-process debug pipe used by
//! this crate's own tests).

pub mod alloc;
pub mod auth;
pub mod backend;
pub mod cli;
pub mod connection;
pub mod error;
pub mod live_bytes;
pub mod loader;
pub mod logging;
pub mod message;
pub mod open;
pub mod transport;
pub mod watch;

pub use auth::{AuthSession, AuthStep, Credentials};
pub use cli::Args;
pub use connection::ConnectionHandle;
pub use error::TransportError;
pub use live_bytes::{LiveByteCounter, LiveMessage};
pub use loader::{LoadOutcome, MessageLoader};
pub use message::{Message, MessageKind};
pub use open::{parse_address, AddressEntry, OpenOptions, OpenRegistry, OpenResult};
pub use transport::{DispatchStatus, Transport};
pub use watch::{TimeoutId, WatchCondition, WatchId, WatchRegistry};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default thresholds, gathered in one place so callers don't have to hunt through
/// module internals to find them.
pub mod defaults {
    /// Soft cap, in bytes, on the sum of not-yet-delivered message payload sizes before
    /// a backend is asked to stop reading, see `LiveByteCounter`.
    pub const MAX_LIVE_MESSAGES_SIZE: i64 = crate::transport::DEFAULT_MAX_LIVE_MESSAGES_SIZE;

    /// Hard cap, in bytes, on a single incoming message frame before the stream is
    /// considered corrupted, see `MessageLoader`.
    pub const MAX_MESSAGE_SIZE: usize = crate::transport::DEFAULT_MAX_MESSAGE_SIZE;

    /// Sentinel for "no uid known yet" (`Credentials::unset`, non-unix `current_uid`).
    pub const UNSET_UID: u32 = crate::auth::UNSET_UID;

    /// Sentinel for "no pid known yet" (`Credentials::unset`).
    pub const UNSET_PID: u32 = crate::auth::UNSET_PID;
}
