//! # Transport Backend
//!
//! The object-safe surface every concrete stream variant implements. A `Transport`
//! owns exactly one `BackendKind` for its whole lifetime; dispatch is a `match` over a
//! closed enum rather than a trait-object vtable, so the compiler checks every variant
//! is handled wherever the backend is consulted (see the enum-dispatch choice recorded
//! in the project design notes).

pub mod autolaunch;
pub mod debug_pipe;
pub mod tcp;
pub mod unix;

use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use async_trait::async_trait;
use bitflags::bitflags;
use std::os::unix::io::RawFd;
use std::sync::Weak;
use std::time::Duration;

bitflags! {
    /// What kind of progress `Transport::do_iteration` should attempt to make.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IterationFlags: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const BLOCK = 0b100;
    }
}

/// Shared dispatch surface for every backend variant.
///
/// Implementations route raw bytes to the auth session while unauthenticated and to
/// the message loader afterward; `Transport` is the only caller and always holds its
/// own lock for the duration of the call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Tear down the underlying stream. Idempotent.
    async fn disconnect(&self);

    /// Attempt to make the requested kind of progress (read, write, or both),
    /// optionally blocking up to `timeout` (indefinitely if `None` and `BLOCK` is set).
    async fn do_iteration(
        &self,
        flags: IterationFlags,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError>;

    /// React to a host-signaled readiness condition for this backend's fd.
    async fn handle_watch(&self, condition: crate::watch::WatchCondition) -> Result<(), TransportError>;

    /// Write an already-framed byte sequence (length prefix plus encoded message) to
    /// the peer.
    async fn send_bytes(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// One-shot hook fired once `Transport::set_connection` has installed the owner,
    /// so the backend can register its initial watches.
    async fn connection_set(&self, connection: Weak<dyn ConnectionHandle>) -> Result<(), TransportError>;

    /// The underlying file descriptor, when the backend has one (all but `DebugPipe`).
    fn socket_fd(&self) -> Option<RawFd> {
        None
    }

    /// Notification that the live-byte counter's above-threshold flag flipped.
    /// Default no-op; backends that gate reads on it override this.
    fn live_messages_changed(&self, _above_threshold: bool) {}
}

/// The concrete backend behind a `Transport`, chosen at `open`/`accept` time and fixed
/// for the object's lifetime.
pub enum BackendKind {
    StreamSocket(tcp::TcpBackend),
    Unix(unix::UnixBackend),
    Autolaunch(autolaunch::AutolaunchBackend),
    DebugPipe(debug_pipe::DebugPipeBackend),
}

#[async_trait]
impl Backend for BackendKind {
    async fn disconnect(&self) {
        match self {
            BackendKind::StreamSocket(b) => b.disconnect().await,
            BackendKind::Unix(b) => b.disconnect().await,
            BackendKind::Autolaunch(b) => b.disconnect().await,
            BackendKind::DebugPipe(b) => b.disconnect().await,
        }
    }

    async fn do_iteration(
        &self,
        flags: IterationFlags,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        match self {
            BackendKind::StreamSocket(b) => b.do_iteration(flags, timeout).await,
            BackendKind::Unix(b) => b.do_iteration(flags, timeout).await,
            BackendKind::Autolaunch(b) => b.do_iteration(flags, timeout).await,
            BackendKind::DebugPipe(b) => b.do_iteration(flags, timeout).await,
        }
    }

    async fn handle_watch(&self, condition: crate::watch::WatchCondition) -> Result<(), TransportError> {
        match self {
            BackendKind::StreamSocket(b) => b.handle_watch(condition).await,
            BackendKind::Unix(b) => b.handle_watch(condition).await,
            BackendKind::Autolaunch(b) => b.handle_watch(condition).await,
            BackendKind::DebugPipe(b) => b.handle_watch(condition).await,
        }
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        match self {
            BackendKind::StreamSocket(b) => b.send_bytes(bytes).await,
            BackendKind::Unix(b) => b.send_bytes(bytes).await,
            BackendKind::Autolaunch(b) => b.send_bytes(bytes).await,
            BackendKind::DebugPipe(b) => b.send_bytes(bytes).await,
        }
    }

    async fn connection_set(&self, connection: Weak<dyn ConnectionHandle>) -> Result<(), TransportError> {
        match self {
            BackendKind::StreamSocket(b) => b.connection_set(connection).await,
            BackendKind::Unix(b) => b.connection_set(connection).await,
            BackendKind::Autolaunch(b) => b.connection_set(connection).await,
            BackendKind::DebugPipe(b) => b.connection_set(connection).await,
        }
    }

    fn socket_fd(&self) -> Option<RawFd> {
        match self {
            BackendKind::StreamSocket(b) => b.socket_fd(),
            BackendKind::Unix(b) => b.socket_fd(),
            BackendKind::Autolaunch(b) => b.socket_fd(),
            BackendKind::DebugPipe(b) => b.socket_fd(),
        }
    }

    fn live_messages_changed(&self, above_threshold: bool) {
        match self {
            BackendKind::StreamSocket(b) => b.live_messages_changed(above_threshold),
            BackendKind::Unix(b) => b.live_messages_changed(above_threshold),
            BackendKind::Autolaunch(b) => b.live_messages_changed(above_threshold),
            BackendKind::DebugPipe(b) => b.live_messages_changed(above_threshold),
        }
    }
}
