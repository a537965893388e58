//! # Transport
//!
//! The state machine tying the auth dialog, the message loader and a concrete backend
//! together behind one dispatch surface. Callers always go through `Arc<Transport>`;
//! strong-count drop to zero is what finalizes the connection, replacing the hand-rolled
//! refcount field an earlier design sketch used (see the project design notes on
//! reference counting).

use crate::auth::{AuthSession, AuthStep, Credentials};
use crate::backend::{Backend, BackendKind, IterationFlags};
use crate::connection::{ConnectionHandle, UnixUserFn};
use crate::error::TransportError;
use crate::live_bytes::LiveByteCounter;
use crate::loader::{LoadOutcome, MessageLoader};
use crate::message::Message;
use crate::open::{OpenOptions, OpenRegistry};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Default high-water mark for queued, undelivered incoming bytes.
pub const DEFAULT_MAX_LIVE_MESSAGES_SIZE: i64 = 63 * 1024 * 1024;
/// Default ceiling on a single message's framed size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Lifecycle phase, driven by the auth dialog and backend I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPhase {
    Fresh,
    Authenticating {
        send_credentials_pending: bool,
        receive_credentials_pending: bool,
    },
    Authenticated,
    Disconnected,
}

/// Result of asking the transport whether it has work left to hand to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Nothing left to do right now.
    Complete,
    /// At least one parsed message is waiting to be delivered.
    DataRemains,
    /// Progress needs a buffer growth that failed; retry later.
    NeedMemory,
}

/// All of a transport's mutable lifecycle state, behind one lock shared with its
/// backend so bytes read off the wire can be fed straight into auth/loader without a
/// second round-trip through the public API.
pub struct TransportInner {
    pub(crate) loader: MessageLoader,
    pub(crate) auth: AuthSession,
    pub(crate) max_live_messages_size: i64,
    pub(crate) phase: TransportPhase,
    pub(crate) is_server: bool,
    pub(crate) address: Option<String>,
    pub(crate) expected_guid: Option<String>,
    pub(crate) credentials: Credentials,
    pub(crate) connection: Weak<dyn ConnectionHandle>,
    pub(crate) unix_user_function: Option<UnixUserFn>,
    pub(crate) max_message_size: usize,
    /// Flips false -> true exactly once, right after the auth dialog completes.
    pub(crate) unused_bytes_recovered: bool,
    pub(crate) pending_auth_trailing: Option<Vec<u8>>,
}

impl TransportInner {
    fn new(is_server: bool, address: Option<String>, auth: AuthSession, max_message_size: usize) -> Self {
        Self {
            loader: MessageLoader::new(max_message_size),
            auth,
            max_live_messages_size: DEFAULT_MAX_LIVE_MESSAGES_SIZE,
            phase: TransportPhase::Fresh,
            is_server,
            address,
            expected_guid: None,
            credentials: Credentials::unset(),
            connection: Weak::<NullConnection>::new(),
            unix_user_function: None,
            max_message_size,
            unused_bytes_recovered: false,
            pending_auth_trailing: None,
        }
    }

    /// Feed freshly read raw bytes into the dialog currently in effect: the auth
    /// session before authentication, the message loader afterward. Returns any bytes
    /// the caller (the backend) must write back to the peer.
    pub(crate) fn on_bytes_read(&mut self, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
        if matches!(self.phase, TransportPhase::Authenticated) {
            self.loader.feed(bytes)?;
            return Ok(Vec::new());
        }

        if matches!(self.phase, TransportPhase::Fresh) {
            self.phase = TransportPhase::Authenticating {
                send_credentials_pending: self.is_server,
                receive_credentials_pending: !self.is_server,
            };
        }

        match self.auth.feed_and_step(bytes)? {
            AuthStep::NeedMoreData => Ok(Vec::new()),
            AuthStep::Write(out) => Ok(out),
            AuthStep::Rejected(reason) => {
                self.fail_and_disconnect();
                Err(TransportError::AuthRejected(reason))
            }
            AuthStep::Authenticated { trailing } => {
                self.complete_auth()?;
                self.pending_auth_trailing = Some(trailing);
                Ok(Vec::new())
            }
            AuthStep::WriteThenAuthenticated { write, trailing } => {
                self.complete_auth()?;
                self.pending_auth_trailing = Some(trailing);
                Ok(write)
            }
        }
    }

    fn complete_auth(&mut self) -> Result<(), TransportError> {
        if !self.is_server {
            match (&self.expected_guid, self.auth.received_guid()) {
                (Some(expected), Some(actual)) if expected != actual => {
                    let expected = expected.clone();
                    let actual = actual.to_string();
                    self.fail_and_disconnect();
                    return Err(TransportError::GuidMismatch { expected, actual });
                }
                (None, Some(actual)) => self.expected_guid = Some(actual.to_string()),
                _ => {}
            }
        }
        self.credentials = self.auth.credentials();
        self.phase = TransportPhase::Authenticated;
        Ok(())
    }

    /// Flip to `Disconnected` and notify the owning connection, the `TransportInner`
    /// half of what `Transport::disconnect` does. The backend side (closing the
    /// socket/pipe) is the caller's job once it has released the lock on `self`, since
    /// the backend isn't reachable from here without risking a re-entrant lock.
    fn fail_and_disconnect(&mut self) {
        self.phase = TransportPhase::Disconnected;
        if let Some(conn) = self.connection.upgrade() {
            conn.notify_disconnected();
        }
    }

    /// Move the auth session's over-read bytes into the loader's buffer, exactly once.
    fn recover_trailing_bytes(&mut self) -> Result<(), TransportError> {
        if self.unused_bytes_recovered {
            return Ok(());
        }
        let Some(trailing) = self.pending_auth_trailing.take() else {
            return Ok(());
        };
        self.loader.feed(&trailing)?;
        self.unused_bytes_recovered = true;
        Ok(())
    }
}

/// Placeholder `Weak` target so `TransportInner` can default-construct before a real
/// owner calls `set_connection`.
struct NullConnection;
impl ConnectionHandle for NullConnection {
    fn deliver_message(&self, _message: crate::live_bytes::LiveMessage<Message>) {}
    fn notify_disconnected(&self) {}
    fn add_watch(&self, _fd: std::os::raw::c_int, _condition: crate::watch::WatchCondition) -> crate::watch::WatchId {
        crate::watch::WatchId(0)
    }
    fn toggle_watch(&self, _id: crate::watch::WatchId, _enabled: bool) {}
    fn remove_watch(&self, _id: crate::watch::WatchId) {}
    fn add_timeout(&self, _interval_ms: u32) -> crate::watch::TimeoutId {
        crate::watch::TimeoutId(0)
    }
    fn remove_timeout(&self, _id: crate::watch::TimeoutId) {}
}

/// A single authenticated, framed message transport. Always held as `Arc<Transport>`;
/// never constructed bare.
pub struct Transport {
    pub(crate) inner: Arc<Mutex<TransportInner>>,
    backend: BackendKind,
    live_messages_size: LiveByteCounter,
}

impl Transport {
    pub(crate) fn from_parts(
        is_server: bool,
        address: Option<String>,
        auth: AuthSession,
        max_message_size: usize,
        make_backend: impl FnOnce(Arc<Mutex<TransportInner>>, LiveByteCounter) -> BackendKind,
    ) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(TransportInner::new(
            is_server,
            address,
            auth,
            max_message_size,
        )));
        let live_messages_size = LiveByteCounter::new();
        let backend = make_backend(inner.clone(), live_messages_size.clone());
        let above = Arc::new(AtomicBool::new(false));
        let above_for_notify = above.clone();
        live_messages_size.set_notify(
            DEFAULT_MAX_LIVE_MESSAGES_SIZE,
            Box::new(move |is_above| {
                above_for_notify.store(is_above, Ordering::SeqCst);
            }),
        );
        Arc::new(Self {
            inner,
            backend,
            live_messages_size,
        })
    }

    /// Parse `address`, then walk the registered openers in order until one succeeds.
    pub async fn open(address: &str, opts: &OpenOptions) -> Result<Arc<Transport>, TransportError> {
        OpenRegistry::default().open(address, opts).await
    }

    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.phase, TransportPhase::Disconnected) {
            return;
        }
        inner.phase = TransportPhase::Disconnected;
        drop(inner);
        self.backend.disconnect().await;
        if let Some(conn) = self.connection_upgrade().await {
            conn.notify_disconnected();
        }
    }

    pub async fn is_connected(&self) -> bool {
        !matches!(self.inner.lock().await.phase, TransportPhase::Disconnected)
    }

    pub async fn is_authenticated(&self) -> bool {
        let phase_is_auth = matches!(self.inner.lock().await.phase, TransportPhase::Authenticated);
        if !phase_is_auth {
            return false;
        }
        if self.inner.lock().await.is_server {
            let predicate = self.inner.lock().await.unix_user_function.clone();
            if let Some(predicate) = predicate {
                let uid = self.inner.lock().await.credentials.uid;
                // Drop the lock around the user callback: it may be arbitrary user
                // code and must not be called while holding `inner`. A paranoia
                // `Arc`-like keep-alive isn't needed here since `self` is already kept
                // alive by the caller's `Arc<Transport>`.
                let allowed = predicate(uid);
                if !allowed {
                    self.disconnect().await;
                    return false;
                }
            }
        }
        true
    }

    pub async fn handle_watch(&self, condition: crate::watch::WatchCondition) -> Result<(), TransportError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.backend.handle_watch(condition).await
    }

    pub async fn do_iteration(
        &self,
        flags: IterationFlags,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        if flags.is_empty() {
            return Ok(());
        }
        if !self.is_connected().await {
            return Ok(());
        }
        self.backend.do_iteration(flags, timeout).await
    }

    /// Drain parsed messages to the owning connection, per `dispatch_status`.
    pub async fn queue_messages(&self) -> Result<(), TransportError> {
        loop {
            match self.dispatch_status().await? {
                DispatchStatus::DataRemains => {
                    let message = {
                        let mut inner = self.inner.lock().await;
                        inner.loader.pop()
                    };
                    if let Some(message) = message {
                        let size = message.accounted_size();
                        let live = crate::live_bytes::LiveMessage::adopt(
                            message,
                            size,
                            self.live_messages_size.clone(),
                        );
                        // Ownership of `live` passes to the connection: its bytes stay
                        // counted against backpressure until the connection drops it,
                        // not merely for the duration of this call. With no connection
                        // attached yet, `live` drops here and releases immediately.
                        if let Some(conn) = self.connection_upgrade().await {
                            conn.deliver_message(live);
                        }
                    }
                }
                DispatchStatus::Complete | DispatchStatus::NeedMemory => break,
            }
        }
        Ok(())
    }

    /// The algorithm from the project design notes: backpressure check, auth-status
    /// check, one-shot trailing-byte recovery, then a loader parse pass.
    pub async fn dispatch_status(&self) -> Result<DispatchStatus, TransportError> {
        if self.live_messages_size.value() >= self.inner.lock().await.max_live_messages_size {
            return Ok(DispatchStatus::Complete);
        }

        if !self.is_authenticated().await {
            return Ok(DispatchStatus::Complete);
        }

        {
            let mut inner = self.inner.lock().await;
            if let Err(TransportError::Oom) = inner.recover_trailing_bytes() {
                return Ok(DispatchStatus::NeedMemory);
            }
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            match inner.loader.parse() {
                Ok(outcome) => outcome,
                Err(err) => {
                    drop(inner);
                    self.disconnect().await;
                    return Err(err);
                }
            }
        };
        match outcome {
            LoadOutcome::NeedMemory => Ok(DispatchStatus::NeedMemory),
            LoadOutcome::Progressed | LoadOutcome::Idle => {
                let has_messages = self.inner.lock().await.loader.has_messages();
                if has_messages {
                    Ok(DispatchStatus::DataRemains)
                } else {
                    Ok(DispatchStatus::Complete)
                }
            }
        }
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.backend.socket_fd()
    }

    /// Current total size, in bytes, of messages delivered to the connection but not
    /// yet released by it. Bounded above by `max_live_messages_size` plus one in-flight
    /// message's size when the application never drains.
    pub fn live_bytes(&self) -> i64 {
        self.live_messages_size.value()
    }

    pub async fn set_connection(&self, conn: Weak<dyn ConnectionHandle>) -> Result<(), TransportError> {
        self.inner.lock().await.connection = conn.clone();
        self.backend.connection_set(conn).await
    }

    pub async fn set_max_message_size(&self, n: usize) {
        self.inner.lock().await.loader.set_max_message_size(n);
    }

    /// Pin the guid this transport's peer must present during authentication. Only
    /// meaningful on the client side, and only before the auth dialog completes; a
    /// server's own guid is authoritative and never overridden.
    pub async fn set_expected_guid(&self, guid: Option<String>) {
        self.inner.lock().await.expected_guid = guid;
    }

    /// Frame and send a message: a 4-byte little-endian length prefix followed by its
    /// `bincode` encoding, mirroring the [`crate::loader::MessageLoader`]'s framing.
    pub async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        let body = message
            .to_bytes()
            .map_err(|e| TransportError::StreamCorrupted(format!("failed to encode message: {e}")))?;
        let mut framed = (body.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(&body);
        self.send_raw_bytes(&framed).await
    }

    pub(crate) async fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.backend.send_bytes(bytes).await
    }

    pub async fn set_max_received_size(&self, n: i64) {
        self.inner.lock().await.max_live_messages_size = n;
        let above = Arc::new(AtomicBool::new(false));
        self.live_messages_size.set_notify(
            n,
            Box::new(move |is_above| {
                above.store(is_above, Ordering::SeqCst);
            }),
        );
    }

    pub async fn unix_user(&self) -> Option<u32> {
        let uid = self.inner.lock().await.credentials.uid;
        (uid != crate::auth::UNSET_UID).then_some(uid)
    }

    pub async fn unix_process_id(&self) -> Option<u32> {
        let pid = self.inner.lock().await.credentials.pid;
        (pid != crate::auth::UNSET_PID).then_some(pid)
    }

    pub async fn set_unix_user_function(&self, f: Option<UnixUserFn>) -> Option<UnixUserFn> {
        let mut inner = self.inner.lock().await;
        std::mem::replace(&mut inner.unix_user_function, f)
    }

    async fn connection_upgrade(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.inner.lock().await.connection.upgrade()
    }

    /// Client-only housekeeping: mark the auth session as having sent its initial
    /// `AUTH EXTERNAL` line, so it knows to expect the server's `OK` next. Called by a
    /// backend's `connect` right after writing [`crate::auth::AuthSession::initial_output`].
    pub(crate) async fn inner_client_sent_auth_line(&self) {
        self.inner.lock().await.auth.client_sent_auth_line();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSession;

    #[tokio::test]
    async fn fresh_transport_is_connected_but_not_authenticated() {
        let (client, _server) = crate::backend::debug_pipe::DebugPipeBackend::pair();
        let transport = Transport::from_parts(
            false,
            None,
            AuthSession::new_client(1000),
            DEFAULT_MAX_MESSAGE_SIZE,
            move |inner, live| BackendKind::DebugPipe(client.into_backend(inner, live)),
        );
        assert!(transport.is_connected().await);
        assert!(!transport.is_authenticated().await);
    }

    struct RecordingConnection {
        received: std::sync::Mutex<Vec<Message>>,
    }

    impl ConnectionHandle for RecordingConnection {
        fn deliver_message(&self, message: crate::live_bytes::LiveMessage<Message>) {
            self.received.lock().unwrap().push(message.into_inner());
        }
        fn notify_disconnected(&self) {}
        fn add_watch(&self, _fd: std::os::raw::c_int, _condition: crate::watch::WatchCondition) -> crate::watch::WatchId {
            crate::watch::WatchId(0)
        }
        fn toggle_watch(&self, _id: crate::watch::WatchId, _enabled: bool) {}
        fn remove_watch(&self, _id: crate::watch::WatchId) {}
        fn add_timeout(&self, _interval_ms: u32) -> crate::watch::TimeoutId {
            crate::watch::TimeoutId(0)
        }
        fn remove_timeout(&self, _id: crate::watch::TimeoutId) {}
    }

    #[tokio::test]
    async fn client_and_server_authenticate_and_exchange_a_message() {
        let (client_end, server_end) = crate::backend::debug_pipe::DebugPipeBackend::pair();

        let mut client_auth = AuthSession::new_client(1000);
        let initial = client_auth.initial_output().expect("client has an initial line");

        let client = Transport::from_parts(false, None, client_auth, DEFAULT_MAX_MESSAGE_SIZE, move |inner, live| {
            BackendKind::DebugPipe(client_end.into_backend(inner, live))
        });
        client.inner.lock().await.auth.client_sent_auth_line();
        client.backend.send_bytes(&initial).await.unwrap();

        let server_auth = AuthSession::new_server_advisory("deadbeefcafef00d".to_string());
        let server = Transport::from_parts(true, None, server_auth, DEFAULT_MAX_MESSAGE_SIZE, move |inner, live| {
            BackendKind::DebugPipe(server_end.into_backend(inner, live))
        });

        let recording = Arc::new(RecordingConnection {
            received: std::sync::Mutex::new(Vec::new()),
        });
        let server_handle: Arc<dyn ConnectionHandle> = recording.clone();
        server.set_connection(Arc::downgrade(&server_handle)).await.unwrap();

        for _ in 0..4 {
            server
                .do_iteration(IterationFlags::READ, Some(Duration::from_millis(50)))
                .await
                .unwrap();
            client
                .do_iteration(IterationFlags::READ, Some(Duration::from_millis(50)))
                .await
                .unwrap();
            if server.is_authenticated().await && client.is_authenticated().await {
                break;
            }
        }
        assert!(server.is_authenticated().await);
        assert!(client.is_authenticated().await);

        let msg = Message::new(1, crate::message::MessageKind::MethodCall, b"hello".to_vec());
        client.send_message(&msg).await.unwrap();
        server
            .do_iteration(IterationFlags::READ, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        server.queue_messages().await.unwrap();

        let received = recording.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].serial, 1);
        assert_eq!(received[0].payload, b"hello");
    }

    #[tokio::test]
    async fn backpressure_above_threshold_reports_complete_before_anything_is_parsed() {
        let (client, _server) = crate::backend::debug_pipe::DebugPipeBackend::pair();
        let transport = Transport::from_parts(
            false,
            None,
            AuthSession::new_client(1000),
            DEFAULT_MAX_MESSAGE_SIZE,
            move |inner, live| BackendKind::DebugPipe(client.into_backend(inner, live)),
        );
        // Skip the handshake: this test is only about the backpressure gate at the top
        // of `dispatch_status`, which runs before the auth-status check.
        transport.inner.lock().await.phase = TransportPhase::Authenticated;
        transport.set_max_received_size(10).await;

        assert_eq!(transport.dispatch_status().await.unwrap(), DispatchStatus::Complete);

        let held = crate::live_bytes::LiveMessage::adopt(
            Message::new(1, crate::message::MessageKind::Signal, vec![0u8; 64]),
            64,
            transport.live_messages_size.clone(),
        );
        assert_eq!(
            transport.dispatch_status().await.unwrap(),
            DispatchStatus::Complete
        );

        drop(held);
    }
}
