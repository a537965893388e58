//! # Debug Pipe Backend
//!
//! An in-process transport pair built on `tokio::io::duplex`, used by this crate's own
//! integration tests and the CLI harness's loopback mode. The distilled design reserves
//! this variant for test builds only; it is compiled in unconditionally here so the
//! crate's own test suite stays self-contained without a `cfg(test)`-only backend
//! leaking into the public API.

use crate::auth::AuthSession;
use crate::backend::{Backend, IterationFlags};
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::live_bytes::LiveByteCounter;
use crate::open::{AddressEntry, OpenOptions, OpenResult};
use crate::transport::{Transport, TransportInner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

const BUFFER_SIZE: usize = 64 * 1024;

fn registry() -> &'static Mutex<HashMap<String, DuplexStream>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, DuplexStream>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct DebugPipeBackend {
    stream: Mutex<DuplexStream>,
    inner: Arc<Mutex<TransportInner>>,
    connection: Mutex<Weak<dyn ConnectionHandle>>,
    live: LiveByteCounter,
}

/// One not-yet-wired half of an in-process pair, produced by [`DebugPipeBackend::pair`].
pub struct DebugPipeEnd {
    stream: DuplexStream,
}

impl DebugPipeEnd {
    /// Wrap this half as the concrete backend for a `Transport` under construction.
    pub fn into_backend(self, inner: Arc<Mutex<TransportInner>>, live: LiveByteCounter) -> DebugPipeBackend {
        DebugPipeBackend {
            stream: Mutex::new(self.stream),
            inner,
            connection: Mutex::new(Weak::<NullHandle>::new()),
            live,
        }
    }
}

struct NullHandle;
impl ConnectionHandle for NullHandle {
    fn deliver_message(&self, _message: crate::live_bytes::LiveMessage<crate::message::Message>) {}
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

impl DebugPipeBackend {
    /// Build a connected pair of not-yet-wired ends for tests that drive the pipe
    /// directly rather than through an address string.
    pub fn pair() -> (DebugPipeEnd, DebugPipeEnd) {
        let (a, b) = tokio::io::duplex(BUFFER_SIZE);
        (DebugPipeEnd { stream: a }, DebugPipeEnd { stream: b })
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut stream = self.stream.lock().await;
        stream.write_all(bytes).await?;
        Ok(())
    }

    async fn process_read_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let result = {
            let mut inner = self.inner.lock().await;
            inner.on_bytes_read(bytes)
        };
        match result {
            Ok(out) => self.write_all(&out).await,
            Err(err) => {
                self.disconnect().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Backend for DebugPipeBackend {
    async fn disconnect(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
    }

    async fn do_iteration(
        &self,
        flags: IterationFlags,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        if !flags.contains(IterationFlags::READ) {
            return Ok(());
        }
        if self.live.is_above_threshold() {
            return Ok(());
        }
        let mut buf = vec![0u8; 4096];
        let read = async {
            let mut stream = self.stream.lock().await;
            stream.read(&mut buf).await
        };
        let n = if flags.contains(IterationFlags::BLOCK) {
            match timeout {
                Some(d) => match tokio::time::timeout(d, read).await {
                    Ok(result) => result?,
                    Err(_) => return Ok(()),
                },
                None => read.await?,
            }
        } else {
            match tokio::time::timeout(Duration::from_millis(0), read).await {
                Ok(result) => result?,
                Err(_) => return Ok(()),
            }
        };
        if n == 0 {
            self.disconnect().await;
            return Ok(());
        }
        self.process_read_bytes(&buf[..n]).await
    }

    async fn handle_watch(&self, condition: crate::watch::WatchCondition) -> Result<(), TransportError> {
        if condition.contains(crate::watch::WatchCondition::READABLE) {
            self.do_iteration(IterationFlags::READ, Some(Duration::from_millis(0)))
                .await?;
        }
        Ok(())
    }

    async fn connection_set(&self, connection: Weak<dyn ConnectionHandle>) -> Result<(), TransportError> {
        *self.connection.lock().await = connection;
        Ok(())
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write_all(bytes).await
    }

    fn socket_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Looked up by an address entry's `name` key: `debug-pipe:name=foo,listen=true` for
/// the server side, `debug-pipe:name=foo` for the client side.
pub async fn connect(entry: &AddressEntry, opts: &OpenOptions) -> OpenResult {
    let Some(name) = entry.get("name") else {
        return OpenResult::BadAddress("debug-pipe address requires name=".to_string());
    };
    let is_server = entry.get("listen") == Some("true");

    if is_server {
        let (server_end, client_end) = DebugPipeBackend::pair();
        registry().lock().await.insert(name.to_string(), client_end.stream);
        let auth = AuthSession::new_server_advisory(format!("{:016x}", rand::random::<u64>()));
        let transport = Transport::from_parts(true, None, auth, opts.max_message_size, move |inner, live| {
            crate::backend::BackendKind::DebugPipe(server_end.into_backend(inner, live))
        });
        OpenResult::Ok(transport)
    } else {
        let Some(mut stream) = registry().lock().await.remove(name) else {
            return OpenResult::DidNotConnect(format!("no debug-pipe listener named {name}"));
        };
        let auth = AuthSession::new_client(opts.local_uid);
        if let Some(initial) = auth.initial_output() {
            if stream.write_all(&initial).await.is_err() {
                return OpenResult::DidNotConnect(format!("debug-pipe {name} closed before auth"));
            }
        }
        let client_end = DebugPipeEnd { stream };
        let transport = Transport::from_parts(
            false,
            Some(format!("debug-pipe:name={name}")),
            auth,
            opts.max_message_size,
            move |inner, live| crate::backend::BackendKind::DebugPipe(client_end.into_backend(inner, live)),
        );
        transport.inner_client_sent_auth_line().await;
        if let Some(guid) = entry.get("guid") {
            transport.set_expected_guid(Some(guid.to_string())).await;
        }
        OpenResult::Ok(transport)
    }
}
