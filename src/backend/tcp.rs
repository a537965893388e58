//! # Stream Socket (TCP) Backend
//!
//! Plain `tokio::net::{TcpStream, TcpListener}`. There is no OS credential-passing
//! facility on a TCP socket, so the `EXTERNAL` mechanism's asserted uid is accepted
//! as-is — advisory only, the same behavior the real protocol documents for
//! transports without `SCM_CREDENTIALS`.

use crate::auth::AuthSession;
use crate::backend::{Backend, IterationFlags};
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::live_bytes::LiveByteCounter;
use crate::open::{AddressEntry, OpenOptions, OpenResult};
use crate::transport::{Transport, TransportInner};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub struct TcpBackend {
    stream: Mutex<TcpStream>,
    inner: Arc<Mutex<TransportInner>>,
    connection: Mutex<Weak<dyn ConnectionHandle>>,
    live: LiveByteCounter,
}

impl TcpBackend {
    fn new(stream: TcpStream, inner: Arc<Mutex<TransportInner>>, live: LiveByteCounter) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream: Mutex::new(stream),
            inner,
            connection: Mutex::new(Weak::<NullHandle>::new()),
            live,
        }
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

#[async_trait]
impl Backend for TcpBackend {
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
        // Mirrors disabling the read-watch: while the live-byte counter is above its
        // threshold, stop pulling more bytes off the wire until the application drains.
        if self.live.is_above_threshold() {
            return Ok(());
        }
        let mut buf = vec![0u8; 8192];
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
        self.stream.try_lock().ok().map(|s| s.as_raw_fd())
    }
}

fn parse_socket_addr(entry: &AddressEntry) -> Result<SocketAddr, String> {
    let host = entry.get("host").unwrap_or("127.0.0.1");
    let port: u16 = entry
        .get("port")
        .ok_or_else(|| "tcp address requires port=".to_string())?
        .parse()
        .map_err(|_| "tcp port= is not a valid u16".to_string())?;
    format!("{host}:{port}")
        .parse()
        .map_err(|e| format!("invalid host/port: {e}"))
}

pub async fn connect(entry: &AddressEntry, opts: &OpenOptions) -> OpenResult {
    let addr = match parse_socket_addr(entry) {
        Ok(addr) => addr,
        Err(msg) => return OpenResult::BadAddress(msg),
    };
    let is_server = entry.get("bind") == Some("true");

    if is_server {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => return OpenResult::DidNotConnect(format!("bind {addr} failed: {e}")),
        };
        let (stream, _peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => return OpenResult::DidNotConnect(format!("accept on {addr} failed: {e}")),
        };
        let auth = AuthSession::new_server_advisory(format!("{:016x}", rand::random::<u64>()));
        let transport = Transport::from_parts(true, None, auth, opts.max_message_size, move |inner, live| {
            crate::backend::BackendKind::StreamSocket(TcpBackend::new(stream, inner, live))
        });
        OpenResult::Ok(transport)
    } else {
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => return OpenResult::DidNotConnect(format!("connect to {addr} failed: {e}")),
        };
        let auth = AuthSession::new_client(opts.local_uid);
        if let Some(initial) = auth.initial_output() {
            if stream.write_all(&initial).await.is_err() {
                return OpenResult::DidNotConnect(format!("{addr} closed before auth"));
            }
        }
        let transport = Transport::from_parts(
            false,
            Some(format!("tcp:host={},port={}", addr.ip(), addr.port())),
            auth,
            opts.max_message_size,
            move |inner, live| crate::backend::BackendKind::StreamSocket(TcpBackend::new(stream, inner, live)),
        );
        transport.inner_client_sent_auth_line().await;
        if let Some(guid) = entry.get("guid") {
            transport.set_expected_guid(Some(guid.to_string())).await;
        }
        OpenResult::Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_port() {
        let entry = AddressEntry {
            method: "tcp".to_string(),
            params: Default::default(),
        };
        assert!(parse_socket_addr(&entry).is_err());
    }

    #[test]
    fn parses_host_and_port() {
        let mut params = std::collections::HashMap::new();
        params.insert("host".to_string(), "127.0.0.1".to_string());
        params.insert("port".to_string(), "9999".to_string());
        let entry = AddressEntry {
            method: "tcp".to_string(),
            params,
        };
        let addr = parse_socket_addr(&entry).unwrap();
        assert_eq!(addr.port(), 9999);
    }
}
