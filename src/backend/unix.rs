//! # Unix Domain Socket Backend
//!
//! `tokio::net::{UnixStream, UnixListener}` for the data path, plus a raw
//! `sendmsg`/`recvmsg` round trip carrying `SCM_CREDENTIALS` ancillary data for the
//! leading credential byte — the one part of the handshake a plain `read`/`write`
//! can't perform, since ancillary data only rides along a `sendmsg`/`recvmsg` call.

use crate::auth::AuthSession;
use crate::backend::{Backend, IterationFlags};
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::live_bytes::LiveByteCounter;
use crate::open::{AddressEntry, OpenOptions, OpenResult};
use crate::transport::{Transport, TransportInner};
use async_trait::async_trait;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixCredentials};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

pub struct UnixBackend {
    stream: Mutex<UnixStream>,
    inner: Arc<Mutex<TransportInner>>,
    connection: Mutex<Weak<dyn ConnectionHandle>>,
    socket_path: Option<String>,
    live: LiveByteCounter,
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

impl UnixBackend {
    fn new(
        stream: UnixStream,
        inner: Arc<Mutex<TransportInner>>,
        socket_path: Option<String>,
        live: LiveByteCounter,
    ) -> Self {
        Self {
            stream: Mutex::new(stream),
            inner,
            connection: Mutex::new(Weak::<NullHandle>::new()),
            socket_path,
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

/// Send the leading credential byte with `SCM_CREDENTIALS` ancillary data. Performed
/// once, before any text-based auth lines, since ancillary data only rides along a
/// `sendmsg` call and a plain `write` can't carry it.
async fn send_credential_byte(stream: &UnixStream) -> std::io::Result<()> {
    stream
        .async_io(Interest::WRITABLE, || {
            let fd = stream.as_raw_fd();
            let creds = UnixCredentials::new();
            let iov = [IoSlice::new(&[0u8])];
            let cmsgs = [ControlMessage::ScmCredentials(&creds)];
            socket::sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)
                .map(|_| ())
                .map_err(std::io::Error::from)
        })
        .await
}

/// Receive the leading credential byte, extracting the peer's uid/pid/gid from the
/// ancillary `SCM_CREDENTIALS` data.
async fn recv_credential_byte(stream: &UnixStream) -> std::io::Result<(u32, u32, u32)> {
    let creds = stream
        .async_io(Interest::READABLE, || {
            let fd = stream.as_raw_fd();
            let mut byte = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut byte)];
            let mut cmsg_space = nix::cmsg_space!(UnixCredentials);
            let msg = socket::recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
                .map_err(std::io::Error::from)?;
            for cmsg in msg
                .cmsgs()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed cmsg"))?
            {
                if let ControlMessageOwned::ScmCredentials(cred) = cmsg {
                    return Ok(cred);
                }
            }
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no SCM_CREDENTIALS received",
            ))
        })
        .await?;
    Ok((creds.uid(), creds.pid() as u32, creds.gid()))
}

#[async_trait]
impl Backend for UnixBackend {
    async fn disconnect(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
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

pub async fn connect(entry: &AddressEntry, opts: &OpenOptions) -> OpenResult {
    let Some(path) = entry.get("path") else {
        return OpenResult::BadAddress("unix address requires path=".to_string());
    };
    let is_server = entry.get("listen") == Some("true");

    if is_server {
        let _ = std::fs::remove_file(path);
        let listener = match UnixListener::bind(Path::new(path)) {
            Ok(listener) => listener,
            Err(e) => return OpenResult::DidNotConnect(format!("bind {path} failed: {e}")),
        };
        let (stream, _peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => return OpenResult::DidNotConnect(format!("accept on {path} failed: {e}")),
        };
        let (peer_uid, peer_pid, peer_gid) = match recv_credential_byte(&stream).await {
            Ok(creds) => creds,
            Err(e) => return OpenResult::DidNotConnect(format!("credential receive failed: {e}")),
        };
        let mut auth = AuthSession::new_server(format!("{:016x}", rand::random::<u64>()));
        auth.set_peer_credential(peer_uid, peer_pid, peer_gid);
        let path_owned = path.to_string();
        let transport = Transport::from_parts(true, None, auth, opts.max_message_size, move |inner, live| {
            let backend = UnixBackend::new(stream, inner, Some(path_owned), live);
            crate::backend::BackendKind::Unix(backend)
        });
        OpenResult::Ok(transport)
    } else {
        let mut stream = match UnixStream::connect(path).await {
            Ok(stream) => stream,
            Err(e) => return OpenResult::DidNotConnect(format!("connect to {path} failed: {e}")),
        };
        if let Err(e) = send_credential_byte(&stream).await {
            return OpenResult::DidNotConnect(format!("credential send failed: {e}"));
        }
        let auth = AuthSession::new_client(opts.local_uid);
        if let Some(initial) = auth.initial_output() {
            // The leading nul byte already went out via `send_credential_byte`'s
            // ancillary-laden `sendmsg`; only the AUTH line itself is a plain write.
            if stream.write_all(&initial[1..]).await.is_err() {
                return OpenResult::DidNotConnect(format!("{path} closed before auth"));
            }
        }
        let transport = Transport::from_parts(
            false,
            Some(format!("unix:path={path}")),
            auth,
            opts.max_message_size,
            move |inner, live| crate::backend::BackendKind::Unix(UnixBackend::new(stream, inner, None, live)),
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
    fn requires_path() {
        let entry = AddressEntry {
            method: "unix".to_string(),
            params: Default::default(),
        };
        // exercised through `connect`, not directly constructible here without tokio;
        // asserted structurally instead.
        assert!(entry.get("path").is_none());
    }
}
