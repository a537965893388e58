//! # Auth Session
//!
//! Line-based SASL dialog run before any message framing begins. Only the `EXTERNAL`
//! mechanism is implemented: the peer's unix uid, already known out-of-band (via
//! `SCM_CREDENTIALS` on the Unix backend, or a self-reported advisory byte on backends
//! with no real credential-passing facility), is cross-checked against the uid the peer
//! asserts in its `AUTH EXTERNAL` line.
//!
//! Bytes arrive incrementally from the backend, same as the [`crate::loader::MessageLoader`]
//! downstream of it; the session buffers partial lines until a full `\r\n`-terminated
//! line is available.

use crate::alloc::DebugAllocator;
use crate::error::TransportError;
use bytes::{Buf, BytesMut};

/// Sentinel uid meaning "no credential known yet", matching the wire protocol's
/// unset-credential convention.
pub const UNSET_UID: u32 = u32::MAX;
/// Sentinel pid meaning "no credential known yet".
pub const UNSET_PID: u32 = 0;

#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub uid: u32,
    pub pid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn unset() -> Self {
        Self {
            uid: UNSET_UID,
            pid: UNSET_PID,
            gid: UNSET_UID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Client: about to send the leading nul byte and AUTH line.
    /// Server: waiting for the leading nul byte and AUTH line.
    AwaitingAuthLine,
    /// Client only: sent AUTH EXTERNAL, waiting for the server's OK line.
    AwaitingOk,
    /// Server only: sent OK, waiting for the client's BEGIN line.
    AwaitingBegin,
    Authenticated,
    Rejected,
}

/// Outcome of feeding bytes into the session and asking it to advance.
pub enum AuthStep {
    /// No full line yet; nothing to write, not finished.
    NeedMoreData,
    /// Advanced the dialog; bytes that must be written back to the peer.
    Write(Vec<u8>),
    /// The dialog has completed and accepted the peer; carries the over-read bytes
    /// immediately following `BEGIN\r\n`, if any, for transfer to the message loader.
    Authenticated { trailing: Vec<u8> },
    /// Client only: completed the dialog locally and must still write `BEGIN\r\n`
    /// before the message stream begins.
    WriteThenAuthenticated { write: Vec<u8>, trailing: Vec<u8> },
    /// The dialog failed; the transport must disconnect.
    Rejected(String),
}

/// SASL `EXTERNAL` dialog state machine for one connection.
pub struct AuthSession {
    role: Role,
    state: State,
    buf: BytesMut,
    /// The uid this side presents (self uid for a client, out-of-band peer uid for a
    /// server, set by the backend once the credential handshake byte has arrived).
    local_uid: u32,
    /// Server only: the uid the server requires a match against, delivered by the
    /// backend's credential-passing mechanism.
    expected_peer_uid: Option<u32>,
    /// Server only: the pid/gid delivered alongside `expected_peer_uid`, carried
    /// straight into `credentials` once the uid check passes. Not itself checked
    /// against anything — `SCM_CREDENTIALS` only gives the protocol a uid to validate.
    peer_pid: u32,
    peer_gid: u32,
    server_guid: String,
    /// Client only: the guid presented by the server in its OK line.
    received_guid: Option<String>,
    credentials: Credentials,
    saw_leading_nul: bool,
    /// When false (the real `SCM_CREDENTIALS` path), the asserted uid in the `AUTH`
    /// line must match `expected_peer_uid`. When true, there is no real
    /// credential-passing mechanism (TCP, debug-pipe), so whatever uid the peer
    /// asserts is accepted, advisory only, never a security boundary.
    trust_asserted_uid: bool,
}

impl AuthSession {
    pub fn new_client(local_uid: u32) -> Self {
        Self {
            role: Role::Client,
            state: State::AwaitingAuthLine,
            buf: BytesMut::new(),
            local_uid,
            expected_peer_uid: None,
            peer_pid: UNSET_PID,
            peer_gid: UNSET_UID,
            server_guid: String::new(),
            received_guid: None,
            credentials: Credentials::unset(),
            saw_leading_nul: false,
            trust_asserted_uid: false,
        }
    }

    /// A server session backed by a real credential-passing mechanism
    /// (`SCM_CREDENTIALS`): the asserted uid must match `set_peer_credential`.
    pub fn new_server(server_guid: String) -> Self {
        Self::new_server_inner(server_guid, false)
    }

    /// A server session on a transport with no credential-passing facility (TCP,
    /// debug-pipe): the asserted uid is trusted as-is, matching the real protocol's
    /// documented advisory-only behavior on such transports.
    pub fn new_server_advisory(server_guid: String) -> Self {
        Self::new_server_inner(server_guid, true)
    }

    fn new_server_inner(server_guid: String, trust_asserted_uid: bool) -> Self {
        Self {
            role: Role::Server,
            state: State::AwaitingAuthLine,
            buf: BytesMut::new(),
            local_uid: UNSET_UID,
            expected_peer_uid: None,
            peer_pid: UNSET_PID,
            peer_gid: UNSET_UID,
            server_guid,
            received_guid: None,
            credentials: Credentials::unset(),
            saw_leading_nul: false,
            trust_asserted_uid,
        }
    }

    /// Backend callback once the credential-passing facility (`SCM_CREDENTIALS`, or a
    /// self-reported byte on backends without one) has delivered the peer's identity.
    pub fn set_peer_credential(&mut self, uid: u32, pid: u32, gid: u32) {
        self.expected_peer_uid = Some(uid);
        self.peer_pid = pid;
        self.peer_gid = gid;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == State::Authenticated
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn received_guid(&self) -> Option<&str> {
        self.received_guid.as_deref()
    }

    /// Client-side: the bytes to write immediately on connect, before any server bytes
    /// have arrived — the leading nul byte plus the `AUTH EXTERNAL` line.
    pub fn initial_output(&self) -> Option<Vec<u8>> {
        if self.role != Role::Client || self.state != State::AwaitingAuthLine {
            return None;
        }
        let mut out = vec![0u8];
        out.extend_from_slice(b"AUTH EXTERNAL ");
        out.extend_from_slice(hex::encode(self.local_uid.to_string()).as_bytes());
        out.extend_from_slice(b"\r\n");
        Some(out)
    }

    /// Feed freshly read bytes and attempt to advance the dialog by one line.
    pub fn feed_and_step(&mut self, bytes: &[u8]) -> Result<AuthStep, TransportError> {
        DebugAllocator::try_reserve(&mut self.buf, bytes.len(), "auth::feed")?;
        self.buf.extend_from_slice(bytes);

        if !self.saw_leading_nul {
            if self.buf.is_empty() {
                return Ok(AuthStep::NeedMoreData);
            }
            self.buf.advance(1);
            self.saw_leading_nul = true;
        }

        let Some(line_end) = find_crlf(&self.buf) else {
            return Ok(AuthStep::NeedMoreData);
        };
        let line = self.buf.split_to(line_end).to_vec();
        self.buf.advance(2); // the CRLF itself

        let line = String::from_utf8_lossy(&line).into_owned();
        self.advance(&line)
    }

    fn advance(&mut self, line: &str) -> Result<AuthStep, TransportError> {
        match (self.role, self.state) {
            (Role::Server, State::AwaitingAuthLine) => {
                let Some(hex_uid) = line.strip_prefix("AUTH EXTERNAL ") else {
                    self.state = State::Rejected;
                    return Ok(AuthStep::Rejected(format!("unexpected line: {line}")));
                };
                let asserted_uid = decode_hex_uid(hex_uid)?;
                let credential_ok = self.trust_asserted_uid
                    || self.expected_peer_uid == Some(asserted_uid);
                if credential_ok {
                    self.credentials.uid = asserted_uid;
                    self.credentials.pid = self.peer_pid;
                    self.credentials.gid = self.peer_gid;
                    self.state = State::AwaitingBegin;
                    let mut out = b"OK ".to_vec();
                    out.extend_from_slice(self.server_guid.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    Ok(AuthStep::Write(out))
                } else {
                    self.state = State::Rejected;
                    Ok(AuthStep::Rejected(format!(
                        "asserted uid {asserted_uid} does not match credential"
                    )))
                }
            }
            (Role::Server, State::AwaitingBegin) => {
                if line == "BEGIN" {
                    self.state = State::Authenticated;
                    let trailing = self.buf.split_to(self.buf.len()).to_vec();
                    Ok(AuthStep::Authenticated { trailing })
                } else {
                    self.state = State::Rejected;
                    Ok(AuthStep::Rejected(format!("expected BEGIN, got: {line}")))
                }
            }
            (Role::Client, State::AwaitingOk) => {
                let Some(guid_hex) = line.strip_prefix("OK ") else {
                    self.state = State::Rejected;
                    return Ok(AuthStep::Rejected(format!("expected OK, got: {line}")));
                };
                self.received_guid = Some(guid_hex.to_string());
                self.credentials.uid = self.local_uid;
                self.state = State::Authenticated;
                let trailing = self.buf.split_to(self.buf.len()).to_vec();
                Ok(AuthStep::WriteThenAuthenticated {
                    write: b"BEGIN\r\n".to_vec(),
                    trailing,
                })
            }
            _ => {
                self.state = State::Rejected;
                Ok(AuthStep::Rejected("auth line received out of sequence".into()))
            }
        }
    }

    /// Client-side: call once `AUTH EXTERNAL` has been written, to start expecting the
    /// server's `OK` line.
    pub fn client_sent_auth_line(&mut self) {
        if self.role == Role::Client && self.state == State::AwaitingAuthLine {
            self.state = State::AwaitingOk;
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn decode_hex_uid(hex_str: &str) -> Result<u32, TransportError> {
    let decoded = hex::decode(hex_str)
        .map_err(|e| TransportError::AuthRejected(format!("invalid hex credential: {e}")))?;
    let as_str = String::from_utf8(decoded)
        .map_err(|e| TransportError::AuthRejected(format!("non-utf8 credential: {e}")))?;
    as_str
        .parse::<u32>()
        .map_err(|e| TransportError::AuthRejected(format!("non-numeric uid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_accepts_matching_credential_and_begin() {
        let mut server = AuthSession::new_server("deadbeef".to_string());
        server.set_peer_credential(1000, 4242, 100);

        let mut client_line = vec![0u8];
        client_line.extend_from_slice(b"AUTH EXTERNAL ");
        client_line.extend_from_slice(hex::encode("1000").as_bytes());
        client_line.extend_from_slice(b"\r\n");

        let step = server.feed_and_step(&client_line).unwrap();
        let AuthStep::Write(ok_line) = step else {
            panic!("expected OK write");
        };
        assert!(ok_line.starts_with(b"OK deadbeef"));

        let step = server.feed_and_step(b"BEGIN\r\nleftover").unwrap();
        let AuthStep::Authenticated { trailing } = step else {
            panic!("expected authenticated");
        };
        assert_eq!(trailing, b"leftover");
        assert!(server.is_authenticated());
        assert_eq!(server.credentials().uid, 1000);
        assert_eq!(server.credentials().pid, 4242);
        assert_eq!(server.credentials().gid, 100);
    }

    #[test]
    fn server_rejects_mismatched_credential() {
        let mut server = AuthSession::new_server("guid".to_string());
        server.set_peer_credential(1000, 4242, 100);
        let mut line = vec![0u8];
        line.extend_from_slice(b"AUTH EXTERNAL ");
        line.extend_from_slice(hex::encode("2000").as_bytes());
        line.extend_from_slice(b"\r\n");
        let step = server.feed_and_step(&line).unwrap();
        assert!(matches!(step, AuthStep::Rejected(_)));
    }

    #[test]
    fn client_initial_output_then_authenticates() {
        let mut client = AuthSession::new_client(1000);
        let out = client.initial_output().unwrap();
        assert_eq!(out[0], 0);
        client.client_sent_auth_line();

        let step = client.feed_and_step(b"OK deadbeef\r\n").unwrap();
        let AuthStep::WriteThenAuthenticated { write, trailing } = step else {
            panic!("expected write-then-authenticated");
        };
        assert_eq!(write, b"BEGIN\r\n");
        assert!(trailing.is_empty());
        assert_eq!(client.received_guid(), Some("deadbeef"));
    }

    #[test]
    fn partial_line_needs_more_data() {
        let mut server = AuthSession::new_server("guid".to_string());
        server.set_peer_credential(1000, 4242, 100);
        let step = server.feed_and_step(&[0u8]).unwrap();
        assert!(matches!(step, AuthStep::NeedMoreData));
        let step = server.feed_and_step(b"AUTH EXTERNAL ").unwrap();
        assert!(matches!(step, AuthStep::NeedMoreData));
    }
}
