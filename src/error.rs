//! Typed error surface for the transport layer.
//!
//! The rest of the crate returns `Result<_, TransportError>` rather than `anyhow::Error`
//! so that callers can distinguish `Oom` (always retryable) from logical/protocol errors
//! without string matching. The CLI binary and integration tests still use `anyhow` at
//! their own boundary, the same split the teacher benchmark binary draws between its
//! library return types and `main`'s top-level `anyhow::Result`.

use thiserror::Error;

/// Errors surfaced by the transport's public operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Any allocation or buffer-reservation failure. Always recoverable by the caller
    /// retrying later; never silently demoted to a logical error.
    #[error("out of memory")]
    Oom,

    /// Syntactic or semantic problem with an address entry.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// A syntactically valid address, but no backend could establish a session.
    #[error("did not connect: {0}")]
    DidNotConnect(String),

    /// No opener in the registry claimed the address.
    #[error("Unknown address type: {0} (known methods: unix, tcp, autolaunch, debug-pipe)")]
    UnknownAddressType(String),

    /// Operation attempted on a transport that has already disconnected.
    #[error("transport is disconnected")]
    Disconnected,

    /// The client pinned a guid that the server did not present.
    #[error("guid mismatch: expected {expected}, server advertised {actual}")]
    GuidMismatch { expected: String, actual: String },

    /// The unix-user predicate refused the connecting uid, or the uid did not match
    /// the process's own uid on the no-predicate server path.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The message loader encountered an unparseable byte stream.
    #[error("stream corrupted: {0}")]
    StreamCorrupted(String),

    /// Backend I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for the errors that induce an immediate disconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::GuidMismatch { .. }
                | TransportError::AuthRejected(_)
                | TransportError::StreamCorrupted(_)
                | TransportError::Io(_)
        )
    }
}
