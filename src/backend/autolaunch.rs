//! # Autolaunch Backend
//!
//! Locates (or spawns) a bus process; it does not contain one. On success the
//! resolved address is handed straight back to [`crate::open::OpenRegistry::open`],
//! so the `Arc<Transport>` this opener ultimately returns is backed by whatever real
//! backend (unix, tcp) the resolved address names — `AutolaunchBackend` itself is kept
//! only as a forwarding shim for callers that hold onto a transport constructed
//! directly around an already-resolved one.

use crate::backend::{Backend, IterationFlags};
use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::open::{AddressEntry, OpenOptions, OpenRegistry, OpenResult};
use crate::transport::Transport;
use async_trait::async_trait;
use std::os::unix::io::RawFd;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Forwards every `Backend` call to an already-resolved transport. Not constructed by
/// the opener path below (which returns the resolved transport directly); kept for
/// callers that want an explicit autolaunch-flavored handle.
pub struct AutolaunchBackend {
    resolved: Arc<Transport>,
}

impl AutolaunchBackend {
    pub fn wrapping(resolved: Arc<Transport>) -> Self {
        Self { resolved }
    }
}

#[async_trait]
impl Backend for AutolaunchBackend {
    async fn disconnect(&self) {
        self.resolved.disconnect().await
    }

    async fn do_iteration(
        &self,
        flags: IterationFlags,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.resolved.do_iteration(flags, timeout).await
    }

    async fn handle_watch(&self, condition: crate::watch::WatchCondition) -> Result<(), TransportError> {
        self.resolved.handle_watch(condition).await
    }

    async fn connection_set(&self, connection: Weak<dyn ConnectionHandle>) -> Result<(), TransportError> {
        self.resolved.set_connection(connection).await
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.resolved.send_raw_bytes(bytes).await
    }

    fn socket_fd(&self) -> Option<RawFd> {
        self.resolved.socket_fd()
    }
}

const DEFAULT_ENV_VAR: &str = "DBUS_SESSION_BUS_ADDRESS";

pub async fn connect(entry: &AddressEntry, opts: &OpenOptions) -> OpenResult {
    let env_var = entry.get("env").unwrap_or(DEFAULT_ENV_VAR);

    if let Ok(resolved_address) = std::env::var(env_var) {
        if !resolved_address.is_empty() {
            return delegate(&resolved_address, opts).await;
        }
    }

    let Some(launch_command) = entry.get("launch") else {
        return OpenResult::DidNotConnect(format!(
            "{env_var} is unset and no launch= command was configured"
        ));
    };

    let mut parts = launch_command.split_whitespace();
    let Some(program) = parts.next() else {
        return OpenResult::BadAddress("launch= command is empty".to_string());
    };

    let child = Command::new(program)
        .args(parts)
        .stdout(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => return OpenResult::DidNotConnect(format!("failed to spawn {program}: {e}")),
    };
    let Some(stdout) = child.stdout.take() else {
        return OpenResult::DidNotConnect(format!("{program} produced no stdout"));
    };

    let mut line = String::new();
    if BufReader::new(stdout).read_line(&mut line).await.unwrap_or(0) == 0 {
        return OpenResult::DidNotConnect(format!("{program} exited before printing an address"));
    }
    delegate(line.trim_end(), opts).await
}

async fn delegate(resolved_address: &str, opts: &OpenOptions) -> OpenResult {
    match OpenRegistry::default().open(resolved_address, opts).await {
        Ok(transport) => OpenResult::Ok(transport),
        Err(e) => OpenResult::DidNotConnect(format!("autolaunch target {resolved_address}: {e}")),
    }
}
