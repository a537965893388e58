//! # Address Parser & Opener Registry
//!
//! D-Bus addresses are a semicolon-separated list of alternatives, each a method name
//! followed by comma-separated `key=value` pairs; the first alternative a registered
//! opener accepts wins. Openers here are async (establishing a connection is
//! inherently so) rather than the plain `fn` pointer a synchronous sketch might use —
//! the dispatch-by-method-name shape otherwise matches the design directly.

use crate::error::TransportError;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;

/// One `method:key=value,...` alternative out of a parsed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub method: String,
    pub params: HashMap<String, String>,
}

impl AddressEntry {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Parse a full D-Bus-style address string into its ordered alternatives.
///
/// Grammar: `address := entry (';' entry)* ; entry := method ':' (key '=' value (',' key '=' value)*)?`.
/// Unknown keys are preserved, not rejected — a given backend may simply ignore keys it
/// doesn't understand.
pub fn parse_address(s: &str) -> Result<Vec<AddressEntry>, TransportError> {
    s.split(';')
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> Result<AddressEntry, TransportError> {
    let (method, rest) = match entry.split_once(':') {
        Some((method, rest)) => (method, rest),
        None => (entry, ""),
    };
    if method.is_empty() {
        return Err(TransportError::BadAddress(format!(
            "address entry has no method: {entry}"
        )));
    }
    let mut params = HashMap::new();
    for pair in rest.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            TransportError::BadAddress(format!("malformed key=value pair: {pair}"))
        })?;
        if key.is_empty() {
            return Err(TransportError::BadAddress(format!(
                "empty key in entry: {entry}"
            )));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(AddressEntry {
        method: method.to_string(),
        params,
    })
}

/// Outcome of one opener's attempt to handle an [`AddressEntry`].
pub enum OpenResult {
    Ok(Arc<Transport>),
    NotHandled,
    BadAddress(String),
    DidNotConnect(String),
}

/// Parameters common to every opener, independent of the chosen backend.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// The local process's real uid, presented in the `EXTERNAL` mechanism's `AUTH` line.
    pub local_uid: u32,
    pub max_message_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            local_uid: current_uid(),
            max_message_size: crate::transport::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    crate::auth::UNSET_UID
}

/// Walks the fixed-order opener list: unix, tcp, autolaunch, debug-pipe.
pub struct OpenRegistry;

impl Default for OpenRegistry {
    fn default() -> Self {
        Self
    }
}

impl OpenRegistry {
    pub async fn open(&self, address: &str, opts: &OpenOptions) -> Result<Arc<Transport>, TransportError> {
        let entries = parse_address(address)?;
        for entry in &entries {
            let result = match entry.method.as_str() {
                "unix" => crate::backend::unix::connect(entry, opts).await,
                "tcp" => crate::backend::tcp::connect(entry, opts).await,
                "autolaunch" => crate::backend::autolaunch::connect(entry, opts).await,
                "debug-pipe" => crate::backend::debug_pipe::connect(entry, opts).await,
                _ => OpenResult::NotHandled,
            };
            match result {
                OpenResult::Ok(transport) => return Ok(transport),
                OpenResult::BadAddress(msg) => return Err(TransportError::BadAddress(msg)),
                OpenResult::DidNotConnect(msg) => return Err(TransportError::DidNotConnect(msg)),
                OpenResult::NotHandled => continue,
            }
        }
        Err(TransportError::UnknownAddressType(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_entry_with_params() {
        let entries = parse_address("unix:path=/tmp/bus,guid=deadbeef").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "unix");
        assert_eq!(entries[0].get("path"), Some("/tmp/bus"));
        assert_eq!(entries[0].get("guid"), Some("deadbeef"));
    }

    #[test]
    fn parses_multiple_alternatives() {
        let entries = parse_address("unix:path=/tmp/bus;tcp:host=127.0.0.1,port=1234").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].method, "tcp");
        assert_eq!(entries[1].get("port"), Some("1234"));
    }

    #[test]
    fn entry_with_no_params_is_allowed() {
        let entries = parse_address("autolaunch:").unwrap();
        assert_eq!(entries[0].method, "autolaunch");
        assert!(entries[0].params.is_empty());
    }

    #[test]
    fn missing_method_is_bad_address() {
        assert!(parse_address(":path=/tmp").is_err());
    }

    #[test]
    fn malformed_pair_is_bad_address() {
        assert!(parse_address("unix:path").is_err());
    }
}
