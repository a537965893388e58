//! # Watch / Timeout Registry
//!
//! Abstract interface to whatever event loop the owning application runs. The
//! transport never polls a socket directly for readiness; it describes the readiness
//! conditions it needs via [`WatchCondition`] and leaves scheduling to the registry.
//!
//! This crate's own backends (`src/backend/*.rs`) don't implement a real registry —
//! they run inside tokio and already get readiness from `AsyncRead`/`AsyncWrite`
//! polling. What they *do* use this module for is the readable/writable gating flags,
//! which double as the backpressure switch driven by
//! [`crate::live_bytes::LiveByteCounter`]'s notify callback.

use bitflags::bitflags;

bitflags! {
    /// Which readiness conditions a watch is currently interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WatchCondition: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR    = 0b100;
    }
}

/// Opaque handle to a registered watch, returned by [`WatchRegistry::add_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Opaque handle to a registered timeout, returned by [`WatchRegistry::add_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(pub u64);

/// Host-provided event loop integration.
///
/// A `Transport` never assumes there is a registry at all — in this crate's own CLI
/// harness there isn't one, because tokio's reactor already does the job. The trait
/// exists so a future embedding application (a real bus daemon with its own main loop)
/// can drive readiness itself instead of handing the transport a whole tokio runtime.
pub trait WatchRegistry: Send + Sync {
    /// Register interest in `condition` for the transport's underlying file descriptor.
    /// Returns an id that can later be passed to `toggle_watch`/`remove_watch`.
    fn add_watch(&self, fd: std::os::raw::c_int, condition: WatchCondition) -> WatchId;

    /// Enable or disable a previously registered watch without removing it — used to
    /// gate reads off entirely once the live-byte counter crosses its threshold.
    fn toggle_watch(&self, id: WatchId, enabled: bool);

    fn remove_watch(&self, id: WatchId);

    /// Register a one-shot timeout, in milliseconds.
    fn add_timeout(&self, interval_ms: u32) -> TimeoutId;

    fn remove_timeout(&self, id: TimeoutId);
}

/// A `WatchRegistry` that does nothing, for embedders (and this crate's own harness)
/// that let tokio's reactor handle readiness directly.
#[derive(Debug, Default)]
pub struct NullWatchRegistry;

impl WatchRegistry for NullWatchRegistry {
    fn add_watch(&self, _fd: std::os::raw::c_int, _condition: WatchCondition) -> WatchId {
        WatchId(0)
    }

    fn toggle_watch(&self, _id: WatchId, _enabled: bool) {}

    fn remove_watch(&self, _id: WatchId) {}

    fn add_timeout(&self, _interval_ms: u32) -> TimeoutId {
        TimeoutId(0)
    }

    fn remove_timeout(&self, _id: TimeoutId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_bits_compose() {
        let both = WatchCondition::READABLE | WatchCondition::WRITABLE;
        assert!(both.contains(WatchCondition::READABLE));
        assert!(both.contains(WatchCondition::WRITABLE));
        assert!(!both.contains(WatchCondition::ERROR));
    }

    #[test]
    fn null_registry_is_inert() {
        let registry = NullWatchRegistry;
        let id = registry.add_watch(3, WatchCondition::READABLE);
        registry.toggle_watch(id, false);
        registry.remove_watch(id);
        let t = registry.add_timeout(100);
        registry.remove_timeout(t);
    }
}
