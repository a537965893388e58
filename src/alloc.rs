//! # Debug Allocation Facade
//!
//! `Vec`/`BytesMut` already abort the process on real allocator failure, so this module
//! doesn't intercept every allocation in the binary. Instead it instruments the two
//! places the transport grows its own buffers under attacker- or peer-controlled sizes —
//! the [`crate::loader::MessageLoader`]'s read buffer and the [`crate::auth::AuthSession`]'s
//! trailing-byte buffer — with a `try_reserve` path that can be forced to fail
//! deterministically under test, plus guard-banded scratch allocations for frame-length
//! validation.
//!
//! Debug behavior is controlled by three environment variables, read once into a
//! process-wide [`OnceLock`]:
//!
//! - `DBUS_MALLOC_FAIL_NTH=<n>` — fail every nth reservation.
//! - `DBUS_MALLOC_FAIL_GREATER_THAN=<bytes>` — fail reservations above this size.
//! - `DBUS_MALLOC_GUARDS` — enable guard bands on [`try_alloc_guarded`].

use crate::error::TransportError;
use bytes::BytesMut;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

const MAGIC_FRONT: u32 = 0xDBDB_F00D;
const MAGIC_BACK: u32 = 0xDBDB_BACC;

#[derive(Debug, Clone, Copy)]
struct DebugAllocConfig {
    fail_nth: Option<u64>,
    fail_greater_than: Option<usize>,
    guards: bool,
}

impl DebugAllocConfig {
    fn from_env() -> Self {
        let fail_nth = std::env::var("DBUS_MALLOC_FAIL_NTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n: &u64| n > 0);
        let fail_greater_than = std::env::var("DBUS_MALLOC_FAIL_GREATER_THAN")
            .ok()
            .and_then(|s| s.parse().ok());
        let guards = std::env::var_os("DBUS_MALLOC_GUARDS").is_some();
        Self {
            fail_nth,
            fail_greater_than,
            guards,
        }
    }
}

fn config() -> &'static DebugAllocConfig {
    static CONFIG: OnceLock<DebugAllocConfig> = OnceLock::new();
    CONFIG.get_or_init(DebugAllocConfig::from_env)
}

/// Decrementing nth-failure counter. Resets to its configured initial value once it
/// fires, so a whole test suite can be driven through every allocation site.
static NTH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn nth_counter_fires() -> bool {
    let Some(n) = config().fail_nth else {
        return false;
    };
    // Lazily (re)initialize the counter to `n` the first time it's consulted or after
    // it fires, so repeated test runs within one process see the same cadence.
    let prev = NTH_COUNTER.load(Ordering::Relaxed);
    let current = if prev == 0 { n } else { prev };
    if current == 1 {
        NTH_COUNTER.store(n, Ordering::Relaxed);
        true
    } else {
        NTH_COUNTER.store(current - 1, Ordering::Relaxed);
        false
    }
}

fn size_cap_fires(additional: usize) -> bool {
    config()
        .fail_greater_than
        .is_some_and(|cap| additional > cap)
}

/// Facade in front of `BytesMut::try_reserve`, with debug-mode failure injection.
pub struct DebugAllocator;

impl DebugAllocator {
    /// Reserve `additional` bytes in `buf`, honoring debug-mode failure injection.
    ///
    /// `tag` is used only in trace logging; it identifies the call site for debugging
    /// simulated-OOM test runs.
    pub fn try_reserve(
        buf: &mut BytesMut,
        additional: usize,
        tag: &'static str,
    ) -> Result<(), TransportError> {
        if additional == 0 {
            return Ok(());
        }
        if size_cap_fires(additional) || nth_counter_fires() {
            tracing::trace!(tag, additional, "debug allocator: injected OOM");
            return Err(TransportError::Oom);
        }
        buf.try_reserve(additional).map_err(|_| TransportError::Oom)
    }
}

/// A guard-banded raw allocation: `[header][front magic][payload][back magic]`.
///
/// `free`/realloc-equivalents run via `Drop`, which checks both bands and panics (a
/// debug assertion, not a silent corruption) on mismatch.
pub struct GuardedAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
    payload_len: usize,
    payload_offset: usize,
    tag: &'static str,
}

#[repr(C)]
struct GuardHeader {
    requested_size: usize,
    tag_ptr: *const u8,
    tag_len: usize,
}

impl GuardedAlloc {
    /// Allocate `size` bytes of scratch space, honoring the same failure-injection
    /// policy as [`DebugAllocator::try_reserve`], with guard bands enabled only when
    /// `DBUS_MALLOC_GUARDS` is set.
    pub fn new(size: usize, tag: &'static str) -> Result<Self, TransportError> {
        if size_cap_fires(size) || nth_counter_fires() {
            return Err(TransportError::Oom);
        }

        let header_size = std::mem::size_of::<GuardHeader>();
        let front_magic = std::mem::size_of::<u32>();
        let back_magic = std::mem::size_of::<u32>();
        let total = header_size + front_magic + size + back_magic;
        let layout = Layout::from_size_align(total, std::mem::align_of::<GuardHeader>())
            .map_err(|_| TransportError::Oom)?;

        // SAFETY: `layout` is non-zero sized (header_size alone is nonzero) and we
        // immediately check the returned pointer for null before touching it.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(TransportError::Oom)?;

        let payload_offset = header_size + front_magic;
        if config().guards {
            // SAFETY: `ptr` points to `total` bytes we just allocated with `layout`;
            // the header, front magic and back magic all fit within that allocation.
            unsafe {
                let header = ptr.as_ptr().cast::<GuardHeader>();
                header.write(GuardHeader {
                    requested_size: size,
                    tag_ptr: tag.as_ptr(),
                    tag_len: tag.len(),
                });
                let front = ptr.as_ptr().add(header_size).cast::<u32>();
                front.write_unaligned(MAGIC_FRONT);
                let back = ptr.as_ptr().add(payload_offset + size).cast::<u32>();
                back.write_unaligned(MAGIC_BACK);
            }
        }

        Ok(Self {
            ptr,
            layout,
            payload_len: size,
            payload_offset,
            tag,
        })
    }

    /// Mutable access to the payload region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `payload_offset..payload_offset + payload_len` was allocated and
        // reserved for the payload by `new`.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.payload_offset),
                self.payload_len,
            )
        }
    }

    fn check_guards(&self) {
        if !config().guards {
            return;
        }
        let header_size = std::mem::size_of::<GuardHeader>();
        // SAFETY: same allocation footprint as `new`.
        unsafe {
            let front = self
                .ptr
                .as_ptr()
                .add(header_size)
                .cast::<u32>()
                .read_unaligned();
            let back = self
                .ptr
                .as_ptr()
                .add(self.payload_offset + self.payload_len)
                .cast::<u32>()
                .read_unaligned();
            assert_eq!(front, MAGIC_FRONT, "guard band corrupted before {}", self.tag);
            assert_eq!(back, MAGIC_BACK, "guard band corrupted after {}", self.tag);
        }
    }
}

impl Drop for GuardedAlloc {
    fn drop(&mut self) {
        self.check_guards();
        // SAFETY: `self.ptr`/`self.layout` are exactly what `alloc` returned in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the allocation is exclusively owned by this struct, like a `Box<[u8]>`.
unsafe impl Send for GuardedAlloc {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The env-var-driven config is a `OnceLock` shared by the whole process, so tests
    // that touch it must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn zero_size_reserve_is_always_ok() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut buf = BytesMut::new();
        assert!(DebugAllocator::try_reserve(&mut buf, 0, "test").is_ok());
    }

    #[test]
    fn guarded_alloc_round_trips_payload() {
        let mut alloc = GuardedAlloc::new(16, "test").unwrap();
        alloc.as_mut_slice().copy_from_slice(&[7u8; 16]);
        assert_eq!(alloc.as_mut_slice(), &[7u8; 16]);
    }
}
