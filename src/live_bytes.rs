//! # Live-Byte Counter
//!
//! Tracks the total size of messages that have been parsed but not yet released by the
//! application, and is the sole mechanism of per-connection incoming backpressure: once
//! the value crosses a configured threshold, the notify callback flips a flag the
//! backend checks before issuing its next read.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

type NotifyCallback = Box<dyn Fn(bool) + Send + Sync>;

struct Notify {
    threshold: i64,
    callback: NotifyCallback,
}

/// Shared, atomic byte counter with a high-water notify callback.
///
/// Cloning is cheap (it shares the same atomics via `Arc`); every backend and the
/// [`crate::transport::Transport`] that owns it hold the same logical counter.
#[derive(Clone)]
pub struct LiveByteCounter {
    value: Arc<AtomicI64>,
    above_threshold: Arc<AtomicBool>,
    notify: Arc<std::sync::Mutex<Option<Notify>>>,
}

impl Default for LiveByteCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveByteCounter {
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicI64::new(0)),
            above_threshold: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Adjust the counter by `delta` (positive when a message is adopted, negative
    /// when the application releases one). May be called from any thread; this is the
    /// one operation that does not require the transport's lock.
    pub fn adjust(&self, delta: i64) {
        let new_value = self.value.fetch_add(delta, Ordering::SeqCst) + delta;
        // The notify callback must only flip a flag observed under lock later — it
        // must never reach back into the backend or the Connection directly.
        if let Ok(guard) = self.notify.lock() {
            if let Some(notify) = guard.as_ref() {
                let now_above = new_value >= notify.threshold;
                let was_above = self.above_threshold.swap(now_above, Ordering::SeqCst);
                if now_above != was_above {
                    (notify.callback)(now_above);
                }
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// True once the counter has crossed its configured threshold and hasn't yet
    /// dropped back below it. Read by the backend at the top of its iteration to
    /// decide whether to skip the next read.
    pub fn is_above_threshold(&self) -> bool {
        self.above_threshold.load(Ordering::SeqCst)
    }

    /// Replace the notify threshold/callback. Called from `Transport::set_max_received_size`.
    pub fn set_notify(&self, threshold: i64, callback: NotifyCallback) {
        let mut guard = self.notify.lock().expect("live-byte counter notify mutex poisoned");
        *guard = Some(Notify { threshold, callback });
        drop(guard);
        // Re-evaluate immediately in case the new threshold already applies to the
        // current value.
        let now_above = self.value() >= threshold;
        self.above_threshold.store(now_above, Ordering::SeqCst);
    }
}

/// RAII adoption of a parsed message's byte size into a [`LiveByteCounter`].
///
/// Constructing one is the "adopt" handshake: the message's byte size joins the
/// counter and stays there until this value drops, which is the Connection
/// "releasing" the message. `size` is measured once at construction and is immutable
/// thereafter, matching the message's own immutability once parsed.
pub struct LiveMessage<T> {
    message: T,
    size: usize,
    counter: LiveByteCounter,
}

impl<T> LiveMessage<T> {
    pub fn adopt(message: T, size: usize, counter: LiveByteCounter) -> Self {
        counter.adjust(size as i64);
        Self {
            message,
            size,
            counter,
        }
    }

    pub fn get(&self) -> &T {
        &self.message
    }

    pub fn into_inner(self) -> T {
        // `ManuallyDrop` lets us move `message` out without running `Self::drop`
        // (which would double-release the counted bytes); `counter` is read out too,
        // as an owned value, so its `Arc` clones still drop normally at the end of
        // this function instead of leaking.
        let this = std::mem::ManuallyDrop::new(self);
        let message = unsafe { std::ptr::read(&this.message) };
        let counter = unsafe { std::ptr::read(&this.counter) };
        counter.adjust(-(this.size as i64));
        message
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl<T> Drop for LiveMessage<T> {
    fn drop(&mut self) {
        self.counter.adjust(-(self.size as i64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn adjust_tracks_value() {
        let counter = LiveByteCounter::new();
        counter.adjust(48);
        assert_eq!(counter.value(), 48);
        counter.adjust(-48);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn notify_fires_on_threshold_crossing_both_directions() {
        let counter = LiveByteCounter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicBool::new(false));
        let (calls2, last2) = (calls.clone(), last.clone());
        counter.set_notify(
            100,
            Box::new(move |above| {
                calls2.fetch_add(1, Ordering::SeqCst);
                last2.store(above, Ordering::SeqCst);
            }),
        );

        counter.adjust(50);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        counter.adjust(60); // 110, crosses above
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(last.load(Ordering::SeqCst));
        assert!(counter.is_above_threshold());

        counter.adjust(-20); // 90, crosses back below
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!last.load(Ordering::SeqCst));
        assert!(!counter.is_above_threshold());
    }

    #[test]
    fn live_message_releases_on_drop() {
        let counter = LiveByteCounter::new();
        {
            let msg = LiveMessage::adopt(vec![0u8; 48], 48, counter.clone());
            assert_eq!(counter.value(), 48);
            assert_eq!(msg.get().len(), 48);
        }
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn live_message_into_inner_still_releases() {
        let counter = LiveByteCounter::new();
        let msg = LiveMessage::adopt(vec![1u8; 40], 40, counter.clone());
        assert_eq!(counter.value(), 40);
        let inner = msg.into_inner();
        assert_eq!(inner.len(), 40);
        assert_eq!(counter.value(), 0);
    }
}
