//! # Message Loader
//!
//! Incremental parser sitting on top of whatever bytes the backend hands it: a
//! length-prefixed frame (4-byte little-endian length followed by a `bincode`-encoded
//! [`Message`]) may arrive split across arbitrarily many reads, so the loader owns a
//! growable buffer and only produces a `Message` once a full frame is present.

use crate::alloc::{DebugAllocator, GuardedAlloc};
use crate::error::TransportError;
use crate::message::Message;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Result of asking the loader to parse whatever bytes are currently buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// At least one additional message became available.
    Progressed,
    /// A buffer growth needed to make progress failed; retry later.
    NeedMemory,
    /// Nothing more can be parsed from the bytes currently buffered.
    Idle,
}

/// Incremental frame parser plus the FIFO of messages it has fully decoded.
pub struct MessageLoader {
    buf: BytesMut,
    queue: VecDeque<Message>,
    max_message_size: usize,
}

impl MessageLoader {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            queue: VecDeque::new(),
            max_message_size,
        }
    }

    pub fn set_max_message_size(&mut self, n: usize) {
        self.max_message_size = n;
    }

    /// Append freshly read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        DebugAllocator::try_reserve(&mut self.buf, bytes.len(), "loader::feed")?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Parse as many complete frames out of the buffer as are currently available.
    ///
    /// A length prefix larger than `max_message_size` is treated as stream corruption,
    /// not a backpressure condition — an honest peer never sends one.
    pub fn parse(&mut self) -> Result<LoadOutcome, TransportError> {
        let mut progressed = false;
        loop {
            if self.buf.len() < LENGTH_PREFIX_SIZE {
                break;
            }
            // Copy the prefix through a guard-banded scratch allocation rather than
            // reading `self.buf` in place: the four bytes that become a trusted
            // length are peer-controlled, and this is the one place that length gets
            // turned into a number, so it's where a guard-band corruption would need
            // to be caught before it could influence anything downstream.
            let mut prefix_scratch = match GuardedAlloc::new(LENGTH_PREFIX_SIZE, "loader::frame_len") {
                Ok(scratch) => scratch,
                Err(_) => return Ok(LoadOutcome::NeedMemory),
            };
            prefix_scratch
                .as_mut_slice()
                .copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
            let len = u32::from_le_bytes(prefix_scratch.as_mut_slice().try_into().unwrap()) as usize;
            if len > self.max_message_size {
                return Err(TransportError::StreamCorrupted(format!(
                    "frame length {len} exceeds max message size {}",
                    self.max_message_size
                )));
            }
            if self.buf.len() < LENGTH_PREFIX_SIZE + len {
                // Reserve room for the rest of the frame up front so a later retry
                // doesn't need to re-check; failure here is recoverable (`NeedMemory`),
                // not corruption.
                let needed = LENGTH_PREFIX_SIZE + len - self.buf.len();
                if let Err(TransportError::Oom) =
                    DebugAllocator::try_reserve(&mut self.buf, needed, "loader::parse")
                {
                    return Ok(LoadOutcome::NeedMemory);
                }
                break;
            }

            self.buf.advance(LENGTH_PREFIX_SIZE);
            let frame = self.buf.split_to(len);
            let message = Message::from_bytes(&frame).map_err(|e| {
                TransportError::StreamCorrupted(format!("malformed message frame: {e}"))
            })?;
            self.queue.push_back(message);
            progressed = true;
        }

        if progressed {
            Ok(LoadOutcome::Progressed)
        } else {
            Ok(LoadOutcome::Idle)
        }
    }

    pub fn has_messages(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn frame(msg: &Message) -> Vec<u8> {
        let body = msg.to_bytes().unwrap();
        let mut out = (body.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn parses_single_frame_delivered_whole() {
        let mut loader = MessageLoader::new(1 << 20);
        let msg = Message::new(1, MessageKind::MethodCall, b"hi".to_vec());
        loader.feed(&frame(&msg)).unwrap();
        assert_eq!(loader.parse().unwrap(), LoadOutcome::Progressed);
        let popped = loader.pop().unwrap();
        assert_eq!(popped.serial, 1);
        assert_eq!(popped.payload, b"hi");
        assert!(loader.pop().is_none());
    }

    #[test]
    fn parses_frame_split_across_feeds() {
        let mut loader = MessageLoader::new(1 << 20);
        let msg = Message::new(2, MessageKind::Signal, vec![1, 2, 3, 4, 5]);
        let bytes = frame(&msg);
        let (first, second) = bytes.split_at(3);
        loader.feed(first).unwrap();
        assert_eq!(loader.parse().unwrap(), LoadOutcome::Idle);
        assert!(!loader.has_messages());
        loader.feed(second).unwrap();
        assert_eq!(loader.parse().unwrap(), LoadOutcome::Progressed);
        assert!(loader.has_messages());
    }

    #[test]
    fn oversized_length_prefix_is_corruption() {
        let mut loader = MessageLoader::new(16);
        loader.feed(&1000u32.to_le_bytes()).unwrap();
        assert!(matches!(loader.parse(), Err(TransportError::StreamCorrupted(_))));
    }

    #[test]
    fn two_frames_in_one_feed_both_parse() {
        let mut loader = MessageLoader::new(1 << 20);
        let a = Message::new(10, MessageKind::MethodCall, vec![0; 4]);
        let b = Message::new(11, MessageKind::MethodReturn, vec![1; 4]);
        let mut bytes = frame(&a);
        bytes.extend_from_slice(&frame(&b));
        loader.feed(&bytes).unwrap();
        assert_eq!(loader.parse().unwrap(), LoadOutcome::Progressed);
        assert_eq!(loader.pop().unwrap().serial, 10);
        assert_eq!(loader.pop().unwrap().serial, 11);
        assert!(loader.pop().is_none());
    }
}
