//! Bounded outbound queue
//!
//! Holds envelopes while the socket is down. Once full, the oldest entry
//! is dropped to make room for the newest.

use std::collections::VecDeque;

use crate::envelope::Envelope;

#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an envelope, returning the oldest one if it had to be dropped
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(envelope);
        dropped
    }

    /// Put an envelope back at the head after a failed transmit. A full
    /// queue rejects it since it is older than everything queued.
    pub fn push_front(&mut self, envelope: Envelope) -> Option<Envelope> {
        if self.items.len() >= self.capacity {
            return Some(envelope);
        }
        self.items.push_front(envelope);
        None
    }

    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.items.iter()
    }
}
