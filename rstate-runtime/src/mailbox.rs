//! Actor mailbox.
//!
//! Unbounded FIFO. Events are never dropped while the actor is alive; a
//! stopped actor clears its mailbox and refuses new events.

use rstate_core::Event;
use std::collections::VecDeque;

/// FIFO queue of external events for one actor.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Event>,
    /// Total events enqueued
    enqueued_count: u64,
    /// Total events taken for processing
    processed_count: u64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
        self.enqueued_count = self.enqueued_count.wrapping_add(1);
    }

    /// Takes the next event.
    pub fn pop(&mut self) -> Option<Event> {
        let event = self.queue.pop_front();
        if event.is_some() {
            self.processed_count = self.processed_count.wrapping_add(1);
        }
        event
    }

    /// Drops all pending events, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueued_count(&self) -> u64 {
        self.enqueued_count
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }
}
