//! Run-to-completion event queue
//!
//! Serialises event delivery into the tester state machine. The first caller
//! to enqueue onto an idle queue drains it in order; events enqueued while a
//! drain is in progress are picked up by that drain rather than dispatched
//! re-entrantly. Overflow drops the event — that is a bug signal, not a
//! normal path.

use crate::engine::tester::TesterEvent;
use std::collections::VecDeque;

/// Maximum number of events expected to be stacked at any one time.
const MAX_EVENTS: usize = 3;

/// Bounded per-interface event queue with re-entrancy suppression.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<TesterEvent>,
    draining: bool,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
            draining: false,
        }
    }

    /// Append an event. Returns false when the queue is full.
    #[must_use]
    pub fn push(&mut self, event: TesterEvent) -> bool {
        if self.events.len() >= MAX_EVENTS {
            return false;
        }
        self.events.push_back(event);
        true
    }

    /// Take the oldest pending event.
    pub fn pop(&mut self) -> Option<TesterEvent> {
        self.events.pop_front()
    }

    /// Whether a drain loop is currently dispatching events.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Mark the start of a drain loop.
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    /// Mark the end of a drain loop.
    pub fn end_drain(&mut self) {
        self.draining = false;
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are pending.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Empty the queue without dispatching anything.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
