//! Progress-event sinks.
//!
//! The engine and phase workers publish events through the narrow
//! [`EventSink`] capability rather than holding the controller server
//! directly; the server implements the trait, tests capture with
//! [`BufferedSink`].

use parking_lot::Mutex;

use crate::types::Event;

/// A destination for progress events. Delivery is FIFO per operation.
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block on slow consumers.
    fn send(&self, event: Event);
}

/// Sink that drops everything; for silent or headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl EventSink for DiscardSink {
    fn send(&self, _event: Event) {}
}

/// Sink that buffers events in memory, in arrival order.
#[derive(Debug, Default)]
pub struct BufferedSink {
    events: Mutex<Vec<Event>>,
}

impl BufferedSink {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True when nothing was received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for BufferedSink {
    fn send(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventStatus, ProgressEntry};

    #[test]
    fn buffered_sink_preserves_order() {
        let sink = BufferedSink::new();
        sink.send(Event::progress(ProgressEntry::message("first")));
        sink.send(Event::terminal(EventStatus::Completed, None));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].progress.as_ref().unwrap().message, "first");
        assert_eq!(events[1].status, EventStatus::Completed);
    }
}
