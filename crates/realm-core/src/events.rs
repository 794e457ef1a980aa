//! Outbound domain event delivery.
//!
//! The core never talks to the messaging hub directly; it hands
//! [`DomainEvent`]s to an [`EventSink`]. The hub implements the trait and
//! fans each event out to the `player:<id>` channel of every recipient.

use std::sync::{Mutex, PoisonError};

use realm_types::DomainEvent;

/// Receiver of domain events. Delivery is fire-and-forget.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: DomainEvent);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: DomainEvent) {}
}

/// Sink that keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far, in order.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
