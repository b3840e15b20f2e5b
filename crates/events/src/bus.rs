//! Event bus implementation using tokio broadcast channels

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1024;

/// Event bus for publishing and subscribing to deployment events.
///
/// Envelopes are numbered and sent under one lock, so every subscriber sees
/// them in strictly increasing `sequence` order even when workers on several
/// tasks publish concurrently.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    next_sequence: Arc<Mutex<u64>>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_sequence: Arc::new(Mutex::new(0)),
        }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the sequence number assigned to the event. With no
    /// subscribers the event is dropped but still consumes a number.
    pub fn publish(&self, event: Event) -> u64 {
        let mut next = match self.next_sequence.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sequence = *next;
        *next += 1;
        let _ = self.sender.send(EventEnvelope::new(sequence, event));
        sequence
    }

    /// Subscribe to events
    ///
    /// Events published before subscribing will not be received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the total number of events published
    pub fn event_count(&self) -> u64 {
        match self.next_sequence.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}

/// Collect every envelope currently buffered in a receiver.
pub fn drain(receiver: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut envelopes = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(envelope) => envelopes.push(envelope),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    envelopes
}
