//! Outbound queue of routed chat messages.
//!
//! Messages wait here until their destination can take them. Order is
//! FIFO per enqueue; a destination that cannot take a message yet keeps
//! every later message addressed to it queued behind that one.

use jim_protocol::Envelope;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::trace;

/// A routed message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Destination account name.
    pub destination: String,
    /// Envelope delivered unchanged to the destination.
    pub envelope: Envelope,
}

impl QueuedMessage {
    /// Create a new queued message.
    #[must_use]
    pub fn new(destination: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            destination: destination.into(),
            envelope,
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the destination; dequeue.
    Delivered,
    /// Destination not writable yet; keep for the next pass.
    Blocked,
    /// Destination gone or failed; dequeue and discard.
    Dropped,
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Messages written.
    pub delivered: usize,
    /// Messages left queued.
    pub retained: usize,
    /// Messages discarded.
    pub dropped: usize,
}

/// FIFO of messages awaiting a writable destination.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
    /// Pending count per destination; absent means zero.
    pending: HashMap<String, usize>,
}

impl OutboundQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&mut self, message: QueuedMessage) {
        trace!(destination = %message.destination, "Message queued");
        *self.pending.entry(message.destination.clone()).or_default() += 1;
        self.entries.push_back(message);
    }

    /// Number of pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate pending messages in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    /// Number of pending messages for `destination`.
    #[must_use]
    pub fn pending_for(&self, destination: &str) -> usize {
        self.pending.get(destination).copied().unwrap_or(0)
    }

    /// Attempt delivery of every pending message, in order.
    ///
    /// Once `deliver` reports [`Delivery::Blocked`] for a destination, the
    /// remaining messages for that destination are retained without being
    /// offered again in this pass.
    pub fn drain<F>(&mut self, mut deliver: F) -> DrainStats
    where
        F: FnMut(&QueuedMessage) -> Delivery,
    {
        let mut stats = DrainStats::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut retained = VecDeque::with_capacity(self.entries.len());

        for message in self.entries.drain(..) {
            if blocked.contains(&message.destination) {
                stats.retained += 1;
                retained.push_back(message);
                continue;
            }

            match deliver(&message) {
                Delivery::Delivered => stats.delivered += 1,
                Delivery::Dropped => stats.dropped += 1,
                Delivery::Blocked => {
                    blocked.insert(message.destination.clone());
                    stats.retained += 1;
                    retained.push_back(message);
                }
            }
        }

        self.pending.clear();
        for message in &retained {
            *self.pending.entry(message.destination.clone()).or_default() += 1;
        }
        self.entries = retained;
        stats
    }

    /// Discard every message for `destination`.
    ///
    /// Returns how many were discarded.
    pub fn purge(&mut self, destination: &str) -> usize {
        if self.pending.remove(destination).is_none() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|m| m.destination != destination);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(to: &str, text: &str) -> QueuedMessage {
        QueuedMessage::new(to, Envelope::message("alice", to, text))
    }

    fn text_of(message: &QueuedMessage) -> String {
        match &message.envelope {
            Envelope::Request(jim_protocol::Request::Message { text, .. }) => text.clone(),
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_drain_in_fifo_order() {
        let mut queue = OutboundQueue::new();
        queue.push(queued("bob", "1"));
        queue.push(queued("carol", "2"));
        queue.push(queued("bob", "3"));

        let mut seen = Vec::new();
        let stats = queue.drain(|m| {
            seen.push(text_of(m));
            Delivery::Delivered
        });

        assert_eq!(seen, vec!["1", "2", "3"]);
        assert_eq!(stats.delivered, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_blocked_destination_keeps_order() {
        let mut queue = OutboundQueue::new();
        queue.push(queued("bob", "1"));
        queue.push(queued("carol", "2"));
        queue.push(queued("bob", "3"));

        let mut offered = Vec::new();
        let stats = queue.drain(|m| {
            offered.push(text_of(m));
            if m.destination == "bob" {
                Delivery::Blocked
            } else {
                Delivery::Delivered
            }
        });

        // "3" is never offered while "1" is blocked
        assert_eq!(offered, vec!["1", "2"]);
        assert_eq!(stats.retained, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(queue.pending_for("bob"), 2);
        assert_eq!(queue.pending_for("carol"), 0);

        let remaining: Vec<_> = queue.iter().map(text_of).collect();
        assert_eq!(remaining, vec!["1", "3"]);
    }

    #[test]
    fn test_dropped_messages_are_discarded() {
        let mut queue = OutboundQueue::new();
        queue.push(queued("ghost", "boo"));

        let stats = queue.drain(|_| Delivery::Dropped);
        assert_eq!(stats.dropped, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_purge() {
        let mut queue = OutboundQueue::new();
        queue.push(queued("bob", "1"));
        queue.push(queued("carol", "2"));
        queue.push(queued("bob", "3"));

        assert_eq!(queue.pending_for("bob"), 2);
        assert_eq!(queue.purge("bob"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_for("bob"), 0);
    }
}
