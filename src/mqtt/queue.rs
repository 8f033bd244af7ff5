use std::collections::VecDeque;

use tracing::{debug, warn};

use super::message_manager::OutgoingMessage;

/// FIFO buffer of messages that could not be handed to the remote broker.
///
/// Unbounded unless a capacity is given. A full queue evicts its oldest entry
/// to make room; evictions are counted.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    messages: VecDeque<OutgoingMessage>,
    capacity: Option<usize>,
    evicted: u64,
}

impl OutgoingQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Appends a message, returning the entry evicted to make room, if any.
    pub fn push(&mut self, message: OutgoingMessage) -> Option<OutgoingMessage> {
        match self.capacity {
            Some(0) => {
                self.evicted += 1;
                warn!("Outgoing queue has no capacity, dropping message");
                Some(message)
            }
            Some(capacity) if self.messages.len() >= capacity => {
                let oldest = self.messages.pop_front();
                self.messages.push_back(message);
                self.evicted += 1;
                warn!(
                    "Outgoing queue full ({} messages), evicted oldest entry",
                    capacity
                );
                oldest
            }
            _ => {
                self.messages.push_back(message);
                debug!("Queued outgoing message, {} pending", self.messages.len());
                None
            }
        }
    }

    /// Hands every queued message to `deliver` in insertion order.
    ///
    /// Stops at the first failure: the failed message goes back to the front
    /// and the rest stay queued behind it. Returns the number delivered.
    pub fn drain_with<E, F>(&mut self, mut deliver: F) -> Result<usize, (usize, E)>
    where
        F: FnMut(&OutgoingMessage) -> Result<(), E>,
    {
        let mut delivered = 0;
        while let Some(message) = self.messages.pop_front() {
            if let Err(e) = deliver(&message) {
                self.messages.push_front(message);
                return Err((delivered, e));
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
