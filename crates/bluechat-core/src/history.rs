//! Ordered, append-only chat history
//!
//! Insertion order is the only order. Each entry is stamped when it is created,
//! and the history never lets a timestamp go backwards even if the wall clock
//! does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{SystemTimeSource, TimeSource, Timestamp};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Which side produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the local user
    Outgoing,
    /// Decoded from a remote payload
    Incoming,
}

/// A chat message as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    content: String,
    direction: Direction,
    timestamp: Timestamp,
    display_time: String,
}

impl Message {
    fn new(content: String, direction: Direction, timestamp: Timestamp) -> Self {
        Self {
            content,
            direction,
            display_time: timestamp.display_time(),
            timestamp,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    /// Local time the message was sent or received
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// `HH:MM` formatted when the message was created
    pub fn display_time(&self) -> &str {
        &self.display_time
    }
}

// ----------------------------------------------------------------------------
// History
// ----------------------------------------------------------------------------

/// Append-only message log owned by one session or one server run
pub struct MessageHistory {
    messages: Vec<Message>,
    time_source: Arc<dyn TimeSource>,
    updates: broadcast::Sender<Message>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }
}

impl std::fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHistory")
            .field("messages", &self.messages)
            .finish_non_exhaustive()
    }
}

impl MessageHistory {
    /// Create an empty history stamped by `time_source`
    pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            messages: Vec::new(),
            time_source,
            updates,
        }
    }

    /// Record text the local user sent
    pub fn record_outgoing(&mut self, content: impl Into<String>) -> Message {
        self.append(content.into(), Direction::Outgoing)
    }

    /// Record text decoded from a remote payload
    pub fn record_incoming(&mut self, content: impl Into<String>) -> Message {
        self.append(content.into(), Direction::Incoming)
    }

    fn append(&mut self, content: String, direction: Direction) -> Message {
        let mut timestamp = self.time_source.now();
        if let Some(last) = self.messages.last() {
            timestamp = timestamp.max(last.timestamp);
        }

        let message = Message::new(content, direction, timestamp);
        self.messages.push(message.clone());
        // No subscribers is fine
        let _ = self.updates.send(message.clone());
        message
    }

    /// Start an empty log for a new session, keeping existing subscribers
    pub fn restart(&mut self) {
        self.messages.clear();
    }

    /// Receive every message appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.updates.subscribe()
    }

    /// Copy of the current log
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StepClock(AtomicU64);

    impl TimeSource for StepClock {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.0.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_append_preserves_order_and_direction() {
        let mut history = MessageHistory::default();
        history.record_outgoing("hi");
        history.record_incoming("hello back");

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].content(), "hi");
        assert!(snapshot[0].is_outgoing());
        assert_eq!(snapshot[1].content(), "hello back");
        assert_eq!(snapshot[1].direction(), Direction::Incoming);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let clock = Arc::new(StepClock(AtomicU64::new(10_000)));
        let mut history = MessageHistory::new(clock.clone());

        history.record_outgoing("first");
        clock.0.store(5_000, Ordering::SeqCst);
        history.record_incoming("second");
        clock.0.store(20_000, Ordering::SeqCst);
        history.record_incoming("third");

        let stamps: Vec<u64> = history
            .messages()
            .iter()
            .map(|m| m.timestamp().as_millis())
            .collect();
        assert_eq!(stamps, vec![10_000, 10_000, 20_000]);
    }

    #[tokio::test]
    async fn test_subscribers_see_appends() {
        let mut history = MessageHistory::default();
        let mut updates = history.subscribe();

        history.record_incoming("ping");
        let message = updates.recv().await.unwrap();
        assert_eq!(message.content(), "ping");
        assert_eq!(message.display_time().len(), 5);
    }

    #[test]
    fn test_restart_keeps_subscribers() {
        let mut history = MessageHistory::default();
        let mut updates = history.subscribe();
        history.record_outgoing("old session");
        history.restart();
        history.record_incoming("new session");

        assert_eq!(history.len(), 1);
        assert_eq!(updates.try_recv().unwrap().content(), "old session");
        assert_eq!(updates.try_recv().unwrap().content(), "new session");
    }
}
