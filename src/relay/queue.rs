// Buffered queue storage for messages published before a consumer attached

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// A message waiting on a broker queue
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Unique message ID
    pub id: String,
    /// Client ID of the publisher
    pub from: String,
    pub body: String,
    pub timestamp: SystemTime,
    pub expires_at: SystemTime,
}

impl QueuedMessage {
    /// Create a new message with TTL
    pub fn new(from: String, body: String, ttl: Duration) -> Self {
        let now = SystemTime::now();

        Self {
            id: Uuid::new_v4().to_string(),
            from,
            body,
            timestamp: now,
            expires_at: now + ttl,
        }
    }

    /// Check if the message has expired
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// FIFO of undelivered messages with expiration and a size cap.
///
/// Owned by the broker loop, so no locking is needed.
#[derive(Debug)]
pub struct PendingMessages {
    messages: VecDeque<QueuedMessage>,
    ttl: Duration,
    max_size: usize,
}

impl PendingMessages {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            ttl,
            max_size,
        }
    }

    /// Buffer a message, dropping the oldest ones when full
    pub fn push(&mut self, from: String, body: String) -> &QueuedMessage {
        self.purge_expired();

        while self.max_size > 0 && self.messages.len() >= self.max_size {
            if let Some(dropped) = self.messages.pop_front() {
                tracing::warn!("Queue full, dropping message {}", dropped.id);
            }
        }

        self.messages.push_back(QueuedMessage::new(from, body, self.ttl));
        &self.messages[self.messages.len() - 1]
    }

    /// Take every live message in publication order
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.purge_expired();
        self.messages.drain(..).collect()
    }

    /// Remove expired messages, returning how many were dropped
    pub fn purge_expired(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.is_expired());
        before - self.messages.len()
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

    #[tokio::test]
    async fn test_message_expiration() {
        let msg = QueuedMessage::new(
            "client1".to_string(),
            "test".to_string(),
            Duration::from_millis(100),
        );

        assert!(!msg.is_expired());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(msg.is_expired());
    }

    #[test]
    fn test_pending_messages_order() {
        let mut queue = PendingMessages::new(Duration::from_secs(60), 10);

        queue.push("client1".to_string(), "msg1".to_string());
        queue.push("client2".to_string(), "msg2".to_string());

        let messages = queue.drain();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "msg1");
        assert_eq!(messages[1].body, "msg2");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pending_messages_max_size() {
        let mut queue = PendingMessages::new(Duration::from_secs(60), 2);

        queue.push("client1".to_string(), "msg1".to_string());
        queue.push("client2".to_string(), "msg2".to_string());
        queue.push("client3".to_string(), "msg3".to_string());

        let messages = queue.drain();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "msg2"); // msg1 was dropped
        assert_eq!(messages[1].body, "msg3");
    }

    #[tokio::test]
    async fn test_pending_messages_expire() {
        let mut queue = PendingMessages::new(Duration::from_millis(50), 10);
        queue.push("client1".to_string(), "stale".to_string());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(queue.purge_expired(), 1);
        assert_eq!(queue.len(), 0);
    }
}
