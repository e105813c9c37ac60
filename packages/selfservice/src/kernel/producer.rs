//! Message producer abstraction for production and testing.
//!
//! The outbox relay publishes through this trait, which allows swapping
//! between a real NATS connection and a recording test double.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::RwLock;

/// A published message, as the relay handed it to the broker.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

/// Trait for broker publish operations.
///
/// `key` is the partitioning key. Consumers that need per-aggregate ordering
/// group messages by it.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;
}

/// Real NATS-backed producer.
///
/// NATS subjects carry no partition key, so the key only travels inside the
/// message envelope; the subject is the topic itself.
pub struct NatsProducer {
    client: async_nats::Client,
}

impl NatsProducer {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageProducer for NatsProducer {
    async fn publish(&self, topic: &str, _key: &str, payload: Bytes) -> Result<()> {
        self.client.publish(topic.to_string(), payload).await?;
        Ok(())
    }
}

/// Producer that records published messages for test inspection.
#[derive(Default)]
pub struct TestProducer {
    published: RwLock<Vec<PublishedMessage>>,
}

impl TestProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all published messages.
    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get published messages for a specific topic.
    pub fn messages_for_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Get the count of published messages.
    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Messages published after the first `skip` ones. Lets tests look at
    /// what a single step of a scenario produced.
    pub fn published_since(&self, skip: usize) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .skip(skip)
            .cloned()
            .collect()
    }

    /// Deserialize a published message payload as JSON.
    pub fn deserialize_message<T: serde::de::DeserializeOwned>(
        &self,
        msg: &PublishedMessage,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&msg.payload)
    }

    /// Clear all recorded messages.
    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl MessageProducer for TestProducer {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_published_messages() {
        let producer = TestProducer::new();

        producer
            .publish("topic.a", "key-1", Bytes::from(r#"{"id":"123"}"#))
            .await
            .unwrap();
        producer
            .publish("topic.b", "key-2", Bytes::new())
            .await
            .unwrap();

        assert_eq!(producer.publish_count(), 2);
        assert_eq!(producer.messages_for_topic("topic.a").len(), 1);
        assert_eq!(producer.messages_for_topic("topic.a")[0].key, "key-1");

        producer.clear();
        assert_eq!(producer.publish_count(), 0);
    }
}
