//! Broker message consumption.
//!
//! Incoming messages carry a JSON envelope with a message type tag. Handlers
//! are registered in an explicit table built at startup; there is no
//! scanning or reflection, what you register is what runs.
//!
//! Handler failure semantics: a handler returns `Ok(())` for anything it
//! decided to skip (malformed payloads, ids that no longer exist) and `Err`
//! only for infrastructure faults, in which case the message is left for the
//! broker's redelivery mechanism. Handlers must therefore be idempotent.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::outbox::OutboxEntry;

// ============================================================================
// Envelope
// ============================================================================

/// Wire envelope wrapping every message on our topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub data: serde_json::Value,
}

impl MessageEnvelope {
    /// Builds the envelope the relay publishes for an outbox entry.
    pub fn from_outbox(entry: &OutboxEntry) -> Self {
        Self {
            message_id: entry.id,
            message_type: entry.event_type.clone(),
            correlation_id: Some(Uuid::new_v4()),
            partition_key: Some(entry.partition_key.clone()),
            data: entry.payload.clone(),
        }
    }

    /// Builds an envelope directly. Used by tests and by producers of
    /// foreign events.
    pub fn new(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: message_type.into(),
            correlation_id: None,
            partition_key: None,
            data,
        }
    }
}

/// Folds legacy underscored message types onto their canonical hyphenated
/// form at the wire-decoding edge, so the registry holds exactly one entry
/// per event.
pub fn canonical_message_type(raw: &str) -> Cow<'_, str> {
    if raw.contains('_') {
        Cow::Owned(raw.replace('_', "-"))
    } else {
        Cow::Borrowed(raw)
    }
}

// ============================================================================
// Handlers and registry
// ============================================================================

/// A reactive handler for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()>;
}

/// Explicit map from canonical message type to handler, built at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message type. Chainable.
    pub fn register(mut self, message_type: &'static str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(message_type, handler);
        self
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Route an envelope to its handler.
    ///
    /// Messages with no registered handler are skipped: our own topics carry
    /// event types nobody here reacts to (e.g. the submitted event).
    pub async fn dispatch(&self, envelope: &MessageEnvelope) -> Result<()> {
        let message_type = canonical_message_type(&envelope.message_type);

        match self.handlers.get(message_type.as_ref()) {
            Some(handler) => handler.handle(envelope).await,
            None => {
                tracing::debug!(
                    message_type = %message_type,
                    message_id = %envelope.message_id,
                    "no handler registered - skipping message"
                );
                Ok(())
            }
        }
    }
}

// ============================================================================
// NATS consumer runtime
// ============================================================================

/// Subscribes to the given topics and feeds decoded envelopes through the
/// registry.
pub struct MessageConsumer {
    client: async_nats::Client,
    registry: Arc<HandlerRegistry>,
    topics: Vec<String>,
}

impl MessageConsumer {
    pub fn new(
        client: async_nats::Client,
        registry: Arc<HandlerRegistry>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            client,
            registry,
            topics,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut subscriptions = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            subscriptions.push(self.client.subscribe(topic.clone()).await?);
            tracing::info!(topic = %topic, "subscribed");
        }

        let mut stream = futures::stream::select_all(subscriptions);

        while let Some(message) = stream.next().await {
            let envelope: MessageEnvelope = match serde_json::from_slice(&message.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(
                        subject = %message.subject,
                        error = %err,
                        "failed to decode message envelope - skipping"
                    );
                    continue;
                }
            };

            if let Err(err) = self.registry.dispatch(&envelope).await {
                tracing::error!(
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    error = %err,
                    "message handler failed, leaving message for redelivery"
                );
            }
        }

        Ok(())
    }
}
