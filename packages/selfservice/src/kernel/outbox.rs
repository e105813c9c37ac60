//! Durable event outbox for same-transaction event persistence.
//!
//! The outbox pattern ensures events are persisted in the same database
//! transaction as the aggregate changes that produced them:
//!
//! 1. The unit of work writes aggregate rows AND outbox entries in a single
//!    transaction (see `kernel::persistence`).
//! 2. The relay polls the outbox, publishes to the broker, and marks entries
//!    as dispatched.
//!
//! # Guarantees
//!
//! - **Same-transaction durability**: an entry survives iff the aggregate
//!   write survives.
//! - **At-least-once delivery**: the relay publishes before marking, so a
//!   crash in between re-publishes on restart. Consumers must be idempotent.
//! - **Per-aggregate ordering**: entry ids are UUIDv7 assigned in recording
//!   order, and the relay drains in id order. No cross-aggregate ordering is
//!   guaranteed.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::consumer::MessageEnvelope;
use super::persistence::StoreError;
use super::producer::MessageProducer;

// ============================================================================
// OutboxEntry
// ============================================================================

/// A persisted outbox row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: Uuid,
    /// Canonical message type tag (e.g. `"membership-submitted"`).
    pub event_type: String,
    pub topic: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    /// When the relay published the entry (`None` = undispatched).
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(
        event_type: String,
        topic: String,
        partition_key: String,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            // v7: recording order is preserved in id order.
            id: Uuid::now_v7(),
            event_type,
            topic,
            partition_key,
            payload,
            occurred_at,
            dispatched_at: None,
        }
    }
}

// ============================================================================
// OutboxStore
// ============================================================================

/// Reads and manages outbox entries for the relay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Fetch undispatched entries in insertion order (oldest first).
    async fn fetch_undispatched(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Mark an entry as dispatched after a successful publish.
    async fn mark_dispatched(&self, id: Uuid) -> Result<(), StoreError>;
}

/// PostgreSQL-backed outbox store.
///
/// A single relay instance drains the table; if several instances run, the
/// worst case is a duplicate publish, which downstream consumers already
/// tolerate.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_undispatched(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        sqlx::query_as::<_, OutboxEntry>(
            "SELECT id, event_type, topic, partition_key, payload, occurred_at, dispatched_at
             FROM outbox
             WHERE dispatched_at IS NULL
             ORDER BY id
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET dispatched_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// ============================================================================
// OutboxRelay
// ============================================================================

/// Configuration for the outbox relay.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// How often to poll for undispatched entries.
    pub poll_interval: Duration,
    /// Maximum entries to publish per poll.
    pub batch_size: i64,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

/// Background task that drains the outbox and publishes to the broker.
pub struct OutboxRelay<S: OutboxStore> {
    store: S,
    producer: Arc<dyn MessageProducer>,
    config: OutboxRelayConfig,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: S, producer: Arc<dyn MessageProducer>) -> Self {
        Self::with_config(store, producer, OutboxRelayConfig::default())
    }

    pub fn with_config(
        store: S,
        producer: Arc<dyn MessageProducer>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            store,
            producer,
            config,
        }
    }

    /// Publish one batch of undispatched entries. Returns how many entries
    /// were published.
    ///
    /// Entries are marked dispatched only after the broker accepted them, so
    /// a failure mid-batch re-publishes the remainder on the next pass
    /// (at-least-once).
    pub async fn drain_once(&self) -> Result<usize> {
        let entries = self.store.fetch_undispatched(self.config.batch_size).await?;
        let count = entries.len();

        for entry in entries {
            let envelope = MessageEnvelope::from_outbox(&entry);
            let payload = Bytes::from(serde_json::to_vec(&envelope)?);

            self.producer
                .publish(&entry.topic, &entry.partition_key, payload)
                .await?;
            self.store.mark_dispatched(entry.id).await?;

            tracing::debug!(
                message_id = %entry.id,
                message_type = %entry.event_type,
                topic = %entry.topic,
                "published outbox entry"
            );
        }

        Ok(count)
    }

    /// Run the relay until the task is dropped.
    pub async fn run(self) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox relay starting"
        );

        loop {
            match self.drain_once().await {
                // A full batch may mean more is waiting; poll again at once.
                Ok(count) if count as i64 >= self.config.batch_size => continue,
                Ok(_) => tokio::time::sleep(self.config.poll_interval).await,
                Err(err) => {
                    tracing::error!(error = %err, "outbox relay pass failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}
