// Kernel module - infrastructure seams and their production implementations.

pub mod clock;
pub mod consumer;
pub mod outbox;
pub mod persistence;
pub mod producer;
pub mod scheduled_tasks;
pub mod test_dependencies;

pub use clock::{Clock, SystemClock};
pub use consumer::{
    canonical_message_type, HandlerRegistry, MessageConsumer, MessageEnvelope, MessageHandler,
};
pub use outbox::{OutboxEntry, OutboxRelay, OutboxRelayConfig, OutboxStore, PgOutboxStore};
pub use persistence::{transactional, Database, PgDatabase, StoreError, StoreTx, UnitOfWork};
pub use producer::{MessageProducer, NatsProducer, PublishedMessage, TestProducer};
