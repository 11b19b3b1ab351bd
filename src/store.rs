//! The external message store interface.

use anyhow::Result;
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::models::Message;

/// A visibility deferral for a single delivery attempt.
#[derive(Clone, Debug)]
pub struct Deferral {
    /// The ack token of the delivery attempt to defer.
    pub ack_token: String,
    /// The time before which the store must not redeliver the message.
    pub not_visible_until: OffsetDateTime,
}

/// The durable message store feeding a sink delivery pipeline.
///
/// The store is append-only, visibility-timeout based and provides
/// at-least-once semantics: any message not permanently acked will eventually
/// be redelivered with a fresh ack token and an incremented deliver count.
/// All operations must have bounded latency; errors are transient from the
/// pipeline's perspective and are retried on its next natural cycle.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Return up to `max_count` currently-visible messages for the consumer.
    async fn produce(&self, consumer: &str, max_count: u64) -> Result<Vec<Message>>;

    /// Permanently remove the given delivery attempts from future redelivery.
    async fn ack(&self, consumer: &str, ack_tokens: Vec<String>) -> Result<()>;

    /// Defer redelivery of each given delivery attempt until its deadline.
    async fn nack(&self, consumer: &str, deferrals: Vec<Deferral>) -> Result<()>;

    /// The confirmed durable position of the replication log feeding this
    /// consumer, used to bound idempotency ledger retention.
    async fn confirmed_flush_position(&self, consumer: &str) -> Result<Option<u64>>;
}
