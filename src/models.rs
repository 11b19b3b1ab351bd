//! Data models of the sink delivery pipeline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// The default max batch size used when a consumer's batch size is unset.
const DEFAULT_BATCH_SIZE: u32 = 10;

/// The change action which produced a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAction {
    Insert,
    Update,
    Delete,
    /// A read-path message, not a change-capture event.
    Read,
}

impl MessageAction {
    /// Whether this action represents a change-capture event.
    ///
    /// Read actions are exempt from idempotency enforcement as they carry no
    /// at-most-once delivery guarantee.
    pub fn is_change_capture(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// A unit of change data to be delivered to a sink.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Message {
    /// The monotonically increasing per-consumer sequence of this change
    /// event, used for ordering and dedup.
    pub sequence: u64,
    /// The opaque handle used to ack or defer this specific delivery attempt.
    ///
    /// Distinct from `sequence`: the same sequence may be redelivered by the
    /// store with a new token.
    pub ack_token: String,
    /// The number of delivery attempts made for this message so far.
    pub deliver_count: u32,
    /// The change action which produced this message.
    pub action: MessageAction,
    /// The encoded change payload.
    pub data: Vec<u8>,
}

/// A consumer of the message store along with its per-sink delivery settings.
#[derive(Clone, Debug)]
pub struct Consumer {
    /// The identity of the store partition this consumer pulls from.
    pub id: Arc<String>,
    /// The max number of messages per emitted batch.
    pub batch_size: u32,
    /// The interval of the periodic store poll.
    pub batch_timeout: Duration,
    /// The base redelivery backoff delay.
    pub backoff_base: Duration,
    /// The ceiling on the redelivery backoff delay.
    pub backoff_max: Duration,
}

impl Consumer {
    /// Create a new consumer deriving its settings from the given config.
    pub fn new(id: impl Into<String>, config: &Config) -> Self {
        let batch_size = if config.batch_size == 0 { DEFAULT_BATCH_SIZE } else { config.batch_size };
        Self {
            id: Arc::new(id.into()),
            batch_size,
            batch_timeout: Duration::from_secs(config.batch_timeout_seconds),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}
