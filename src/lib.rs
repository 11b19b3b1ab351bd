//! Sink delivery pipeline for change data capture streams.
//!
//! This crate implements the delivery side of a CDC platform: a demand-driven
//! producer which pulls change messages from a durable, at-least-once message
//! store, filters them through an idempotency ledger so that a sequence is
//! never emitted downstream twice, groups survivors into fixed-size batches,
//! and routes acknowledgment or backoff-deferred negative-acknowledgment back
//! into the store as the downstream sink reports completion.
//!
//! One [`sink::SinkCtl`] runs per consumer as a single logical actor: demand
//! signals, batch completions, timer fires and wakeup notifications are all
//! serialized through the controller's event loop, so a slow or broken sink
//! can never overwhelm memory or duplicate work. The durable store and the
//! ledger storage are expressed as traits ([`store::MessageStore`] and
//! [`ledger::LedgerStore`]) and are treated as external collaborators.

pub mod backoff;
pub mod config;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod ledger;
pub mod models;
pub mod registry;
#[cfg(test)]
mod registry_test;
pub mod sink;
pub mod store;

pub use crate::config::Config;
pub use crate::error::{ShutdownError, ShutdownResult};
pub use crate::ledger::{LedgerStore, MemoryLedger};
pub use crate::models::{Consumer, Message, MessageAction};
pub use crate::registry::{SinkHandle, SinkRegistry, SinksMap};
pub use crate::sink::{BatchResult, SinkBatch, SinkCtl, SinkCtlMsg};
pub use crate::store::{Deferral, MessageStore};
