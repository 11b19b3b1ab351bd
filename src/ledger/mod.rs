//! Idempotency ledger.
//!
//! The ledger tracks which sequence numbers have already been successfully
//! delivered for a consumer so that redeliveries from the at-least-once store
//! are never re-emitted downstream. Retention is bounded: a periodic trim
//! discards all entries at or below the upstream durable watermark, which is
//! the minimum window needed to dedup redeliveries that can occur between a
//! message being handed to a sink and its replication position being
//! confirmed.

#[cfg(test)]
mod mod_test;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// Storage for delivered-sequence markers.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Return the subset of the given sequences already marked delivered for
    /// the consumer.
    async fn already_delivered(&self, consumer: &str, sequences: &[u64]) -> Result<HashSet<u64>>;

    /// Mark the given sequences as delivered for the consumer.
    ///
    /// Marking an already-marked sequence is a no-op.
    async fn mark_delivered(&self, consumer: &str, sequences: &[u64]) -> Result<()>;

    /// Discard all entries for the consumer at or below the given watermark.
    ///
    /// Trim is one-way: discarded sequences are forgotten permanently, and if
    /// the store ever redelivers them they will be treated as new. Redelivery
    /// below the watermark is covered by the store's own retention
    /// guarantees, not the ledger.
    async fn trim(&self, consumer: &str, watermark: u64) -> Result<()>;
}

/// An in-memory ledger backend.
#[derive(Default)]
pub struct MemoryLedger {
    /// Delivered sequences per consumer.
    delivered: Mutex<HashMap<String, BTreeSet<u64>>>,
}

impl MemoryLedger {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeSet<u64>>>> {
        self.delivered.lock().map_err(|_| anyhow!("idempotency ledger mutex poisoned"))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn already_delivered(&self, consumer: &str, sequences: &[u64]) -> Result<HashSet<u64>> {
        let delivered = self.lock()?;
        let set = match delivered.get(consumer) {
            Some(set) => set,
            None => return Ok(HashSet::new()),
        };
        Ok(sequences.iter().copied().filter(|seq| set.contains(seq)).collect())
    }

    async fn mark_delivered(&self, consumer: &str, sequences: &[u64]) -> Result<()> {
        let mut delivered = self.lock()?;
        let set = delivered.entry(consumer.to_string()).or_default();
        set.extend(sequences.iter().copied());
        Ok(())
    }

    async fn trim(&self, consumer: &str, watermark: u64) -> Result<()> {
        let mut delivered = self.lock()?;
        if let Some(set) = delivered.get_mut(consumer) {
            match watermark.checked_add(1) {
                Some(start) => {
                    let retained = set.split_off(&start);
                    *set = retained;
                }
                None => set.clear(),
            }
        }
        Ok(())
    }
}
