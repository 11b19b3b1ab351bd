//! Test fixtures.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Message, MessageAction};
use crate::store::{Deferral, MessageStore};

/// Create a test message with the given sequence, action and delivery count.
pub fn new_message(sequence: u64, action: MessageAction, deliver_count: u32) -> Message {
    Message {
        sequence,
        ack_token: format!("token-{}", sequence),
        deliver_count,
        action,
        data: format!("message-{}", sequence).into_bytes(),
    }
}

/// Create a contiguous run of first-attempt insert messages.
pub fn new_messages(sequences: std::ops::Range<u64>) -> Vec<Message> {
    sequences.map(|seq| new_message(seq, MessageAction::Insert, 0)).collect()
}

#[derive(Default)]
struct MemoryStoreState {
    queue: VecDeque<Message>,
    produce_errors: u32,
    produce_calls: u32,
    produce_max_counts: Vec<u64>,
    acked: Vec<String>,
    nacked: Vec<Deferral>,
    nack_chunks: Vec<usize>,
    watermark: Option<u64>,
}

/// An in-memory message store double which records every call made against
/// it.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreState> {
        self.state.lock().expect("memory store mutex poisoned")
    }

    /// Append messages to the deliverable queue.
    pub fn push_messages(&self, messages: Vec<Message>) {
        self.lock().queue.extend(messages);
    }

    /// Make the next `count` produce calls fail.
    pub fn set_produce_errors(&self, count: u32) {
        self.lock().produce_errors = count;
    }

    /// Set the confirmed flush position returned to the controller.
    pub fn set_watermark(&self, watermark: Option<u64>) {
        self.lock().watermark = watermark;
    }

    /// The number of produce calls made so far.
    pub fn produce_calls(&self) -> u32 {
        self.lock().produce_calls
    }

    /// The `max_count` argument of every produce call made so far.
    pub fn produce_max_counts(&self) -> Vec<u64> {
        self.lock().produce_max_counts.clone()
    }

    /// All ack tokens acked so far, in call order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// All deferrals nacked so far, in call order.
    pub fn nacked(&self) -> Vec<Deferral> {
        self.lock().nacked.clone()
    }

    /// The deferral count of every nack call made so far.
    pub fn nack_chunks(&self) -> Vec<usize> {
        self.lock().nack_chunks.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn produce(&self, _consumer: &str, max_count: u64) -> Result<Vec<Message>> {
        let mut state = self.lock();
        state.produce_calls += 1;
        state.produce_max_counts.push(max_count);
        if state.produce_errors > 0 {
            state.produce_errors -= 1;
            return Err(anyhow!("simulated produce error"));
        }
        let take = (max_count as usize).min(state.queue.len());
        Ok(state.queue.drain(..take).collect())
    }

    async fn ack(&self, _consumer: &str, ack_tokens: Vec<String>) -> Result<()> {
        self.lock().acked.extend(ack_tokens);
        Ok(())
    }

    async fn nack(&self, _consumer: &str, deferrals: Vec<Deferral>) -> Result<()> {
        let mut state = self.lock();
        state.nack_chunks.push(deferrals.len());
        state.nacked.extend(deferrals);
        Ok(())
    }

    async fn confirmed_flush_position(&self, _consumer: &str) -> Result<Option<u64>> {
        Ok(self.lock().watermark)
    }
}
