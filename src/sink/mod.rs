//! Sink delivery pipeline controller.
//!
//! One `SinkCtl` runs per consumer and owns all delivery state: demand
//! accounting, pull cycles against the message store, idempotency filtering,
//! batching, and the routing of acks and backoff-deferred nacks back into the
//! store and ledger. All state transitions are serialized through the
//! controller's event loop; demand signals, batch completions and wakeup
//! notifications arrive as messages on the same channel, and timers fire
//! within the loop itself, so no two pull cycles for a consumer ever run
//! concurrently.

pub mod demand;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use uuid::Uuid;

use crate::backoff;
use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};
use crate::ledger::LedgerStore;
use crate::models::{Consumer, Message};
use crate::sink::demand::DemandAccumulator;
use crate::store::{Deferral, MessageStore};

/// The delay used to coalesce rapid demand signals into a single pull.
const PULL_COALESCE_DELAY: Duration = Duration::from_millis(10);

const METRIC_DELIVERED_MESSAGES: &str = "sink_delivered_messages";
const METRIC_DUPLICATES_FILTERED: &str = "sink_duplicates_filtered";
const METRIC_BATCHES_EMITTED: &str = "sink_batches_emitted";
const METRIC_OUTSTANDING_DEMAND: &str = "sink_outstanding_demand";

/// A controller encapsulating all logic for delivering a consumer's messages
/// to its sink.
pub struct SinkCtl<S: MessageStore, L: LedgerStore> {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The consumer whose messages this controller delivers.
    consumer: Consumer,
    /// The external message store client.
    store: Arc<S>,
    /// The idempotency ledger of this consumer.
    ledger: Arc<L>,

    /// A channel of events to be processed by this controller.
    events_rx: ReceiverStream<SinkCtlMsg>,
    /// A stream of "messages available" wakeup notifications.
    wakeups: BroadcastStream<Arc<String>>,
    /// The channel on which batches are handed to the downstream consumer.
    delivery_tx: mpsc::Sender<SinkBatch>,

    /// Demand accounting for the downstream consumer.
    demand: DemandAccumulator,
    /// The deadline at which the next scheduled pull should fire, if any.
    pull_deadline: Option<Instant>,
    /// The expected message sequences of batches currently out for delivery.
    in_flight: HashMap<Uuid, HashSet<u64>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A bool indicating that this controller is draining: no new pulls are
    /// issued, in-flight batches are allowed to complete normally.
    draining: bool,
    /// A bool indicating that this controller must stop immediately.
    descheduled: bool,
}

impl<S: MessageStore, L: LedgerStore> SinkCtl<S, L> {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, consumer: Consumer, store: Arc<S>, ledger: Arc<L>, delivery_tx: mpsc::Sender<SinkBatch>,
        wakeups: broadcast::Receiver<Arc<String>>, shutdown_tx: broadcast::Sender<()>, events_rx: mpsc::Receiver<SinkCtlMsg>,
    ) -> Self {
        metrics::register_counter!(METRIC_DELIVERED_MESSAGES, metrics::Unit::Count, "the number of messages successfully delivered and acked");
        metrics::register_counter!(METRIC_DUPLICATES_FILTERED, metrics::Unit::Count, "the number of already-delivered messages filtered and re-acked");
        metrics::register_counter!(METRIC_BATCHES_EMITTED, metrics::Unit::Count, "the number of batches emitted downstream");
        metrics::register_gauge!(METRIC_OUTSTANDING_DEMAND, metrics::Unit::Count, "the number of batches downstream is ready to accept");
        Self {
            config,
            consumer,
            store,
            ledger,
            events_rx: ReceiverStream::new(events_rx),
            wakeups: BroadcastStream::new(wakeups),
            delivery_tx,
            demand: DemandAccumulator::default(),
            pull_deadline: None,
            in_flight: Default::default(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            draining: false,
            descheduled: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("sink delivery controller {} has started", self.consumer.id);

        let poll_timer = tokio::time::sleep(self.consumer.batch_timeout);
        tokio::pin!(poll_timer);
        let trim_timer = tokio::time::sleep(self.trim_interval());
        tokio::pin!(trim_timer);
        let pull_timer = tokio::time::sleep(PULL_COALESCE_DELAY);
        tokio::pin!(pull_timer);

        loop {
            if self.descheduled || (self.draining && self.in_flight.is_empty()) {
                break;
            }
            if let Some(deadline) = self.pull_deadline {
                pull_timer.as_mut().reset(deadline);
            }
            tokio::select! {
                msg_opt = self.events_rx.next() => self.handle_msg(msg_opt).await,
                Some(wakeup) = self.wakeups.next() => self.handle_wakeup(wakeup),
                _ = &mut pull_timer, if self.pull_deadline.is_some() => {
                    self.pull_deadline = None;
                    self.demand.consume_pull_slot();
                    self.execute_pull_cycle().await;
                }
                _ = &mut poll_timer => {
                    poll_timer.as_mut().reset(Instant::now() + self.consumer.batch_timeout);
                    self.execute_pull_cycle().await;
                }
                _ = &mut trim_timer => {
                    trim_timer.as_mut().reset(Instant::now() + self.trim_interval());
                    self.trim_ledger().await;
                }
                _ = self.shutdown_rx.next() => self.begin_drain(),
            }
        }

        tracing::debug!("sink delivery controller {} has shutdown", self.consumer.id);
        Ok(())
    }

    fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.config.trim_interval_seconds)
    }

    /// Handle a message sent to this controller.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_msg(&mut self, msg_opt: Option<SinkCtlMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                // The command channel is closed, so no completion reports can
                // ever arrive. Stop immediately instead of draining.
                self.draining = true;
                self.descheduled = true;
                return;
            }
        };
        match msg {
            SinkCtlMsg::AddDemand(n) => self.handle_add_demand(n),
            SinkCtlMsg::BatchResult(res) => self.handle_batch_result(res).await,
            SinkCtlMsg::Shutdown => self.begin_drain(),
        }
    }

    /// Handle a demand signal from the downstream consumer.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_add_demand(&mut self, n: u64) {
        if self.draining {
            return;
        }
        if self.demand.add(n) {
            self.schedule_pull(PULL_COALESCE_DELAY);
        }
        metrics::gauge!(METRIC_OUTSTANDING_DEMAND, self.demand.outstanding() as f64);
    }

    /// Handle a "messages available" notification, treating it as a
    /// demand-check trigger so newly-written data is noticed without waiting
    /// out the full poll interval.
    #[tracing::instrument(level = "trace", skip(self, wakeup))]
    fn handle_wakeup(&mut self, wakeup: Result<Arc<String>, BroadcastStreamRecvError>) {
        if self.draining {
            return;
        }
        match wakeup {
            Ok(consumer) if consumer.as_str() != self.consumer.id.as_str() => return,
            Ok(_consumer) => (),
            Err(err) => {
                // A lagged wakeup stream may have dropped a notification for
                // this consumer, so run a demand check anyway.
                tracing::debug!(error = ?err, "sink wakeup stream lagged");
            }
        }
        if self.demand.request_pull() {
            self.schedule_pull(PULL_COALESCE_DELAY);
        }
    }

    /// Schedule a pull to fire after the given delay, keeping the earliest
    /// deadline if one is already scheduled.
    fn schedule_pull(&mut self, delay: Duration) {
        if self.draining {
            return;
        }
        let deadline = Instant::now() + delay;
        self.pull_deadline = Some(match self.pull_deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }

    /// Stop issuing new pulls; in-flight batches are allowed to complete
    /// normally, as dropping an ack would leave the message stuck invisible
    /// in the store until its nack timeout expires.
    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        tracing::debug!(consumer = %self.consumer.id, in_flight = self.in_flight.len(), "sink delivery controller draining");
        self.draining = true;
        self.pull_deadline = None;
    }

    /// Execute a pull cycle against the message store, if demand is
    /// outstanding.
    ///
    /// Any store or ledger failure here is transient: the cycle is abandoned
    /// and retried on the next demand signal, wakeup or poll timer fire.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn execute_pull_cycle(&mut self) {
        if self.draining || self.demand.outstanding() == 0 {
            return;
        }
        if let Err(err) = self.try_execute_pull_cycle().await {
            tracing::warn!(error = ?err, consumer = %self.consumer.id, "pull cycle failed, will retry on next trigger");
        }
    }

    async fn try_execute_pull_cycle(&mut self) -> Result<()> {
        let max_count = self.demand.outstanding().saturating_mul(self.consumer.batch_size as u64);
        let messages = self
            .store
            .produce(self.consumer.id.as_str(), max_count)
            .await
            .context("error pulling messages from store")?;
        if messages.is_empty() {
            return Ok(());
        }

        // Read-path messages are not change-capture events and bypass the
        // idempotency ledger entirely.
        let candidate_seqs: Vec<u64> = messages.iter().filter(|msg| msg.action.is_change_capture()).map(|msg| msg.sequence).collect();
        let delivered = if candidate_seqs.is_empty() {
            HashSet::new()
        } else {
            self.ledger
                .already_delivered(self.consumer.id.as_str(), &candidate_seqs)
                .await
                .context("error checking ledger for delivered sequences")?
        };

        let (mut survivors, mut duplicate_tokens) = (Vec::with_capacity(messages.len()), Vec::new());
        for msg in messages {
            if msg.action.is_change_capture() && delivered.contains(&msg.sequence) {
                duplicate_tokens.push(msg.ack_token);
            } else {
                survivors.push(msg);
            }
        }

        if !duplicate_tokens.is_empty() {
            // Redelivery of confirmed sequences is expected under
            // crash/restart races. Ack them straight back so they do not
            // occupy store capacity or get redelivered again.
            tracing::warn!(consumer = %self.consumer.id, count = duplicate_tokens.len(), "store redelivered already-confirmed messages, re-acking");
            metrics::counter!(METRIC_DUPLICATES_FILTERED, duplicate_tokens.len() as u64);
            if let Err(err) = self.store.ack(self.consumer.id.as_str(), duplicate_tokens).await {
                tracing::warn!(error = ?err, consumer = %self.consumer.id, "error re-acking duplicate messages");
            }
            // The demand consumed by the duplicates must be refilled without
            // waiting for the next timer or demand signal.
            self.demand.request_pull();
            self.schedule_pull(Duration::ZERO);
        }

        let mut batches_emitted = 0u64;
        for chunk in survivors.chunks(self.consumer.batch_size as usize) {
            let batch = SinkBatch {
                id: Uuid::new_v4(),
                consumer: self.consumer.id.clone(),
                messages: chunk.to_vec(),
            };
            self.in_flight.insert(batch.id, batch.messages.iter().map(|msg| msg.sequence).collect());
            if let Err(err) = self.delivery_tx.send(batch).await {
                self.in_flight.remove(&err.0.id);
                tracing::error!(consumer = %self.consumer.id, "sink delivery channel closed, draining pipeline");
                self.begin_drain();
                break;
            }
            batches_emitted += 1;
            metrics::counter!(METRIC_BATCHES_EMITTED, 1);
        }
        self.demand.consume_batches(batches_emitted);
        metrics::gauge!(METRIC_OUTSTANDING_DEMAND, self.demand.outstanding() as f64);
        Ok(())
    }

    /// Handle a completion report from the downstream consumer.
    #[tracing::instrument(level = "trace", skip(self, res))]
    async fn handle_batch_result(&mut self, res: BatchResult) {
        if let Err(err) = self.try_handle_batch_result(res).await {
            tracing::error!(error = ?err, consumer = %self.consumer.id, "acknowledger contract violated, aborting pipeline");
            let _ = self.shutdown_tx.send(());
            self.descheduled = true;
        }
    }

    async fn try_handle_batch_result(&mut self, res: BatchResult) -> ShutdownResult<()> {
        let expected = match self.in_flight.remove(&res.id) {
            Some(expected) => expected,
            None => return Err(ShutdownError(anyhow!("completion report received for unknown batch {}", res.id))),
        };

        // Every message of the batch must appear in exactly one of the two
        // partitions.
        let mut seen = HashSet::with_capacity(expected.len());
        for msg in res.successful.iter().chain(res.failed.iter()) {
            if !expected.contains(&msg.sequence) {
                return Err(ShutdownError(anyhow!("completion report for batch {} contains foreign sequence {}", res.id, msg.sequence)));
            }
            if !seen.insert(msg.sequence) {
                return Err(ShutdownError(anyhow!("completion report for batch {} lists sequence {} in both partitions", res.id, msg.sequence)));
            }
        }
        if seen.len() != expected.len() {
            return Err(ShutdownError(anyhow!("completion report for batch {} is missing {} message(s)", res.id, expected.len() - seen.len())));
        }

        self.process_successful(res.successful).await;
        self.process_failed(res.failed).await;
        Ok(())
    }

    /// Mark successfully delivered messages in the ledger, then ack them to
    /// the store in a single call.
    ///
    /// The ledger is marked before the ack so that a crash between the two
    /// leaves the sequences deduplicated rather than re-emitted.
    #[tracing::instrument(level = "trace", skip(self, successful))]
    async fn process_successful(&self, successful: Vec<Message>) {
        if successful.is_empty() {
            return;
        }
        let sequences: Vec<u64> = successful.iter().map(|msg| msg.sequence).collect();
        if let Err(err) = self.ledger.mark_delivered(self.consumer.id.as_str(), &sequences).await {
            // Skipping the ack as well is safe: the store will redeliver and
            // the next cycle retries both operations.
            tracing::warn!(error = ?err, consumer = %self.consumer.id, "error marking delivered sequences, deferring ack to redelivery");
            return;
        }
        let tokens: Vec<String> = successful.into_iter().map(|msg| msg.ack_token).collect();
        let count = tokens.len() as u64;
        match self.store.ack(self.consumer.id.as_str(), tokens).await {
            Ok(()) => metrics::counter!(METRIC_DELIVERED_MESSAGES, count),
            Err(err) => {
                tracing::warn!(error = ?err, consumer = %self.consumer.id, "error acking delivered messages, ledger will re-ack on redelivery")
            }
        }
    }

    /// Defer redelivery of failed messages, backing off exponentially on the
    /// per-message delivery attempt count.
    #[tracing::instrument(level = "trace", skip(self, failed))]
    async fn process_failed(&self, failed: Vec<Message>) {
        if failed.is_empty() {
            return;
        }
        let now = time::OffsetDateTime::now_utc();
        let deferrals: Vec<Deferral> = failed
            .into_iter()
            .map(|msg| {
                let delay = backoff::delay(self.consumer.backoff_base, msg.deliver_count, self.consumer.backoff_max);
                Deferral {
                    ack_token: msg.ack_token,
                    not_visible_until: now + delay,
                }
            })
            .collect();
        // The store caps the number of deferrals per nack call.
        for chunk in deferrals.chunks(self.config.nack_chunk_size.max(1)) {
            if let Err(err) = self.store.nack(self.consumer.id.as_str(), chunk.to_vec()).await {
                tracing::warn!(error = ?err, consumer = %self.consumer.id, "error nacking failed messages, store visibility timeout will cover redelivery");
            }
        }
    }

    /// Trim the idempotency ledger using the upstream durable watermark.
    ///
    /// An unavailable watermark is logged and skipped, never fatal, and never
    /// blocks future delivery.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn trim_ledger(&self) {
        let watermark = match self.store.confirmed_flush_position(self.consumer.id.as_str()).await {
            Ok(Some(watermark)) => watermark,
            Ok(None) => {
                tracing::debug!(consumer = %self.consumer.id, "no confirmed flush position available, skipping ledger trim");
                return;
            }
            Err(err) => {
                tracing::warn!(error = ?err, consumer = %self.consumer.id, "error fetching confirmed flush position, skipping ledger trim");
                return;
            }
        };
        if let Err(err) = self.ledger.trim(self.consumer.id.as_str(), watermark).await {
            tracing::warn!(error = ?err, consumer = %self.consumer.id, watermark, "error trimming idempotency ledger");
        }
    }
}

/// A message bound for a sink delivery controller.
pub enum SinkCtlMsg {
    /// The downstream consumer is ready to receive `n` more batches.
    AddDemand(u64),
    /// A completion report for a delivered batch.
    BatchResult(BatchResult),
    /// Begin a graceful drain of the pipeline.
    Shutdown,
}

/// An ordered group of messages handed to the downstream sink consumer.
///
/// A batch is owned exclusively by the downstream consumer once emitted; the
/// controller never mutates it after hand-off and only reacts to its
/// completion report.
#[derive(Clone, Debug)]
pub struct SinkBatch {
    /// The unique ID of this batch, echoed back in its completion report.
    pub id: Uuid,
    /// The consumer to which this batch belongs.
    pub consumer: Arc<String>,
    /// The messages of this batch, in increasing sequence order.
    pub messages: Vec<Message>,
}

/// The downstream consumer's completion report for a delivered batch.
///
/// Every message of the batch must appear in exactly one of the two
/// partitions; anything else is a broken acknowledger contract and aborts the
/// pipeline instance.
#[derive(Clone, Debug)]
pub struct BatchResult {
    /// The ID of the completed batch.
    pub id: Uuid,
    /// The messages which were successfully delivered to the sink.
    pub successful: Vec<Message>,
    /// The messages whose delivery failed and which must be redelivered
    /// later.
    pub failed: Vec<Message>,
}
