//! Sink registry.
//!
//! The registry maps consumer IDs to live delivery controller handles and
//! fans out "messages available" wakeup notifications from ingest to every
//! running controller.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};

use crate::sink::{BatchResult, SinkCtlMsg};

/// All sink handles currently registered, indexed by consumer ID.
pub type SinksMap = Arc<ArcSwap<HashMap<String, SinkHandle>>>;

/// A registry of live sink delivery controllers.
pub struct SinkRegistry {
    /// A map of all currently registered sink handles.
    sinks: SinksMap,
    /// The channel used to notify controllers of newly available messages.
    wakeups: broadcast::Sender<Arc<String>>,
}

impl SinkRegistry {
    /// Create a new instance.
    pub fn new() -> Self {
        let (wakeups, _) = broadcast::channel(1000);
        Self { sinks: Default::default(), wakeups }
    }

    /// Register a handle for the given consumer, replacing any previous
    /// handle of the same consumer.
    pub fn register(&self, handle: SinkHandle) {
        let mut updated = self.sinks.load().as_ref().clone();
        updated.insert(handle.consumer.as_ref().clone(), handle);
        self.sinks.store(Arc::new(updated));
    }

    /// Remove the handle of the given consumer, if registered.
    pub fn deregister(&self, consumer: &str) {
        let mut updated = self.sinks.load().as_ref().clone();
        if updated.remove(consumer).is_none() {
            return;
        }
        self.sinks.store(Arc::new(updated));
    }

    /// Fetch the handle of the given consumer, if registered.
    pub fn get(&self, consumer: &str) -> Option<SinkHandle> {
        self.sinks.load().get(consumer).cloned()
    }

    /// Notify the consumer's controller that new messages are available for
    /// pulling.
    ///
    /// Notifications are advisory: a dropped notification only delays pickup
    /// until the controller's next poll interval.
    pub fn notify_messages_available(&self, consumer: Arc<String>) {
        let _ = self.wakeups.send(consumer);
    }

    /// Subscribe to the wakeup notification channel.
    pub fn subscribe_wakeups(&self) -> broadcast::Receiver<Arc<String>> {
        self.wakeups.subscribe()
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a live sink delivery controller.
#[derive(Clone)]
pub struct SinkHandle {
    /// The consumer this handle belongs to.
    pub consumer: Arc<String>,
    /// The controller's command channel.
    pub tx: mpsc::Sender<SinkCtlMsg>,
}

impl SinkHandle {
    /// Signal that the downstream consumer is ready for `n` more batches.
    pub async fn add_demand(&self, n: u64) -> Result<()> {
        self.tx
            .send(SinkCtlMsg::AddDemand(n))
            .await
            .context("error sending demand signal, controller has shutdown")
    }

    /// Deliver a completion report for an emitted batch.
    pub async fn complete(&self, res: BatchResult) -> Result<()> {
        self.tx
            .send(SinkCtlMsg::BatchResult(res))
            .await
            .context("error sending completion report, controller has shutdown")
    }

    /// Request a graceful drain of the controller.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(SinkCtlMsg::Shutdown)
            .await
            .context("error sending shutdown signal, controller has shutdown")
    }
}
