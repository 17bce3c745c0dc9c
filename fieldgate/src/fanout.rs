//! Delivery of sample batches to the time-series store and the bus.
//!
//! Each batch goes to both sinks concurrently. A failing sink is logged and
//! never retried, and it never holds back the other one.

use std::future::Future;

use fieldgate_common::TopicBuilder;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sample::SampleBatch;

/// Errors raised by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("time-series store error: {0}")]
    Store(String),
    #[error("bus publish error: {0}")]
    Bus(String),
}

/// Batched writes to a time-series store.
pub trait TimeSeriesSink: Send + Sync + 'static {
    fn write_batch(
        &self,
        batch: &SampleBatch,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Single-message publishes to the bus.
pub trait BusPublisher: Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Outcome of delivering one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// `None` when no store is configured.
    pub stored: Option<bool>,
    pub published: usize,
    pub publish_failures: usize,
}

/// Writes batches to the store and publishes their samples on the bus.
pub struct SinkFanout<S, B> {
    store: Option<S>,
    bus: B,
    topics: TopicBuilder,
}

impl<S: TimeSeriesSink, B: BusPublisher> SinkFanout<S, B> {
    pub fn new(store: Option<S>, bus: B, topics: TopicBuilder) -> Self {
        Self { store, bus, topics }
    }

    /// Deliver one batch to every sink.
    pub async fn deliver(&self, batch: &SampleBatch) -> FanoutReport {
        let store = async {
            let store = self.store.as_ref()?;
            match store.write_batch(batch).await {
                Ok(()) => Some(true),
                Err(e) => {
                    warn!(
                        device = %batch.device_name,
                        samples = batch.len(),
                        error = %e,
                        "Dropping batch for time-series store"
                    );
                    Some(false)
                }
            }
        };

        let bus = async {
            let mut published = 0;
            let mut failures = 0;
            for sample in &batch.samples {
                let topic = self.topics.data_topic(
                    &batch.device_name,
                    batch.unit_id,
                    sample.class.as_str(),
                    sample.address,
                );
                match self.bus.publish(&topic, sample.value.to_string()).await {
                    Ok(()) => published += 1,
                    Err(e) => {
                        failures += 1;
                        warn!(topic = %topic, error = %e, "Bus publish failed");
                    }
                }
            }
            (published, failures)
        };

        let (stored, (published, publish_failures)) = tokio::join!(store, bus);

        debug!(
            device = %batch.device_name,
            samples = batch.len(),
            ?stored,
            published,
            publish_failures,
            "Batch delivered"
        );

        FanoutReport {
            stored,
            published,
            publish_failures,
        }
    }

    /// Deliver batches until every sender is gone.
    pub async fn run(self, mut batches: mpsc::Receiver<SampleBatch>) {
        while let Some(batch) = batches.recv().await {
            self.deliver(&batch).await;
        }
        debug!("Fanout stopped");
    }
}

/// Non-blocking producer side of the fanout channel.
#[derive(Debug, Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<SampleBatch>,
}

impl BatchSender {
    /// Create a sender and the receiver to hand to [`SinkFanout::run`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SampleBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a batch. Returns `false` when it was dropped.
    pub fn submit(&self, batch: SampleBatch) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(
                    device = %batch.device_name,
                    samples = batch.len(),
                    "Fanout queue full, dropping batch"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                debug!(device = %batch.device_name, "Fanout stopped, dropping batch");
                false
            }
        }
    }
}
