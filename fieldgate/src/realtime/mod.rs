//! Bus updates relayed to streaming subscribers.
//!
//! The Zenoh callback runs on Zenoh's own threads. It only parses the sample
//! and pushes it onto a [`HandoffQueue`]; a single dispatcher task drains the
//! queue and broadcasts to the [`SubscriberRegistry`].

mod handoff;
mod registry;
mod server;

pub use handoff::HandoffQueue;
pub use registry::{BroadcastReport, SubscriberHandle, SubscriberRegistry, SubscriberState};
pub use server::{HealthReport, LinkHealth, RealtimeServer, create_router};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fieldgate_common::parse_data_topic;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use zenoh::sample::SampleKind;

use crate::register::{RegisterClass, RegisterValue};

/// Message pushed to streaming subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealtimeUpdate {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub device_name: String,
    pub slave_id: u8,
    pub register_type: RegisterClass,
    pub address: u16,
    pub value: RegisterValue,
}

impl RealtimeUpdate {
    /// Decode a data topic and its payload. The register class named in the
    /// topic decides how the payload is read.
    pub fn from_bus(topic: &str, payload: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        let parsed = parse_data_topic(topic).ok()?;
        let class = RegisterClass::from_name(parsed.register_type)?;
        let value = class.decode_payload(std::str::from_utf8(payload).ok()?)?;

        Some(Self {
            timestamp,
            topic: topic.to_string(),
            device_name: parsed.device_name.to_string(),
            slave_id: parsed.unit_id,
            register_type: class,
            address: parsed.address,
            value,
        })
    }
}

/// Shared state of the realtime bridge.
pub struct RealtimeBridge {
    queue: HandoffQueue<RealtimeUpdate>,
    registry: SubscriberRegistry,
    subscriber_buffer: usize,
}

impl RealtimeBridge {
    pub fn new(queue_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            queue: HandoffQueue::new(queue_capacity),
            registry: SubscriberRegistry::new(),
            subscriber_buffer,
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }

    /// Updates displaced from the hand-off queue.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Entry point for the bus callback. Never blocks.
    ///
    /// Returns `false` when the sample is not a data update.
    pub fn offer(&self, topic: &str, payload: &[u8]) -> bool {
        match RealtimeUpdate::from_bus(topic, payload, Utc::now()) {
            Some(update) => {
                self.queue.push(update);
                true
            }
            None => {
                trace!(topic, "Ignoring non-data sample");
                false
            }
        }
    }

    /// Drain the hand-off queue and broadcast until `shutdown` turns true.
    /// Every subscriber is closed on exit.
    pub async fn dispatch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                update = self.queue.recv() => {
                    let Some(update) = update else { break };
                    self.broadcast(&update);
                }
            }
        }

        self.queue.close();
        self.registry.close_all();
        debug!("Realtime dispatcher stopped");
    }

    fn broadcast(&self, update: &RealtimeUpdate) {
        let message: Arc<str> = match serde_json::to_string(update) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(topic = %update.topic, error = %e, "Failed to encode update");
                return;
            }
        };

        let report = self.registry.broadcast(message);
        trace!(
            topic = %update.topic,
            delivered = report.delivered,
            evicted = report.evicted,
            "Update broadcast"
        );
    }

    /// Declare the bus subscription feeding this bridge.
    ///
    /// The returned subscriber must be kept alive; undeclaring it stops the
    /// flow of updates.
    pub async fn subscribe(
        self: &Arc<Self>,
        session: &zenoh::Session,
        key_expr: &str,
    ) -> crate::error::Result<zenoh::pubsub::Subscriber<()>> {
        let bridge = Arc::clone(self);
        let subscriber = session
            .declare_subscriber(key_expr)
            .callback(move |sample| {
                if sample.kind() == SampleKind::Delete {
                    return;
                }
                let payload = sample.payload().to_bytes();
                bridge.offer(sample.key_expr().as_str(), &payload);
            })
            .await?;

        info!(key_expr, "Realtime bridge subscribed");
        Ok(subscriber)
    }
}
