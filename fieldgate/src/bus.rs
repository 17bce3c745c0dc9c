//! Zenoh-backed bus publisher.

use std::sync::Arc;

use crate::fanout::{BusPublisher, SinkError};

/// Publishes text payloads through a shared Zenoh session.
#[derive(Clone, Debug)]
pub struct ZenohBus {
    session: Arc<zenoh::Session>,
}

impl ZenohBus {
    pub fn new(session: Arc<zenoh::Session>) -> Self {
        Self { session }
    }
}

impl BusPublisher for ZenohBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), SinkError> {
        self.session
            .put(topic, payload)
            .await
            .map_err(|e| SinkError::Bus(format!("{}: {}", topic, e)))
    }
}
