//! Startup, run and shutdown of the whole gateway.

use std::future::Future;
use std::sync::Arc;

use fieldgate_common::{BridgeStatus, TopicBuilder};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::ZenohBus;
use crate::config::GatewayConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::fanout::BusPublisher;
use crate::influx::InfluxWriter;
use crate::link::ModbusTcpConnector;
use crate::realtime::{RealtimeBridge, RealtimeServer};

/// Name used in status messages.
pub const BRIDGE_NAME: &str = "fieldgate";

struct RealtimeParts {
    subscriber: zenoh::pubsub::Subscriber<()>,
    dispatcher: JoinHandle<()>,
    server: JoinHandle<()>,
}

/// Everything the running gateway owns, built once at startup.
pub struct GatewayContext {
    version: String,
    session: Arc<zenoh::Session>,
    bus: ZenohBus,
    topics: TopicBuilder,
    shutdown: watch::Sender<bool>,
    engine: Engine<ZenohBus>,
    intake_task: JoinHandle<()>,
    realtime: Option<RealtimeParts>,
    device_names: Vec<String>,
}

impl GatewayContext {
    /// Open the bus session and start every component.
    ///
    /// Everything that can fail runs before the first task is spawned.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        let version = env!("CARGO_PKG_VERSION").to_string();
        info!(bridge = BRIDGE_NAME, version = %version, "Starting gateway");

        let session = Arc::new(fieldgate_common::connect(&config.zenoh).await?);
        let bus = ZenohBus::new(session.clone());
        let topics = TopicBuilder::new(config.gateway.key_prefix.as_str());

        let store = config.influxdb.as_ref().map(InfluxWriter::new).transpose()?;
        match &config.influxdb {
            Some(influx) => info!(url = %influx.url, bucket = %influx.bucket, "Writing to InfluxDB"),
            None => info!("No InfluxDB configured, samples go to the bus only"),
        }

        let (shutdown, shutdown_rx) = watch::channel(false);

        let realtime = match &config.realtime {
            Some(realtime) => {
                let bridge = Arc::new(RealtimeBridge::new(
                    realtime.queue_capacity,
                    realtime.subscriber_buffer,
                ));
                let key = realtime
                    .subscribe_key
                    .clone()
                    .unwrap_or_else(|| topics.wildcard());
                let subscriber = bridge.subscribe(&session, &key).await?;
                let listener = RealtimeServer::bind(realtime.listen).await?;
                Some((bridge, subscriber, listener, realtime.clone()))
            }
            None => None,
        };

        let engine = Engine::start(
            &config.gateway,
            ModbusTcpConnector,
            store,
            bus.clone(),
            shutdown_rx.clone(),
        );

        let intake_task = {
            let intake = engine.intake().clone();
            let session = session.clone();
            let topic = config.gateway.command_topic.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = intake.run(session, topic, shutdown).await {
                    error!(error = %e, "Command intake failed");
                }
            })
        };

        let realtime = match realtime {
            Some((bridge, subscriber, listener, realtime)) => {
                let server = RealtimeServer::new(
                    bridge.clone(),
                    engine.lanes().to_vec(),
                    realtime.listen,
                    realtime.path,
                );
                let server_shutdown = shutdown_rx.clone();
                let server = tokio::spawn(async move {
                    if let Err(e) = server.run(listener, server_shutdown).await {
                        error!(error = %e, "Realtime server failed");
                    }
                });
                let dispatcher = tokio::spawn(bridge.dispatch(shutdown_rx.clone()));

                Some(RealtimeParts {
                    subscriber,
                    dispatcher,
                    server,
                })
            }
            None => None,
        };

        Ok(Self {
            version,
            session,
            bus,
            topics,
            shutdown,
            engine,
            intake_task,
            realtime,
            device_names: config.gateway.devices.iter().map(|d| d.name.clone()).collect(),
        })
    }

    /// Run until `signal` resolves, then shut down.
    pub async fn run_until<F: Future<Output = ()>>(self, signal: F) -> Result<()> {
        let links: Vec<String> = self
            .engine
            .lanes()
            .iter()
            .map(|lane| lane.endpoint().to_string())
            .collect();
        let running = BridgeStatus::running(BRIDGE_NAME, &self.version).with_metadata(
            serde_json::json!({ "devices": self.device_names, "links": links }),
        );
        publish_status(&self.bus, &self.topics, &running).await;

        info!(
            bridge = BRIDGE_NAME,
            lanes = self.engine.lanes().len(),
            "Gateway running. Press Ctrl+C to stop."
        );

        signal.await;

        info!(bridge = BRIDGE_NAME, "Received shutdown signal");
        self.stop().await
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);

        self.engine.join().await;
        if let Err(e) = self.intake_task.await {
            warn!(error = %e, "Command intake task failed");
        }

        if let Some(parts) = self.realtime {
            if let Err(e) = parts.subscriber.undeclare().await {
                warn!(error = %e, "Failed to undeclare realtime subscriber");
            }
            for task in [parts.dispatcher, parts.server] {
                if let Err(e) = task.await {
                    warn!(error = %e, "Realtime task failed");
                }
            }
        }

        let offline = BridgeStatus::offline(BRIDGE_NAME, &self.version);
        publish_status(&self.bus, &self.topics, &offline).await;

        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Error closing Zenoh session");
        }

        info!(bridge = BRIDGE_NAME, "Goodbye!");
        Ok(())
    }
}

async fn publish_status(bus: &ZenohBus, topics: &TopicBuilder, status: &BridgeStatus) {
    let payload = match status.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode status");
            return;
        }
    };
    if let Err(e) = bus.publish(&topics.status_key(), payload).await {
        warn!(status = %status.status, error = %e, "Failed to publish status");
    }
}
