//! The polling and command engine, independent of any concrete transport.

use std::sync::Arc;

use fieldgate_common::TopicBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::CommandIntake;
use crate::config::GatewaySection;
use crate::fanout::{BatchSender, BusPublisher, SinkFanout, TimeSeriesSink};
use crate::lane::{LaneHandle, build_lanes};
use crate::link::Connector;

/// Running lanes and fanout, plus the command intake that feeds the lanes.
pub struct Engine<B> {
    lanes: Vec<LaneHandle>,
    intake: Arc<CommandIntake<B>>,
    lane_tasks: Vec<JoinHandle<()>>,
    fanout_task: JoinHandle<()>,
}

impl<B: BusPublisher + Clone> Engine<B> {
    /// Spawn one lane per endpoint and the fanout task.
    ///
    /// Lanes stop when `shutdown` turns true; the fanout task drains what
    /// the lanes produced and stops after them.
    pub fn start<C, S>(
        gateway: &GatewaySection,
        connector: C,
        store: Option<S>,
        bus: B,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        C: Connector + Clone,
        S: TimeSeriesSink,
    {
        let topics = TopicBuilder::new(gateway.key_prefix.as_str());
        let (batches, batch_rx) = BatchSender::channel(gateway.fanout_capacity);

        let fanout = SinkFanout::new(store, bus.clone(), topics);
        let fanout_task = tokio::spawn(fanout.run(batch_rx));

        let mut lanes = Vec::new();
        let mut lane_tasks = Vec::new();
        for (lane, handle) in build_lanes(
            &gateway.devices,
            &connector,
            gateway.link_settings(),
            gateway.tick(),
            &batches,
        ) {
            lane_tasks.push(tokio::spawn(lane.run(shutdown.clone())));
            lanes.push(handle);
        }
        // Only the lanes hold senders now, so the fanout ends with them.
        drop(batches);

        info!(
            lanes = lanes.len(),
            devices = gateway.devices.len(),
            "Engine started"
        );

        let intake = Arc::new(CommandIntake::new(
            lanes.clone(),
            bus,
            gateway.response_topic.clone(),
        ));

        Self {
            lanes,
            intake,
            lane_tasks,
            fanout_task,
        }
    }

    pub fn lanes(&self) -> &[LaneHandle] {
        &self.lanes
    }

    pub fn intake(&self) -> &Arc<CommandIntake<B>> {
        &self.intake
    }

    /// Wait for every lane and then the fanout to finish.
    pub async fn join(self) {
        for task in self.lane_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Lane task failed");
            }
        }
        if let Err(e) = self.fanout_task.await {
            warn!(error = %e, "Fanout task failed");
        }
        info!("Engine stopped");
    }
}
