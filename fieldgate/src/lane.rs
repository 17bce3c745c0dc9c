//! Lanes: one task per field link.
//!
//! A lane owns its [`FieldLink`], the [`PollScheduler`] for the devices
//! behind it and an inbox of write requests. Polls and writes on one link
//! are serialized by the lane's loop; different lanes run in parallel.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::fanout::BatchSender;
use crate::link::{Connector, Endpoint, FieldLink, LinkError, LinkSettings, LinkState};
use crate::register::RegisterValue;
use crate::sample::WriteCommand;
use crate::scheduler::PollScheduler;

/// Pending write requests per lane.
const COMMAND_INBOX: usize = 32;

/// A write command together with the channel its outcome goes back on.
#[derive(Debug)]
pub struct WriteRequest {
    pub command: WriteCommand,
    pub reply: oneshot::Sender<Result<RegisterValue, LinkError>>,
}

/// Identity of a device served by a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneDevice {
    pub id: String,
    pub name: String,
    pub unit_id: u8,
}

/// Cloneable handle used to reach a running lane.
#[derive(Debug, Clone)]
pub struct LaneHandle {
    endpoint: Endpoint,
    devices: Vec<LaneDevice>,
    commands: mpsc::Sender<WriteRequest>,
    state: watch::Receiver<LinkState>,
}

impl LaneHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn devices(&self) -> &[LaneDevice] {
        &self.devices
    }

    /// Current state of the lane's link.
    pub fn link_state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn hosts_unit(&self, unit_id: u8) -> bool {
        self.devices.iter().any(|d| d.unit_id == unit_id)
    }

    /// Match by device name or id.
    pub fn hosts_device(&self, device: &str) -> bool {
        self.devices.iter().any(|d| d.name == device || d.id == device)
    }

    /// Hand a write to the lane and wait for the device's answer.
    ///
    /// Returns `None` if the lane is no longer running.
    pub async fn write(&self, command: WriteCommand) -> Option<Result<RegisterValue, LinkError>> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(WriteRequest { command, reply })
            .await
            .ok()?;
        outcome.await.ok()
    }
}

/// The task that owns one field link.
pub struct Lane<C: Connector> {
    link: FieldLink<C>,
    scheduler: PollScheduler,
    tick: Duration,
    batches: BatchSender,
    commands: mpsc::Receiver<WriteRequest>,
}

impl<C: Connector> Lane<C> {
    pub fn new(
        link: FieldLink<C>,
        scheduler: PollScheduler,
        tick: Duration,
        batches: BatchSender,
    ) -> (Self, LaneHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_INBOX);
        let handle = LaneHandle {
            endpoint: link.endpoint().clone(),
            devices: scheduler
                .devices()
                .map(|d| LaneDevice {
                    id: d.id.clone(),
                    name: d.name.clone(),
                    unit_id: d.unit_id,
                })
                .collect(),
            commands: tx,
            state: link.watch_state(),
        };

        let lane = Self {
            link,
            scheduler,
            tick,
            batches,
            commands: rx,
        };

        (lane, handle)
    }

    /// Poll and execute writes until `shutdown` turns true.
    ///
    /// Work in progress when the signal arrives completes before the link
    /// is closed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let endpoint = self.link.endpoint().clone();
        info!(%endpoint, devices = self.scheduler.devices().count(), "Lane started");

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(%endpoint, "Shutdown signal received");
                        break;
                    }
                }

                Some(request) = self.commands.recv() => {
                    self.execute(request).await;
                }

                _ = ticker.tick() => {
                    for batch in self.scheduler.tick(&mut self.link, Instant::now()).await {
                        self.batches.submit(batch);
                    }
                }
            }
        }

        self.link.shutdown().await;
        info!(%endpoint, "Lane stopped");
    }

    async fn execute(&mut self, request: WriteRequest) {
        let WriteRequest { command, reply } = request;
        let outcome = self
            .link
            .write(command.class, command.unit_id, command.address, command.value)
            .await;

        if let Err(e) = &outcome {
            warn!(
                endpoint = %self.link.endpoint(),
                unit_id = command.unit_id,
                class = %command.class,
                address = command.address,
                error = %e,
                "Write failed"
            );
        }

        if reply.send(outcome).is_err() {
            debug!("Write requester went away before the reply");
        }
    }
}

/// Group devices by endpoint and build one lane per distinct `host:port`.
///
/// Lanes come back ordered by endpoint.
pub fn build_lanes<C: Connector + Clone>(
    devices: &[DeviceConfig],
    connector: &C,
    settings: LinkSettings,
    tick: Duration,
    batches: &BatchSender,
) -> Vec<(Lane<C>, LaneHandle)> {
    let mut by_endpoint: BTreeMap<Endpoint, Vec<DeviceConfig>> = BTreeMap::new();
    for device in devices {
        by_endpoint
            .entry(device.endpoint())
            .or_default()
            .push(device.clone());
    }

    by_endpoint
        .into_iter()
        .map(|(endpoint, devices)| {
            let link = FieldLink::new(endpoint, connector.clone(), settings);
            Lane::new(link, PollScheduler::new(devices), tick, batches.clone())
        })
        .collect()
}
