//! Per-device polling on independent intervals.

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::link::{Connector, FieldLink, LinkError};
use crate::sample::{Sample, SampleBatch};

/// Result of one poll cycle for one device.
#[derive(Debug)]
pub enum CycleOutcome {
    /// At least one register group was read.
    Batch(SampleBatch),
    /// The cycle completed but every group was omitted.
    Empty,
    /// A connection-level failure ended the cycle; nothing is emitted.
    Aborted(LinkError),
}

/// Poll every register group of `device` in declared order.
pub async fn run_cycle<C: Connector>(link: &mut FieldLink<C>, device: &DeviceConfig) -> CycleOutcome {
    let collected_at = Utc::now();
    let mut samples = Vec::new();

    for group in &device.registers {
        match link
            .read(group.class, device.unit_id, group.address, group.count)
            .await
        {
            Ok(values) => {
                samples.extend((0..group.count).zip(values).map(|(offset, value)| Sample {
                    class: group.class,
                    address: group.address.wrapping_add(offset),
                    value,
                }));
            }
            Err(e) if e.is_connection_level() => {
                warn!(
                    device = %device.name,
                    class = %group.class,
                    address = group.address,
                    error = %e,
                    "Aborting poll cycle"
                );
                return CycleOutcome::Aborted(e);
            }
            Err(e) => {
                warn!(
                    device = %device.name,
                    class = %group.class,
                    address = group.address,
                    count = group.count,
                    error = %e,
                    "Omitting register group from cycle"
                );
            }
        }
    }

    if samples.is_empty() {
        return CycleOutcome::Empty;
    }

    CycleOutcome::Batch(SampleBatch {
        device_id: device.id.clone(),
        device_name: device.name.clone(),
        unit_id: device.unit_id,
        collected_at,
        samples,
    })
}

struct DeviceSchedule {
    device: DeviceConfig,
    last_success: Option<Instant>,
}

impl DeviceSchedule {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_success {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.device.poll_interval(),
        }
    }
}

/// Decides which devices behind one link are due and polls them.
pub struct PollScheduler {
    schedules: Vec<DeviceSchedule>,
}

impl PollScheduler {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        Self {
            schedules: devices
                .into_iter()
                .map(|device| DeviceSchedule {
                    device,
                    last_success: None,
                })
                .collect(),
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.schedules.iter().map(|s| &s.device)
    }

    /// Ids of the devices whose interval has elapsed at `now`.
    pub fn due(&self, now: Instant) -> Vec<&str> {
        self.schedules
            .iter()
            .filter(|s| s.is_due(now))
            .map(|s| s.device.id.as_str())
            .collect()
    }

    /// Run one tick: poll every due device and return the emitted batches.
    ///
    /// A device's interval restarts from the moment its own cycle started,
    /// and only when that cycle completes; an aborted cycle is retried on the
    /// next tick. Devices polled later in the tick are measured from their
    /// own start, not from `now`.
    pub async fn tick<C: Connector>(
        &mut self,
        link: &mut FieldLink<C>,
        now: Instant,
    ) -> Vec<SampleBatch> {
        let mut batches = Vec::new();

        for schedule in self.schedules.iter_mut().filter(|s| s.is_due(now)) {
            let started = Instant::now();
            match run_cycle(link, &schedule.device).await {
                CycleOutcome::Batch(batch) => {
                    debug!(
                        device = %batch.device_name,
                        samples = batch.len(),
                        "Poll cycle complete"
                    );
                    schedule.last_success = Some(started);
                    batches.push(batch);
                }
                CycleOutcome::Empty => {
                    debug!(device = %schedule.device.name, "Poll cycle produced no samples");
                    schedule.last_success = Some(started);
                }
                CycleOutcome::Aborted(_) => {}
            }
        }

        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterGroup;
    use crate::link::{Endpoint, LinkSettings};
    use crate::mock::{MockConnector, MockFailure};
    use crate::register::{RegisterClass, RegisterValue};
    use std::time::Duration;
    use tokio::time::MissedTickBehavior;

    fn device(id: &str, interval: u64, registers: Vec<RegisterGroup>) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            host: "10.0.0.5".to_string(),
            port: 502,
            unit_id: 1,
            poll_interval_secs: interval,
            registers,
        }
    }

    fn group(class: RegisterClass, address: u16, count: u16) -> RegisterGroup {
        RegisterGroup {
            class,
            address,
            count,
        }
    }

    fn link(connector: &MockConnector) -> FieldLink<MockConnector> {
        FieldLink::new(
            Endpoint::new("10.0.0.5", 502),
            connector.clone(),
            LinkSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_respect_interval() {
        let connector = MockConnector::new();
        let mut link = link(&connector);
        let mut scheduler = PollScheduler::new(vec![device(
            "tank",
            5,
            vec![group(RegisterClass::HoldingRegister, 10, 2)],
        )]);

        let mut emitted = Vec::new();
        for _ in 0..11 {
            let now = Instant::now();
            if !scheduler.tick(&mut link, now).await.is_empty() {
                emitted.push(now);
            }
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(emitted.len(), 3);
        for pair in emitted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_keep_independent_intervals() {
        let connector = MockConnector::new();
        let mut link = link(&connector);
        let mut scheduler = PollScheduler::new(vec![
            device("fast", 1, vec![group(RegisterClass::Coil, 0, 1)]),
            device("slow", 3, vec![group(RegisterClass::Coil, 1, 1)]),
        ]);

        let now = Instant::now();
        assert_eq!(scheduler.tick(&mut link, now).await.len(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.due(Instant::now()), vec!["fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_share_timestamp_and_addresses() {
        let connector = MockConnector::new();
        connector.set_words(1, 10, &[100, 200]);
        let mut link = link(&connector);
        let tank = device("tank", 5, vec![group(RegisterClass::HoldingRegister, 10, 2)]);

        let CycleOutcome::Batch(batch) = run_cycle(&mut link, &tank).await else {
            panic!("expected a batch");
        };

        assert_eq!(batch.device_id, "tank");
        assert_eq!(batch.unit_id, 1);
        let addresses: Vec<u16> = batch.samples.iter().map(|s| s.address).collect();
        assert_eq!(addresses, vec![10, 11]);
        assert_eq!(batch.samples[1].value, RegisterValue::Word(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_discards_partial_cycle() {
        let connector = MockConnector::new();
        connector.fail_read_at(RegisterClass::InputRegister, 20, MockFailure::Hang);
        let mut link = link(&connector);
        let dev = device(
            "meter",
            5,
            vec![
                group(RegisterClass::HoldingRegister, 0, 4),
                group(RegisterClass::InputRegister, 20, 2),
                group(RegisterClass::Coil, 0, 8),
            ],
        );

        let outcome = run_cycle(&mut link, &dev).await;

        assert!(matches!(outcome, CycleOutcome::Aborted(LinkError::Timeout)));
        // The third group is never attempted.
        assert_eq!(connector.reads().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_cycle_retries_next_tick() {
        let connector = MockConnector::new();
        connector.fail_next_read(MockFailure::Disconnect);
        let mut link = link(&connector);
        let mut scheduler = PollScheduler::new(vec![device(
            "tank",
            5,
            vec![group(RegisterClass::HoldingRegister, 10, 2)],
        )]);

        assert!(scheduler.tick(&mut link, Instant::now()).await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick(&mut link, Instant::now()).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_omits_only_that_group() {
        let connector = MockConnector::new();
        connector.fail_read_at(RegisterClass::HoldingRegister, 900, MockFailure::Exception(2));
        let mut link = link(&connector);
        let dev = device(
            "plc",
            5,
            vec![
                group(RegisterClass::HoldingRegister, 900, 2),
                group(RegisterClass::Coil, 0, 3),
            ],
        );

        let CycleOutcome::Batch(batch) = run_cycle(&mut link, &dev).await else {
            panic!("expected a batch");
        };

        assert_eq!(batch.len(), 3);
        assert!(batch.samples.iter().all(|s| s.class == RegisterClass::Coil));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_groups_omitted_counts_as_completed() {
        let connector = MockConnector::new();
        connector.fail_read_at(RegisterClass::HoldingRegister, 0, MockFailure::Malformed);
        let mut link = link(&connector);
        let mut scheduler = PollScheduler::new(vec![device(
            "plc",
            5,
            vec![group(RegisterClass::HoldingRegister, 0, 1)],
        )]);

        assert!(scheduler.tick(&mut link, Instant::now()).await.is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(scheduler.due(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_measured_from_own_cycle_on_shared_link() {
        let connector = MockConnector::new();
        connector.delay_reads_at(RegisterClass::HoldingRegister, 0, Duration::from_secs(2));
        let mut link = link(&connector);
        let mut scheduler = PollScheduler::new(vec![
            device("slow", 10, vec![group(RegisterClass::HoldingRegister, 0, 1)]),
            device("b", 5, vec![group(RegisterClass::Coil, 1, 1)]),
        ]);

        let origin = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut emitted = Vec::new();
        while origin.elapsed() < Duration::from_secs(30) {
            ticker.tick().await;
            for batch in scheduler.tick(&mut link, Instant::now()).await {
                if batch.device_id == "b" {
                    emitted.push(Instant::now());
                }
            }
        }

        assert!(emitted.len() >= 4);
        for pair in emitted.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_secs(5),
                "batches for b only {:?} apart",
                pair[1] - pair[0]
            );
        }
    }
}
