//! Samples produced by polling and commands consumed by writes.

use chrono::{DateTime, Utc};

use crate::register::{RegisterClass, RegisterValue};

/// One register value read during a poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub class: RegisterClass,
    pub address: u16,
    pub value: RegisterValue,
}

/// All samples collected from one device in one cycle.
///
/// Every sample shares the batch's device identity and collection time.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub device_id: String,
    pub device_name: String,
    pub unit_id: u8,
    pub collected_at: DateTime<Utc>,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Collection time in nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.collected_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.collected_at.timestamp_micros().saturating_mul(1_000))
    }
}

/// A validated request to write one register.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    pub unit_id: u8,
    pub class: RegisterClass,
    pub address: u16,
    pub value: RegisterValue,
    /// Name of the device to route to, when the sender provided one.
    pub device: Option<String>,
    /// When the sender says it issued the command.
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}
