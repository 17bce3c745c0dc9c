//! In-memory stand-ins for field devices and sinks.
//!
//! Used by the unit and integration tests, and handy for running the engine
//! without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::fanout::{BusPublisher, SinkError, TimeSeriesSink};
use crate::link::{Connector, Endpoint, FieldTransport, LinkError};
use crate::register::{RegisterClass, RegisterValue};
use crate::sample::SampleBatch;

/// Scripted failure for the next matching request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Never answer; the link's timeout fires.
    Hang,
    /// The socket breaks.
    Disconnect,
    /// The device answers with an exception code.
    Exception(u8),
    /// The device answers with garbage.
    Malformed,
}

impl MockFailure {
    async fn into_error<T>(self) -> Result<T, LinkError> {
        match self {
            MockFailure::Hang => std::future::pending().await,
            MockFailure::Disconnect => {
                Err(LinkError::Transport("connection reset by peer".to_string()))
            }
            MockFailure::Exception(code) => Err(LinkError::DeviceRejected(code)),
            MockFailure::Malformed => Err(LinkError::Protocol("malformed response".to_string())),
        }
    }
}

/// A read seen by the mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRead {
    pub unit_id: u8,
    pub class: RegisterClass,
    pub address: u16,
    pub count: u16,
}

/// A write seen by the mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub endpoint: Endpoint,
    pub unit_id: u8,
    pub function_code: u8,
    pub address: u16,
    pub value: RegisterValue,
}

#[derive(Debug, Default)]
struct DeviceState {
    registers: HashMap<(u8, RegisterClass, u16), RegisterValue>,
    refuse_connects: u32,
    next_read_failures: VecDeque<MockFailure>,
    read_failures_at: HashMap<(RegisterClass, u16), MockFailure>,
    read_delays: HashMap<(RegisterClass, u16), Duration>,
    next_write_failures: VecDeque<MockFailure>,
    connect_attempts: usize,
    closed_sessions: usize,
    reads: Vec<MockRead>,
    writes: Vec<MockWrite>,
}

impl DeviceState {
    fn value(&self, unit_id: u8, class: RegisterClass, address: u16) -> RegisterValue {
        self.registers
            .get(&(unit_id, class, address))
            .copied()
            .unwrap_or(if class.is_bit() {
                RegisterValue::Bit(false)
            } else {
                RegisterValue::Word(0)
            })
    }
}

/// Connector to a simulated device. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<DeviceState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload holding registers starting at `address`.
    pub fn set_words(&self, unit_id: u8, address: u16, values: &[u16]) {
        let values: Vec<RegisterValue> = values.iter().copied().map(RegisterValue::Word).collect();
        self.set(unit_id, RegisterClass::HoldingRegister, address, &values);
    }

    pub fn set(&self, unit_id: u8, class: RegisterClass, address: u16, values: &[RegisterValue]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            let address = address.wrapping_add(offset as u16);
            state.registers.insert((unit_id, class, address), *value);
        }
    }

    pub fn get(&self, unit_id: u8, class: RegisterClass, address: u16) -> RegisterValue {
        self.state.lock().value(unit_id, class, address)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    /// Fail the next read, whatever it asks for.
    pub fn fail_next_read(&self, failure: MockFailure) {
        self.state.lock().next_read_failures.push_back(failure);
    }

    /// Fail the next read of `class` starting at `address`.
    pub fn fail_read_at(&self, class: RegisterClass, address: u16, failure: MockFailure) {
        self.state
            .lock()
            .read_failures_at
            .insert((class, address), failure);
    }

    /// Make every read of `class` starting at `address` take `delay`.
    pub fn delay_reads_at(&self, class: RegisterClass, address: u16, delay: Duration) {
        self.state.lock().read_delays.insert((class, address), delay);
    }

    pub fn fail_next_write(&self, failure: MockFailure) {
        self.state.lock().next_write_failures.push_back(failure);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.lock().closed_sessions
    }

    pub fn reads(&self) -> Vec<MockRead> {
        self.state.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.state.lock().writes.clone()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MockTransport, LinkError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(LinkError::Transport(format!(
                "connection refused by {}",
                endpoint
            )));
        }

        Ok(MockTransport {
            endpoint: endpoint.clone(),
            state: self.state.clone(),
        })
    }
}

/// Session with the simulated device.
#[derive(Debug)]
pub struct MockTransport {
    endpoint: Endpoint,
    state: Arc<Mutex<DeviceState>>,
}

impl FieldTransport for MockTransport {
    async fn read(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<RegisterValue>, LinkError> {
        let (delay, outcome) = {
            let mut state = self.state.lock();
            let delay = state.read_delays.get(&(class, address)).copied();
            state.reads.push(MockRead {
                unit_id,
                class,
                address,
                count,
            });

            let failure = state
                .read_failures_at
                .remove(&(class, address))
                .or_else(|| state.next_read_failures.pop_front());
            let outcome = match failure {
                Some(failure) => Err(failure),
                None => Ok((0..count)
                    .map(|offset| state.value(unit_id, class, address.wrapping_add(offset)))
                    .collect()),
            };
            (delay, outcome)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Ok(values) => Ok(values),
            Err(failure) => failure.into_error().await,
        }
    }

    async fn write(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        value: RegisterValue,
    ) -> Result<(), LinkError> {
        let failure = {
            let mut state = self.state.lock();
            match state.next_write_failures.pop_front() {
                Some(failure) => Some(failure),
                None => {
                    state.writes.push(MockWrite {
                        endpoint: self.endpoint.clone(),
                        unit_id,
                        function_code: class.write_function_code().unwrap_or_default(),
                        address,
                        value,
                    });
                    state.registers.insert((unit_id, class, address), value);
                    None
                }
            }
        };

        match failure {
            Some(failure) => failure.into_error().await,
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        self.state.lock().closed_sessions += 1;
    }
}

/// Time-series store that keeps every batch in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    batches: Arc<Mutex<Vec<SampleBatch>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write from now on with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn batches(&self) -> Vec<SampleBatch> {
        self.batches.lock().clone()
    }
}

impl TimeSeriesSink for MemoryStore {
    async fn write_batch(&self, batch: &SampleBatch) -> Result<(), SinkError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(SinkError::Store(message));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Bus that records every publish.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    messages: Arc<Mutex<Vec<(String, String)>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    /// Every `(topic, payload)` published so far, in order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    /// Payloads published on `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl BusPublisher for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), SinkError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(SinkError::Bus(message));
        }
        self.messages.lock().push((topic.to_string(), payload));
        Ok(())
    }
}
