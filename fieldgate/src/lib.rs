//! Modbus TCP gateway for field devices.
//!
//! Devices are polled over one [`FieldLink`] per TCP endpoint. Each poll
//! cycle becomes a [`SampleBatch`] that is written to InfluxDB and published
//! on Zenoh. Write commands arrive on a Zenoh topic and are routed to the
//! lane owning the target device. A realtime bridge relays data topics to
//! WebSocket subscribers.
//!
//! # Key Expressions
//!
//! ```text
//! modbus/gateway/<device_name>/<unit_id>/<register_type>/<address>
//! modbus/gateway/@/status
//! modbus/control/command
//! ```
//!
//! Where `<register_type>` is `coils`, `discrete_inputs`, `holding_registers`
//! or `input_registers`, and the payload is the plain value (`true`, `42`).

pub mod bus;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod influx;
pub mod lane;
pub mod link;
pub mod mock;
pub mod realtime;
pub mod register;
pub mod sample;
pub mod scheduler;

pub use command::{CommandAck, CommandError, CommandIntake};
pub use config::GatewayConfig;
pub use context::GatewayContext;
pub use engine::Engine;
pub use error::{GatewayError, Result};
pub use fanout::{BusPublisher, SinkFanout, TimeSeriesSink};
pub use link::{Connector, Endpoint, FieldLink, FieldTransport, LinkError, LinkState};
pub use realtime::RealtimeBridge;
pub use register::{RegisterClass, RegisterValue};
pub use sample::{Sample, SampleBatch, WriteCommand};
pub use scheduler::PollScheduler;
