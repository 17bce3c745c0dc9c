//! Write commands received from the bus.
//!
//! A command is a JSON object:
//!
//! ```json
//! {"slave_id": 1, "register_type": "holding_register", "address": 5, "value": 100,
//!  "timestamp_api_sent": "2024-05-01T12:00:00Z", "device": "Tank1"}
//! ```
//!
//! `timestamp_api_sent` and `device` are optional. Commands are validated
//! completely before any lane is contacted.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zenoh::sample::SampleKind;

use crate::fanout::BusPublisher;
use crate::lane::LaneHandle;
use crate::link::LinkError;
use crate::register::{RegisterClass, RegisterValue};
use crate::sample::WriteCommand;

/// Reasons a command was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown register type '{0}'")]
    UnknownClass(String),
    #[error("{0} are read-only")]
    ReadOnlyClass(RegisterClass),
    #[error("value {value} does not fit {class}")]
    ValueMismatch { class: RegisterClass, value: String },
    #[error("no lane serves {0}")]
    NoRoute(String),
    #[error("unit {0} is served by several lanes, name the device")]
    AmbiguousRoute(u8),
    #[error("lane for {0} is not running")]
    LaneUnavailable(String),
    #[error("write failed: {0}")]
    Link(#[from] LinkError),
}

impl CommandError {
    /// Whether the command was rejected before any device contact.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CommandError::Link(_) | CommandError::LaneUnavailable(_))
    }
}

/// Parse and validate a command payload.
pub fn parse_command(payload: &[u8], received_at: DateTime<Utc>) -> Result<WriteCommand, CommandError> {
    let json: Value =
        serde_json::from_slice(payload).map_err(|e| CommandError::Malformed(e.to_string()))?;
    let fields = json
        .as_object()
        .ok_or_else(|| CommandError::Malformed("expected a JSON object".to_string()))?;

    let unit_id = required(fields, "slave_id")?
        .as_u64()
        .filter(|u| (1..=247).contains(u))
        .ok_or_else(|| invalid("slave_id", "expected an integer in 1-247"))? as u8;

    let class_name = required(fields, "register_type")?
        .as_str()
        .ok_or_else(|| invalid("register_type", "expected a string"))?;
    let class = RegisterClass::from_name(class_name)
        .ok_or_else(|| CommandError::UnknownClass(class_name.to_string()))?;
    if !class.is_writable() {
        return Err(CommandError::ReadOnlyClass(class));
    }

    let address = required(fields, "address")?
        .as_u64()
        .and_then(|a| u16::try_from(a).ok())
        .ok_or_else(|| invalid("address", "expected an integer in 0-65535"))?;

    let raw_value = required(fields, "value")?;
    let value = decode_value(class, raw_value).ok_or_else(|| CommandError::ValueMismatch {
        class,
        value: raw_value.to_string(),
    })?;

    let device = match fields.get("device") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
        Some(_) => return Err(invalid("device", "expected a non-empty string")),
    };

    let sent_at = fields
        .get("timestamp_api_sent")
        .and_then(Value::as_str)
        .and_then(parse_timestamp);

    Ok(WriteCommand {
        unit_id,
        class,
        address,
        value,
        device,
        sent_at,
        received_at,
    })
}

fn required<'a>(fields: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, CommandError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(CommandError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn invalid(field: &'static str, reason: &str) -> CommandError {
    CommandError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

/// Booleans for bit classes, integers 0-65535 for word classes. Nothing else.
fn decode_value(class: RegisterClass, value: &Value) -> Option<RegisterValue> {
    if class.is_bit() {
        value.as_bool().map(RegisterValue::Bit)
    } else {
        value
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .map(RegisterValue::Word)
    }
}

/// RFC 3339, or a naive ISO 8601 timestamp taken as UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc())
        })
        .ok()
}

/// Pick the lane a command goes to.
///
/// An explicit device wins. Otherwise the unit id decides, and with a single
/// lane every unit goes to it.
pub fn route<'a>(lanes: &'a [LaneHandle], command: &WriteCommand) -> Result<&'a LaneHandle, CommandError> {
    if let Some(device) = &command.device {
        return lanes
            .iter()
            .find(|lane| lane.hosts_device(device))
            .ok_or_else(|| CommandError::NoRoute(format!("device '{}'", device)));
    }

    let mut hosting = lanes.iter().filter(|lane| lane.hosts_unit(command.unit_id));
    match (hosting.next(), hosting.next()) {
        (Some(lane), None) => Ok(lane),
        (Some(_), Some(_)) => Err(CommandError::AmbiguousRoute(command.unit_id)),
        (None, _) => match lanes {
            [only] => Ok(only),
            _ => Err(CommandError::NoRoute(format!("unit {}", command.unit_id))),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Acknowledgement published on the response topic.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAck {
    pub slave_id: u8,
    pub register_type: &'static str,
    pub address: u16,
    pub value: RegisterValue,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CommandAck {
    pub fn new(command: &WriteCommand, outcome: &Result<RegisterValue, CommandError>) -> Self {
        let (status, value, error) = match outcome {
            Ok(applied) => (AckStatus::Ok, *applied, None),
            Err(e) => (AckStatus::Error, command.value, Some(e.to_string())),
        };
        Self {
            slave_id: command.unit_id,
            register_type: command.class.command_name(),
            address: command.address,
            value,
            status,
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Validates bus commands and hands them to the owning lane.
pub struct CommandIntake<B> {
    lanes: Vec<LaneHandle>,
    bus: B,
    response_topic: Option<String>,
}

impl<B: BusPublisher> CommandIntake<B> {
    pub fn new(lanes: Vec<LaneHandle>, bus: B, response_topic: Option<String>) -> Self {
        Self {
            lanes,
            bus,
            response_topic,
        }
    }

    /// Process one command payload end to end.
    pub async fn handle(&self, payload: &[u8]) -> Result<RegisterValue, CommandError> {
        let command = match parse_command(payload, Utc::now()) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejected command");
                return Err(e);
            }
        };

        let outcome = self.execute(&command).await;

        match &outcome {
            Ok(value) => info!(
                unit_id = command.unit_id,
                class = %command.class,
                address = command.address,
                %value,
                latency_ms = command
                    .sent_at
                    .map(|sent| (command.received_at - sent).num_milliseconds()),
                "Command applied"
            ),
            Err(e) => warn!(
                unit_id = command.unit_id,
                class = %command.class,
                address = command.address,
                error = %e,
                "Command failed"
            ),
        }

        self.acknowledge(&command, &outcome).await;
        outcome
    }

    async fn execute(&self, command: &WriteCommand) -> Result<RegisterValue, CommandError> {
        let lane = route(&self.lanes, command)?;
        match lane.write(command.clone()).await {
            Some(result) => Ok(result?),
            None => Err(CommandError::LaneUnavailable(lane.endpoint().to_string())),
        }
    }

    async fn acknowledge(&self, command: &WriteCommand, outcome: &Result<RegisterValue, CommandError>) {
        let Some(topic) = &self.response_topic else {
            return;
        };

        let ack = CommandAck::new(command, outcome);
        let payload = match serde_json::to_string(&ack) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode command acknowledgement");
                return;
            }
        };

        if let Err(e) = self.bus.publish(topic, payload).await {
            warn!(topic = %topic, error = %e, "Failed to publish command acknowledgement");
        }
    }
}

impl<B: BusPublisher> CommandIntake<B> {
    /// Subscribe to `topic` and process commands until `shutdown` turns true.
    ///
    /// Commands are handled one at a time in arrival order, so two writes to
    /// the same register reach the device in the order they were published.
    pub async fn run(
        self: Arc<Self>,
        session: Arc<zenoh::Session>,
        topic: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> crate::error::Result<()> {
        let subscriber = session.declare_subscriber(&topic).await?;
        info!(topic = %topic, "Listening for commands");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                sample = subscriber.recv_async() => {
                    let sample = match sample {
                        Ok(sample) => sample,
                        Err(e) => {
                            warn!("Command subscriber closed: {}", e);
                            break;
                        }
                    };
                    if sample.kind() == SampleKind::Delete {
                        continue;
                    }

                    let payload = sample.payload().to_bytes().into_owned();
                    debug!(key = %sample.key_expr(), bytes = payload.len(), "Command received");

                    let _ = self.handle(&payload).await;
                }
            }
        }

        subscriber.undeclare().await?;
        info!("Command intake stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(json: &str) -> Result<WriteCommand, CommandError> {
        parse_command(json.as_bytes(), Utc::now())
    }

    #[test]
    fn test_parse_holding_register_command() {
        let command = parse(
            r#"{"slave_id": 1, "register_type": "holding_register", "address": 5, "value": 100,
                "timestamp_api_sent": "2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(command.unit_id, 1);
        assert_eq!(command.class, RegisterClass::HoldingRegister);
        assert_eq!(command.address, 5);
        assert_eq!(command.value, RegisterValue::Word(100));
        assert_eq!(
            command.sent_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
        assert!(command.device.is_none());
    }

    #[test]
    fn test_parse_naive_timestamp_and_device() {
        let command = parse(
            r#"{"slave_id": 2, "register_type": "coil", "address": 0, "value": true,
                "timestamp_api_sent": "2024-05-01T12:00:00.250", "device": "Pump"}"#,
        )
        .unwrap();

        assert_eq!(command.value, RegisterValue::Bit(true));
        assert_eq!(command.device.as_deref(), Some("Pump"));
        assert!(command.sent_at.is_some());
    }

    #[test]
    fn test_coil_requires_boolean() {
        let err = parse(r#"{"slave_id": 1, "register_type": "coil", "address": 0, "value": 1}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::ValueMismatch {
                class: RegisterClass::Coil,
                ..
            }
        ));
    }

    #[test]
    fn test_register_rejects_non_integers() {
        for value in ["true", "1.5", "-1", "65536", "\"7\""] {
            let json = format!(
                r#"{{"slave_id": 1, "register_type": "holding_register", "address": 0, "value": {}}}"#,
                value
            );
            assert!(
                matches!(parse(&json), Err(CommandError::ValueMismatch { .. })),
                "value {} should be rejected",
                value
            );
        }
    }

    #[test]
    fn test_rejects_missing_unit() {
        let err = parse(r#"{"register_type": "coil", "address": 0, "value": true}"#).unwrap_err();
        assert_eq!(err, CommandError::MissingField("slave_id"));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_rejects_read_only_class() {
        let err = parse(r#"{"slave_id": 1, "register_type": "input_register", "address": 0, "value": 1}"#)
            .unwrap_err();
        assert_eq!(err, CommandError::ReadOnlyClass(RegisterClass::InputRegister));

        let err = parse(r#"{"slave_id": 1, "register_type": "flag", "address": 0, "value": 1}"#)
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownClass(_)));
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        assert!(matches!(parse("not json"), Err(CommandError::Malformed(_))));
        assert!(matches!(parse("[1, 2]"), Err(CommandError::Malformed(_))));
        assert!(matches!(
            parse(r#"{"slave_id": 0, "register_type": "coil", "address": 0, "value": true}"#),
            Err(CommandError::InvalidField { field: "slave_id", .. })
        ));
        assert!(matches!(
            parse(r#"{"slave_id": 1, "register_type": "coil", "address": 70000, "value": true}"#),
            Err(CommandError::InvalidField { field: "address", .. })
        ));
    }

    #[test]
    fn test_ack_serialization() {
        let command = parse(r#"{"slave_id": 1, "register_type": "coil", "address": 3, "value": false}"#)
            .unwrap();

        let ack = CommandAck::new(&command, &Ok(RegisterValue::Bit(false)));
        let json: Value = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["register_type"], "coil");
        assert_eq!(json["value"], false);
        assert!(json.get("error").is_none());

        let ack = CommandAck::new(&command, &Err(CommandError::Link(LinkError::Timeout)));
        let json: Value = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "write failed: request timed out");
    }
}
