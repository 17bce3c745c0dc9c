//! InfluxDB v2 writer.
//!
//! Batches are encoded as line protocol, one point per sample:
//!
//! ```text
//! modbus_data,address=10,device_name=Tank1,register_type=holding_registers,slave_id=1 value=42i 1700000000000000000
//! ```
//!
//! and sent in a single `POST /api/v2/write` with nanosecond precision.

use std::fmt::Write as _;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

use crate::config::InfluxConfig;
use crate::fanout::{SinkError, TimeSeriesSink};
use crate::register::RegisterValue;
use crate::sample::SampleBatch;

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Integer(i64),
    Boolean(bool),
}

impl FieldValue {
    /// Line protocol rendering: integers carry an `i` suffix.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::Boolean(v) => v.to_string(),
        }
    }
}

impl From<RegisterValue> for FieldValue {
    fn from(value: RegisterValue) -> Self {
        match value {
            RegisterValue::Bit(b) => FieldValue::Boolean(b),
            RegisterValue::Word(w) => FieldValue::Integer(i64::from(w)),
        }
    }
}

/// Render one batch as line protocol.
pub fn encode_batch(measurement: &str, batch: &SampleBatch) -> String {
    let timestamp = batch.timestamp_nanos();
    let measurement = escape_measurement(measurement);
    let device = escape_tag(&batch.device_name);
    let mut body = String::new();

    // Tags are written in key order.
    for sample in &batch.samples {
        if !body.is_empty() {
            body.push('\n');
        }
        let _ = write!(
            body,
            "{},address={},device_name={},register_type={},slave_id={} value={} {}",
            measurement,
            sample.address,
            device,
            sample.class.as_str(),
            batch.unit_id,
            FieldValue::from(sample.value).to_line_protocol(),
            timestamp
        );
    }

    body
}

/// Commas and spaces must be escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Commas, equals signs, and spaces must be escaped in tag values.
fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// HTTP client for the InfluxDB v2 write API.
#[derive(Debug, Clone)]
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: reqwest::Url,
    token: Option<String>,
    measurement: String,
}

impl InfluxWriter {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let base = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        let write_url = reqwest::Url::parse_with_params(
            &base,
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .map_err(|e| SinkError::Store(format!("invalid url '{}': {}", config.url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SinkError::Store(e.to_string()))?;

        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
            measurement: config.measurement.clone(),
        })
    }

    pub fn write_url(&self) -> &reqwest::Url {
        &self.write_url
    }
}

impl TimeSeriesSink for InfluxWriter {
    async fn write_batch(&self, batch: &SampleBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = encode_batch(&self.measurement, batch);
        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Store(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SinkError::Store(format!("HTTP {}: {}", status, detail.trim())));
        }

        debug!(
            device = %batch.device_name,
            points = batch.len(),
            "Wrote batch to InfluxDB"
        );
        Ok(())
    }
}
