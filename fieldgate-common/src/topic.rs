//! Key expressions for gateway data, status and wildcard subscriptions.

use crate::error::{Error, Result};

/// Default topic prefix for gateway data.
pub const DEFAULT_PREFIX: &str = "modbus/gateway";

/// Builder for gateway topics.
///
/// Data topics follow the pattern:
/// `<prefix>/<device_name>/<unit_id>/<register_type>/<address>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    /// Create a builder with the given prefix. A trailing `/` is ignored.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the data topic for one register.
    ///
    /// # Example
    /// ```
    /// use fieldgate_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("modbus/gateway");
    /// assert_eq!(
    ///     topics.data_topic("Tank1", 1, "holding_registers", 10),
    ///     "modbus/gateway/Tank1/1/holding_registers/10"
    /// );
    /// ```
    pub fn data_topic(
        &self,
        device_name: &str,
        unit_id: u8,
        register_type: &str,
        address: u16,
    ) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.prefix, device_name, unit_id, register_type, address
        )
    }

    /// Wildcard matching every data topic under the prefix.
    ///
    /// # Example
    /// ```
    /// use fieldgate_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::new("modbus/gateway").wildcard(), "modbus/gateway/**");
    /// ```
    pub fn wildcard(&self) -> String {
        format!("{}/**", self.prefix)
    }

    /// Key for bridge status messages.
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Parsed components of a data topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTopic<'a> {
    pub device_name: &'a str,
    pub unit_id: u8,
    pub register_type: &'a str,
    pub address: u16,
}

/// Parse a data topic.
///
/// Only the last four segments are interpreted, so any prefix depth is
/// accepted as long as it is non-empty.
pub fn parse_data_topic(topic: &str) -> Result<DataTopic<'_>> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() < 5 {
        return Err(Error::Topic(format!("too few segments in '{}'", topic)));
    }

    let tail = &parts[parts.len() - 4..];
    if tail.iter().any(|segment| segment.is_empty()) {
        return Err(Error::Topic(format!("empty segment in '{}'", topic)));
    }

    let unit_id = tail[1]
        .parse::<u8>()
        .map_err(|_| Error::Topic(format!("invalid unit id '{}' in '{}'", tail[1], topic)))?;
    let address = tail[3]
        .parse::<u16>()
        .map_err(|_| Error::Topic(format!("invalid address '{}' in '{}'", tail[3], topic)))?;

    Ok(DataTopic {
        device_name: tail[0],
        unit_id,
        register_type: tail[2],
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builder() {
        let topics = TopicBuilder::new("modbus/gateway/");

        assert_eq!(topics.prefix(), "modbus/gateway");
        assert_eq!(
            topics.data_topic("pump", 3, "coils", 0),
            "modbus/gateway/pump/3/coils/0"
        );
        assert_eq!(topics.status_key(), "modbus/gateway/@/status");
    }

    #[test]
    fn test_parse_data_topic() {
        let parsed = parse_data_topic("site/a/modbus/Tank1/1/holding_registers/11").unwrap();

        assert_eq!(parsed.device_name, "Tank1");
        assert_eq!(parsed.unit_id, 1);
        assert_eq!(parsed.register_type, "holding_registers");
        assert_eq!(parsed.address, 11);
    }

    #[test]
    fn test_parse_invalid_topics() {
        assert!(parse_data_topic("Tank1/1/coils/0").is_err());
        assert!(parse_data_topic("modbus/Tank1/x/coils/0").is_err());
        assert!(parse_data_topic("modbus/Tank1/1/coils/70000").is_err());
        assert!(parse_data_topic("modbus//1/coils/0").is_err());
    }
}
