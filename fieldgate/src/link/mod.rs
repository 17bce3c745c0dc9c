//! Connection to one field device.
//!
//! A [`FieldLink`] owns the socket to a single `host:port` and moves through
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Faulted(backoff) -> Connecting ...
//! ```
//!
//! with `Shutdown` reachable from every state. Reconnects are attempted
//! lazily by the next read or write, at most once per call and never while
//! the backoff window is still open.

mod modbus;

pub use modbus::{ModbusTcpConnector, ModbusTransport};

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::register::{RegisterClass, RegisterValue};

/// Network identity of a field device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors returned by field link operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device rejected request with exception code {0:#04x}")]
    DeviceRejected(u8),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Socket-level failure reported by a transport. The link converts this
    /// into a fault and reports [`LinkError::NotConnected`] to its caller.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl LinkError {
    /// Errors that mean the device could not be reached at all.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            LinkError::NotConnected | LinkError::Timeout | LinkError::Transport(_)
        )
    }
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Faulted { retry_in: Duration },
    Shutdown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Connected => f.write_str("connected"),
            LinkState::Faulted { retry_in } => write!(f, "faulted (retry in {:?})", retry_in),
            LinkState::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// A live session with a device, as produced by a [`Connector`].
pub trait FieldTransport: Send {
    /// Read `count` values of `class` starting at `address`.
    fn read(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<RegisterValue>, LinkError>> + Send;

    /// Write a single value.
    fn write(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        value: RegisterValue,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Close the session. Errors are not reported; the session is gone either way.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Transport: FieldTransport + 'static;

    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Self::Transport, LinkError>> + Send;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Timing parameters for a [`FieldLink`].
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    /// Upper bound for connecting and for every request.
    pub request_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Connection and state machine for one field device.
pub struct FieldLink<C: Connector> {
    endpoint: Endpoint,
    connector: C,
    timeout: Duration,
    backoff: Backoff,
    transport: Option<C::Transport>,
    retry_at: Option<Instant>,
    state: watch::Sender<LinkState>,
}

impl<C: Connector> FieldLink<C> {
    pub fn new(endpoint: Endpoint, connector: C, settings: LinkSettings) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            endpoint,
            connector,
            timeout: settings.request_timeout,
            backoff: Backoff::new(settings.backoff_initial, settings.backoff_max),
            transport: None,
            retry_at: None,
            state,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Read `count` consecutive values of `class`.
    pub async fn read(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<RegisterValue>, LinkError> {
        if count == 0 || count > class.max_read_count() {
            return Err(LinkError::InvalidRequest(format!(
                "count {} outside 1..={} for {}",
                count,
                class.max_read_count(),
                class
            )));
        }
        if u32::from(address) + u32::from(count) > 0x1_0000 {
            return Err(LinkError::InvalidRequest(format!(
                "range {}+{} exceeds the address space",
                address, count
            )));
        }

        self.ensure_connected().await?;

        let timeout = self.timeout;
        let outcome = match self.transport.as_mut() {
            Some(transport) => {
                tokio::time::timeout(timeout, transport.read(class, unit_id, address, count)).await
            }
            None => return Err(LinkError::NotConnected),
        };

        let mut values = self.settle(outcome, "read")?;
        if values.len() < usize::from(count) {
            return Err(LinkError::Protocol(format!(
                "expected {} values, device returned {}",
                count,
                values.len()
            )));
        }
        values.truncate(usize::from(count));
        if let Some(foreign) = values.iter().find(|v| !v.fits(class)) {
            return Err(LinkError::Protocol(format!(
                "value {} does not belong to {}",
                foreign, class
            )));
        }

        Ok(values)
    }

    /// Write one value and return it once the device acknowledged.
    ///
    /// The class and value domain are checked before anything is sent.
    pub async fn write(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        value: RegisterValue,
    ) -> Result<RegisterValue, LinkError> {
        if !class.is_writable() {
            return Err(LinkError::InvalidValue(format!("{} are read-only", class)));
        }
        if !value.fits(class) {
            return Err(LinkError::InvalidValue(format!(
                "{} does not fit {}",
                value, class
            )));
        }

        self.ensure_connected().await?;

        let timeout = self.timeout;
        let outcome = match self.transport.as_mut() {
            Some(transport) => {
                tokio::time::timeout(timeout, transport.write(class, unit_id, address, value))
                    .await
            }
            None => return Err(LinkError::NotConnected),
        };

        self.settle(outcome, "write")?;
        Ok(value)
    }

    /// Close the socket for good. Later calls fail with `NotConnected`.
    pub async fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.retry_at = None;
        self.transition(LinkState::Shutdown, "shutdown requested");
    }

    async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        if self.transport.is_some() {
            return Ok(());
        }
        if matches!(*self.state.borrow(), LinkState::Shutdown) {
            return Err(LinkError::NotConnected);
        }
        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                debug!(endpoint = %self.endpoint, "Backoff window open, not reconnecting yet");
                return Err(LinkError::NotConnected);
            }
        }

        self.transition(LinkState::Connecting, "connect attempt");

        match tokio::time::timeout(self.timeout, self.connector.connect(&self.endpoint)).await {
            Ok(Ok(transport)) => {
                self.transport = Some(transport);
                self.retry_at = None;
                self.backoff.reset();
                self.transition(LinkState::Connected, "connection established");
                Ok(())
            }
            Ok(Err(e)) => {
                self.fault(&e.to_string());
                Err(LinkError::NotConnected)
            }
            Err(_) => {
                self.fault("connect timed out");
                Err(LinkError::NotConnected)
            }
        }
    }

    fn settle<T>(
        &mut self,
        outcome: Result<Result<T, LinkError>, tokio::time::error::Elapsed>,
        op: &str,
    ) -> Result<T, LinkError> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(LinkError::Transport(cause))) => {
                self.fault(&format!("{} failed: {}", op, cause));
                Err(LinkError::NotConnected)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.fault(&format!("{} timed out", op));
                Err(LinkError::Timeout)
            }
        }
    }

    fn fault(&mut self, cause: &str) {
        // Dropping the transport closes the socket.
        self.transport = None;
        let retry_in = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + retry_in);
        self.transition(LinkState::Faulted { retry_in }, cause);
    }

    fn transition(&self, next: LinkState, cause: &str) {
        let faulted = matches!(next, LinkState::Faulted { .. });
        let previous = self.state.send_replace(next);
        let current = self.state.borrow().clone();

        if faulted {
            warn!(
                endpoint = %self.endpoint,
                from = %previous,
                to = %current,
                cause,
                "Field link transition"
            );
        } else {
            info!(
                endpoint = %self.endpoint,
                from = %previous,
                to = %current,
                cause,
                "Field link transition"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockFailure};

    fn settings() -> LinkSettings {
        LinkSettings {
            request_timeout: Duration::from_millis(500),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    fn link(connector: MockConnector) -> FieldLink<MockConnector> {
        FieldLink::new(Endpoint::new("10.0.0.5", 502), connector, settings())
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_connection_level_errors() {
        assert!(LinkError::NotConnected.is_connection_level());
        assert!(LinkError::Timeout.is_connection_level());
        assert!(!LinkError::DeviceRejected(2).is_connection_level());
        assert!(!LinkError::Protocol("bad frame".into()).is_connection_level());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_lazily_and_reads() {
        let connector = MockConnector::new();
        connector.set_words(1, 10, &[7, 8]);
        let mut link = link(connector.clone());

        assert_eq!(link.state(), LinkState::Disconnected);
        let values = link
            .read(RegisterClass::HoldingRegister, 1, 10, 2)
            .await
            .unwrap();

        assert_eq!(values, vec![RegisterValue::Word(7), RegisterValue::Word(8)]);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_inside_backoff_window() {
        let connector = MockConnector::new();
        connector.refuse_connects(1);
        let mut link = link(connector.clone());

        let err = link.read(RegisterClass::Coil, 1, 0, 1).await.unwrap_err();
        assert_eq!(err, LinkError::NotConnected);
        assert_eq!(
            link.state(),
            LinkState::Faulted {
                retry_in: Duration::from_secs(1)
            }
        );

        // Still inside the window: no new attempt.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(link.read(RegisterClass::Coil, 1, 0, 1).await.is_err());
        assert_eq!(connector.connect_attempts(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(link.read(RegisterClass::Coil, 1, 0, 1).await.is_ok());
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_faults_link() {
        let connector = MockConnector::new();
        connector.fail_next_read(MockFailure::Hang);
        let mut link = link(connector.clone());

        let err = link
            .read(RegisterClass::InputRegister, 1, 0, 1)
            .await
            .unwrap_err();

        assert_eq!(err, LinkError::Timeout);
        assert!(matches!(link.state(), LinkState::Faulted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_keeps_connection() {
        let connector = MockConnector::new();
        connector.fail_next_read(MockFailure::Exception(0x02));
        let mut link = link(connector.clone());

        let err = link
            .read(RegisterClass::HoldingRegister, 1, 900, 1)
            .await
            .unwrap_err();

        assert_eq!(err, LinkError::DeviceRejected(0x02));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_validation_happens_before_transmission() {
        let connector = MockConnector::new();
        let mut link = link(connector.clone());

        let err = link
            .write(RegisterClass::Coil, 1, 0, RegisterValue::Word(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidValue(_)));

        let err = link
            .write(RegisterClass::InputRegister, 1, 0, RegisterValue::Word(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidValue(_)));

        assert_eq!(connector.connect_attempts(), 0);
        assert!(connector.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_rejects_oversized_request() {
        let mut link = link(MockConnector::new());

        let err = link
            .read(RegisterClass::HoldingRegister, 1, 0, 126)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidRequest(_)));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let connector = MockConnector::new();
        let mut link = link(connector.clone());
        let mut states = link.watch_state();

        link.read(RegisterClass::Coil, 1, 0, 1).await.unwrap();
        link.shutdown().await;

        assert_eq!(*states.borrow_and_update(), LinkState::Shutdown);
        assert_eq!(
            link.read(RegisterClass::Coil, 1, 0, 1).await.unwrap_err(),
            LinkError::NotConnected
        );
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(connector.closed_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_exception_keeps_connection() {
        let connector = MockConnector::new();
        connector.fail_next_write(MockFailure::Exception(0x03));
        let mut link = link(connector.clone());

        let err = link
            .write(RegisterClass::HoldingRegister, 1, 5, RegisterValue::Word(100))
            .await
            .unwrap_err();

        assert_eq!(err, LinkError::DeviceRejected(0x03));
        assert_eq!(link.state(), LinkState::Connected);
        assert!(connector.writes().is_empty());

        let applied = link
            .write(RegisterClass::HoldingRegister, 1, 5, RegisterValue::Word(100))
            .await
            .unwrap();
        assert_eq!(applied, RegisterValue::Word(100));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_faults_link() {
        let connector = MockConnector::new();
        connector.fail_next_write(MockFailure::Hang);
        let mut link = link(connector.clone());

        let err = link
            .write(RegisterClass::Coil, 1, 0, RegisterValue::Bit(true))
            .await
            .unwrap_err();

        assert_eq!(err, LinkError::Timeout);
        assert!(matches!(link.state(), LinkState::Faulted { .. }));
        assert!(connector.writes().is_empty());
    }
}
