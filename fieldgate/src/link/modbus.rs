//! Modbus TCP transport backed by `tokio-modbus`.

use tokio_modbus::client::{Client, Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::debug;

use super::{Connector, Endpoint, FieldTransport, LinkError};
use crate::register::{RegisterClass, RegisterValue};

/// Opens Modbus TCP sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusTcpConnector;

impl Connector for ModbusTcpConnector {
    type Transport = ModbusTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<ModbusTransport, LinkError> {
        let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| LinkError::Transport(format!("cannot resolve {}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| LinkError::Transport(format!("no address for {}", endpoint)))?;

        debug!(%endpoint, %addr, "Opening Modbus TCP connection");

        let ctx = tcp::connect(addr)
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;

        Ok(ModbusTransport { ctx })
    }
}

/// One open Modbus TCP session. The unit id is set per request.
#[derive(Debug)]
pub struct ModbusTransport {
    ctx: Context,
}

impl FieldTransport for ModbusTransport {
    async fn read(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<RegisterValue>, LinkError> {
        self.ctx.set_slave(Slave(unit_id));

        let values = match class {
            RegisterClass::Coil => bits(settle(self.ctx.read_coils(address, count).await)?),
            RegisterClass::DiscreteInput => {
                bits(settle(self.ctx.read_discrete_inputs(address, count).await)?)
            }
            RegisterClass::HoldingRegister => {
                words(settle(self.ctx.read_holding_registers(address, count).await)?)
            }
            RegisterClass::InputRegister => {
                words(settle(self.ctx.read_input_registers(address, count).await)?)
            }
        };

        Ok(values)
    }

    async fn write(
        &mut self,
        class: RegisterClass,
        unit_id: u8,
        address: u16,
        value: RegisterValue,
    ) -> Result<(), LinkError> {
        self.ctx.set_slave(Slave(unit_id));

        match (class, value) {
            (RegisterClass::Coil, RegisterValue::Bit(on)) => {
                settle(self.ctx.write_single_coil(address, on).await)
            }
            (RegisterClass::HoldingRegister, RegisterValue::Word(word)) => {
                settle(self.ctx.write_single_register(address, word).await)
            }
            _ => Err(LinkError::InvalidValue(format!(
                "cannot write {} to {}",
                value, class
            ))),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            debug!(error = %e, "Error while closing Modbus session");
        }
    }
}

/// Flatten the transport and exception layers of a `tokio-modbus` result.
fn settle<T>(result: tokio_modbus::Result<T>) -> Result<T, LinkError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(LinkError::DeviceRejected(u8::from(exception))),
        Err(tokio_modbus::Error::Protocol(e)) => Err(LinkError::Protocol(e.to_string())),
        Err(e) => Err(LinkError::Transport(e.to_string())),
    }
}

fn bits(values: Vec<bool>) -> Vec<RegisterValue> {
    values.into_iter().map(RegisterValue::Bit).collect()
}

fn words(values: Vec<u16>) -> Vec<RegisterValue> {
    values.into_iter().map(RegisterValue::Word).collect()
}
