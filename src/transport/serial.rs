//! Serial (RS-232 / USB-CDC) transport.
//!
//! Addresses use the VISA form `ASRL<port>::INSTR`, e.g.
//! `ASRL/dev/ttyUSB0::INSTR` or `ASRL3::INSTR` (COM3). The blocking
//! `serialport` calls run on tokio's blocking pool.

use super::{Transport, TransportOptions};
use crate::error::AppResult;

#[cfg(feature = "instrument_serial")]
use super::{strip_response, transport_error};
#[cfg(feature = "instrument_serial")]
use async_trait::async_trait;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::time::Duration;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

#[cfg(feature = "instrument_serial")]
const DEFAULT_BAUD_RATE: u32 = 9600;

/// Poll granularity of a blocking read.
#[cfg(feature = "instrument_serial")]
const READ_SLICE: Duration = Duration::from_millis(50);

/// Whether `address` names a serial resource.
pub fn is_serial_address(address: &str) -> bool {
    address.to_ascii_uppercase().starts_with("ASRL")
}

/// Operating-system port name for a serial address.
pub fn port_name(address: &str) -> String {
    let body = address.get(4..).unwrap_or_default();
    let body = body
        .strip_suffix("::INSTR")
        .or_else(|| body.strip_suffix("::instr"))
        .unwrap_or(body);
    if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()) {
        format!("COM{body}")
    } else {
        body.to_string()
    }
}

#[cfg(feature = "instrument_serial")]
pub struct SerialTransport {
    resource: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
    write_termination: String,
    read_termination: String,
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    fn take_port(&mut self) -> AppResult<Box<dyn SerialPort>> {
        self.port
            .take()
            .ok_or_else(|| transport_error(&self.resource, "serial port is closed"))
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        let mut port = self.take_port()?;
        let payload = format!("{}{}", command, self.write_termination);

        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = port
                .write_all(payload.as_bytes())
                .and_then(|()| port.flush());
            (port, result)
        })
        .await
        .map_err(|e| transport_error(&self.resource, format!("serial write task failed: {e}")))?;

        self.port = Some(port);
        result.map_err(|e| transport_error(&self.resource, format!("write failed: {e}")))
    }

    async fn read(&mut self) -> AppResult<String> {
        let mut port = self.take_port()?;
        let terminator = self.read_termination.clone().into_bytes();
        let deadline = std::time::Instant::now() + self.timeout;

        let (port, result) = tokio::task::spawn_blocking(move || {
            let mut response = Vec::new();
            let mut buffer = [0u8; 256];
            let result = loop {
                if !terminator.is_empty() && response.ends_with(&terminator) {
                    break Ok(response);
                }
                if std::time::Instant::now() >= deadline {
                    break Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no complete response before timeout",
                    ));
                }
                match port.read(&mut buffer) {
                    Ok(0) => {}
                    Ok(n) => response.extend_from_slice(&buffer[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => break Err(e),
                }
            };
            (port, result)
        })
        .await
        .map_err(|e| transport_error(&self.resource, format!("serial read task failed: {e}")))?;

        self.port = Some(port);
        let raw = result.map_err(|e| transport_error(&self.resource, format!("read failed: {e}")))?;
        Ok(strip_response(&String::from_utf8_lossy(&raw)))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(resource = %self.resource, "Serial port closed");
        }
        Ok(())
    }
}

#[cfg(feature = "instrument_serial")]
pub async fn open(address: &str, options: &TransportOptions) -> AppResult<Box<dyn Transport>> {
    let name = port_name(address);
    let baud_rate = options.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let resource = address.to_string();

    let port = tokio::task::spawn_blocking({
        let name = name.clone();
        move || {
            serialport::new(&name, baud_rate)
                .timeout(READ_SLICE)
                .open()
        }
    })
    .await
    .map_err(|e| transport_error(&resource, format!("serial open task failed: {e}")))?
    .map_err(|e| {
        transport_error(
            &resource,
            format!("failed to open serial port '{name}' at {baud_rate} baud: {e}"),
        )
    })?;

    debug!(resource = %resource, port = %name, baud_rate, "Serial port opened");

    Ok(Box::new(SerialTransport {
        resource,
        port: Some(port),
        timeout: options.timeout,
        write_termination: options.write_termination.clone(),
        read_termination: options.read_termination.clone(),
    }))
}

#[cfg(not(feature = "instrument_serial"))]
pub async fn open(_address: &str, _options: &TransportOptions) -> AppResult<Box<dyn Transport>> {
    Err(crate::error::BenchError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

/// Serial ports present on this machine, as `ASRL...::INSTR` addresses.
#[cfg(feature = "instrument_serial")]
pub async fn list_resources() -> Vec<String> {
    match tokio::task::spawn_blocking(serialport::available_ports).await {
        Ok(Ok(ports)) => ports
            .into_iter()
            .map(|p| format!("ASRL{}::INSTR", p.port_name))
            .collect(),
        Ok(Err(e)) => {
            debug!("Could not enumerate serial ports: {}", e);
            Vec::new()
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(not(feature = "instrument_serial"))]
pub async fn list_resources() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_serial_addresses() {
        assert!(is_serial_address("ASRL/dev/ttyUSB0::INSTR"));
        assert!(is_serial_address("asrl3::INSTR"));
        assert!(!is_serial_address("TCPIP0::192.168.1.5::INSTR"));
    }

    #[test]
    fn maps_addresses_to_port_names() {
        assert_eq!(port_name("ASRL/dev/ttyUSB0::INSTR"), "/dev/ttyUSB0");
        assert_eq!(port_name("ASRL3::INSTR"), "COM3");
        assert_eq!(port_name("ASRL/dev/ttyACM1"), "/dev/ttyACM1");
    }
}
