//! Bus transports.
//!
//! The framework does not speak any wire protocol itself. A [`ResourceManager`]
//! opens a [`Transport`] for a bus address (a VISA resource string such as
//! `"TCPIP0::192.168.1.100::INSTR"` or a serial address such as
//! `"ASRL/dev/ttyUSB0::INSTR"`), and the transport moves command strings to the
//! instrument and response strings back.
//!
//! Available implementations:
//!
//! - [`BusResourceManager`]: dispatches serial addresses to [`serial`] (feature
//!   `instrument_serial`) and everything else to [`visa`] (feature
//!   `instrument_visa`).
//! - [`simulated::SimulatedBus`]: in-process SCPI instruments for tests and
//!   dry runs.

pub mod serial;
pub mod simulated;
pub mod visa;

use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-device transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Read timeout for one response.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Baud rate, only used by serial links.
    #[serde(default)]
    pub baud_rate: Option<u32>,

    /// Appended to every command.
    #[serde(default = "default_termination")]
    pub write_termination: String,

    /// Marks the end of a response.
    #[serde(default = "default_termination")]
    pub read_termination: String,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_termination() -> String {
    "\n".to_string()
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            baud_rate: None,
            write_termination: default_termination(),
            read_termination: default_termination(),
        }
    }
}

/// An open link to one instrument.
///
/// Implementations are not required to be internally synchronised;
/// [`crate::connection::Connection`] serialises access.
#[async_trait]
pub trait Transport: Send {
    /// Send one command. The write termination is appended by the transport.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Read one complete response, without its termination.
    async fn read(&mut self) -> AppResult<String>;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Change the read timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Release the link.
    async fn close(&mut self) -> AppResult<()>;
}

/// Opens transports and enumerates reachable addresses.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Open a transport for `address`.
    async fn open(&self, address: &str, options: &TransportOptions)
        -> AppResult<Box<dyn Transport>>;

    /// Addresses currently reachable, used in connection error messages.
    async fn list_resources(&self) -> Vec<String>;
}

/// Resource manager for real hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusResourceManager;

impl BusResourceManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ResourceManager for BusResourceManager {
    async fn open(
        &self,
        address: &str,
        options: &TransportOptions,
    ) -> AppResult<Box<dyn Transport>> {
        if serial::is_serial_address(address) {
            serial::open(address, options).await
        } else {
            visa::open(address, options).await
        }
    }

    async fn list_resources(&self) -> Vec<String> {
        let mut resources = visa::list_resources().await;
        resources.extend(serial::list_resources().await);
        resources
    }
}

/// Strip the termination and any padding around a response.
pub(crate) fn strip_response(raw: &str) -> String {
    raw.trim().to_string()
}

pub(crate) fn transport_error(resource: &str, message: impl Into<String>) -> BenchError {
    BenchError::Transport {
        resource: resource.to_string(),
        message: message.into(),
    }
}
