//! VISA transport for GPIB, USB-TMC and LAN instruments.
//!
//! Wraps the `visa-rs` bindings. VISA calls block, so every operation runs on
//! tokio's blocking pool with the session moved into the task and handed back
//! afterwards.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::{Transport, TransportOptions};
use crate::error::AppResult;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use super::{strip_response, transport_error};
#[cfg(feature = "instrument_visa")]
use async_trait::async_trait;
#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::{attribute::AttrTmoValue, prelude::*};

/// I/O timeout in whole milliseconds, saturating at the VISA attribute range.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(feature = "instrument_visa")]
fn apply_timeout(session: &visa_rs::Instrument, timeout: Duration) -> Result<(), String> {
    let millis = timeout_millis(timeout);
    let attr = AttrTmoValue::new_checked(millis)
        .ok_or_else(|| format!("VISA timeout of {millis} ms is out of range"))?;
    session
        .set_attr(attr)
        .map_err(|e| format!("failed to set VISA timeout: {e}"))
}

#[cfg(feature = "instrument_visa")]
pub struct VisaTransport {
    resource: String,
    session: Option<visa_rs::Instrument>,
    timeout: Duration,
    write_termination: String,
    read_termination: String,
}

#[cfg(feature = "instrument_visa")]
impl VisaTransport {
    fn take_session(&mut self) -> AppResult<visa_rs::Instrument> {
        self.session
            .take()
            .ok_or_else(|| transport_error(&self.resource, "VISA session is closed"))
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Transport for VisaTransport {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        let mut session = self.take_session()?;
        let payload = format!("{}{}", command, self.write_termination);
        let timeout = self.timeout;

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = apply_timeout(&session, timeout)
                .and_then(|()| session.write_all(payload.as_bytes()).map_err(|e| e.to_string()));
            (session, result)
        })
        .await
        .map_err(|e| transport_error(&self.resource, format!("VISA write task failed: {e}")))?;

        self.session = Some(session);
        result.map_err(|e| transport_error(&self.resource, format!("VISA write failed: {e}")))
    }

    async fn read(&mut self) -> AppResult<String> {
        let mut session = self.take_session()?;
        let terminator = self.read_termination.clone().into_bytes();
        let timeout = self.timeout;

        let (session, result) = tokio::task::spawn_blocking(move || {
            if let Err(e) = apply_timeout(&session, timeout) {
                return (session, Err(e));
            }
            let mut response = Vec::new();
            let mut buffer = [0u8; 1024];
            let result = loop {
                match session.read(&mut buffer) {
                    Ok(0) => break Ok(response),
                    Ok(n) => {
                        response.extend_from_slice(&buffer[..n]);
                        if n < buffer.len()
                            || (!terminator.is_empty() && response.ends_with(&terminator))
                        {
                            break Ok(response);
                        }
                    }
                    Err(e) => break Err(e.to_string()),
                }
            };
            (session, result)
        })
        .await
        .map_err(|e| transport_error(&self.resource, format!("VISA read task failed: {e}")))?;

        self.session = Some(session);
        let raw =
            result.map_err(|e| transport_error(&self.resource, format!("VISA read failed: {e}")))?;
        Ok(strip_response(&String::from_utf8_lossy(&raw)))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Takes effect on the session at the next write or read.
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.session.take().is_some() {
            debug!(resource = %self.resource, "VISA session closed");
        }
        Ok(())
    }
}

#[cfg(feature = "instrument_visa")]
pub async fn open(address: &str, options: &TransportOptions) -> AppResult<Box<dyn Transport>> {
    let resource = address.to_string();
    let session = tokio::task::spawn_blocking({
        let resource = resource.clone();
        let timeout = options.timeout;
        move || -> Result<visa_rs::Instrument, String> {
            let rm = DefaultRM::new().map_err(|e| format!("failed to create VISA resource manager: {e}"))?;
            let c_string = CString::new(resource.as_str()).map_err(|e| e.to_string())?;
            let visa_string = visa_rs::VisaString::from(c_string);
            let session = rm
                .open(&visa_string.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| format!("failed to open VISA resource: {e}"))?;
            apply_timeout(&session, timeout)?;
            Ok(session)
        }
    })
    .await
    .map_err(|e| transport_error(&resource, format!("VISA open task failed: {e}")))?
    .map_err(|message| transport_error(&resource, message))?;

    debug!(
        resource = %resource,
        timeout_ms = options.timeout.as_millis() as u64,
        "VISA resource opened"
    );

    Ok(Box::new(VisaTransport {
        resource,
        session: Some(session),
        timeout: options.timeout,
        write_termination: options.write_termination.clone(),
        read_termination: options.read_termination.clone(),
    }))
}

#[cfg(not(feature = "instrument_visa"))]
pub async fn open(_address: &str, _options: &TransportOptions) -> AppResult<Box<dyn Transport>> {
    Err(crate::error::BenchError::FeatureNotEnabled(
        "instrument_visa".to_string(),
    ))
}

/// Every `INSTR` resource the VISA library can see.
#[cfg(feature = "instrument_visa")]
pub async fn list_resources() -> Vec<String> {
    let found = tokio::task::spawn_blocking(|| -> Result<Vec<String>, String> {
        let rm = DefaultRM::new().map_err(|e| e.to_string())?;
        let expr = CString::new("?*INSTR").map_err(|e| e.to_string())?;
        let mut list = rm
            .find_res_list(&visa_rs::VisaString::from(expr).into())
            .map_err(|e| e.to_string())?;
        let mut resources = Vec::new();
        while let Some(next) = list.find_next().map_err(|e| e.to_string())? {
            resources.push(next.to_string());
        }
        Ok(resources)
    })
    .await;

    match found {
        Ok(Ok(resources)) => resources,
        Ok(Err(e)) => {
            debug!("Could not enumerate VISA resources: {}", e);
            Vec::new()
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(not(feature = "instrument_visa"))]
pub async fn list_resources() -> Vec<String> {
    Vec::new()
}
