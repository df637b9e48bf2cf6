//! Simulated SCPI instruments.
//!
//! A [`SimulatedBus`] is a [`ResourceManager`] whose addresses resolve to
//! in-process [`SimulatedInstrument`]s. The simulated device understands enough
//! SCPI to exercise the framework:
//!
//! - `*IDN?` answers the configured identity, `*OPC?` answers `1` (optionally
//!   after a number of busy `0` replies), `*RST` clears settings and `*CLS`
//!   clears the error queue.
//! - `SYST:ERR?` pops the error queue (`+0,"No error"` when empty). A persistent
//!   error is reported on every poll until cleared.
//! - `HEADER value` stores a setting which `HEADER?` reads back.
//! - Any query can be given a fixed reply with [`SimulatedInstrument::respond`].
//!
//! Every command written is recorded for test verification, as are session
//! opens and closes.
//!
//! # Example
//!
//! ```
//! use labbench::transport::simulated::{SimulatedBus, SimulatedInstrument};
//!
//! let psu = SimulatedInstrument::new("ACME,PSU-2,0001,1.0");
//! let bus = SimulatedBus::new();
//! bus.attach("TCPIP0::10.0.0.5::INSTR", psu.clone());
//! assert_eq!(psu.opens(), 0);
//! ```

use super::{transport_error, ResourceManager, Transport, TransportOptions};
use crate::error::AppResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const ERROR_QUERY: &str = "SYST:ERR?";
const NO_ERROR: &str = "+0,\"No error\"";

#[derive(Default)]
struct DeviceState {
    identity: String,
    settings: HashMap<String, String>,
    responses: HashMap<String, String>,
    error_queue: VecDeque<(i32, String)>,
    persistent_error: Option<(i32, String)>,
    pending: VecDeque<String>,
    writes: Vec<String>,
    opc_busy_polls: u32,
    latency: Duration,
    reachable: bool,
    fail_next_open: bool,
    opens: usize,
    closes: usize,
}

/// One simulated instrument. Clones share the same device state.
#[derive(Clone)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedInstrument {
    /// A reachable device answering `identity` to `*IDN?`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                identity: identity.into(),
                reachable: true,
                ..DeviceState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every response by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Change the identity string.
    pub fn set_identity(&self, identity: impl Into<String>) {
        self.lock().identity = identity.into();
    }

    /// Fixed reply for `query`, overriding the built-in behaviour.
    pub fn respond(&self, query: impl Into<String>, reply: impl Into<String>) {
        self.lock().responses.insert(query.into(), reply.into());
    }

    /// Remove a fixed reply.
    pub fn clear_response(&self, query: &str) {
        self.lock().responses.remove(query);
    }

    /// Current value of a setting written as `HEADER value`.
    pub fn setting(&self, header: &str) -> Option<String> {
        self.lock().settings.get(header).cloned()
    }

    /// Store a setting as if the front panel had changed it.
    pub fn set_setting(&self, header: impl Into<String>, value: impl Into<String>) {
        self.lock().settings.insert(header.into(), value.into());
    }

    /// Queue one error, reported once.
    pub fn push_error(&self, code: i32, message: impl Into<String>) {
        self.lock().error_queue.push_back((code, message.into()));
    }

    /// Report this error on every error-queue poll until cleared.
    pub fn set_persistent_error(&self, code: i32, message: impl Into<String>) {
        self.lock().persistent_error = Some((code, message.into()));
    }

    pub fn clear_persistent_error(&self) {
        self.lock().persistent_error = None;
    }

    /// Answer `0` to the next `polls` operation-complete queries.
    pub fn set_busy(&self, polls: u32) {
        self.lock().opc_busy_polls = polls;
    }

    /// Make the device disappear from (or reappear on) the bus.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Fail the next session open.
    pub fn inject_open_failure(&self) {
        self.lock().fail_next_open = true;
    }

    /// Every command written so far, queries included.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Number of error-queue queries received.
    pub fn error_polls(&self) -> usize {
        self.lock().writes.iter().filter(|w| *w == ERROR_QUERY).count()
    }

    /// Sessions opened so far.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Sessions closed so far.
    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Whether a session is currently open.
    pub fn is_open(&self) -> bool {
        let state = self.lock();
        state.opens > state.closes
    }

    fn handle_write(&self, command: &str) {
        let mut state = self.lock();
        let command = command.trim();
        state.writes.push(command.to_string());

        if command.contains('?') {
            let reply = state.answer(command);
            state.pending.push_back(reply);
            return;
        }

        match command {
            "*RST" => state.settings.clear(),
            "*CLS" => state.error_queue.clear(),
            _ => {
                let (header, value) = command.split_once(' ').unwrap_or((command, ""));
                state
                    .settings
                    .insert(header.trim().to_string(), value.trim().to_string());
            }
        }
    }
}

impl DeviceState {
    fn answer(&mut self, query: &str) -> String {
        if let Some(reply) = self.responses.get(query) {
            return reply.clone();
        }
        match query {
            "*IDN?" => self.identity.clone(),
            "*OPC?" => {
                if self.opc_busy_polls > 0 {
                    self.opc_busy_polls -= 1;
                    "0".to_string()
                } else {
                    "1".to_string()
                }
            }
            ERROR_QUERY => {
                if let Some((code, message)) = &self.persistent_error {
                    format!("{code},\"{message}\"")
                } else if let Some((code, message)) = self.error_queue.pop_front() {
                    format!("{code},\"{message}\"")
                } else {
                    NO_ERROR.to_string()
                }
            }
            _ => {
                let header = query.replace('?', "");
                self.settings
                    .get(header.trim())
                    .cloned()
                    .unwrap_or_else(|| "0".to_string())
            }
        }
    }
}

/// A session on a [`SimulatedInstrument`].
pub struct SimulatedLink {
    resource: String,
    device: SimulatedInstrument,
    timeout: Duration,
    open: bool,
}

#[async_trait]
impl Transport for SimulatedLink {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        if !self.open {
            return Err(transport_error(&self.resource, "session is closed"));
        }
        self.device.handle_write(command);
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        if !self.open {
            return Err(transport_error(&self.resource, "session is closed"));
        }
        let latency = self.device.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let reply = self.device.lock().pending.pop_front();
        match reply {
            Some(reply) => Ok(reply),
            None => {
                tokio::time::sleep(self.timeout).await;
                Err(transport_error(
                    &self.resource,
                    format!("no response within {:?}", self.timeout),
                ))
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> AppResult<()> {
        if std::mem::replace(&mut self.open, false) {
            let mut state = self.device.lock();
            state.closes += 1;
            state.pending.clear();
        }
        Ok(())
    }
}

/// Resource manager over simulated instruments.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    devices: Arc<Mutex<BTreeMap<String, SimulatedInstrument>>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SimulatedInstrument>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place `device` on the bus at `address`.
    pub fn attach(&self, address: impl Into<String>, device: SimulatedInstrument) {
        self.lock().insert(address.into(), device);
    }

    /// The device at `address`, if any.
    pub fn device(&self, address: &str) -> Option<SimulatedInstrument> {
        self.lock().get(address).cloned()
    }
}

#[async_trait]
impl ResourceManager for SimulatedBus {
    async fn open(
        &self,
        address: &str,
        options: &TransportOptions,
    ) -> AppResult<Box<dyn Transport>> {
        let device = self
            .device(address)
            .ok_or_else(|| transport_error(address, "resource not found"))?;

        {
            let mut state = device.lock();
            if !state.reachable {
                return Err(transport_error(address, "device did not respond"));
            }
            if std::mem::take(&mut state.fail_next_open) {
                return Err(transport_error(address, "injected open failure"));
            }
            state.opens += 1;
        }

        Ok(Box::new(SimulatedLink {
            resource: address.to_string(),
            device,
            timeout: options.timeout,
            open: true,
        }))
    }

    async fn list_resources(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, device)| device.lock().reachable)
            .map(|(address, _)| address.clone())
            .collect()
    }
}
