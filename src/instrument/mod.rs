//! Instrument lifecycle.
//!
//! An [`Instrument`] is constructed from its settings without touching the
//! hardware and then moves through a fixed lifecycle:
//!
//! ```text
//! Unopened --open--> Open --initialize--> Initialized --close--> Closed
//!                      \_____________________close_____________/
//! ```
//!
//! - `open` connects, queries the identity and compares it with the configured
//!   one. A mismatch closes the link and leaves the instrument `Closed`.
//! - `initialize` resets the instrument, starts the error-queue watchdog and
//!   locks out the front panel, but only under [`ControlMode::Software`]. In
//!   interactive mode the state still advances and nothing is sent.
//! - `close` stops the watchdog, hands the front panel back and closes the
//!   link. It is safe to call in any state.
//!
//! Multichannel instruments live in [`multichannel`]; the shared capability
//! traits in [`capabilities`].

pub mod capabilities;
pub(crate) mod core;
pub mod multichannel;

use self::core::{ErrorQueueProbe, InstrumentCore};
use crate::commands::CommandSet;
use crate::connection::Connection;
use crate::error::{AppResult, BenchError};
use crate::transport::{ResourceManager, TransportOptions};
use crate::watchdog::{AbortSignal, Fault, Watchdog, WatchdogSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use multichannel::MultichannelInstrument;

/// Who is in charge of the instrument during a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// The framework resets the instrument, watches it and locks the panel.
    #[default]
    Software,
    /// A person at the front panel; the framework only talks when asked.
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unopened,
    Open,
    Initialized,
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Unopened => "unopened",
            Lifecycle::Open => "open",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything needed to construct an instrument.
#[derive(Debug, Clone)]
pub struct InstrumentSettings {
    pub name: String,
    pub address: String,
    pub expected_identity: String,
    /// Read back every setpoint and output state after writing it.
    pub verify: bool,
    pub control: ControlMode,
    pub transport: TransportOptions,
    pub commands: CommandSet,
    pub watchdog: WatchdogSettings,
}

impl InstrumentSettings {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        expected_identity: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            expected_identity: expected_identity.into(),
            verify: false,
            control: ControlMode::default(),
            transport: TransportOptions::default(),
            commands: CommandSet::default(),
            watchdog: WatchdogSettings::default(),
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_control(mut self, control: ControlMode) -> Self {
        self.control = control;
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_commands(mut self, commands: CommandSet) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogSettings) -> Self {
        self.watchdog = watchdog;
        self
    }
}

struct LifecycleState {
    state: Lifecycle,
    watchdog: Option<Watchdog>,
}

/// A single bench instrument.
pub struct Instrument {
    core: Arc<InstrumentCore>,
    lifecycle: Mutex<LifecycleState>,
    reservation: Mutex<Option<String>>,
}

impl Instrument {
    pub fn new(settings: InstrumentSettings) -> Self {
        Self {
            core: Arc::new(InstrumentCore::new(settings)),
            lifecycle: Mutex::new(LifecycleState {
                state: Lifecycle::Unopened,
                watchdog: None,
            }),
            reservation: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn address(&self) -> &str {
        self.core.address()
    }

    pub fn control(&self) -> ControlMode {
        self.core.control()
    }

    pub fn verify(&self) -> bool {
        self.core.verify()
    }

    pub(crate) fn core(&self) -> &Arc<InstrumentCore> {
        &self.core
    }

    pub async fn state(&self) -> Lifecycle {
        self.lifecycle.lock().await.state
    }

    /// Whether the error-queue watchdog is running.
    pub async fn watchdog_running(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .watchdog
            .as_ref()
            .is_some_and(Watchdog::is_running)
    }

    fn invalid_state(&self, operation: &'static str, state: Lifecycle) -> BenchError {
        BenchError::InvalidState {
            name: self.name().to_string(),
            operation,
            state,
        }
    }

    async fn check_identity(&self, connection: &Connection) -> AppResult<()> {
        let received = connection.query(&self.core.commands().identify).await?;
        let expected = self.core.expected_identity();
        if received.trim() != expected {
            return Err(BenchError::IdentityMismatch {
                name: self.name().to_string(),
                expected: expected.to_string(),
                received,
            });
        }
        Ok(())
    }

    /// Connect and verify the identity.
    pub async fn open(&self, resources: &dyn ResourceManager) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != Lifecycle::Unopened {
            return Err(self.invalid_state("open", lifecycle.state));
        }

        info!(instrument = %self.name(), address = %self.address(), "Opening");
        let transport = match resources
            .open(self.address(), self.core.transport_options())
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                let available = resources.list_resources().await;
                error!(
                    instrument = %self.name(),
                    "Could not open {}: {}. Available resources: {:?}",
                    self.address(),
                    e,
                    available
                );
                return Err(BenchError::Connection {
                    name: self.name().to_string(),
                    address: self.address().to_string(),
                    reason: e.to_string(),
                    available,
                });
            }
        };
        self.core.connection.attach(transport).await?;

        if let Err(e) = self.check_identity(&self.core.connection).await {
            error!(instrument = %self.name(), "{}", e);
            if let Err(close_err) = self.core.connection.close().await {
                warn!(instrument = %self.name(), "Closing after failed open: {}", close_err);
            }
            lifecycle.state = Lifecycle::Closed;
            return Err(e);
        }

        lifecycle.state = Lifecycle::Open;
        info!(instrument = %self.name(), "Opened");
        Ok(())
    }

    /// Bring the instrument to a known state. Under software control this
    /// resets it, starts the error-queue watchdog and locks the front panel.
    pub async fn initialize(&self, abort: &AbortSignal) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != Lifecycle::Open {
            return Err(self.invalid_state("initialize", lifecycle.state));
        }

        match self.control() {
            ControlMode::Software => {
                self.core.reset().await?;
                let probe = Arc::new(ErrorQueueProbe::new(self.core.clone()));
                lifecycle.watchdog = Some(Watchdog::spawn(
                    probe,
                    self.core.watchdog_settings(),
                    abort.clone(),
                ));
                if let Some(remote) = &self.core.commands().remote {
                    self.core.connection.write(remote).await?;
                }
            }
            ControlMode::Interactive => {
                info!(
                    instrument = %self.name(),
                    "Interactive control, skipping reset, watchdog and remote lockout"
                );
            }
        }

        lifecycle.state = Lifecycle::Initialized;
        info!(instrument = %self.name(), "Initialized");
        Ok(())
    }

    /// Stop the watchdog, return front-panel control and close the link.
    /// Every step runs even if an earlier one fails.
    pub async fn close(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            Lifecycle::Unopened | Lifecycle::Closed => {
                debug!(instrument = %self.name(), state = %lifecycle.state, "Nothing to close");
                return Ok(());
            }
            Lifecycle::Open | Lifecycle::Initialized => {}
        }

        let mut errors = Vec::new();
        if let Some(watchdog) = lifecycle.watchdog.take() {
            watchdog.stop().await;
        }
        if self.control() == ControlMode::Software {
            if let Some(local) = &self.core.commands().local {
                if let Err(e) = self.core.connection.write(local).await {
                    warn!(instrument = %self.name(), "Could not return to local control: {}", e);
                    errors.push(e);
                }
            }
        }
        if let Err(e) = self.core.connection.close().await {
            warn!(instrument = %self.name(), "Could not close connection: {}", e);
            errors.push(e);
        }
        if let Some(purpose) = self.reservation.lock().await.take() {
            debug!(instrument = %self.name(), "Released from {}", purpose);
        }

        lifecycle.state = Lifecycle::Closed;
        info!(instrument = %self.name(), "Closed");
        BenchError::from_teardown(errors)
    }

    /// Probe reachability without committing to a session. Uses the open
    /// connection if there is one, a temporary link otherwise.
    pub async fn test_connection(&self, resources: &dyn ResourceManager) -> bool {
        if self.core.connection.is_open().await {
            return match self.check_identity(&self.core.connection).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(instrument = %self.name(), "Connection test failed: {}", e);
                    false
                }
            };
        }

        let transport = match resources
            .open(self.address(), self.core.transport_options())
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                warn!(instrument = %self.name(), "Not reachable at {}: {}", self.address(), e);
                return false;
            }
        };
        let probe = Connection::new(self.name(), self.address());
        if let Err(e) = probe.attach(transport).await {
            warn!(instrument = %self.name(), "Connection test failed: {}", e);
            return false;
        }

        let reachable = match self.check_identity(&probe).await {
            Ok(()) => true,
            Err(e) => {
                warn!(instrument = %self.name(), "Connection test failed: {}", e);
                false
            }
        };
        if let Some(local) = &self.core.commands().local {
            if let Err(e) = probe.write(local).await {
                debug!(instrument = %self.name(), "Could not return to local control: {}", e);
            }
        }
        if let Err(e) = probe.close().await {
            debug!(instrument = %self.name(), "Could not close test connection: {}", e);
        }
        reachable
    }

    /// Hold the whole instrument for `purpose`.
    pub async fn reserve(&self, purpose: &str) -> AppResult<()> {
        let mut reservation = self.reservation.lock().await;
        if let Some(holder) = reservation.as_ref() {
            return Err(BenchError::AlreadyReserved {
                target: self.name().to_string(),
                holder: holder.clone(),
            });
        }
        *reservation = Some(purpose.to_string());
        info!("{} reserved for {}", self.name(), purpose);
        Ok(())
    }

    pub async fn free(&self) -> AppResult<()> {
        let mut reservation = self.reservation.lock().await;
        match reservation.take() {
            Some(purpose) => {
                info!("{} released from {}", self.name(), purpose);
                Ok(())
            }
            None => Err(BenchError::NotReserved {
                target: self.name().to_string(),
            }),
        }
    }

    pub async fn is_reserved(&self) -> bool {
        self.reservation.lock().await.is_some()
    }

    /// The purpose while reserved, the instrument name otherwise.
    pub async fn display_name(&self) -> String {
        self.reservation
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| self.name().to_string())
    }

    /// One poll of the error queue.
    pub async fn errors(&self) -> AppResult<Vec<Fault>> {
        self.core.instrument_errors().await
    }

    pub async fn reset(&self) -> AppResult<()> {
        self.core.reset().await
    }

    /// Wait for pending operations, with the transport timeout raised to
    /// `timeout` for each operation-complete query.
    pub async fn wait_until_complete(&self, timeout: Duration) -> AppResult<()> {
        self.core.wait_until_complete(Some(timeout)).await
    }

    pub async fn write(&self, command: &str) -> AppResult<()> {
        self.core.connection.write(command).await
    }

    pub async fn query(&self, command: &str) -> AppResult<String> {
        self.core.connection.query(command).await
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name())
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
