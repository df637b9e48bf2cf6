//! Instrument registry and session supervision.
//!
//! The [`Supervisor`] owns the abort channel for a test session. Watchdogs
//! started while it brings instruments up report faults to it, and it races
//! the test procedure against those reports. Whichever way the session ends,
//! the same clean-up runs: every instrument is closed in reverse order, which
//! turns outputs off, releases reservations and stops the watchdogs.
//!
//! A supervisor runs one session. Once shutdown has begun, later faults are
//! ignored.

use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::Connectable;
use crate::instrument::{Instrument, MultichannelInstrument};
use crate::transport::ResourceManager;
use crate::watchdog::{abort_channel, AbortSignal, FaultReport};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// An instrument as held by the registry.
#[derive(Debug, Clone)]
pub enum BenchInstrument {
    Single(Arc<Instrument>),
    Multichannel(Arc<MultichannelInstrument>),
}

impl BenchInstrument {
    pub fn name(&self) -> &str {
        match self {
            BenchInstrument::Single(instrument) => instrument.name(),
            BenchInstrument::Multichannel(instrument) => instrument.name(),
        }
    }

    /// The instrument's lifecycle interface.
    pub fn lifecycle(&self) -> &dyn Connectable {
        match self {
            BenchInstrument::Single(instrument) => instrument.as_ref(),
            BenchInstrument::Multichannel(instrument) => instrument.as_ref(),
        }
    }

    /// The underlying base instrument.
    pub fn base(&self) -> &Instrument {
        match self {
            BenchInstrument::Single(instrument) => instrument,
            BenchInstrument::Multichannel(instrument) => instrument.base(),
        }
    }
}

impl From<Instrument> for BenchInstrument {
    fn from(instrument: Instrument) -> Self {
        BenchInstrument::Single(Arc::new(instrument))
    }
}

impl From<MultichannelInstrument> for BenchInstrument {
    fn from(instrument: MultichannelInstrument) -> Self {
        BenchInstrument::Multichannel(Arc::new(instrument))
    }
}

/// Named instruments in registration order.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    instruments: Vec<BenchInstrument>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, instrument: impl Into<BenchInstrument>) -> AppResult<()> {
        let instrument = instrument.into();
        if self.instruments.iter().any(|i| i.name() == instrument.name()) {
            return Err(BenchError::Configuration(format!(
                "instrument '{}' is registered twice",
                instrument.name()
            )));
        }
        self.instruments.push(instrument);
        Ok(())
    }

    pub fn get(&self, name: &str) -> AppResult<&BenchInstrument> {
        self.instruments
            .iter()
            .find(|i| i.name() == name)
            .ok_or_else(|| BenchError::UnknownInstrument(name.to_string()))
    }

    pub fn single(&self, name: &str) -> AppResult<Arc<Instrument>> {
        match self.get(name)? {
            BenchInstrument::Single(instrument) => Ok(instrument.clone()),
            BenchInstrument::Multichannel(_) => Err(BenchError::Configuration(format!(
                "'{name}' is a multichannel instrument"
            ))),
        }
    }

    pub fn multichannel(&self, name: &str) -> AppResult<Arc<MultichannelInstrument>> {
        match self.get(name)? {
            BenchInstrument::Multichannel(instrument) => Ok(instrument.clone()),
            BenchInstrument::Single(_) => Err(BenchError::Configuration(format!(
                "'{name}' has no channels"
            ))),
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &BenchInstrument> {
        self.instruments.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.instruments.iter().map(BenchInstrument::name).collect()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

enum Outcome<T> {
    Finished(AppResult<T>),
    Faulted(FaultReport),
}

/// Runs one test session over a registry of instruments.
pub struct Supervisor {
    registry: InstrumentRegistry,
    resources: Arc<dyn ResourceManager>,
    abort: AbortSignal,
    faults: Mutex<mpsc::UnboundedReceiver<FaultReport>>,
}

impl Supervisor {
    pub fn new(resources: Arc<dyn ResourceManager>, registry: InstrumentRegistry) -> Self {
        let (abort, faults) = abort_channel();
        Self {
            registry,
            resources,
            abort,
            faults: Mutex::new(faults),
        }
    }

    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    pub fn resources(&self) -> &dyn ResourceManager {
        self.resources.as_ref()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Open and initialise every instrument in registration order. On the
    /// first failure everything is torn down again and that error returned.
    pub async fn request_resources(&self) -> AppResult<()> {
        for instrument in self.registry.iter() {
            let lifecycle = instrument.lifecycle();
            let result = async {
                lifecycle.open(self.resources.as_ref()).await?;
                lifecycle.initialize(&self.abort).await
            }
            .await;

            if let Err(e) = result {
                error!(instrument = %instrument.name(), "Could not bring up instrument: {}", e);
                if let Err(cleanup_err) = self.cleanup().await {
                    warn!("Clean-up after failed start reported: {}", cleanup_err);
                }
                return Err(e);
            }
        }
        info!(count = self.registry.len(), "All instruments ready");
        Ok(())
    }

    /// Run `procedure` until it finishes or a watchdog reports a fault, then
    /// clean up. A fault cancels the procedure and is returned as
    /// [`BenchError::Fault`].
    pub async fn run<F, T>(&self, procedure: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let mut faults = self.faults.lock().await;
        let mut outcome = tokio::select! {
            result = procedure => Outcome::Finished(result),
            Some(report) = faults.recv() => Outcome::Faulted(report),
        };

        if let Outcome::Finished(_) = outcome {
            if !self.abort.begin_shutdown() {
                // A fault was raised as the procedure completed.
                if let Ok(report) = faults.try_recv() {
                    outcome = Outcome::Faulted(report);
                }
            }
        }
        drop(faults);

        match outcome {
            Outcome::Finished(result) => {
                info!("Procedure finished, shutting down");
                let cleanup = self.cleanup().await;
                match (result, cleanup) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), cleanup) => {
                        if let Err(cleanup_err) = cleanup {
                            warn!("Clean-up after failed procedure reported: {}", cleanup_err);
                        }
                        Err(e)
                    }
                }
            }
            Outcome::Faulted(report) => {
                error!("Aborting session: {}", report);
                if let Err(cleanup_err) = self.cleanup().await {
                    warn!("Clean-up after fault reported: {}", cleanup_err);
                }
                Err(BenchError::Fault(report))
            }
        }
    }

    /// Close every instrument in reverse registration order.
    pub async fn cleanup(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for instrument in self.registry.iter().rev() {
            if let Err(e) = instrument.lifecycle().close().await {
                error!(instrument = %instrument.name(), "Close failed: {}", e);
                errors.push(e);
            }
        }
        BenchError::from_teardown(errors)
    }
}
