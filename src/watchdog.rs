//! Fault watchdogs and the abort signal.
//!
//! A [`Watchdog`] is a background tokio task that polls a [`FaultProbe`] on a
//! fixed interval. It runs on its own schedule regardless of what the main
//! control flow is doing; its polls go through the instrument's
//! [`Connection`](crate::connection::Connection) like any other query, so they
//! never split another party's write and read.
//!
//! When a poll reports faults (or the poll itself fails), every fault is logged
//! and a [`FaultReport`] is raised on the [`AbortSignal`]. Raising does not wait
//! for anyone to act on it. The signal carries a one-shot "shutting down" flag:
//! only the first report reaches the handler, later ones are logged and
//! dropped, so a fault that persists across polls cannot trigger teardown
//! twice.
//!
//! # Design
//!
//! - One watchdog per initialised instrument polls the error queue.
//! - One watchdog per enabled channel output checks channel conditions
//!   (current limiting, protection trips). It is started after the output
//!   settle delay and stopped before the output is commanded off.
//! - Stopping signals the task, which exits at its next wait point, and joins
//!   it with a bounded timeout. A task that does not exit in time is aborted.

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Timing for watchdogs and output enabling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Time between polls.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Delay between enabling an output and starting its channel watchdog.
    #[serde(default = "default_output_settle", with = "humantime_serde")]
    pub output_settle: Duration,

    /// Bound on waiting for a stopped watchdog to exit.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_output_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            output_settle: default_output_settle(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Entry from the instrument's error queue.
    Device,
    /// Channel condition such as current limiting.
    Channel,
    /// The poll itself failed.
    Communication,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fault {
    pub source: String,
    pub kind: FaultKind,
    pub code: Option<i32>,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl Fault {
    pub fn device(source: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::new(source, FaultKind::Device, Some(code), message)
    }

    pub fn channel(source: impl Into<String>, code: Option<i32>, message: impl Into<String>) -> Self {
        Self::new(source, FaultKind::Channel, code, message)
    }

    pub fn communication(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, FaultKind::Communication, None, message)
    }

    fn new(
        source: impl Into<String>,
        kind: FaultKind,
        code: Option<i32>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            kind,
            code,
            message: message.into(),
            detected_at: Utc::now(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} reporting error {} ({})", self.source, code, self.message),
            None => write!(f, "{} reporting {}", self.source, self.message),
        }
    }
}

/// Faults found by one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultReport {
    pub source: String,
    pub faults: Vec<Fault>,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let faults: Vec<String> = self.faults.iter().map(ToString::to_string).collect();
        write!(f, "{}", faults.join("; "))
    }
}

struct AbortShared {
    shutting_down: AtomicBool,
    sender: mpsc::UnboundedSender<FaultReport>,
}

/// Sending side of the abort channel. Cheap to clone.
#[derive(Clone)]
pub struct AbortSignal {
    shared: Arc<AbortShared>,
}

/// Create an abort signal and the receiver the supervisor listens on.
pub fn abort_channel() -> (AbortSignal, mpsc::UnboundedReceiver<FaultReport>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let signal = AbortSignal {
        shared: Arc::new(AbortShared {
            shutting_down: AtomicBool::new(false),
            sender,
        }),
    };
    (signal, receiver)
}

impl AbortSignal {
    /// Deliver `report` unless shutdown has already begun. Returns whether the
    /// report was delivered.
    pub fn raise(&self, report: FaultReport) -> bool {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(source = %report.source, "Shutdown already in progress, ignoring fault");
            return false;
        }
        if self.shared.sender.send(report).is_err() {
            warn!("Fault raised but no abort handler is listening");
        }
        true
    }

    /// Mark shutdown as started on the normal completion path. Returns `false`
    /// if it had already started.
    pub fn begin_shutdown(&self) -> bool {
        !self.shared.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Something a watchdog can poll for faults.
#[async_trait]
pub trait FaultProbe: Send + Sync + 'static {
    /// Name used in logs and fault reports.
    fn source(&self) -> String;

    /// Faults present right now. An empty list means healthy.
    async fn poll(&self) -> AppResult<Vec<Fault>>;
}

/// Handle to a running watchdog task.
pub struct Watchdog {
    source: String,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl Watchdog {
    /// Start polling `probe` every `settings.poll_interval`, first poll one
    /// interval from now.
    pub fn spawn(probe: Arc<dyn FaultProbe>, settings: &WatchdogSettings, abort: AbortSignal) -> Self {
        let source = probe.source();
        let period = settings.poll_interval;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn({
            let source = source.clone();
            async move {
                debug!(source = %source, interval = ?period, "Watchdog started");
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = &mut stop_rx => break,
                        _ = ticker.tick() => {}
                    }

                    let faults = match probe.poll().await {
                        Ok(faults) => faults,
                        Err(e) => vec![Fault::communication(&source, format!("fault poll failed: {e}"))],
                    };
                    if faults.is_empty() {
                        trace!(source = %source, "No faults");
                        continue;
                    }

                    for fault in &faults {
                        error!("{}. Shutting down...", fault);
                    }
                    abort.raise(FaultReport {
                        source: source.clone(),
                        faults,
                    });
                }
                debug!(source = %source, "Watchdog stopped");
            }
        });

        Self {
            source,
            stop: Some(stop_tx),
            task: Some(task),
            stop_timeout: settings.stop_timeout,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and wait for it, at most `stop_timeout`.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(source = %self.source, "Watchdog task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    source = %self.source,
                    "Watchdog did not stop within {:?}, aborting it",
                    self.stop_timeout
                );
                task.abort();
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
