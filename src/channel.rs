//! Channels: reservation and soft limits.
//!
//! A [`Channel`] is one independently controllable output or measurement path
//! of a multichannel instrument. It has fixed absolute limits per
//! [`Quantity`] and soft limits that start equal to them and can only be
//! narrowed. Every `set_value` is checked against the current soft limits
//! before anything is sent to the hardware.
//!
//! Reservation is a fail-fast exclusivity check, not a lock: reserving a
//! reserved channel and freeing a free one both fail immediately. While
//! reserved, the channel is named after its purpose; otherwise it is named
//! `"<instrument> - Channel N"`.
//!
//! Channels do not own the bus. They hold a weak reference to their
//! instrument, assigned at initialisation, and every command goes through the
//! instrument's connection lock.

use crate::error::{AppResult, BenchError};
use crate::instrument::core::{ChannelFaultProbe, InstrumentCore};
use crate::watchdog::{AbortSignal, Watchdog};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A settable quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Voltage,
    Current,
    Power,
    Frequency,
}

impl Quantity {
    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "A",
            Quantity::Power => "dBm",
            Quantity::Frequency => "Hz",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
            Quantity::Frequency => "frequency",
        };
        f.write_str(name)
    }
}

/// A closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
}

impl Limits {
    /// Validated limits for `quantity`. Fails when `min > max` or either bound
    /// is not a number.
    pub fn new(quantity: Quantity, min: f64, max: f64) -> AppResult<Self> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(BenchError::MalformedLimits { quantity, min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    /// Whether this interval lies inside `outer`.
    pub fn within(&self, outer: &Limits) -> bool {
        outer.min <= self.min && self.max <= outer.max
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Construction-time description of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// 1-based channel number.
    pub index: usize,
    /// Absolute hardware limits. A quantity without limits cannot be set.
    #[serde(default)]
    pub limits: BTreeMap<Quantity, Limits>,
}

impl ChannelSpec {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            limits: BTreeMap::new(),
        }
    }

    pub fn with_limits(mut self, quantity: Quantity, min: f64, max: f64) -> Self {
        self.limits.insert(quantity, Limits { min, max });
        self
    }
}

struct ChannelState {
    host: Weak<InstrumentCore>,
    host_name: Option<String>,
    abort: Option<AbortSignal>,
    name: String,
    reserved: bool,
    soft: BTreeMap<Quantity, Limits>,
    output_enabled: bool,
    watchdog: Option<Watchdog>,
}

impl ChannelState {
    fn default_name(&self, index: usize) -> String {
        match &self.host_name {
            Some(host) => format!("{host} - Channel {index}"),
            None => format!("Channel {index}"),
        }
    }
}

struct ChannelShared {
    index: usize,
    absolute: BTreeMap<Quantity, Limits>,
    state: Mutex<ChannelState>,
}

/// Handle to one channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn new(spec: ChannelSpec) -> AppResult<Self> {
        if spec.index == 0 {
            return Err(BenchError::Configuration(
                "channel numbers start at 1".to_string(),
            ));
        }
        for (quantity, limits) in &spec.limits {
            Limits::new(*quantity, limits.min, limits.max)?;
        }

        let state = ChannelState {
            host: Weak::new(),
            host_name: None,
            abort: None,
            name: format!("Channel {}", spec.index),
            reserved: false,
            soft: spec.limits.clone(),
            output_enabled: false,
            watchdog: None,
        };
        Ok(Self {
            shared: Arc::new(ChannelShared {
                index: spec.index,
                absolute: spec.limits,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Purpose while reserved, `"<instrument> - Channel N"` otherwise.
    pub async fn name(&self) -> String {
        self.shared.state.lock().await.name.clone()
    }

    pub async fn is_reserved(&self) -> bool {
        self.shared.state.lock().await.reserved
    }

    pub fn absolute_limits(&self, quantity: Quantity) -> Option<Limits> {
        self.shared.absolute.get(&quantity).copied()
    }

    pub async fn soft_limits(&self, quantity: Quantity) -> Option<Limits> {
        self.shared.state.lock().await.soft.get(&quantity).copied()
    }

    pub async fn is_output_enabled(&self) -> bool {
        self.shared.state.lock().await.output_enabled
    }

    /// Whether a channel watchdog is currently running.
    pub async fn watchdog_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .await
            .watchdog
            .as_ref()
            .is_some_and(Watchdog::is_running)
    }

    /// Bind to the owning instrument. `abort` is `None` when the instrument is
    /// not under software control, in which case no channel watchdog runs.
    pub(crate) async fn attach(&self, host: &Arc<InstrumentCore>, abort: Option<AbortSignal>) {
        let mut state = self.shared.state.lock().await;
        state.host = Arc::downgrade(host);
        state.host_name = Some(host.name().to_string());
        state.abort = abort;
        if !state.reserved {
            state.name = state.default_name(self.shared.index);
        }
    }

    fn host(&self, state: &ChannelState) -> AppResult<Arc<InstrumentCore>> {
        state.host.upgrade().ok_or_else(|| BenchError::Detached {
            target: state.name.clone(),
        })
    }

    /// Mark the channel as held for `purpose`. Callers go through
    /// [`MultichannelInstrument::reserve_channel`](crate::instrument::MultichannelInstrument::reserve_channel).
    pub(crate) async fn reserve(&self, purpose: &str) -> AppResult<Channel> {
        let mut state = self.shared.state.lock().await;
        if state.reserved {
            return Err(BenchError::AlreadyReserved {
                target: state.default_name(self.shared.index),
                holder: state.name.clone(),
            });
        }
        let previous = std::mem::replace(&mut state.name, purpose.to_string());
        state.reserved = true;
        info!("{} reserved for {}", previous, purpose);
        Ok(self.clone())
    }

    /// Release the channel: output off, soft limits reset, default name.
    pub async fn free(&self) -> AppResult<()> {
        let mut state = self.shared.state.lock().await;
        if !state.reserved {
            return Err(BenchError::NotReserved {
                target: state.name.clone(),
            });
        }
        if state.output_enabled || state.watchdog.is_some() {
            self.disable_locked(&mut state).await?;
        }
        self.release_locked(&mut state);
        Ok(())
    }

    fn release_locked(&self, state: &mut ChannelState) {
        state.soft = self.shared.absolute.clone();
        let default_name = state.default_name(self.shared.index);
        let previous = std::mem::replace(&mut state.name, default_name);
        if std::mem::take(&mut state.reserved) {
            info!("{} released as {}", previous, state.name);
        }
    }

    /// Narrow the operating interval for `quantity`.
    pub async fn set_soft_limits(&self, quantity: Quantity, min: f64, max: f64) -> AppResult<()> {
        let requested = Limits::new(quantity, min, max)?;
        let mut state = self.shared.state.lock().await;
        let absolute = self
            .absolute_limits(quantity)
            .ok_or_else(|| BenchError::UnsupportedQuantity {
                target: state.name.clone(),
                quantity,
            })?;

        if !requested.within(&absolute) {
            error!(
                "{}: soft {} limits {} {} are outside the channel limits {} {}",
                state.name,
                quantity,
                requested,
                quantity.unit(),
                absolute,
                quantity.unit()
            );
            return Err(BenchError::LimitsOutsideAbsolute {
                target: state.name.clone(),
                quantity,
                requested,
                absolute,
            });
        }

        state.soft.insert(quantity, requested);
        debug!("{} soft {} limits set to {} {}", state.name, quantity, requested, quantity.unit());
        Ok(())
    }

    /// Command `quantity` to `value`, within the current soft limits. With
    /// verification enabled on the instrument, the setpoint is read back and
    /// must match.
    pub async fn set_value(&self, quantity: Quantity, value: f64) -> AppResult<()> {
        let state = self.shared.state.lock().await;
        let limits = state
            .soft
            .get(&quantity)
            .copied()
            .ok_or_else(|| BenchError::UnsupportedQuantity {
                target: state.name.clone(),
                quantity,
            })?;
        if !limits.contains(value) {
            return Err(BenchError::OutOfRange {
                target: state.name.clone(),
                quantity,
                value,
                limits,
            });
        }

        let host = self.host(&state)?;
        let sent = host.set_quantity(self.shared.index, quantity, value).await?;

        if host.verify() {
            let readback = host.get_quantity(self.shared.index, quantity).await?;
            if !values_match(sent, readback) {
                error!(
                    "{}: commanded {} {} {} but the instrument reports {} {}",
                    state.name,
                    quantity,
                    sent,
                    quantity.unit(),
                    readback,
                    quantity.unit()
                );
                return Err(BenchError::ReadbackMismatch {
                    target: state.name.clone(),
                    quantity,
                    commanded: format!("{} {}", sent, quantity.unit()),
                    readback: format!("{} {}", readback, quantity.unit()),
                });
            }
        }

        debug!("{} {} set to {} {}", state.name, quantity, sent, quantity.unit());
        Ok(())
    }

    /// Setpoint as reported by the instrument.
    pub async fn get_value(&self, quantity: Quantity) -> AppResult<f64> {
        let state = self.shared.state.lock().await;
        let host = self.host(&state)?;
        host.get_quantity(self.shared.index, quantity).await
    }

    /// Measured value at the output terminals.
    pub async fn measure(&self, quantity: Quantity) -> AppResult<f64> {
        let state = self.shared.state.lock().await;
        let host = self.host(&state)?;
        host.measure_quantity(self.shared.index, quantity).await
    }

    /// Output state as reported by the instrument.
    pub async fn output_state(&self) -> AppResult<bool> {
        let state = self.shared.state.lock().await;
        let host = self.host(&state)?;
        host.output_state(self.shared.index).await
    }

    /// Turn the output on, wait for it to settle, then start the channel
    /// watchdog. The channel must be reserved.
    pub async fn enable_output(&self) -> AppResult<()> {
        let mut state = self.shared.state.lock().await;
        if !state.reserved {
            return Err(BenchError::OutputRequiresReservation {
                target: state.name.clone(),
            });
        }
        if state.output_enabled {
            return Err(BenchError::OutputAlreadyEnabled {
                target: state.name.clone(),
            });
        }

        let host = self.host(&state)?;
        host.set_output(self.shared.index, true).await?;
        state.output_enabled = true;
        if let Err(e) = self.confirm_enabled(&host, &state).await {
            // No watchdog covers the output yet, so it must not stay on.
            if let Err(off) = host.set_output(self.shared.index, false).await {
                error!("{}: could not turn output back off: {}", state.name, off);
            }
            state.output_enabled = false;
            return Err(e);
        }
        info!("{} output enabled", state.name);

        // Inrush transients can look like current limiting.
        tokio::time::sleep(host.watchdog_settings().output_settle).await;

        match (state.abort.clone(), host.has_channel_fault_check()) {
            (Some(abort), true) => {
                let probe = Arc::new(ChannelFaultProbe::new(
                    host.clone(),
                    self.shared.index,
                    state.name.clone(),
                ));
                state.watchdog = Some(Watchdog::spawn(
                    probe,
                    host.watchdog_settings(),
                    abort,
                ));
            }
            (None, _) => debug!("{}: not under software control, no channel watchdog", state.name),
            (_, false) => debug!("{}: instrument has no channel fault check", state.name),
        }
        Ok(())
    }

    async fn confirm_enabled(&self, host: &InstrumentCore, state: &ChannelState) -> AppResult<()> {
        if host.verify() && !host.output_state(self.shared.index).await? {
            error!("{}: output was commanded on but reports off", state.name);
            return Err(BenchError::OutputStateMismatch {
                target: state.name.clone(),
                expected: true,
            });
        }
        Ok(())
    }

    /// Stop the channel watchdog, then turn the output off.
    pub async fn disable_output(&self) -> AppResult<()> {
        let mut state = self.shared.state.lock().await;
        self.disable_locked(&mut state).await
    }

    async fn disable_locked(&self, state: &mut ChannelState) -> AppResult<()> {
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.stop().await;
        }

        let host = self.host(state)?;
        if !host.has_output_control() {
            debug!("{}: instrument has no output control", state.name);
            state.output_enabled = false;
            return Ok(());
        }
        host.set_output(self.shared.index, false).await?;
        let was_enabled = std::mem::replace(&mut state.output_enabled, false);
        if host.verify()
            && host.has_output_readback()
            && host.output_state(self.shared.index).await?
        {
            error!("{}: output was commanded off but reports on", state.name);
            return Err(BenchError::OutputStateMismatch {
                target: state.name.clone(),
                expected: false,
            });
        }
        if was_enabled {
            info!("{} output disabled", state.name);
        } else {
            debug!("{} output forced off", state.name);
        }
        Ok(())
    }

    /// Teardown on instrument close: output off when the instrument is still
    /// reachable, then release regardless.
    pub(crate) async fn shutdown(&self) -> AppResult<()> {
        let mut state = self.shared.state.lock().await;
        let result = if state.host.upgrade().is_some() {
            self.disable_locked(&mut state).await
        } else {
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.stop().await;
            }
            Ok(())
        };
        if let Err(e) = &result {
            warn!("{}: could not turn output off during shutdown: {}", state.name, e);
        }
        state.output_enabled = false;
        self.release_locked(&mut state);
        result
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.shared.index)
            .field("absolute", &self.shared.absolute)
            .finish_non_exhaustive()
    }
}

fn values_match(commanded: f64, readback: f64) -> bool {
    let scale = commanded.abs().max(readback.abs()).max(1.0);
    (commanded - readback).abs() <= 1e-9 * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psu_channel() -> Channel {
        Channel::new(
            ChannelSpec::new(1)
                .with_limits(Quantity::Voltage, 0.0, 30.0)
                .with_limits(Quantity::Current, 0.0, 3.0),
        )
        .unwrap()
    }

    #[test]
    fn malformed_absolute_limits_are_rejected() {
        let result = Channel::new(ChannelSpec::new(1).with_limits(Quantity::Voltage, 5.0, 1.0));
        assert!(matches!(result, Err(BenchError::MalformedLimits { .. })));
        assert!(Channel::new(ChannelSpec::new(0)).is_err());
    }

    #[tokio::test]
    async fn soft_limits_must_lie_within_absolute() {
        let channel = psu_channel();

        channel.set_soft_limits(Quantity::Voltage, 0.0, 5.0).await.unwrap();
        assert_eq!(
            channel.soft_limits(Quantity::Voltage).await,
            Some(Limits { min: 0.0, max: 5.0 })
        );

        for (min, max) in [(-1.0, 5.0), (0.0, 31.0), (6.0, 2.0)] {
            assert!(channel.set_soft_limits(Quantity::Voltage, min, max).await.is_err());
        }
        assert_eq!(
            channel.soft_limits(Quantity::Voltage).await,
            Some(Limits { min: 0.0, max: 5.0 })
        );

        channel.set_soft_limits(Quantity::Voltage, 0.0, 30.0).await.unwrap();
        assert!(matches!(
            channel.set_soft_limits(Quantity::Power, -10.0, 0.0).await,
            Err(BenchError::UnsupportedQuantity { .. })
        ));
    }

    #[tokio::test]
    async fn second_reservation_fails_and_keeps_first_name() {
        let channel = psu_channel();
        channel.reserve("DUT supply").await.unwrap();

        let err = channel.reserve("gate bias").await.unwrap_err();
        assert!(matches!(err, BenchError::AlreadyReserved { ref holder, .. } if holder == "DUT supply"));
        assert_eq!(channel.name().await, "DUT supply");
        assert!(channel.is_reserved().await);
    }

    #[tokio::test]
    async fn free_restores_limits_and_name() {
        let channel = psu_channel();
        channel.reserve("DUT supply").await.unwrap();
        channel.set_soft_limits(Quantity::Voltage, 1.0, 2.0).await.unwrap();

        channel.free().await.unwrap();
        assert!(!channel.is_reserved().await);
        assert_eq!(channel.name().await, "Channel 1");
        assert_eq!(
            channel.soft_limits(Quantity::Voltage).await,
            channel.absolute_limits(Quantity::Voltage)
        );

        assert!(matches!(channel.free().await, Err(BenchError::NotReserved { .. })));
    }

    #[tokio::test]
    async fn out_of_range_value_fails_before_touching_hardware() {
        let channel = psu_channel();
        channel.set_soft_limits(Quantity::Voltage, 0.0, 5.0).await.unwrap();

        // Not attached: an in-range request would fail with Detached.
        assert!(matches!(
            channel.set_value(Quantity::Voltage, 10.0).await,
            Err(BenchError::OutOfRange { .. })
        ));
        assert!(matches!(
            channel.set_value(Quantity::Voltage, 3.0).await,
            Err(BenchError::Detached { .. })
        ));
    }

    #[tokio::test]
    async fn enabling_requires_reservation() {
        let channel = psu_channel();
        assert!(matches!(
            channel.enable_output().await,
            Err(BenchError::OutputRequiresReservation { .. })
        ));
    }

    #[test]
    fn limits_display_and_containment() {
        let limits = Limits::new(Quantity::Frequency, 9e3, 6e9).unwrap();
        assert!(limits.contains(1e9));
        assert!(!limits.contains(6.1e9));
        assert_eq!(Limits { min: 0.0, max: 30.0 }.to_string(), "[0, 30]");
        assert!(Limits::new(Quantity::Power, f64::NAN, 0.0).is_err());
    }

    #[test]
    fn readback_comparison_tolerates_float_noise() {
        assert!(values_match(3.0, 3.000_000_000_1));
        assert!(!values_match(3.0, 3.001));
    }
}
