//! Instruments with several independently controllable channels.

use super::{ControlMode, Instrument, InstrumentSettings, Lifecycle};
use crate::channel::{Channel, ChannelSpec};
use crate::error::{AppResult, BenchError};
use crate::transport::ResourceManager;
use crate::watchdog::AbortSignal;
use tracing::{debug, info, warn};

/// A base instrument plus a fixed, 1-indexed set of channels.
#[derive(Debug)]
pub struct MultichannelInstrument {
    base: Instrument,
    channels: Vec<Channel>,
}

impl MultichannelInstrument {
    /// The channel indices must be exactly `1..=N`, in any order.
    pub fn new(settings: InstrumentSettings, mut specs: Vec<ChannelSpec>) -> AppResult<Self> {
        specs.sort_by_key(|spec| spec.index);
        let found: Vec<usize> = specs.iter().map(|spec| spec.index).collect();
        let contiguous = found
            .iter()
            .enumerate()
            .all(|(position, index)| *index == position + 1);
        if found.is_empty() || !contiguous {
            return Err(BenchError::ChannelLayout {
                instrument: settings.name,
                count: found.len(),
                found,
            });
        }

        let channels = specs
            .into_iter()
            .map(Channel::new)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            base: Instrument::new(settings),
            channels,
        })
    }

    pub fn base(&self) -> &Instrument {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Channel `index`, counting from 1.
    pub fn channel(&self, index: usize) -> AppResult<&Channel> {
        index
            .checked_sub(1)
            .and_then(|position| self.channels.get(position))
            .ok_or_else(|| BenchError::InvalidChannel {
                instrument: self.name().to_string(),
                index,
                count: self.channels.len(),
            })
    }

    pub async fn open(&self, resources: &dyn ResourceManager) -> AppResult<()> {
        self.base.open(resources).await
    }

    /// Initialise the base instrument, bind the channels to it and, under
    /// software control, force every output off.
    pub async fn initialize(&self, abort: &AbortSignal) -> AppResult<()> {
        self.base.initialize(abort).await?;

        let core = self.base.core();
        let software = self.base.control() == ControlMode::Software;
        let channel_abort = software.then(|| abort.clone());
        for channel in &self.channels {
            channel.attach(core, channel_abort.clone()).await;
        }

        if software && core.commands().output_off.is_some() {
            for channel in &self.channels {
                core.set_output(channel.index(), false).await?;
            }
            info!(instrument = %self.name(), "All outputs off");
        }
        Ok(())
    }

    /// Release every channel, outputs off, then close the base instrument.
    pub async fn close(&self) -> AppResult<()> {
        match self.base.state().await {
            Lifecycle::Unopened | Lifecycle::Closed => {
                debug!(instrument = %self.name(), "Nothing to close");
                return Ok(());
            }
            Lifecycle::Open | Lifecycle::Initialized => {}
        }

        let mut errors = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.shutdown().await {
                errors.push(e);
            }
        }
        match self.base.close().await {
            Ok(()) => {}
            Err(BenchError::ShutdownFailed(base_errors)) => errors.extend(base_errors),
            Err(e) => errors.push(e),
        }
        if !errors.is_empty() {
            warn!(instrument = %self.name(), count = errors.len(), "Closed with errors");
        }
        BenchError::from_teardown(errors)
    }

    /// Reserve channel `index` for `purpose`. The index is checked before any
    /// channel is touched.
    pub async fn reserve_channel(&self, index: usize, purpose: &str) -> AppResult<Channel> {
        self.channel(index)?.reserve(purpose).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Quantity;
    use crate::commands::CommandSet;
    use crate::transport::simulated::{SimulatedBus, SimulatedInstrument};
    use crate::watchdog::abort_channel;
    use tracing_test::traced_test;

    fn settings() -> InstrumentSettings {
        InstrumentSettings::new("psu", "ASRL3::INSTR", "ACME,PSU-2")
    }

    #[test]
    fn channel_layout_must_cover_one_to_n() {
        let ok = MultichannelInstrument::new(
            settings(),
            vec![ChannelSpec::new(2), ChannelSpec::new(1)],
        )
        .unwrap();
        assert_eq!(ok.channel_count(), 2);
        assert_eq!(ok.channel(1).unwrap().index(), 1);

        for layout in [vec![], vec![1, 3], vec![1, 1], vec![2, 3]] {
            let specs = layout.into_iter().map(ChannelSpec::new).collect();
            assert!(matches!(
                MultichannelInstrument::new(settings(), specs),
                Err(BenchError::ChannelLayout { .. })
            ));
        }
    }

    #[tokio::test]
    async fn invalid_index_touches_nothing() {
        let instrument = MultichannelInstrument::new(
            settings(),
            vec![
                ChannelSpec::new(1).with_limits(Quantity::Voltage, 0.0, 30.0),
                ChannelSpec::new(2).with_limits(Quantity::Voltage, 0.0, 30.0),
            ],
        )
        .unwrap();

        for index in [0, 3] {
            assert!(matches!(
                instrument.reserve_channel(index, "x").await,
                Err(BenchError::InvalidChannel { count: 2, .. })
            ));
        }
        for channel in instrument.channels() {
            assert!(!channel.is_reserved().await);
        }
    }

    #[tokio::test]
    async fn close_before_open_is_a_no_op() {
        let instrument = MultichannelInstrument::new(settings(), vec![ChannelSpec::new(1)]).unwrap();
        instrument.close().await.unwrap();
        instrument.close().await.unwrap();
        assert_eq!(instrument.base().state().await, Lifecycle::Unopened);
    }

    async fn supply(verify: bool, device: &SimulatedInstrument) -> MultichannelInstrument {
        let bus = SimulatedBus::new();
        bus.attach("ASRL3::INSTR", device.clone());
        let instrument = MultichannelInstrument::new(
            settings()
                .with_verify(verify)
                .with_commands(CommandSet::scpi_power_supply()),
            vec![
                ChannelSpec::new(1).with_limits(Quantity::Voltage, 0.0, 30.0),
                ChannelSpec::new(2).with_limits(Quantity::Voltage, 0.0, 30.0),
            ],
        )
        .unwrap();
        let (abort, _faults) = abort_channel();
        instrument.open(&bus).await.unwrap();
        instrument.initialize(&abort).await.unwrap();
        instrument
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_names_channels_and_forces_outputs_off() {
        let device = SimulatedInstrument::new("ACME,PSU-2");
        let instrument = supply(false, &device).await;

        let writes = device.writes();
        assert!(writes.contains(&"OUTP1 OFF".to_string()));
        assert!(writes.contains(&"OUTP2 OFF".to_string()));
        assert_eq!(writes.last().map(String::as_str), Some("OUTP2 OFF"));
        assert_eq!(instrument.channel(2).unwrap().name().await, "psu - Channel 2");

        instrument.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_channels() {
        let device = SimulatedInstrument::new("ACME,PSU-2");
        let instrument = supply(true, &device).await;

        let channel = instrument.reserve_channel(1, "DUT supply").await.unwrap();
        channel.set_soft_limits(Quantity::Voltage, 0.0, 5.0).await.unwrap();
        channel.enable_output().await.unwrap();
        assert!(channel.watchdog_running().await);

        instrument.close().await.unwrap();
        assert!(!channel.is_reserved().await);
        assert!(!channel.is_output_enabled().await);
        assert!(!channel.watchdog_running().await);
        assert_eq!(channel.name().await, "psu - Channel 1");
        assert_eq!(
            channel.soft_limits(Quantity::Voltage).await,
            channel.absolute_limits(Quantity::Voltage)
        );
        assert_eq!(device.setting("OUTP1").as_deref(), Some("OFF"));
        assert!(!device.is_open());

        instrument.close().await.unwrap();
        assert_eq!(device.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_output_verify_turns_output_back_off() {
        let device = SimulatedInstrument::new("ACME,PSU-2");
        device.respond("OUTP1?", "0");
        let instrument = supply(true, &device).await;

        let channel = instrument.reserve_channel(1, "DUT supply").await.unwrap();
        let err = channel.enable_output().await.unwrap_err();
        assert!(matches!(err, BenchError::OutputStateMismatch { expected: true, .. }));
        assert_eq!(device.setting("OUTP1").as_deref(), Some("OFF"));
        assert!(!channel.is_output_enabled().await);
        assert!(!channel.watchdog_running().await);

        instrument.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_output_readback_turns_output_back_off() {
        let device = SimulatedInstrument::new("ACME,PSU-2");
        let bus = SimulatedBus::new();
        bus.attach("ASRL3::INSTR", device.clone());
        let mut commands = CommandSet::scpi_power_supply();
        commands.output_state = None;
        let instrument = MultichannelInstrument::new(
            settings().with_verify(true).with_commands(commands),
            vec![ChannelSpec::new(1).with_limits(Quantity::Voltage, 0.0, 30.0)],
        )
        .unwrap();
        let (abort, _faults) = abort_channel();
        instrument.open(&bus).await.unwrap();
        instrument.initialize(&abort).await.unwrap();

        let channel = instrument.reserve_channel(1, "DUT supply").await.unwrap();
        assert!(matches!(
            channel.enable_output().await,
            Err(BenchError::Unsupported { .. })
        ));
        assert_eq!(device.setting("OUTP1").as_deref(), Some("OFF"));
        assert!(!channel.is_output_enabled().await);
        assert!(!channel.watchdog_running().await);

        // A second attempt is not blocked by a stale output flag.
        assert!(matches!(
            channel.enable_output().await,
            Err(BenchError::Unsupported { .. })
        ));
        instrument.close().await.unwrap();
        assert!(!device.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn close_without_output_commands_succeeds() {
        let device = SimulatedInstrument::new("ACME,PSU-2");
        let bus = SimulatedBus::new();
        bus.attach("ASRL3::INSTR", device.clone());
        let instrument = MultichannelInstrument::new(
            settings().with_commands(CommandSet::scpi()),
            vec![ChannelSpec::new(1), ChannelSpec::new(2)],
        )
        .unwrap();
        let (abort, _faults) = abort_channel();
        instrument.open(&bus).await.unwrap();
        instrument.initialize(&abort).await.unwrap();
        instrument.reserve_channel(2, "DUT sense").await.unwrap();

        instrument.close().await.unwrap();
        assert!(!instrument.channel(2).unwrap().is_reserved().await);
        assert!(!device.writes().iter().any(|w| w.starts_with("OUTP")));
        assert!(!device.is_open());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn readback_mismatch_is_logged() {
        let device = SimulatedInstrument::new("ACME,PSU-2");
        device.respond("SOUR1:VOLT?", "2.950");
        let instrument = supply(true, &device).await;

        let channel = instrument.reserve_channel(1, "DUT supply").await.unwrap();
        let err = channel.set_value(Quantity::Voltage, 3.0).await.unwrap_err();
        assert!(matches!(err, BenchError::ReadbackMismatch { .. }));
        assert!(logs_contain(
            "DUT supply: commanded voltage 3 V but the instrument reports 2.95 V"
        ));

        instrument.close().await.unwrap();
    }
}
