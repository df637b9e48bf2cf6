//! Shared instrument state and command rendering.
//!
//! `InstrumentCore` is what channels and watchdogs hold on to: the settings,
//! the command table and the connection. Everything that turns a typed request
//! into command strings and parses the replies lives here.

use super::{ControlMode, InstrumentSettings};
use crate::channel::Quantity;
use crate::commands::{
    channel_bit, parse_error_queue, parse_status_word, ChannelFaultCheck, CommandSet,
    OutputStateQuery, QuantityCommands,
};
use crate::connection::Connection;
use crate::error::{AppResult, BenchError};
use crate::transport::TransportOptions;
use crate::watchdog::{Fault, FaultProbe, WatchdogSettings};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Delay between busy operation-complete replies.
const OPC_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct InstrumentCore {
    settings: InstrumentSettings,
    pub(crate) connection: Connection,
}

impl InstrumentCore {
    pub(crate) fn new(settings: InstrumentSettings) -> Self {
        let connection = Connection::new(settings.name.clone(), settings.address.clone());
        Self {
            settings,
            connection,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.settings.name
    }

    pub(crate) fn address(&self) -> &str {
        &self.settings.address
    }

    pub(crate) fn expected_identity(&self) -> &str {
        &self.settings.expected_identity
    }

    pub(crate) fn verify(&self) -> bool {
        self.settings.verify
    }

    pub(crate) fn control(&self) -> ControlMode {
        self.settings.control
    }

    pub(crate) fn transport_options(&self) -> &TransportOptions {
        &self.settings.transport
    }

    pub(crate) fn commands(&self) -> &CommandSet {
        &self.settings.commands
    }

    pub(crate) fn watchdog_settings(&self) -> &WatchdogSettings {
        &self.settings.watchdog
    }

    pub(crate) fn has_channel_fault_check(&self) -> bool {
        self.settings.commands.channel_fault != ChannelFaultCheck::None
    }

    /// Whether outputs can be commanded off. Without it they cannot be
    /// commanded on either.
    pub(crate) fn has_output_control(&self) -> bool {
        self.settings.commands.output_off.is_some()
    }

    pub(crate) fn has_output_readback(&self) -> bool {
        self.settings.commands.output_state.is_some()
    }

    fn malformed(&self, command: &str, response: &str) -> BenchError {
        BenchError::MalformedResponse {
            name: self.settings.name.clone(),
            command: command.to_string(),
            response: response.to_string(),
        }
    }

    async fn query_number(&self, command: &str) -> AppResult<f64> {
        let reply = self.connection.query(command).await?;
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| self.malformed(command, &reply))
    }

    async fn query_status_word(&self, command: &str) -> AppResult<u64> {
        let reply = self.connection.query(command).await?;
        parse_status_word(&reply).ok_or_else(|| self.malformed(command, &reply))
    }

    fn quantity_commands(&self, quantity: Quantity) -> AppResult<&QuantityCommands> {
        self.settings
            .commands
            .quantity(quantity)
            .ok_or_else(|| BenchError::UnsupportedQuantity {
                target: self.settings.name.clone(),
                quantity,
            })
    }

    /// Reset command, settle, wait for operation complete, clear status.
    pub(crate) async fn reset(&self) -> AppResult<()> {
        let commands = self.commands();
        info!(instrument = %self.name(), "Resetting");
        self.connection.write(&commands.reset).await?;
        tokio::time::sleep(commands.reset_settle).await;
        self.wait_until_complete(None).await?;
        self.connection.write(&commands.clear_status).await
    }

    /// Poll operation complete until the instrument stops answering `0`.
    pub(crate) async fn wait_until_complete(&self, timeout: Option<Duration>) -> AppResult<()> {
        let command = &self.commands().operation_complete;
        let limit = self.commands().opc_poll_limit;
        for attempt in 0..=limit {
            let reply = match timeout {
                Some(timeout) => self.connection.query_with_timeout(command, timeout).await?,
                None => self.connection.query(command).await?,
            };
            if reply.trim() != "0" {
                return Ok(());
            }
            debug!(instrument = %self.name(), attempt, "Operation still in progress");
            tokio::time::sleep(OPC_RETRY_DELAY).await;
        }
        Err(BenchError::Transport {
            resource: self.address().to_string(),
            message: format!("operation not complete after {} polls", limit + 1),
        })
    }

    /// One poll of the instrument error queue.
    pub(crate) async fn instrument_errors(&self) -> AppResult<Vec<Fault>> {
        let command = &self.commands().error_query;
        let reply = self.connection.query(command).await?;
        let entries = parse_error_queue(&reply).ok_or_else(|| self.malformed(command, &reply))?;
        Ok(entries
            .into_iter()
            .map(|entry| Fault::device(self.name(), entry.code, entry.message))
            .collect())
    }

    /// Channel conditions currently present on `channel`.
    pub(crate) async fn channel_faults(&self, channel: usize, source: &str) -> AppResult<Vec<Fault>> {
        let commands = self.commands();
        match &commands.channel_fault {
            ChannelFaultCheck::None => Ok(Vec::new()),
            ChannelFaultCheck::ErrorQueue { query } => {
                let command = commands.render(query, channel, None)?;
                let reply = self.connection.query(&command).await?;
                let entries =
                    parse_error_queue(&reply).ok_or_else(|| self.malformed(&command, &reply))?;
                Ok(entries
                    .into_iter()
                    .map(|entry| Fault::channel(source, Some(entry.code), entry.message))
                    .collect())
            }
            ChannelFaultCheck::StatusBit {
                query,
                first_bit,
                stride,
                message,
            } => {
                let command = commands.render(query, channel, None)?;
                let word = self.query_status_word(&command).await?;
                if bit_set(word, channel_bit(*first_bit, *stride, channel)) {
                    Ok(vec![Fault::channel(source, None, message.clone())])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Send the set command. Returns the value as sent, after rounding.
    pub(crate) async fn set_quantity(&self, channel: usize, quantity: Quantity, value: f64) -> AppResult<f64> {
        let templates = self.quantity_commands(quantity)?;
        let text = templates.format_value(value);
        let command = self.commands().render(&templates.set, channel, Some(&text))?;
        self.connection.write(&command).await?;
        Ok(text.parse::<f64>().unwrap_or(value))
    }

    pub(crate) async fn get_quantity(&self, channel: usize, quantity: Quantity) -> AppResult<f64> {
        let templates = self.quantity_commands(quantity)?;
        let command = self.commands().render(&templates.get, channel, None)?;
        self.query_number(&command).await
    }

    pub(crate) async fn measure_quantity(&self, channel: usize, quantity: Quantity) -> AppResult<f64> {
        let templates = self.quantity_commands(quantity)?;
        let template = templates
            .measure
            .as_ref()
            .ok_or_else(|| BenchError::Unsupported {
                target: self.name().to_string(),
                operation: "measurement",
            })?;
        let command = self.commands().render(template, channel, None)?;
        self.query_number(&command).await
    }

    pub(crate) async fn set_output(&self, channel: usize, on: bool) -> AppResult<()> {
        let commands = self.commands();
        let template = if on { &commands.output_on } else { &commands.output_off };
        let template = template.as_ref().ok_or_else(|| BenchError::Unsupported {
            target: self.name().to_string(),
            operation: "output control",
        })?;
        let command = commands.render(template, channel, None)?;
        self.connection.write(&command).await
    }

    pub(crate) async fn output_state(&self, channel: usize) -> AppResult<bool> {
        let commands = self.commands();
        match &commands.output_state {
            None => Err(BenchError::Unsupported {
                target: self.name().to_string(),
                operation: "output state readback",
            }),
            Some(OutputStateQuery::Reply { query, on }) => {
                let command = commands.render(query, channel, None)?;
                let reply = self.connection.query(&command).await?;
                let reply = reply.trim();
                Ok(on.iter().any(|token| token.eq_ignore_ascii_case(reply)))
            }
            Some(OutputStateQuery::StatusBit {
                query,
                first_bit,
                stride,
            }) => {
                let command = commands.render(query, channel, None)?;
                let word = self.query_status_word(&command).await?;
                Ok(bit_set(word, channel_bit(*first_bit, *stride, channel)))
            }
        }
    }
}

fn bit_set(word: u64, bit: u32) -> bool {
    bit < u64::BITS && word & (1 << bit) != 0
}

/// Polls the instrument error queue.
pub(crate) struct ErrorQueueProbe {
    core: Arc<InstrumentCore>,
}

impl ErrorQueueProbe {
    pub(crate) fn new(core: Arc<InstrumentCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl FaultProbe for ErrorQueueProbe {
    fn source(&self) -> String {
        self.core.name().to_string()
    }

    async fn poll(&self) -> AppResult<Vec<Fault>> {
        self.core.instrument_errors().await
    }
}

/// Checks one channel for fault conditions.
pub(crate) struct ChannelFaultProbe {
    core: Arc<InstrumentCore>,
    channel: usize,
    source: String,
}

impl ChannelFaultProbe {
    pub(crate) fn new(core: Arc<InstrumentCore>, channel: usize, source: String) -> Self {
        Self {
            core,
            channel,
            source,
        }
    }
}

#[async_trait]
impl FaultProbe for ChannelFaultProbe {
    fn source(&self) -> String {
        self.source.clone()
    }

    async fn poll(&self) -> AppResult<Vec<Fault>> {
        self.core.channel_faults(self.channel, &self.source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::{SimulatedBus, SimulatedInstrument};
    use crate::transport::ResourceManager;

    const ADDRESS: &str = "TCPIP0::192.168.1.20::INSTR";
    const IDN: &str = "Siglent Technologies,SPD3303X,SPD3XIDD4R0001,1.01.01.02.07R2,V3.0";

    async fn core_with(commands: CommandSet, device: &SimulatedInstrument) -> InstrumentCore {
        let bus = SimulatedBus::new();
        bus.attach(ADDRESS, device.clone());
        let settings = InstrumentSettings::new("psu", ADDRESS, IDN).with_commands(commands);
        let core = InstrumentCore::new(settings);
        let transport = bus
            .open(ADDRESS, core.transport_options())
            .await
            .unwrap();
        core.connection.attach(transport).await.unwrap();
        core
    }

    #[tokio::test]
    async fn spd3303x_status_word_decodes_per_channel() {
        let device = SimulatedInstrument::new(IDN);
        // CH2 in constant-current mode, CH1 output on.
        device.respond("SYST:STATUS?", "0x0012");
        let core = core_with(CommandSet::siglent_spd3303x(), &device).await;

        assert!(core.output_state(1).await.unwrap());
        assert!(!core.output_state(2).await.unwrap());
        assert!(core.channel_faults(1, "CH1").await.unwrap().is_empty());
        let faults = core.channel_faults(2, "CH2").await.unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].message, "output entered current limiting");
    }

    #[tokio::test]
    async fn set_quantity_rounds_and_renders() {
        let device = SimulatedInstrument::new(IDN);
        let core = core_with(CommandSet::siglent_spd3303x(), &device).await;

        let sent = core.set_quantity(2, Quantity::Voltage, 3.3004).await.unwrap();
        assert_eq!(sent, 3.3);
        assert_eq!(device.writes().last().map(String::as_str), Some("CH2:VOLT 3.300"));
        assert_eq!(core.get_quantity(2, Quantity::Voltage).await.unwrap(), 3.3);
    }

    #[tokio::test]
    async fn unsupported_operations_are_reported() {
        let device = SimulatedInstrument::new(IDN);
        let core = core_with(CommandSet::scpi(), &device).await;

        assert!(matches!(
            core.set_quantity(1, Quantity::Power, 0.0).await,
            Err(BenchError::UnsupportedQuantity { .. })
        ));
        assert!(matches!(
            core.set_output(1, true).await,
            Err(BenchError::Unsupported { .. })
        ));
        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn malformed_error_reply_is_an_error() {
        let device = SimulatedInstrument::new(IDN);
        device.respond("SYST:ERR?", "garbage");
        let core = core_with(CommandSet::scpi(), &device).await;

        assert!(matches!(
            core.instrument_errors().await,
            Err(BenchError::MalformedResponse { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_waits_for_operation_complete() {
        let device = SimulatedInstrument::new(IDN);
        device.set_busy(3);
        device.push_error(-113, "Undefined header");
        let core = core_with(CommandSet::scpi(), &device).await;

        core.reset().await.unwrap();

        let writes = device.writes();
        assert_eq!(writes.first().map(String::as_str), Some("*RST"));
        assert_eq!(writes.iter().filter(|w| *w == "*OPC?").count(), 4);
        assert_eq!(writes.last().map(String::as_str), Some("*CLS"));
        assert!(core.instrument_errors().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn endless_busy_instrument_gives_up() {
        let device = SimulatedInstrument::new(IDN);
        device.set_busy(u32::MAX);
        let mut commands = CommandSet::scpi();
        commands.opc_poll_limit = 5;
        let core = core_with(commands, &device).await;

        assert!(core.wait_until_complete(None).await.is_err());
        assert_eq!(device.writes().len(), 6);
    }
}
