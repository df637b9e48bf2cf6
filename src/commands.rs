//! Command templates.
//!
//! Device behaviour is data, not code: a [`CommandSet`] lists the command
//! strings an instrument family understands, as `strfmt` templates with
//! `{channel}` and `{value}` placeholders. The framework renders them and parses
//! the replies; nothing is overridden per device.
//!
//! Built-in profiles are available by name through [`CommandSet::profile`]:
//!
//! | name | for |
//! |---|---|
//! | `scpi` | any IEEE 488.2 / SCPI instrument, no channel commands |
//! | `scpi_power_supply` | multichannel SCPI supplies (`SOURn:VOLT`, `OUTPn`) |
//! | `scpi_signal_generator` | SCPI RF sources (`SOURn:FREQ`, `SOURn:POW`) |
//! | `siglent_spd3303x` | Siglent SPD3303X/SPD3303C |
//!
//! # Example
//!
//! ```
//! use labbench::channel::Quantity;
//! use labbench::commands::CommandSet;
//!
//! let commands = CommandSet::profile("siglent_spd3303x").unwrap();
//! let set = commands.quantity(Quantity::Voltage).unwrap();
//! assert_eq!(commands.render(&set.set, 2, Some("3.300")).unwrap(), "CH2:VOLT 3.300");
//! ```

use crate::channel::Quantity;
use crate::error::{AppResult, BenchError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

/// Names accepted by [`CommandSet::profile`].
pub const PROFILES: &[&str] = &[
    "scpi",
    "scpi_power_supply",
    "scpi_signal_generator",
    "siglent_spd3303x",
];

/// Templates for one controllable quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityCommands {
    /// Set command, e.g. `SOUR{channel}:VOLT {value}`.
    pub set: String,
    /// Setpoint query, e.g. `SOUR{channel}:VOLT?`.
    pub get: String,
    /// Measurement query, if the instrument can measure the quantity.
    #[serde(default)]
    pub measure: Option<String>,
    /// Round values to this many decimals before sending.
    #[serde(default)]
    pub decimals: Option<usize>,
}

impl QuantityCommands {
    fn new(set: &str, get: &str, measure: Option<&str>, decimals: Option<usize>) -> Self {
        Self {
            set: set.to_string(),
            get: get.to_string(),
            measure: measure.map(str::to_string),
            decimals,
        }
    }

    /// Text sent for `value`.
    pub fn format_value(&self, value: f64) -> String {
        match self.decimals {
            Some(decimals) => format!("{value:.decimals$}"),
            None => value.to_string(),
        }
    }
}

/// How to read back whether a channel output is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputStateQuery {
    /// Query that answers one of `on` when enabled (`OUTP1?` -> `1`).
    Reply { query: String, on: Vec<String> },
    /// One bit per channel in a status word, at `first_bit + stride * (channel - 1)`.
    StatusBit {
        query: String,
        first_bit: u32,
        stride: u32,
    },
}

/// How a channel watchdog detects a channel fault.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelFaultCheck {
    /// The instrument reports no channel conditions.
    #[default]
    None,
    /// A per-channel error queue in `code,"message"` format.
    ErrorQueue { query: String },
    /// A status bit that is set while the fault is present (current limiting,
    /// protection trip).
    StatusBit {
        query: String,
        first_bit: u32,
        stride: u32,
        message: String,
    },
}

/// Command templates for one instrument family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    pub identify: String,
    pub reset: String,
    pub operation_complete: String,
    pub clear_status: String,
    pub error_query: String,
    /// Remote lockout, sent at the end of initialisation.
    pub remote: Option<String>,
    /// Return to front-panel control, sent on close.
    pub local: Option<String>,
    pub quantities: BTreeMap<Quantity, QuantityCommands>,
    pub output_on: Option<String>,
    pub output_off: Option<String>,
    pub output_state: Option<OutputStateQuery>,
    pub channel_fault: ChannelFaultCheck,
    /// Time given to the instrument after the reset command.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
    /// Busy replies tolerated while waiting for operation complete.
    pub opc_poll_limit: u32,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::scpi()
    }
}

impl CommandSet {
    /// IEEE 488.2 common commands and the SCPI error queue.
    pub fn scpi() -> Self {
        Self {
            identify: "*IDN?".into(),
            reset: "*RST".into(),
            operation_complete: "*OPC?".into(),
            clear_status: "*CLS".into(),
            error_query: "SYST:ERR?".into(),
            remote: None,
            local: None,
            quantities: BTreeMap::new(),
            output_on: None,
            output_off: None,
            output_state: None,
            channel_fault: ChannelFaultCheck::None,
            reset_settle: Duration::from_secs(1),
            opc_poll_limit: 100,
        }
    }

    pub fn scpi_power_supply() -> Self {
        let mut quantities = BTreeMap::new();
        quantities.insert(
            Quantity::Voltage,
            QuantityCommands::new(
                "SOUR{channel}:VOLT {value}",
                "SOUR{channel}:VOLT?",
                Some("MEAS{channel}:VOLT?"),
                Some(3),
            ),
        );
        quantities.insert(
            Quantity::Current,
            QuantityCommands::new(
                "SOUR{channel}:CURR {value}",
                "SOUR{channel}:CURR?",
                Some("MEAS{channel}:CURR?"),
                Some(3),
            ),
        );
        Self {
            remote: Some("SYST:REM".into()),
            local: Some("SYST:LOC".into()),
            quantities,
            output_on: Some("OUTP{channel} ON".into()),
            output_off: Some("OUTP{channel} OFF".into()),
            output_state: Some(OutputStateQuery::Reply {
                query: "OUTP{channel}?".into(),
                on: vec!["1".into(), "ON".into()],
            }),
            channel_fault: ChannelFaultCheck::StatusBit {
                query: "STAT:QUES:INST:ISUM{channel}:COND?".into(),
                first_bit: 1,
                stride: 0,
                message: "output entered current limiting".into(),
            },
            ..Self::scpi()
        }
    }

    pub fn scpi_signal_generator() -> Self {
        let mut quantities = BTreeMap::new();
        quantities.insert(
            Quantity::Frequency,
            QuantityCommands::new("SOUR{channel}:FREQ {value}", "SOUR{channel}:FREQ?", None, None),
        );
        quantities.insert(
            Quantity::Power,
            QuantityCommands::new("SOUR{channel}:POW {value}", "SOUR{channel}:POW?", None, Some(2)),
        );
        Self {
            quantities,
            output_on: Some("OUTP{channel} ON".into()),
            output_off: Some("OUTP{channel} OFF".into()),
            output_state: Some(OutputStateQuery::Reply {
                query: "OUTP{channel}?".into(),
                on: vec!["1".into(), "ON".into()],
            }),
            ..Self::scpi()
        }
    }

    /// Siglent SPD3303X. Channel mode and output state live in the
    /// `SYST:STATUS?` word: bits 0/1 are CH1/CH2 constant-current mode, bits
    /// 4/5 are CH1/CH2 output enabled.
    pub fn siglent_spd3303x() -> Self {
        let mut quantities = BTreeMap::new();
        quantities.insert(
            Quantity::Voltage,
            QuantityCommands::new(
                "CH{channel}:VOLT {value}",
                "CH{channel}:VOLT?",
                Some("MEAS:VOLT? CH{channel}"),
                Some(3),
            ),
        );
        quantities.insert(
            Quantity::Current,
            QuantityCommands::new(
                "CH{channel}:CURR {value}",
                "CH{channel}:CURR?",
                Some("MEAS:CURR? CH{channel}"),
                Some(3),
            ),
        );
        Self {
            quantities,
            output_on: Some("OUTP CH{channel},ON".into()),
            output_off: Some("OUTP CH{channel},OFF".into()),
            output_state: Some(OutputStateQuery::StatusBit {
                query: "SYST:STATUS?".into(),
                first_bit: 4,
                stride: 1,
            }),
            channel_fault: ChannelFaultCheck::StatusBit {
                query: "SYST:STATUS?".into(),
                first_bit: 0,
                stride: 1,
                message: "output entered current limiting".into(),
            },
            ..Self::scpi()
        }
    }

    /// A built-in profile by name.
    pub fn profile(name: &str) -> AppResult<Self> {
        match name {
            "scpi" => Ok(Self::scpi()),
            "scpi_power_supply" => Ok(Self::scpi_power_supply()),
            "scpi_signal_generator" => Ok(Self::scpi_signal_generator()),
            "siglent_spd3303x" => Ok(Self::siglent_spd3303x()),
            other => Err(BenchError::Configuration(format!(
                "unknown command profile '{}' (available: {})",
                other,
                PROFILES.join(", ")
            ))),
        }
    }

    pub fn quantity(&self, quantity: Quantity) -> Option<&QuantityCommands> {
        self.quantities.get(&quantity)
    }

    /// Render `template` for `channel`, with `value` if the template takes one.
    pub fn render(&self, template: &str, channel: usize, value: Option<&str>) -> AppResult<String> {
        let mut vars = HashMap::new();
        vars.insert("channel".to_string(), channel.to_string());
        if let Some(value) = value {
            vars.insert("value".to_string(), value.to_string());
        }
        strfmt::strfmt(template, &vars)
            .map_err(|e| BenchError::Template(format!("'{template}': {e}")))
    }
}

/// One entry reported by an error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: i32,
    pub message: String,
}

fn quoted_entry() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#"([+-]?\d+)\s*,\s*"([^"]*)""#).unwrap()
    })
}

fn bare_entry() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^\s*([+-]?\d+)(?:\s*[,\s]\s*(.*?))?\s*$").unwrap()
    })
}

/// Parse an error-queue reply into its entries, dropping code 0.
///
/// Accepts the SCPI form `-113,"Undefined header"`, several such pairs in one
/// reply, and the unquoted `0  No Error` form some supplies use. Returns `None`
/// when the reply matches neither form.
pub fn parse_error_queue(reply: &str) -> Option<Vec<ErrorEntry>> {
    let mut entries = Vec::new();
    let mut matched = false;
    for caps in quoted_entry().captures_iter(reply) {
        matched = true;
        if let Ok(code) = caps[1].parse::<i32>() {
            entries.push(ErrorEntry {
                code,
                message: caps[2].to_string(),
            });
        }
    }
    if !matched {
        let caps = bare_entry().captures(reply)?;
        let code = caps[1].parse::<i32>().ok()?;
        entries.push(ErrorEntry {
            code,
            message: caps.get(2).map_or("", |m| m.as_str()).to_string(),
        });
    }
    entries.retain(|entry| entry.code != 0);
    Some(entries)
}

/// Parse a status word: decimal, `0x` hex or `#H` hex.
pub fn parse_status_word(reply: &str) -> Option<u64> {
    let reply = reply.trim();
    if let Some(hex) = reply
        .strip_prefix("0x")
        .or_else(|| reply.strip_prefix("0X"))
        .or_else(|| reply.strip_prefix("#H"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        reply
            .parse::<u64>()
            .ok()
            .or_else(|| reply.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
    }
}

/// Bit position for `channel` in a status word.
pub fn channel_bit(first_bit: u32, stride: u32, channel: usize) -> u32 {
    let offset = u32::try_from(channel.saturating_sub(1)).unwrap_or(u32::MAX / 2);
    first_bit.saturating_add(stride.saturating_mul(offset))
}
