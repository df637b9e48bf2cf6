//! Bench configuration using Figment.
//!
//! Configuration is loaded from a TOML file and then from environment
//! variables prefixed with `LABBENCH_`. Nested keys are separated by a
//! double underscore:
//!
//! ```text
//! LABBENCH_APPLICATION__LOG_LEVEL=debug
//! LABBENCH_WATCHDOG__POLL_INTERVAL=1s
//! ```
//!
//! # Example
//!
//! ```
//! use labbench::config::BenchConfig;
//!
//! let config = BenchConfig::from_toml_str(r#"
//!     [[instruments]]
//!     name = "supply"
//!     address = "TCPIP0::192.168.1.20::INSTR"
//!     expected_identity = "ACME,PSU-2,0001,1.0"
//!     commands = "scpi_power_supply"
//!
//!     [[instruments.channels]]
//!     index = 1
//!     limits.voltage = { min = 0.0, max = 30.0 }
//! "#).unwrap();
//! let registry = config.build_registry().unwrap();
//! assert_eq!(registry.names(), vec!["supply"]);
//! ```

use crate::channel::ChannelSpec;
use crate::commands::CommandSet;
use crate::error::{AppResult, BenchError};
use crate::instrument::{ControlMode, Instrument, InstrumentSettings, MultichannelInstrument};
use crate::supervisor::{BenchInstrument, InstrumentRegistry};
use crate::transport::simulated::{SimulatedBus, SimulatedInstrument};
use crate::transport::TransportOptions;
use crate::watchdog::WatchdogSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Used by [`BenchConfig::load`] when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

const ENV_PREFIX: &str = "LABBENCH_";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Timing shared by every instrument's watchdogs.
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_name() -> String {
    "labbench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// A built-in profile name or a full command table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSource {
    Profile(String),
    Table(CommandSet),
}

impl Default for CommandSource {
    fn default() -> Self {
        CommandSource::Profile("scpi".to_string())
    }
}

impl CommandSource {
    pub fn resolve(&self) -> AppResult<CommandSet> {
        match self {
            CommandSource::Profile(name) => CommandSet::profile(name),
            CommandSource::Table(commands) => Ok(commands.clone()),
        }
    }
}

/// One `[[instruments]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    pub name: String,
    pub address: String,
    pub expected_identity: String,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub control: ControlMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: TransportOptions,
    #[serde(default)]
    pub commands: CommandSource,
    /// Overrides the profile's settle time after reset.
    #[serde(default, with = "humantime_serde")]
    pub reset_settle: Option<Duration>,
    /// Overrides the profile's operation-complete poll limit.
    #[serde(default)]
    pub opc_poll_limit: Option<u32>,
    /// Non-empty for multichannel instruments.
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

fn default_enabled() -> bool {
    true
}

impl InstrumentDefinition {
    pub fn settings(&self, watchdog: &WatchdogSettings) -> AppResult<InstrumentSettings> {
        let mut commands = self.commands.resolve()?;
        if let Some(settle) = self.reset_settle {
            commands.reset_settle = settle;
        }
        if let Some(limit) = self.opc_poll_limit {
            commands.opc_poll_limit = limit;
        }
        Ok(
            InstrumentSettings::new(&self.name, &self.address, &self.expected_identity)
                .with_verify(self.verify)
                .with_control(self.control)
                .with_transport(self.transport.clone())
                .with_commands(commands)
                .with_watchdog(watchdog.clone()),
        )
    }

    /// Construct the instrument. No hardware is contacted.
    pub fn build(&self, watchdog: &WatchdogSettings) -> AppResult<BenchInstrument> {
        let settings = self.settings(watchdog)?;
        if self.channels.is_empty() {
            Ok(Instrument::new(settings).into())
        } else {
            Ok(MultichannelInstrument::new(settings, self.channels.clone())?.into())
        }
    }
}

impl BenchConfig {
    /// Load from `path` (default [`DEFAULT_CONFIG_PATH`]) and the environment,
    /// then validate. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check names, addresses, identities, command profiles and channel
    /// layouts. Disabled instruments are checked too.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(BenchError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let mut names = HashSet::new();
        for definition in &self.instruments {
            if definition.name.trim().is_empty() {
                return Err(BenchError::Configuration(
                    "instrument name cannot be empty".to_string(),
                ));
            }
            if !names.insert(definition.name.as_str()) {
                return Err(BenchError::Configuration(format!(
                    "duplicate instrument name '{}'",
                    definition.name
                )));
            }
            if definition.address.trim().is_empty() {
                return Err(BenchError::Configuration(format!(
                    "instrument '{}': address cannot be empty",
                    definition.name
                )));
            }
            if definition.expected_identity.trim().is_empty() {
                return Err(BenchError::Configuration(format!(
                    "instrument '{}': expected_identity cannot be empty",
                    definition.name
                )));
            }
            definition.build(&self.watchdog)?;
        }
        Ok(())
    }

    /// Registry of the enabled instruments, in file order.
    pub fn build_registry(&self) -> AppResult<InstrumentRegistry> {
        let mut registry = InstrumentRegistry::new();
        for definition in self.instruments.iter().filter(|d| d.enabled) {
            registry.register(definition.build(&self.watchdog)?)?;
        }
        Ok(registry)
    }

    /// A simulated bus with one device per enabled instrument, each
    /// answering its expected identity.
    pub fn simulated_bus(&self) -> SimulatedBus {
        let bus = SimulatedBus::new();
        for definition in self.instruments.iter().filter(|d| d.enabled) {
            bus.attach(
                definition.address.clone(),
                SimulatedInstrument::new(definition.expected_identity.clone()),
            );
        }
        bus
    }
}
