//! Core library for the labbench application.
//!
//! This library contains the instrument lifecycle, channel reservation and
//! fault watchdog framework for bench instruments on a VISA or serial bus. It
//! is used by the `labbench` binary and by test procedures.
//!
//! # Example
//!
//! ```
//! use labbench::channel::{ChannelSpec, Quantity};
//! use labbench::commands::CommandSet;
//! use labbench::instrument::{InstrumentSettings, MultichannelInstrument};
//! use labbench::transport::simulated::{SimulatedBus, SimulatedInstrument};
//! use labbench::watchdog::abort_channel;
//!
//! # tokio_test::block_on(async {
//! let bus = SimulatedBus::new();
//! bus.attach("GPIB0::5::INSTR", SimulatedInstrument::new("ACME,PSU-2"));
//!
//! let settings = InstrumentSettings::new("supply", "GPIB0::5::INSTR", "ACME,PSU-2")
//!     .with_commands(CommandSet::scpi_power_supply());
//! let supply = MultichannelInstrument::new(
//!     settings,
//!     vec![ChannelSpec::new(1).with_limits(Quantity::Voltage, 0.0, 30.0)],
//! )?;
//!
//! let (abort, _faults) = abort_channel();
//! supply.open(&bus).await?;
//! supply.initialize(&abort).await?;
//!
//! let dut = supply.reserve_channel(1, "DUT supply").await?;
//! dut.set_soft_limits(Quantity::Voltage, 0.0, 5.0).await?;
//! dut.set_value(Quantity::Voltage, 3.3).await?;
//! assert!(dut.set_value(Quantity::Voltage, 10.0).await.is_err());
//!
//! supply.close().await?;
//! # Ok::<(), labbench::error::BenchError>(())
//! # }).unwrap();
//! ```

pub mod channel;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod supervisor;
pub mod transport;
pub mod watchdog;

pub use channel::{Channel, ChannelSpec, Limits, Quantity};
pub use error::{AppResult, BenchError};
pub use instrument::{ControlMode, Instrument, InstrumentSettings, Lifecycle, MultichannelInstrument};
pub use supervisor::{BenchInstrument, InstrumentRegistry, Supervisor};
