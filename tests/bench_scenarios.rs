//! End-to-end behaviour of instruments and channels on a simulated bus.

use labbench::channel::{ChannelSpec, Limits, Quantity};
use labbench::commands::CommandSet;
use labbench::error::BenchError;
use labbench::instrument::{ControlMode, Instrument, InstrumentSettings, Lifecycle, MultichannelInstrument};
use labbench::transport::simulated::{SimulatedBus, SimulatedInstrument};
use labbench::watchdog::abort_channel;
use std::time::Duration;

const PSU_ADDRESS: &str = "TCPIP0::192.168.1.20::INSTR";
const PSU_IDN: &str = "RIGOL TECHNOLOGIES,DP832,DP8C0001,00.01.14";

fn bench() -> (SimulatedBus, SimulatedInstrument) {
    let bus = SimulatedBus::new();
    let device = SimulatedInstrument::new(PSU_IDN);
    bus.attach(PSU_ADDRESS, device.clone());
    (bus, device)
}

fn supply_settings() -> InstrumentSettings {
    InstrumentSettings::new("DP832", PSU_ADDRESS, PSU_IDN)
        .with_verify(true)
        .with_commands(CommandSet::scpi_power_supply())
}

fn two_channel_supply(settings: InstrumentSettings) -> MultichannelInstrument {
    MultichannelInstrument::new(
        settings,
        vec![
            ChannelSpec::new(1)
                .with_limits(Quantity::Voltage, 0.0, 30.0)
                .with_limits(Quantity::Current, 0.0, 3.0),
            ChannelSpec::new(2)
                .with_limits(Quantity::Voltage, 0.0, 30.0)
                .with_limits(Quantity::Current, 0.0, 3.0),
        ],
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn soft_limits_gate_set_value() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    let (abort, _faults) = abort_channel();
    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();

    let dut = supply.reserve_channel(1, "DUT supply").await.unwrap();
    dut.set_soft_limits(Quantity::Voltage, 0.0, 5.0).await.unwrap();

    device.clear_writes();
    let err = dut.set_value(Quantity::Voltage, 10.0).await.unwrap_err();
    assert!(matches!(err, BenchError::OutOfRange { .. }));
    assert!(device.writes().is_empty());

    dut.set_value(Quantity::Voltage, 3.0).await.unwrap();
    assert_eq!(dut.get_value(Quantity::Voltage).await.unwrap(), 3.0);
    assert_eq!(
        device.writes(),
        vec![
            "SOUR1:VOLT 3.000".to_string(),
            "SOUR1:VOLT?".to_string(),
            "SOUR1:VOLT?".to_string(),
        ]
    );

    supply.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn identity_mismatch_closes_without_watchdog() {
    let (bus, device) = bench();
    device.set_identity("RIGOL TECHNOLOGIES,DP821,DP8B0002,00.01.14");
    let supply = two_channel_supply(supply_settings());

    let err = supply.open(&bus).await.unwrap_err();
    assert!(matches!(err, BenchError::IdentityMismatch { .. }));
    assert_eq!(supply.base().state().await, Lifecycle::Closed);
    assert!(!supply.base().watchdog_running().await);
    assert!(!device.is_open());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(device.error_polls(), 0);

    let (abort, _faults) = abort_channel();
    assert!(matches!(
        supply.initialize(&abort).await,
        Err(BenchError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn persistent_device_error_aborts_once() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    let (abort, mut faults) = abort_channel();
    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();

    let dut = supply.reserve_channel(1, "DUT supply").await.unwrap();
    dut.set_value(Quantity::Voltage, 5.0).await.unwrap();
    dut.enable_output().await.unwrap();
    assert!(dut.watchdog_running().await);

    device.set_persistent_error(208, "current limit exceeded");
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(device.error_polls() >= 2);

    let report = faults.try_recv().unwrap();
    assert_eq!(report.source, "DP832");
    assert_eq!(report.faults[0].code, Some(208));
    assert_eq!(report.faults[0].message, "current limit exceeded");
    assert!(faults.try_recv().is_err());
    assert!(abort.is_shutting_down());

    supply.close().await.unwrap();
    assert!(!dut.is_reserved().await);
}

#[tokio::test]
async fn out_of_range_channel_index_touches_nothing() {
    let (_bus, device) = bench();
    let supply = two_channel_supply(supply_settings());

    let err = supply.reserve_channel(3, "x").await.unwrap_err();
    assert!(matches!(
        err,
        BenchError::InvalidChannel { index: 3, count: 2, .. }
    ));
    for channel in supply.channels() {
        assert!(!channel.is_reserved().await);
        assert_eq!(
            channel.soft_limits(Quantity::Voltage).await,
            Some(Limits { min: 0.0, max: 30.0 })
        );
    }
    assert!(device.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_in_every_state() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    let (abort, _faults) = abort_channel();

    supply.close().await.unwrap();
    supply.open(&bus).await.unwrap();
    supply.close().await.unwrap();
    supply.close().await.unwrap();
    assert_eq!(device.closes(), 1);

    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();
    supply.close().await.unwrap();
    supply.close().await.unwrap();
    assert_eq!(supply.base().state().await, Lifecycle::Closed);
    assert_eq!(device.closes(), 1);
    assert!(!supply.base().watchdog_running().await);
}

#[tokio::test(start_paused = true)]
async fn interactive_mode_skips_reset_watchdog_and_lockout() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings().with_control(ControlMode::Interactive));
    let (abort, _faults) = abort_channel();

    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();
    assert_eq!(supply.base().state().await, Lifecycle::Initialized);
    assert!(!supply.base().watchdog_running().await);
    assert_eq!(device.writes(), vec!["*IDN?".to_string()]);

    let dut = supply.reserve_channel(2, "gate bias").await.unwrap();
    dut.enable_output().await.unwrap();
    assert!(!dut.watchdog_running().await);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(device.error_polls(), 0);

    supply.close().await.unwrap();
    assert!(!device.writes().contains(&"SYST:LOC".to_string()));
    assert_eq!(device.setting("OUTP2").as_deref(), Some("OFF"));
}

#[tokio::test(start_paused = true)]
async fn channel_watchdog_follows_output_state() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    let (abort, mut faults) = abort_channel();
    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();

    let dut = supply.reserve_channel(1, "DUT supply").await.unwrap();
    assert!(!dut.watchdog_running().await);
    dut.enable_output().await.unwrap();
    assert!(dut.is_output_enabled().await);
    assert!(dut.watchdog_running().await);
    assert!(matches!(
        dut.enable_output().await,
        Err(BenchError::OutputAlreadyEnabled { .. })
    ));

    dut.disable_output().await.unwrap();
    assert!(!dut.watchdog_running().await);
    assert_eq!(device.setting("OUTP1").as_deref(), Some("OFF"));

    // A limiting condition after the output is off must go unnoticed.
    device.respond("STAT:QUES:INST:ISUM1:COND?", "2");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(faults.try_recv().is_err());

    supply.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn channel_fault_names_the_channel() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    let (abort, mut faults) = abort_channel();
    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();

    let dut = supply.reserve_channel(2, "DUT supply").await.unwrap();
    dut.enable_output().await.unwrap();
    device.respond("STAT:QUES:INST:ISUM2:COND?", "2");
    tokio::time::sleep(Duration::from_secs(4)).await;

    let report = faults.try_recv().unwrap();
    assert_eq!(report.source, "DUT supply");
    assert_eq!(report.faults[0].message, "output entered current limiting");

    supply.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn free_turns_output_off_and_restores_limits() {
    let (bus, device) = bench();
    let supply = two_channel_supply(supply_settings());
    let (abort, _faults) = abort_channel();
    supply.open(&bus).await.unwrap();
    supply.initialize(&abort).await.unwrap();

    let dut = supply.reserve_channel(1, "DUT supply").await.unwrap();
    dut.set_soft_limits(Quantity::Current, 0.0, 0.5).await.unwrap();
    dut.enable_output().await.unwrap();

    dut.free().await.unwrap();
    assert!(!dut.is_output_enabled().await);
    assert!(!dut.watchdog_running().await);
    assert_eq!(dut.name().await, "DP832 - Channel 1");
    assert_eq!(
        dut.soft_limits(Quantity::Current).await,
        Some(Limits { min: 0.0, max: 3.0 })
    );
    assert_eq!(device.setting("OUTP1").as_deref(), Some("OFF"));

    let again = supply.reserve_channel(1, "second user").await.unwrap();
    assert_eq!(again.name().await, "second user");

    supply.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn single_instrument_wait_and_errors() {
    let bus = SimulatedBus::new();
    let analyser = SimulatedInstrument::new("Keysight Technologies,N9030B,MY55190123,A.33.03");
    bus.attach("GPIB0::18::INSTR", analyser.clone());
    let instrument = Instrument::new(InstrumentSettings::new(
        "analyser",
        "GPIB0::18::INSTR",
        "Keysight Technologies,N9030B,MY55190123,A.33.03",
    ));
    instrument.open(&bus).await.unwrap();

    analyser.set_busy(2);
    instrument.wait_until_complete(Duration::from_secs(30)).await.unwrap();

    analyser.push_error(-222, "Data out of range");
    let errors = instrument.errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, Some(-222));
    assert!(instrument.errors().await.unwrap().is_empty());

    instrument.write("FREQ:CENT 2.4 GHz").await.unwrap();
    assert_eq!(instrument.query("FREQ:CENT?").await.unwrap(), "2.4 GHz");

    instrument.close().await.unwrap();
}
