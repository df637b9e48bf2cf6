//! Loading bench configuration from files and the environment.

use labbench::config::{BenchConfig, CommandSource};
use labbench::instrument::ControlMode;
use labbench::supervisor::Supervisor;
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const BENCH_TOML: &str = r#"
[application]
name = "Gain flatness"
log_level = "info"

[watchdog]
poll_interval = "2s"
output_settle = "250ms"

[[instruments]]
name = "source"
address = "GPIB0::10::INSTR"
expected_identity = "Rohde&Schwarz,SMB100A,1406.6000k03/180123,3.1.19.15"
commands = "scpi_signal_generator"

[[instruments.channels]]
index = 1
limits.frequency = { min = 9e3, max = 6e9 }
limits.power = { min = -145.0, max = 18.0 }

[[instruments]]
name = "supply"
address = "ASRL/dev/ttyUSB0::INSTR"
expected_identity = "Siglent Technologies,SPD3303X,SPD3XIDD4R0001,1.01.01.02.07R2,V3.0"
commands = "siglent_spd3303x"
control = "interactive"

[instruments.transport]
baud_rate = 9600
timeout = "1s"

[[instruments.channels]]
index = 1
limits.voltage = { min = 0.0, max = 32.0 }
limits.current = { min = 0.0, max = 3.2 }

[[instruments.channels]]
index = 2
limits.voltage = { min = 0.0, max = 32.0 }
limits.current = { min = 0.0, max = 3.2 }
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn loads_file_with_defaults() {
    let file = config_file(BENCH_TOML);
    let config = BenchConfig::load(Some(file.path())).unwrap();

    assert_eq!(config.application.name, "Gain flatness");
    assert_eq!(config.watchdog.poll_interval, Duration::from_secs(2));
    assert_eq!(config.watchdog.output_settle, Duration::from_millis(250));
    assert_eq!(config.watchdog.stop_timeout, Duration::from_secs(2));

    let supply = &config.instruments[1];
    assert_eq!(supply.control, ControlMode::Interactive);
    assert_eq!(supply.transport.baud_rate, Some(9600));
    assert_eq!(supply.transport.timeout, Duration::from_secs(1));
    assert_eq!(supply.transport.read_termination, "\n");
    assert_eq!(
        supply.commands,
        CommandSource::Profile("siglent_spd3303x".to_string())
    );
    assert!(supply.enabled);
    assert!(!supply.verify);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = config_file(BENCH_TOML);
    std::env::set_var("LABBENCH_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("LABBENCH_WATCHDOG__POLL_INTERVAL", "500ms");
    let loaded = BenchConfig::load(Some(file.path()));
    std::env::remove_var("LABBENCH_APPLICATION__LOG_LEVEL");
    std::env::remove_var("LABBENCH_WATCHDOG__POLL_INTERVAL");

    let config = loaded.unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.watchdog.poll_interval, Duration::from_millis(500));
    assert_eq!(config.instruments.len(), 2);
}

#[test]
#[serial]
fn invalid_environment_value_is_rejected() {
    let file = config_file(BENCH_TOML);
    std::env::set_var("LABBENCH_APPLICATION__LOG_LEVEL", "chatty");
    let loaded = BenchConfig::load(Some(file.path()));
    std::env::remove_var("LABBENCH_APPLICATION__LOG_LEVEL");

    assert!(loaded.is_err());
}

#[test]
#[serial]
fn missing_file_gives_an_empty_bench() {
    let dir = tempfile::tempdir().unwrap();
    let config = BenchConfig::load(Some(dir.path().join("absent.toml").as_path())).unwrap();
    assert!(config.instruments.is_empty());
    assert_eq!(config.application.log_level, "info");
}

#[tokio::test(start_paused = true)]
async fn simulated_bench_comes_up_from_configuration() {
    let config = BenchConfig::from_toml_str(BENCH_TOML).unwrap();
    let bus = config.simulated_bus();
    let supervisor = Supervisor::new(Arc::new(bus.clone()), config.build_registry().unwrap());

    supervisor.request_resources().await.unwrap();
    let source = supervisor.registry().multichannel("source").unwrap();
    let rf = source.reserve_channel(1, "RF drive").await.unwrap();

    supervisor
        .run(async {
            rf.set_value(labbench::Quantity::Frequency, 2.45e9).await?;
            rf.set_value(labbench::Quantity::Power, -20.0).await
        })
        .await
        .unwrap();

    let device = bus.device("GPIB0::10::INSTR").unwrap();
    assert_eq!(device.setting("SOUR1:FREQ").as_deref(), Some("2450000000"));
    assert_eq!(device.setting("SOUR1:POW").as_deref(), Some("-20.00"));
    assert!(!device.is_open());
}

#[tokio::test(start_paused = true)]
async fn channelled_instrument_on_default_profile_tears_down_cleanly() {
    let config = BenchConfig::from_toml_str(
        r#"
[[instruments]]
name = "meter"
address = "GPIB0::22::INSTR"
expected_identity = "KEITHLEY INSTRUMENTS INC.,MODEL 2000,1234567,A19"

[[instruments.channels]]
index = 1
"#,
    )
    .unwrap();
    assert_eq!(
        config.instruments[0].commands,
        CommandSource::Profile("scpi".to_string())
    );

    let bus = config.simulated_bus();
    let supervisor = Supervisor::new(Arc::new(bus.clone()), config.build_registry().unwrap());
    supervisor.request_resources().await.unwrap();

    let meter = supervisor.registry().multichannel("meter").unwrap();
    let input = meter.reserve_channel(1, "DUT output").await.unwrap();
    supervisor.run(async { Ok(()) }).await.unwrap();

    assert!(!input.is_reserved().await);
    let device = bus.device("GPIB0::22::INSTR").unwrap();
    assert!(!device.is_open());
}
