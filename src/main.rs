//! CLI entry point for labbench.
//!
//! ```bash
//! labbench --config config/bench.toml resources
//! labbench probe supply analyser
//! labbench --simulate check --hold 30s
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use labbench::config::BenchConfig;
use labbench::supervisor::{BenchInstrument, Supervisor};
use labbench::transport::{BusResourceManager, ResourceManager};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labbench")]
#[command(about = "Bench instrument control with fault watchdogs", long_about = None)]
struct Cli {
    /// Bench configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated instruments answering the configured identities
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the resources visible on the bus
    Resources,

    /// Check that instruments answer with their expected identity
    Probe {
        /// Instruments to probe (default: all enabled)
        names: Vec<String>,
    },

    /// Bring every enabled instrument up under supervision, then tear down
    Check {
        /// Keep the watchdogs running this long before tearing down
        #[arg(long, default_value = "0s", value_parser = parse_duration)]
        hold: Duration,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(text).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BenchConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: BenchConfig) -> Result<bool> {
    let resources: Arc<dyn ResourceManager> = if cli.simulate {
        info!("Using simulated instruments");
        Arc::new(config.simulated_bus())
    } else {
        Arc::new(BusResourceManager::new())
    };

    match cli.command {
        Commands::Resources => {
            let found = resources.list_resources().await;
            if found.is_empty() {
                println!("No resources found");
            }
            for address in found {
                println!("{address}");
            }
            Ok(true)
        }
        Commands::Probe { names } => {
            let registry = config
                .build_registry()
                .context("Failed to build instrument registry")?;
            let selected: Vec<&BenchInstrument> = if names.is_empty() {
                registry.iter().collect()
            } else {
                names
                    .iter()
                    .map(|name| registry.get(name))
                    .collect::<Result<_, _>>()?
            };

            let results = join_all(
                selected
                    .iter()
                    .map(|instrument| instrument.lifecycle().test_connection(resources.as_ref())),
            )
            .await;

            for (instrument, reachable) in selected.iter().zip(&results) {
                let status = if *reachable { "reachable" } else { "unreachable" };
                println!("{:<20} {:<40} {}", instrument.name(), instrument.base().address(), status);
            }
            Ok(results.iter().all(|reachable| *reachable))
        }
        Commands::Check { hold } => {
            let registry = config
                .build_registry()
                .context("Failed to build instrument registry")?;
            let supervisor = Supervisor::new(resources, registry);
            supervisor
                .request_resources()
                .await
                .context("Failed to bring up instruments")?;

            supervisor
                .run(async {
                    if !hold.is_zero() {
                        info!("Holding for {:?} with watchdogs running", hold);
                        tokio::select! {
                            _ = tokio::time::sleep(hold) => {}
                            result = tokio::signal::ctrl_c() => {
                                if let Err(e) = result {
                                    warn!("Could not listen for Ctrl-C: {}", e);
                                }
                                info!("Interrupted");
                            }
                        }
                    }
                    for instrument in supervisor.registry().iter() {
                        let errors = instrument.base().errors().await?;
                        for fault in &errors {
                            warn!("{}", fault);
                        }
                        println!("{:<20} {} error(s) queued", instrument.name(), errors.len());
                    }
                    Ok(())
                })
                .await
                .context("Supervised check failed")?;
            println!("All instruments checked and released");
            Ok(true)
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(true)
        }
    }
}
