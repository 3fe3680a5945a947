//! Command-line interface for the NeoMind device fleet simulator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neomind_devsim::mqtt::{MqttHubConnector, MqttProvisioningClient};
use neomind_devsim::{
    Device, DeviceServices, EdgeEnvironment, Fleet, HttpFunctionEndpoint, HttpRegistryClient, SimulationConfig,
    TracingSink,
};

/// NeoMind Device Simulator - Simulate IoT device fleets against a hub.
#[derive(Parser, Debug)]
#[command(name = "neomind-devsim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Simulation config (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start every device and run until Ctrl-C.
    Run {
        /// Device list (JSON array).
        devices: PathBuf,
        /// Delay between device starts, in milliseconds.
        #[arg(long, default_value_t = 500)]
        stagger_ms: u64,
    },
    /// Check a config and device list without connecting.
    Validate {
        /// Device list (JSON array).
        devices: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var("NEOMIND_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("neomind_devsim=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }

    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Run { devices, stagger_ms } => run(config, &devices, stagger_ms).await,
        Command::Validate { devices } => validate(&config, &devices),
    }
}

fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    let config = match path {
        Some(path) => SimulationConfig::load(path)?,
        None => {
            let config = SimulationConfig::default().with_env_overrides();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn load_devices(path: &Path) -> Result<Vec<Device>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let devices: Vec<Device> =
        serde_json::from_str(&text).with_context(|| format!("Invalid device list {}", path.display()))?;
    Ok(devices)
}

fn validate(config: &SimulationConfig, path: &Path) -> Result<()> {
    let devices = load_devices(path)?;
    println!("Config OK: {} geo area(s), DPS retries {}", config.geo.len(), config.simulation.dps_retries);
    println!("Devices: {}", devices.len());
    for device in &devices {
        println!(
            "  {:<24} {:<12} comms={}{}",
            device.id,
            format!("{:?}", device.kind()).to_lowercase(),
            device.comms.len(),
            if device.plan_mode() { " plan" } else { "" }
        );
    }
    Ok(())
}

async fn run(config: SimulationConfig, path: &Path, stagger_ms: u64) -> Result<()> {
    let devices = load_devices(path)?;
    let config = Arc::new(config);

    let services = DeviceServices::new(
        config.clone(),
        Arc::new(TracingSink),
        Arc::new(MqttHubConnector::new(config.simulation.sas_expire_hours)),
        Arc::new(MqttProvisioningClient::new()),
    )
    .with_registry(Arc::new(HttpRegistryClient::new()))
    .with_function_endpoint(Arc::new(HttpFunctionEndpoint::new()))
    .with_environment(EdgeEnvironment::from_env());

    let fleet = Fleet::new(services);
    for device in devices {
        fleet.add(device).await;
    }
    tracing::info!(devices = fleet.len().await, "Fleet loaded");

    fleet.start_all(Duration::from_millis(stagger_ms)).await?;

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("Stopping fleet");
    fleet.stop_all().await;
    fleet.shutdown().await;
    Ok(())
}
