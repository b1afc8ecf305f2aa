//! # scratch-link
//!
//! Gateway binary: loads settings, installs logging, and serves the
//! loopback WebSocket endpoint until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use link_device::sim::{SimulatedBle, SimulatedBt};
use link_server::{GatewayConfig, SessionManager};
use link_settings::{GatewaySettings, parse_log_format};
use link_telemetry::{TelemetryConfig, init_telemetry};

/// Loopback WebSocket gateway for Bluetooth peripherals.
#[derive(Parser, Debug)]
#[command(name = "scratch-link", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.scratch-link/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (`error`..`trace`). Overrides settings.
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (`json` or `pretty`). Overrides settings.
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut GatewaySettings) -> Result<()> {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            settings.logging.format =
                parse_log_format(format).ok_or_else(|| anyhow!("unknown log format: {format}"))?;
        }
        Ok(())
    }
}

fn telemetry_config(settings: &GatewaySettings) -> Result<TelemetryConfig> {
    TelemetryConfig::from_settings(&settings.logging).context("Invalid log level")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings.clone().unwrap_or_else(link_settings::settings_path);
    let mut settings = link_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings)?;
    link_settings::validate(&settings).context("Invalid settings")?;

    init_telemetry(&telemetry_config(&settings)?).context("Failed to initialise logging")?;
    tracing::info!(settings = %settings_path.display(), "starting scratch-link");

    // Native adapters plug in through the link-device traits; the binary
    // serves the simulated demo population.
    let ble = Arc::new(SimulatedBle::demo());
    let bt = Arc::new(SimulatedBt::demo());
    let manager = SessionManager::new(ble, bt, GatewayConfig::from(&settings));

    let server = link_server::start(manager).await.context("Failed to bind server")?;
    tracing::info!(addr = %server.addr(), "scratch-link listening on ws://{}", server.addr());

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown(None).await {
        tracing::warn!("some sessions did not finish before the shutdown deadline");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
