//! INQ1 terminal bridge
//!
//! Exposes one INQ1 channel as a pseudo-terminal. Prints the pty path on
//! stdout once the interface is claimed, then relays bytes until the device
//! or the terminal fails.

use anyhow::{Context, Result, anyhow};
use bridge::{BridgeConfig, SessionEnd, engine, pty, supervise};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use common::registry::{self, ChannelDescriptor, INQ1};
use common::setup_logging;
use common::usb::{self, UsbBus, UsbError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "inq1-bridge")]
#[command(
    author,
    version,
    about = "Expose an INQ1 modem channel as a pseudo-terminal"
)]
#[command(long_about = "
Claims one USB interface of an INQ1 modem (1614:0408), allocates a
pseudo-terminal and relays bytes between them. The pty path is printed on
stdout; point a dialer, AT-command tool or NMEA reader at it.

CHANNELS:
    modem     AT command interface (interface 0)
    diag      diagnostics (interface 2)
    nmea      GPS sentences (interface 3)
    pcsync    PC sync (interface 4)

EXAMPLES:
    # Bridge the modem channel
    inq1-bridge modem

    # Use a finite USB timeout and verbose logging
    inq1-bridge --usb-timeout-ms 1000 --log-level debug modem

The hidden interfaces only appear after running inq1-unlock on the device's
generic SCSI node.
")]
struct Args {
    /// Channel to bridge
    #[arg(value_name = "CHANNEL", value_parser = parse_channel)]
    channel: Option<&'static ChannelDescriptor>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the default configuration to PATH (or the default location) and exit
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    save_config: Option<Option<PathBuf>>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// USB bulk transfer timeout in milliseconds (0 = block indefinitely)
    #[arg(long, value_name = "MS")]
    usb_timeout_ms: Option<u64>,

    /// Number of one-second discovery attempts
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    attempts: Option<u32>,
}

fn parse_channel(name: &str) -> Result<&'static ChannelDescriptor, String> {
    registry::lookup(name).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.save_config {
        let path = path.unwrap_or_else(BridgeConfig::default_path);
        BridgeConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Checked before any USB call.
    let Some(channel) = args.channel else {
        Args::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                format!(
                    "a channel is required (valid channels: {})",
                    registry::names().join(", ")
                ),
            )
            .exit();
    };

    let mut config = match args.config {
        Some(ref path) => BridgeConfig::load(path).context("Failed to load configuration")?,
        None => BridgeConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(timeout) = args.usb_timeout_ms {
        config.usb.timeout_ms = timeout;
    }
    if let Some(attempts) = args.attempts {
        config.discovery.attempts = attempts;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.log_level).context("Failed to setup logging")?;

    info!("inq1-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Channel '{}': interface {}, endpoint {:#04x}",
        channel.name, channel.usb_interface, channel.usb_endpoint
    );

    run_bridge(channel, &config).await
}

/// Locate, claim, allocate, relay; then release on every path
async fn run_bridge(channel: &'static ChannelDescriptor, config: &BridgeConfig) -> Result<()> {
    let policy = config.discovery_policy();
    let device = tokio::task::spawn_blocking(move || -> Result<_, UsbError> {
        let bus = UsbBus::new()?;
        usb::locate(&bus, INQ1, policy)
    })
    .await
    .context("USB discovery task failed")?
    .context("Device discovery failed")?;

    let claim = Arc::new(
        usb::establish(&device, channel, config.session_options())
            .context("Failed to establish USB session")?,
    );

    let terminal = pty::allocate().context("Failed to allocate terminal")?;
    terminal
        .publish(std::io::stdout().lock())
        .context("Failed to publish terminal path")?;

    let reader = terminal
        .reader(config.terminal_poll())
        .context("Failed to clone pty master")?;
    let writer = terminal.writer().context("Failed to clone pty master")?;

    let relay = engine::spawn(claim.clone(), reader, writer, config.transfer_policy())
        .context("Failed to start relay")?;

    let (end, _) = supervise(relay, claim, interrupted()).await;
    drop(terminal);

    match end {
        SessionEnd::Interrupted => Ok(()),
        SessionEnd::Stopped(report) => match report.result {
            Err(e) => Err(anyhow!(e).context(format!("{} relay stopped", report.direction))),
            Ok(()) => Err(anyhow!("{} relay stopped unexpectedly", report.direction)),
        },
        SessionEnd::Vanished => Err(anyhow!("relay loops ended without reporting")),
    }
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Error waiting for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
