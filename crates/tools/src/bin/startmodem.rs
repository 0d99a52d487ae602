//! INQ1 modem start
//!
//! Sends the start sequence to the diagnostics channel so the modem channel
//! accepts AT commands.

use anyhow::{Context, Result};
use clap::Parser;
use common::registry::{self, INQ1};
use common::setup_logging;
use common::usb::{self, DiscoveryPolicy, SessionOptions, UsbBus};
use tools::modem_start::{self, DEFAULT_APN};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "inq1-startmodem")]
#[command(author, version, about = "Run the INQ1 modem start sequence")]
struct Args {
    /// Access point name sent with the start sequence
    #[arg(long, default_value = DEFAULT_APN)]
    apn: String,

    /// Number of one-second discovery attempts
    #[arg(
        long,
        value_name = "N",
        default_value_t = DiscoveryPolicy::default().attempts,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    attempts: u32,

    /// Leave a bound kernel driver in place instead of detaching it
    #[arg(long)]
    keep_kernel_driver: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to setup logging")?;

    let commands = modem_start::command_sequence(&args.apn)?;
    let channel = registry::lookup("diag")?;

    let policy = DiscoveryPolicy {
        attempts: args.attempts,
        ..DiscoveryPolicy::default()
    };
    let bus = UsbBus::new()?;
    let device = usb::locate(&bus, INQ1, policy).context("Device discovery failed")?;

    let claim = usb::establish(
        &device,
        channel,
        SessionOptions {
            detach_kernel_driver: !args.keep_kernel_driver,
        },
    )
    .context("Failed to establish USB session")?;

    modem_start::run_sequence(&claim, &commands, std::io::stdout().lock())?;
    info!("Start sequence complete");

    drop(claim);
    Ok(())
}
