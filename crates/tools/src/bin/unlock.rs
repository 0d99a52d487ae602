//! INQ1 interface unlock
//!
//! Sends the SCSI command that exposes the modem, diagnostics and GPS
//! interfaces. Point it at the device's generic SCSI node (e.g. `/dev/sg2`).

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::path::PathBuf;
use tools::scsi_unlock::{self, UnlockOutcome};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "inq1-unlock")]
#[command(author, version, about = "Expose the hidden INQ1 USB interfaces")]
struct Args {
    /// Generic SCSI device node of the INQ1
    #[arg(value_name = "DEVICE")]
    device: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to setup logging")?;

    match scsi_unlock::unlock(&args.device)? {
        UnlockOutcome::Completed => info!("Unlock command accepted"),
        UnlockOutcome::Rejected {
            status,
            host_status,
            driver_status,
            sense,
        } => warn!(
            "Unlock command completed with status {:#04x} (host {:#06x}, driver {:#06x}, sense {:02x?})",
            status, host_status, driver_status, sense
        ),
        UnlockOutcome::Disconnected(errno) => {
            warn!("Device dropped off during unlock ({}); expected on re-enumeration", errno)
        }
    }

    Ok(())
}
