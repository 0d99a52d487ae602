//! Modem start sequence
//!
//! Three NUL-padded text commands are written to the diagnostics channel
//! before the modem interface answers AT commands. After each command the
//! replies are drained and echoed.

use common::BulkPipe;
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// APN used when none is given
pub const DEFAULT_APN: &str = "three.co.uk";

/// Per-transfer timeout for commands and replies
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Size of each reply read
pub const REPLY_CHUNK: usize = 32;

const SHORT_FRAME: usize = 12;
const APN_FRAME: usize = 32;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("APN '{apn}' too long: '{prefix}<apn>' must fit in {max} bytes")]
    ApnTooLong {
        apn: String,
        prefix: &'static str,
        max: usize,
    },

    #[error("usb_bulk_write failed for {command}: {source:?}")]
    Write {
        command: &'static str,
        #[source]
        source: rusb::Error,
    },

    #[error("usb_bulk_write failed for {command}: wrote {written} of {expected} bytes")]
    ShortWrite {
        command: &'static str,
        written: usize,
        expected: usize,
    },

    #[error("failed to print reply: {0}")]
    Output(#[from] io::Error),
}

/// One command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub label: &'static str,
    pub frame: Vec<u8>,
}

/// Zero-pad `text` to `len` bytes, keeping at least one trailing NUL
fn padded(text: &str, len: usize) -> Option<Vec<u8>> {
    if text.len() >= len {
        return None;
    }
    let mut frame = text.as_bytes().to_vec();
    frame.resize(len, 0);
    Some(frame)
}

/// Build the CANSTART, MODEMBEGIN, APN sequence
pub fn command_sequence(apn: &str) -> Result<Vec<Command>, StartError> {
    const APN_PREFIX: &str = "APN:";

    let apn_frame =
        padded(&format!("{}{}", APN_PREFIX, apn), APN_FRAME).ok_or_else(|| {
            StartError::ApnTooLong {
                apn: apn.to_string(),
                prefix: APN_PREFIX,
                max: APN_FRAME - 1,
            }
        })?;

    let fixed = |label: &'static str| Command {
        label,
        // Both fixed commands are shorter than the frame.
        frame: padded(label, SHORT_FRAME).unwrap_or_default(),
    };

    Ok(vec![
        fixed("CANSTART"),
        fixed("MODEMBEGIN"),
        Command {
            label: "APN",
            frame: apn_frame,
        },
    ])
}

/// Write each command and echo its replies to `out`
pub fn run_sequence<P, W>(pipe: &P, commands: &[Command], mut out: W) -> Result<(), StartError>
where
    P: BulkPipe + ?Sized,
    W: Write,
{
    for command in commands {
        send(pipe, command)?;
        drain_replies(pipe, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

fn send<P: BulkPipe + ?Sized>(pipe: &P, command: &Command) -> Result<(), StartError> {
    let written = pipe
        .write_bulk(&command.frame, COMMAND_TIMEOUT)
        .map_err(|source| StartError::Write {
            command: command.label,
            source,
        })?;

    if written != command.frame.len() {
        return Err(StartError::ShortWrite {
            command: command.label,
            written,
            expected: command.frame.len(),
        });
    }

    info!("Sent {} ({} bytes)", command.label, written);
    Ok(())
}

/// Read replies until the device goes quiet
fn drain_replies<P, W>(pipe: &P, out: &mut W) -> Result<(), StartError>
where
    P: BulkPipe + ?Sized,
    W: Write,
{
    let mut buf = [0u8; REPLY_CHUNK];

    loop {
        match pipe.read_bulk(&mut buf, COMMAND_TIMEOUT) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                write!(out, "nread = {} ", n)?;
                out.write_all(&buf[..n])?;
                writeln!(out)?;
            }
            Err(e) => {
                debug!("reply drain ended: {:?}", e);
                return Ok(());
            }
        }
    }
}
