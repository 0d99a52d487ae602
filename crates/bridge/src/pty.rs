//! Pseudo-terminal allocation
//!
//! The master side is switched to raw mode because the channel carries an
//! opaque byte stream (AT commands, NMEA sentences, binary diagnostics) that
//! must reach the device untouched. The slave descriptor is kept open for the
//! lifetime of the pair so tools can attach and detach without the master
//! seeing a hang-up.

use crate::error::TerminalError;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::{OpenptyResult, openpty};
use nix::sys::termios::{SetArg, cfmakeraw, tcgetattr, tcsetattr};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// A raw-mode pty pair
pub struct TerminalPair {
    master: File,
    _slave: OwnedFd,
    slave_path: PathBuf,
}

/// Allocate a pty pair and put it in raw mode
pub fn allocate() -> Result<TerminalPair, TerminalError> {
    let OpenptyResult { master, slave } = openpty(None, None).map_err(TerminalError::Open)?;

    let mut termios = tcgetattr(master.as_fd()).map_err(TerminalError::RawMode)?;
    cfmakeraw(&mut termios);
    tcsetattr(master.as_fd(), SetArg::TCSANOW, &termios).map_err(TerminalError::RawMode)?;

    let slave_path = nix::unistd::ttyname(slave.as_fd()).map_err(TerminalError::SlavePath)?;

    info!("Allocated pty {}", slave_path.display());

    Ok(TerminalPair {
        master: File::from(master),
        _slave: slave,
        slave_path,
    })
}

impl TerminalPair {
    /// Path external tools open to reach the channel
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Print the slave path as a single line and flush
    pub fn publish<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out, "{}", self.slave_path.display())?;
        out.flush()
    }

    /// Reader over a clone of the master that wakes up every `tick`
    pub fn reader(&self, tick: Duration) -> io::Result<PtyReader> {
        Ok(PtyReader {
            master: self.master.try_clone()?,
            tick,
        })
    }

    /// Writer over a clone of the master
    pub fn writer(&self) -> io::Result<File> {
        self.master.try_clone()
    }
}

/// Master-side reader with a bounded wait
///
/// `read` waits at most `tick` for the master to become readable and reports
/// `TimedOut` when nothing arrived, so the relay loop can check for a stop
/// request between reads.
pub struct PtyReader {
    master: File,
    tick: Duration,
}

impl PtyReader {
    fn wait_readable(&self) -> io::Result<bool> {
        let millis = self.tick.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Err(io::ErrorKind::Interrupted.into()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.wait_readable()? {
            return Err(io::ErrorKind::TimedOut.into());
        }

        // POLLHUP/POLLERR also wake us; the read then surfaces the error.
        let n = self.master.read(buf)?;
        debug!("pty read {} bytes", n);
        Ok(n)
    }
}
