//! SCSI unlock request
//!
//! Out of the box the INQ1 presents itself as a mass-storage device. A SEEK(6)
//! submitted through the Linux generic SCSI driver makes it drop off the bus
//! and come back with the modem, diagnostics and GPS interfaces.

use nix::errno::Errno;
use std::ffi::{c_int, c_uint, c_ushort, c_void};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// SCSI SEEK(6) to LBA 0
pub const UNLOCK_COMMAND: [u8; 6] = [0x2b, 0x00, 0x00, 0x00, 0x00, 0x00];

const SG_INTERFACE_ID: c_int = b'S' as c_int;
const SG_DXFER_NONE: c_int = -1;
const SG_INFO_OK_MASK: c_uint = 0x1;
const SG_IO_TIMEOUT_MS: c_uint = 5000;
const SENSE_LEN: usize = 32;

/// `sg_io_hdr_t` from `<scsi/sg.h>`
#[repr(C)]
#[derive(Debug)]
pub struct SgIoHdr {
    pub interface_id: c_int,
    pub dxfer_direction: c_int,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: c_ushort,
    pub dxfer_len: c_uint,
    pub dxferp: *mut c_void,
    pub cmdp: *mut u8,
    pub sbp: *mut u8,
    pub timeout: c_uint,
    pub flags: c_uint,
    pub pack_id: c_int,
    pub usr_ptr: *mut c_void,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: c_ushort,
    pub driver_status: c_ushort,
    pub resid: c_int,
    pub duration: c_uint,
    pub info: c_uint,
}

impl SgIoHdr {
    /// Header for a command with no data phase
    ///
    /// The pointers borrow `cmd` and `sense`; both must outlive the request.
    pub fn no_data(cmd: &mut [u8], sense: &mut [u8]) -> Self {
        Self {
            interface_id: SG_INTERFACE_ID,
            dxfer_direction: SG_DXFER_NONE,
            cmd_len: cmd.len() as u8,
            mx_sb_len: sense.len() as u8,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: std::ptr::null_mut(),
            cmdp: cmd.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: SG_IO_TIMEOUT_MS,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }

    fn completed_ok(&self) -> bool {
        self.info & SG_INFO_OK_MASK == 0
    }
}

nix::ioctl_readwrite_bad!(sg_io, 0x2285, SgIoHdr);

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("{}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("SG_IO failed: {0}")]
    Submit(#[source] Errno),
}

/// How the request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// The command completed with good status
    Completed,
    /// The command completed with an error status
    Rejected {
        status: u8,
        host_status: u16,
        driver_status: u16,
        sense: Vec<u8>,
    },
    /// The device went away while the request was in flight
    Disconnected(Errno),
}

/// Submit the unlock command to the generic SCSI node at `path`
pub fn unlock(path: &Path) -> Result<UnlockOutcome, UnlockError> {
    let node = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| UnlockError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let mut cmd = UNLOCK_COMMAND;
    let mut sense = [0u8; SENSE_LEN];
    let mut hdr = SgIoHdr::no_data(&mut cmd, &mut sense);

    debug!("Submitting SG_IO {:02x?} to {}", UNLOCK_COMMAND, path.display());

    // SAFETY: the header matches sg_io_hdr_t and its buffers live on this
    // frame for the duration of the synchronous call.
    let result = unsafe { sg_io(node.as_raw_fd(), &mut hdr) };

    let sense_len = (hdr.sb_len_wr as usize).min(SENSE_LEN);
    let outcome = classify(result.map(drop), &hdr, &sense[..sense_len])?;
    info!("Unlock request on {}: {:?}", path.display(), outcome);
    Ok(outcome)
}

/// Map the ioctl result and completion fields to an outcome
fn classify(
    result: nix::Result<()>,
    hdr: &SgIoHdr,
    sense: &[u8],
) -> Result<UnlockOutcome, UnlockError> {
    match result {
        Ok(()) if hdr.completed_ok() => Ok(UnlockOutcome::Completed),
        Ok(()) => Ok(UnlockOutcome::Rejected {
            status: hdr.status,
            host_status: hdr.host_status,
            driver_status: hdr.driver_status,
            sense: sense.to_vec(),
        }),
        Err(errno @ (Errno::ENODEV | Errno::EIO)) => Ok(UnlockOutcome::Disconnected(errno)),
        Err(errno) => Err(UnlockError::Submit(errno)),
    }
}
