//! USB subsystem
//!
//! Discovery of the target device and ownership of the claimed interface.
//!
//! - [`locator`] polls the bus until a device with the wanted identity shows up
//! - [`session`] opens it, claims one interface and releases it on drop
//!
//! The relay loops only see the [`BulkPipe`] trait, which lets them run against
//! scripted pipes in tests.

pub mod locator;
pub mod session;

use crate::registry::DeviceIdentity;
use std::time::Duration;
use thiserror::Error;

pub use locator::{DeviceSource, DiscoveryPolicy, UsbBus, locate};
pub use session::{ClaimedInterface, SessionOptions, establish};

/// Errors raised while finding and claiming the device
#[derive(Debug, Error)]
pub enum UsbError {
    #[error("failed to initialize libusb: {0}")]
    Context(#[source] rusb::Error),

    #[error("failed to enumerate USB devices: {0}")]
    Enumerate(#[source] rusb::Error),

    #[error("timeout: USB device {identity} not found after {attempts} attempts")]
    DeviceNotFound {
        identity: DeviceIdentity,
        attempts: u32,
    },

    #[error("usb_open failed: {0:?}")]
    Open(#[source] rusb::Error),

    #[error("usb_claim_interface {interface} failed: {source:?}")]
    Claim {
        interface: u8,
        #[source]
        source: rusb::Error,
    },
}

/// Bulk endpoint pair of a claimed interface
///
/// Both methods take `&self` so one thread can write while another reads.
pub trait BulkPipe: Send + Sync {
    /// Write to the OUT endpoint, returning the number of bytes accepted
    fn write_bulk(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Read from the IN endpoint, returning the number of bytes received
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

/// Whether a transfer error may be retried in place
///
/// A timed out bulk call is the only condition the relay treats as transient.
pub fn is_transient(err: &rusb::Error) -> bool {
    matches!(err, rusb::Error::Timeout)
}
