//! Claimed interface ownership
//!
//! [`ClaimedInterface`] is the only owner of the device handle once a channel
//! has been claimed. Dropping it releases the interface, hands the interface
//! back to its kernel driver if we took it away, and then closes the handle.

use super::{BulkPipe, UsbError};
use crate::registry::ChannelDescriptor;
use rusb::{Context, Device, DeviceHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Claim behaviour
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Detach a bound kernel driver before claiming, reattach on release
    pub detach_kernel_driver: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            detach_kernel_driver: true,
        }
    }
}

/// An open device with one interface claimed for a channel
pub struct ClaimedInterface {
    handle: DeviceHandle<Context>,
    channel: &'static ChannelDescriptor,
    reattach_kernel_driver: bool,
}

/// Open `device` and claim the interface carrying `channel`
///
/// On a claim failure the handle is closed before returning.
pub fn establish(
    device: &Device<Context>,
    channel: &'static ChannelDescriptor,
    options: SessionOptions,
) -> Result<ClaimedInterface, UsbError> {
    let handle = open(device)?;
    ClaimedInterface::claim(handle, channel, options)
}

/// Open a handle to a located device
pub fn open(device: &Device<Context>) -> Result<DeviceHandle<Context>, UsbError> {
    let handle = device.open().map_err(|e| {
        warn!("Failed to open device: {}", e);
        UsbError::Open(e)
    })?;

    debug!(
        "Opened device bus={} addr={}",
        device.bus_number(),
        device.address()
    );
    Ok(handle)
}

impl ClaimedInterface {
    /// Take exclusive ownership of the channel's interface
    pub fn claim(
        mut handle: DeviceHandle<Context>,
        channel: &'static ChannelDescriptor,
        options: SessionOptions,
    ) -> Result<Self, UsbError> {
        let interface = channel.usb_interface;
        let mut reattach_kernel_driver = false;

        if options.detach_kernel_driver {
            match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    match handle.detach_kernel_driver(interface) {
                        Ok(()) => reattach_kernel_driver = true,
                        // Claiming will most likely fail next and report the real cause.
                        Err(e) => warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        ),
                    }
                }
                Ok(false) => {
                    debug!("No kernel driver active on interface {}", interface);
                }
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface, e
                    );
                }
            }
        }

        if let Err(source) = handle.claim_interface(interface) {
            if reattach_kernel_driver {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(UsbError::Claim { interface, source });
        }

        info!(
            "Claimed interface {} for channel '{}' (endpoint {:#04x})",
            interface, channel.name, channel.usb_endpoint
        );

        Ok(Self {
            handle,
            channel,
            reattach_kernel_driver,
        })
    }
}

impl BulkPipe for ClaimedInterface {
    fn write_bulk(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle
            .write_bulk(self.channel.out_address(), data, timeout)
    }

    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle
            .read_bulk(self.channel.in_address(), buf, timeout)
    }
}

impl Drop for ClaimedInterface {
    fn drop(&mut self) {
        let interface = self.channel.usb_interface;

        match self.handle.release_interface(interface) {
            Ok(()) => debug!("Released interface {}", interface),
            // NoDevice is the usual outcome after an unplug.
            Err(e) => debug!("Failed to release interface {}: {}", interface, e),
        }

        if self.reattach_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", interface);
            }
        }

        info!("Closed device (channel '{}')", self.channel.name);
    }
}
