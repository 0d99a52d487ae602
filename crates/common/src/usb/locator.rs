//! Device discovery
//!
//! Scans the bus for the first device whose descriptor matches a
//! [`DeviceIdentity`], retrying on a fixed interval for a bounded number of
//! attempts. The device usually re-enumerates after the unlock request, so it
//! may take a few seconds to appear.

use super::UsbError;
use crate::registry::DeviceIdentity;
use rusb::{Context, Device, UsbContext};
use std::time::Duration;
use tracing::{debug, info};

/// How long to keep polling for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Number of scans before giving up
    pub attempts: u32,
    /// Sleep between scans
    pub poll_interval: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Something that can be scanned for a matching device
pub trait DeviceSource {
    type Device;

    /// Enumerate once and return the first match in enumeration order
    fn scan(&self, identity: DeviceIdentity) -> rusb::Result<Option<Self::Device>>;
}

/// The host's USB buses, through libusb
pub struct UsbBus {
    context: Context,
}

impl UsbBus {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(UsbError::Context)?;
        Ok(Self { context })
    }
}

impl DeviceSource for UsbBus {
    type Device = Device<Context>;

    fn scan(&self, identity: DeviceIdentity) -> rusb::Result<Option<Self::Device>> {
        let devices = self.context.devices()?;

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device bus={} addr={}: no descriptor ({})",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if identity.matches(desc.vendor_id(), desc.product_id()) {
                debug!(
                    "Matched {} at bus={} addr={}",
                    identity,
                    device.bus_number(),
                    device.address()
                );
                return Ok(Some(device));
            }
        }

        Ok(None)
    }
}

/// Poll `source` until a device matching `identity` appears
///
/// Returns [`UsbError::DeviceNotFound`] once `policy.attempts` scans have come
/// up empty. An enumeration failure ends discovery immediately.
pub fn locate<S: DeviceSource>(
    source: &S,
    identity: DeviceIdentity,
    policy: DiscoveryPolicy,
) -> Result<S::Device, UsbError> {
    info!("waiting for USB device {}...", identity);

    for attempt in 1..=policy.attempts {
        if let Some(device) = source.scan(identity).map_err(UsbError::Enumerate)? {
            info!("Found USB device {} (attempt {})", identity, attempt);
            return Ok(device);
        }

        if attempt < policy.attempts {
            std::thread::sleep(policy.poll_interval);
        }
    }

    Err(UsbError::DeviceNotFound {
        identity,
        attempts: policy.attempts,
    })
}
