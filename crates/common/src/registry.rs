//! Compiled-in channel and device tables
//!
//! The INQ1 exposes several serial-style functions, each on its own USB
//! interface with one bulk endpoint pair. The table is fixed at build time;
//! selecting a name that is not listed is a configuration error.

use std::fmt;

/// One selectable channel: the interface to claim and its bulk endpoint number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Name given on the command line
    pub name: &'static str,
    /// USB interface number carrying this channel
    pub usb_interface: u8,
    /// Bulk endpoint number (direction bit not included)
    pub usb_endpoint: u8,
}

impl ChannelDescriptor {
    /// Endpoint address for device-to-host bulk transfers
    pub const fn in_address(&self) -> u8 {
        self.usb_endpoint | 0x80
    }

    /// Endpoint address for host-to-device bulk transfers
    pub const fn out_address(&self) -> u8 {
        self.usb_endpoint & 0x7f
    }
}

/// Supported channels, in the order they are listed in usage output
///
/// Endpoint 1 on the modem interface is an interrupt endpoint and is not
/// bridged.
pub const CHANNELS: &[ChannelDescriptor] = &[
    ChannelDescriptor {
        name: "modem",
        usb_interface: 0,
        usb_endpoint: 0x02,
    },
    ChannelDescriptor {
        name: "diag",
        usb_interface: 2,
        usb_endpoint: 0x06,
    },
    ChannelDescriptor {
        name: "nmea",
        usb_interface: 3,
        usb_endpoint: 0x08,
    },
    ChannelDescriptor {
        name: "pcsync",
        usb_interface: 4,
        usb_endpoint: 0x0a,
    },
];

/// Look up a channel by name
pub fn lookup(name: &str) -> crate::Result<&'static ChannelDescriptor> {
    CHANNELS
        .iter()
        .find(|channel| channel.name == name)
        .ok_or_else(|| crate::Error::UnknownChannel {
            name: name.to_string(),
            valid: names().join(", "),
        })
}

/// All channel names in table order
pub fn names() -> Vec<&'static str> {
    CHANNELS.iter().map(|channel| channel.name).collect()
}

/// Vendor/product pair used to find the device during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Exact match on both identifiers
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Amoi INQ1
pub const INQ1: DeviceIdentity = DeviceIdentity {
    vendor_id: 0x1614,
    product_id: 0x0408,
};
