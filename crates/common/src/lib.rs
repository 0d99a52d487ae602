//! Common building blocks for inq1-usbserial
//!
//! This crate provides the pieces shared by the terminal bridge and the
//! one-shot tools: the compiled-in channel registry, USB discovery and
//! interface claiming, error types, logging setup, and test doubles for the
//! USB side of a session.

pub mod error;
pub mod logging;
pub mod registry;
pub mod test_utils;
pub mod usb;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use registry::{CHANNELS, ChannelDescriptor, DeviceIdentity, INQ1};
pub use usb::{BulkPipe, ClaimedInterface, DiscoveryPolicy, UsbError};
