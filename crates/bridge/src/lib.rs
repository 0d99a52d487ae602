//! USB-to-terminal bridge for the INQ1 modem
//!
//! Claims one INQ1 interface, allocates a pseudo-terminal and relays bytes in
//! both directions so terminal tools (dialers, AT utilities, NMEA readers) can
//! talk to the hardware through the pty slave.
//!
//! - [`pty`] allocates the raw-mode terminal pair
//! - [`engine`] runs the two relay loops and supervises them
//! - [`supervisor`] ends the session and releases the device
//! - [`config`] holds the transfer and discovery policy

pub mod config;
pub mod engine;
pub mod error;
pub mod pty;
pub mod supervisor;

pub use config::BridgeConfig;
pub use engine::{Bridge, Direction, LoopReport, TransferPolicy};
pub use error::{BridgeError, TerminalError};
pub use pty::{PtyReader, TerminalPair};
pub use supervisor::{SessionEnd, supervise};
