//! Bridge error types

use crate::engine::Direction;
use thiserror::Error;

/// Why a relay loop stopped
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The terminal master reported end-of-file
    #[error("read failed: terminal closed")]
    TerminalEof,

    #[error("read failed: {0}")]
    TerminalRead(#[source] std::io::Error),

    #[error("write failed: {0}")]
    TerminalWrite(#[source] std::io::Error),

    #[error("usb_bulk_write failed: {0:?}")]
    UsbWrite(#[source] rusb::Error),

    /// A bulk write reported success without taking any bytes
    #[error("usb_bulk_write made no progress with {remaining} bytes pending")]
    UsbWriteStalled { remaining: usize },

    #[error("usb_bulk_read failed: {0:?}")]
    UsbRead(#[source] rusb::Error),

    /// A bulk read completed with no data
    #[error("usb_bulk_read returned no data")]
    UsbReadEmpty,

    #[error("failed to start {direction} relay: {source}")]
    Spawn {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} relay panicked")]
    Panicked(Direction),
}

/// Pseudo-terminal allocation failures
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("openpty failed: {0}")]
    Open(#[source] nix::Error),

    #[error("failed to set raw mode: {0}")]
    RawMode(#[source] nix::Error),

    #[error("failed to resolve pty slave path: {0}")]
    SlavePath(#[source] nix::Error),
}
