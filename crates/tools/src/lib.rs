//! One-shot INQ1 preparation tools
//!
//! - [`scsi_unlock`] sends the SCSI command that makes the modem, diagnostics
//!   and GPS interfaces appear
//! - [`modem_start`] runs the start sequence on the diagnostics channel

pub mod modem_start;
pub mod scsi_unlock;
