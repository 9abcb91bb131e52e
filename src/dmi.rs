//! The Debug Module Interface seam.
//!
//! Everything the back end does ultimately reduces to 32-bit register reads
//! and writes against the Debug Module, addressed by a 7-bit (nominally up
//! to 16-bit) DMI address. How those accesses reach the hardware (JTAG,
//! a simulator socket, memory-mapped into a softcore fabric) is out of
//! scope here; implement [`DmiAccess`] for your transport and hand it to
//! [`DebugModule`](crate::DebugModule).

use thiserror::Error;

/// Error reported by a DMI transport.
#[derive(Debug, Error)]
pub enum DmiError {
    /// The transport reported that the operation failed.
    #[error("the DMI operation failed")]
    OperationFailed,
    /// The transport is no longer connected to the Debug Module.
    #[error("the DMI transport is disconnected")]
    Disconnected,
    /// Transport-specific failure.
    #[error("DMI transport error: {0}")]
    Other(String),
}

/// Access to the Debug Module Interface.
pub trait DmiAccess {
    /// Read the 32-bit DM register at `addr`.
    fn dmi_read(&mut self, addr: u16) -> Result<u32, DmiError>;

    /// Write the 32-bit DM register at `addr`.
    fn dmi_write(&mut self, addr: u16, value: u32) -> Result<(), DmiError>;
}

/// A transport that is not wired to any hardware.
///
/// Reads return zero and writes are dropped, which lets the server run (and
/// the front end be exercised) without a Debug Module attached. Note that a
/// zero `dmstatus` reads as "no debug module present", so `monitor reset_dm`
/// against this transport reports exactly that.
#[derive(Debug, Default)]
pub struct NullDmi;

impl DmiAccess for NullDmi {
    fn dmi_read(&mut self, addr: u16) -> Result<u32, DmiError> {
        tracing::trace!("dmi_read({addr:#04x}) => 0 (no transport)");
        Ok(0)
    }

    fn dmi_write(&mut self, addr: u16, value: u32) -> Result<(), DmiError> {
        tracing::trace!("dmi_write({addr:#04x}, {value:#010x}) dropped (no transport)");
        Ok(())
    }
}
