//! GDB remote-serial-protocol server for RISC-V harts debugged through a
//! Debug Module conforming to v0.13 of the RISC-V External Debug Support
//! specification.
//!
//! The crate is split into two halves. The *front end* ([`stub::GdbStub`])
//! speaks GDB's Remote Serial Protocol over a byte stream: it reassembles
//! `$…#cc` frames from arbitrary read boundaries, validates checksums,
//! dispatches command packets, and encodes responses. The *back end*
//! ([`DebugModule`]) translates each debugger operation into a sequence of
//! 32-bit reads and writes on the Debug Module Interface: the Abstract
//! Command protocol for register access and the System Bus protocol for
//! memory access, including the busy polling and error recovery each
//! requires.
//!
//! The physical DMI transport is pluggable through [`DmiAccess`]; the
//! crate only assumes `dmi_read(addr) -> u32` and `dmi_write(addr, u32)`.

pub mod dmi;
pub mod elf;
pub mod protocol;
pub mod registers;
pub mod server;
pub mod stub;

mod debug_module;

pub use debug_module::{DebugModule, DmError, PollConfig, RunMode, StopPoll};
pub use dmi::{DmiAccess, DmiError, NullDmi};
pub use server::{GdbServer, StopHandle};
pub use stub::{GdbStub, SessionError, StubConfig};

use std::fmt;

/// Native register width of the debugged hart.
///
/// The width selects the Abstract Command access size and the number of hex
/// digits per register value on the RSP wire. It defaults to 64 and can be
/// changed at runtime (`monitor xlen`) or picked up from a loaded ELF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlen {
    /// 32-bit registers (RV32).
    Rv32,
    /// 64-bit registers (RV64).
    Rv64,
}

impl Xlen {
    /// Parse a width in bits; only 32 and 64 are valid.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(Xlen::Rv32),
            64 => Some(Xlen::Rv64),
            _ => None,
        }
    }

    /// Register width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Register width in bytes.
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Number of ASCII hex digits a register value occupies on the wire.
    pub fn hex_digits(self) -> usize {
        self.bits() as usize / 4
    }
}

impl fmt::Display for Xlen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RV{}", self.bits())
    }
}
