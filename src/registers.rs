//! Register-level codec for the RISC-V Debug Module.
//!
//! Field layouts follow v0.13 of the RISC-V External Debug Support
//! specification. Each DM register is a newtype over its 32-bit raw value
//! with typed bitfield accessors; [`DebugRegister`] ties the type to its
//! fixed DMI address.

use bitfield::bitfield;

/// A 32-bit register in the Debug Module address space.
pub trait DebugRegister: From<u32> + Into<u32> {
    /// DMI address of the register.
    const ADDRESS: u8;
    /// Register name, as spelled in the debug specification.
    const NAME: &'static str;
}

macro_rules! data_register {
    ($(#[$outer:meta])* $name:ident, $addr:expr, $reg_name:expr) => {
        $(#[$outer])*
        #[derive(Debug, Copy, Clone)]
        pub struct $name(pub u32);

        impl DebugRegister for $name {
            const ADDRESS: u8 = $addr;
            const NAME: &'static str = $reg_name;
        }

        impl From<$name> for u32 {
            fn from(register: $name) -> Self {
                register.0
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

bitfield! {
    /// The `dmcontrol` register, at DM address 0x10.
    #[derive(Copy, Clone)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub u16, hartsello, set_hartsello: 25, 16;
    pub u16, hartselhi, set_hartselhi: 15, 6;
    pub setresethaltreq, set_setresethaltreq: 3;
    pub clrresethaltreq, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl DebugRegister for Dmcontrol {
    const ADDRESS: u8 = 0x10;
    const NAME: &'static str = "dmcontrol";
}

impl From<Dmcontrol> for u32 {
    fn from(register: Dmcontrol) -> Self {
        register.0
    }
}

impl From<u32> for Dmcontrol {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// The read-only `dmstatus` register, at DM address 0x11.
    #[derive(Copy, Clone)]
    pub struct Dmstatus(u32);
    impl Debug;

    pub impebreak, _: 22;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allnonexistent, _: 15;
    pub anynonexistent, _: 14;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub authbusy, _: 6;
    pub hasresethaltreq, _: 5;
    pub confstrptrvalid, _: 4;
    pub u8, version, _: 3, 0;
}

impl DebugRegister for Dmstatus {
    const ADDRESS: u8 = 0x11;
    const NAME: &'static str = "dmstatus";
}

impl From<Dmstatus> for u32 {
    fn from(register: Dmstatus) -> Self {
        register.0
    }
}

impl From<u32> for Dmstatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// The `abstractcs` register, at DM address 0x16.
    ///
    /// `cmderr` is write-1-to-clear; write [`CMDERR_W1C`] into the field to
    /// reset it.
    #[derive(Copy, Clone)]
    pub struct Abstractcs(u32);
    impl Debug;

    pub u8, progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub u8, cmderr, set_cmderr: 10, 8;
    pub u8, datacount, _: 4, 0;
}

impl DebugRegister for Abstractcs {
    const ADDRESS: u8 = 0x16;
    const NAME: &'static str = "abstractcs";
}

impl From<Abstractcs> for u32 {
    fn from(register: Abstractcs) -> Self {
        register.0
    }
}

impl From<u32> for Abstractcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// The `command` register, at DM address 0x17, in its Access Register
    /// form (`cmdtype` 0).
    #[derive(Copy, Clone)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    pub u8, cmd_type, set_cmd_type: 31, 24;
    pub u8, from into RiscvBusAccess, _, set_aarsize: 22, 20;
    pub aarpostincrement, set_aarpostincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub u16, regno, set_regno: 15, 0;
}

impl DebugRegister for AccessRegisterCommand {
    const ADDRESS: u8 = 0x17;
    const NAME: &'static str = "command";
}

impl From<AccessRegisterCommand> for u32 {
    fn from(register: AccessRegisterCommand) -> Self {
        register.0
    }
}

impl From<u32> for AccessRegisterCommand {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// The `sbcs` system-bus control register, at DM address 0x38.
    ///
    /// `sbbusyerror` and `sberror` are write-1-to-clear.
    #[derive(Copy, Clone)]
    pub struct Sbcs(u32);
    impl Debug;

    pub u8, sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub u8, from into RiscvBusAccess, _, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub u8, sberror, set_sberror: 14, 12;
    pub u8, sbasize, _: 11, 5;
    pub sbaccess128, _: 4;
    pub sbaccess64, _: 3;
    pub sbaccess32, _: 2;
    pub sbaccess16, _: 1;
    pub sbaccess8, _: 0;
}

impl DebugRegister for Sbcs {
    const ADDRESS: u8 = 0x38;
    const NAME: &'static str = "sbcs";
}

impl From<Sbcs> for u32 {
    fn from(register: Sbcs) -> Self {
        register.0
    }
}

impl From<u32> for Sbcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// The `dcsr` debug control/status CSR (0x7B0).
    ///
    /// Not a DM register; this is the value moved through the data
    /// registers by abstract commands.
    #[derive(Copy, Clone)]
    pub struct Dcsr(u32);
    impl Debug;

    pub u8, xdebugver, _: 31, 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stepie, set_stepie: 11;
    pub stopcount, set_stopcount: 10;
    pub stoptime, set_stoptime: 9;
    pub u8, cause, _: 8, 6;
    pub mprven, set_mprven: 4;
    pub nmip, _: 3;
    pub step, set_step: 2;
    pub u8, prv, set_prv: 1, 0;
}

data_register! { /** Abstract command data register 0, at DM address 0x04. */ Data0, 0x04, "data0" }
data_register! { /** Abstract command data register 1, at DM address 0x05. */ Data1, 0x05, "data1" }
data_register! { /** Abstract command data register 2, at DM address 0x06. */ Data2, 0x06, "data2" }
data_register! { /** Abstract command data register 3, at DM address 0x07. */ Data3, 0x07, "data3" }
data_register! { /** Abstract command data register 4, at DM address 0x08. */ Data4, 0x08, "data4" }
data_register! { /** Abstract command data register 5, at DM address 0x09. */ Data5, 0x09, "data5" }
data_register! { /** Abstract command data register 6, at DM address 0x0a. */ Data6, 0x0a, "data6" }
data_register! { /** Abstract command data register 7, at DM address 0x0b. */ Data7, 0x0b, "data7" }
data_register! { /** Abstract command data register 8, at DM address 0x0c. */ Data8, 0x0c, "data8" }
data_register! { /** Abstract command data register 9, at DM address 0x0d. */ Data9, 0x0d, "data9" }
data_register! { /** Abstract command data register 10, at DM address 0x0e. */ Data10, 0x0e, "data10" }
data_register! { /** Abstract command data register 11, at DM address 0x0f. */ Data11, 0x0f, "data11" }

data_register! { /** Hart information register, at DM address 0x12. */ Hartinfo, 0x12, "hartinfo" }
data_register! { /** Halt summary register, at DM address 0x13. */ Haltsum, 0x13, "haltsum" }
data_register! { /** Abstract command autoexec register, at DM address 0x18. */ Abstractauto, 0x18, "abstractauto" }
data_register! { /** First program buffer word, at DM address 0x20. */ Progbuf0, 0x20, "progbuf0" }

data_register! { /** System bus address bits 31:0, at DM address 0x39. */ Sbaddress0, 0x39, "sbaddress0" }
data_register! { /** System bus address bits 63:32, at DM address 0x3a. */ Sbaddress1, 0x3a, "sbaddress1" }
data_register! { /** System bus address bits 95:64, at DM address 0x3b. */ Sbaddress2, 0x3b, "sbaddress2" }

data_register! { /** System bus data bits 31:0, at DM address 0x3c. */ Sbdata0, 0x3c, "sbdata0" }
data_register! { /** System bus data bits 63:32, at DM address 0x3d. */ Sbdata1, 0x3d, "sbdata1" }
data_register! { /** System bus data bits 95:64, at DM address 0x3e. */ Sbdata2, 0x3e, "sbdata2" }
data_register! { /** System bus data bits 127:96, at DM address 0x3f. */ Sbdata3, 0x3f, "sbdata3" }

data_register! {
    /** Target verbosity scalar, at the non-standard DM address 0x60.
    Debug Modules that do not implement it ignore the write. */
    Verbosity, 0x60, "verbosity"
}

/// Debug-mode CSR addresses.
pub mod csr {
    /// Debug control and status.
    pub const DCSR: u16 = 0x7b0;
    /// Debug PC.
    pub const DPC: u16 = 0x7b1;
    /// Debug scratch register 0.
    pub const DSCRATCH0: u16 = 0x7b2;
    /// Debug scratch register 1.
    pub const DSCRATCH1: u16 = 0x7b3;
}

/// Register selector in the `command.regno` encoding: CSR x at x, GPR x at
/// 0x1000 + x, FPR x at 0x1020 + x.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterId(pub u16);

impl RegisterId {
    /// Base of the GPR range.
    pub const GPR_BASE: u16 = 0x1000;
    /// Base of the FPR range.
    pub const FPR_BASE: u16 = 0x1020;

    /// Selector for CSR `addr` (0x000..=0xFFF).
    pub fn csr(addr: u16) -> Self {
        debug_assert!(addr <= 0xfff);
        RegisterId(addr)
    }

    /// Selector for general-purpose register `x0`..`x31`.
    pub fn gpr(n: u8) -> Self {
        debug_assert!(n < 32);
        RegisterId(Self::GPR_BASE + u16::from(n))
    }

    /// Selector for floating-point register `f0`..`f31`.
    pub fn fpr(n: u8) -> Self {
        debug_assert!(n < 32);
        RegisterId(Self::FPR_BASE + u16::from(n))
    }
}

/// Access width for bus accesses, used both for `sbcs.sbaccess` and for the
/// abstract command `aarsize` field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd)]
pub enum RiscvBusAccess {
    /// 8 bits.
    A8 = 0,
    /// 16 bits.
    A16 = 1,
    /// 32 bits.
    A32 = 2,
    /// 64 bits.
    A64 = 3,
    /// 128 bits.
    A128 = 4,
}

impl From<RiscvBusAccess> for u8 {
    fn from(value: RiscvBusAccess) -> Self {
        value as u8
    }
}

/// Errors reported in `abstractcs.cmderr` after an abstract command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cmderr {
    /// No error.
    None = 0,
    /// A command was issued while `busy` was set.
    Busy = 1,
    /// The command is not supported.
    NotSupported = 2,
    /// The command raised an exception on the hart.
    Exception = 3,
    /// The hart was not in the required halted/running state.
    HaltResume = 4,
    /// A bus error occurred.
    Bus = 5,
    /// Reserved encoding.
    Reserved = 6,
    /// Any other failure.
    Other = 7,
}

/// Value written into `cmderr` to clear it (write-1-to-clear).
pub const CMDERR_W1C: u8 = Cmderr::Other as u8;

impl Cmderr {
    /// Decode the 3-bit `cmderr` field.
    pub fn from_bits(value: u8) -> Self {
        use Cmderr::*;

        match value {
            0 => None,
            1 => Busy,
            2 => NotSupported,
            3 => Exception,
            4 => HaltResume,
            5 => Bus,
            6 => Reserved,
            7 => Other,
            _ => panic!("cmderr is a 3 bit field, got {value}"),
        }
    }
}

/// Errors reported in `sbcs.sberror` after a system-bus access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Sberror {
    /// No error.
    None = 0,
    /// The bus access timed out.
    Timeout = 1,
    /// The address was not accepted by the bus.
    BadAddress = 2,
    /// The access was misaligned.
    Alignment = 3,
    /// The access size is not supported.
    UnsupportedSize = 4,
    /// Reserved encoding.
    Reserved5 = 5,
    /// Reserved encoding.
    Reserved6 = 6,
    /// Written by the debugger to clear the field (write-1-to-clear).
    Cleared = 7,
}

/// Value written into `sberror` to clear it (write-1-to-clear).
pub const SBERROR_W1C: u8 = Sberror::Cleared as u8;

impl Sberror {
    /// Decode the 3-bit `sberror` field.
    pub fn from_bits(value: u8) -> Self {
        use Sberror::*;

        match value {
            0 => None,
            1 => Timeout,
            2 => BadAddress,
            3 => Alignment,
            4 => UnsupportedSize,
            5 => Reserved5,
            6 => Reserved6,
            7 => Cleared,
            _ => panic!("sberror is a 3 bit field, got {value}"),
        }
    }
}

/// Debug Module versions, from the `dmstatus.version` field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugModuleVersion {
    /// No debug module is present.
    NoModule = 0,
    /// Version 0.11 of the debug specification.
    Version0_11 = 1,
    /// Version 0.13 of the debug specification.
    Version0_13 = 2,
    /// A debug module is present but conforms to no known version.
    NonConforming = 15,
}

impl DebugModuleVersion {
    /// Decode the 4-bit `version` field.
    pub fn from_bits(value: u8) -> Self {
        match value {
            0 => DebugModuleVersion::NoModule,
            1 => DebugModuleVersion::Version0_11,
            2 => DebugModuleVersion::Version0_13,
            _ => DebugModuleVersion::NonConforming,
        }
    }
}

/// Why the hart entered debug mode, from the `dcsr.cause` field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HaltCause {
    /// An `ebreak` instruction was executed.
    Ebreak,
    /// A trigger module match.
    Trigger,
    /// The debugger requested a halt.
    HaltRequest,
    /// Single-step completed.
    Step,
    /// Reserved encoding.
    Reserved(u8),
}

impl HaltCause {
    /// Decode the 3-bit `cause` field.
    pub fn from_bits(value: u8) -> Self {
        match value {
            1 => HaltCause::Ebreak,
            2 => HaltCause::Trigger,
            3 => HaltCause::HaltRequest,
            4 => HaltCause::Step,
            other => HaltCause::Reserved(other & 0x7),
        }
    }

    /// The raw field value, as reported to the debugger in `T` packets.
    pub fn bits(self) -> u8 {
        match self {
            HaltCause::Ebreak => 1,
            HaltCause::Trigger => 2,
            HaltCause::HaltRequest => 3,
            HaltCause::Step => 4,
            HaltCause::Reserved(other) => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dmcontrol_field_packing() {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_haltreq(true);
        dmcontrol.set_dmactive(true);
        assert_eq!(dmcontrol.0, 0x8000_0001);

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_resumereq(true);
        dmcontrol.set_dmactive(true);
        assert_eq!(dmcontrol.0, 0x4000_0001);

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_ndmreset(true);
        dmcontrol.set_dmactive(true);
        assert_eq!(dmcontrol.0, 0x0000_0003);
    }

    #[test]
    fn dmstatus_flags() {
        let dmstatus = Dmstatus(0x0000_0302);
        assert!(dmstatus.allhalted());
        assert!(dmstatus.anyhalted());
        assert_eq!(dmstatus.version(), 2);
        assert!(!dmstatus.anyunavail());
    }

    #[test]
    fn read_gpr2_rv64_command_encoding() {
        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_aarsize(RiscvBusAccess::A64);
        command.set_transfer(true);
        command.set_regno(RegisterId::gpr(2).0);
        assert_eq!(command.0, 0x0032_1002);
    }

    #[test]
    fn write_dpc_rv32_command_encoding() {
        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_aarsize(RiscvBusAccess::A32);
        command.set_transfer(true);
        command.set_write(true);
        command.set_regno(RegisterId::csr(csr::DPC).0);
        assert_eq!(command.0, 0x0023_07b1);
    }

    #[test]
    fn sbcs_read_setup_encoding() {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbbusyerror(true);
        sbcs.set_sbreadonaddr(true);
        sbcs.set_sbaccess(RiscvBusAccess::A32);
        sbcs.set_sbautoincrement(true);
        sbcs.set_sbreadondata(true);
        sbcs.set_sberror(SBERROR_W1C);
        assert_eq!(
            sbcs.0,
            (1 << 22) | (1 << 20) | (2 << 17) | (1 << 16) | (1 << 15) | (7 << 12)
        );
    }

    #[test]
    fn dcsr_fields() {
        // cause = step (4), step bit set, prv = machine.
        let dcsr = Dcsr((4 << 6) | (1 << 2) | 3);
        assert_eq!(dcsr.cause(), 4);
        assert!(dcsr.step());
        assert_eq!(dcsr.prv(), 3);

        let mut dcsr = Dcsr(0);
        dcsr.set_step(true);
        assert_eq!(dcsr.0, 1 << 2);
    }

    #[test]
    fn regno_encoding() {
        assert_eq!(RegisterId::gpr(0).0, 0x1000);
        assert_eq!(RegisterId::gpr(31).0, 0x101f);
        assert_eq!(RegisterId::fpr(0).0, 0x1020);
        assert_eq!(RegisterId::csr(csr::DCSR).0, 0x7b0);
    }

    #[test]
    fn cmderr_and_sberror_round_trip() {
        for bits in 0..8u8 {
            assert_eq!(Cmderr::from_bits(bits) as u8, bits);
            assert_eq!(Sberror::from_bits(bits) as u8, bits);
        }
    }

    #[test]
    fn halt_cause_bits() {
        assert_eq!(HaltCause::from_bits(3), HaltCause::HaltRequest);
        assert_eq!(HaltCause::from_bits(4), HaltCause::Step);
        assert_eq!(HaltCause::from_bits(0), HaltCause::Reserved(0));
        for bits in 0..8u8 {
            assert_eq!(HaltCause::from_bits(bits).bits(), bits);
        }
    }

    #[test]
    fn data_register_addresses() {
        assert_eq!(Data0::ADDRESS, 0x04);
        assert_eq!(Data9::ADDRESS, 0x0d);
        assert_eq!(Data10::ADDRESS, 0x0e);
        assert_eq!(Data11::ADDRESS, 0x0f);
        assert_eq!(Sbaddress0::ADDRESS, 0x39);
        assert_eq!(Sbdata0::ADDRESS, 0x3c);
        assert_eq!(Verbosity::ADDRESS, 0x60);
    }
}
