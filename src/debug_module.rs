//! Debug Module back end.
//!
//! Maps logical debugger operations onto sequences of DMI register
//! accesses against a v0.13 Debug Module: the Abstract Command protocol
//! for register reads and writes, and the System Bus protocol for memory.
//! Every abstract command is followed by polling `abstractcs.busy`, and a
//! nonzero `cmderr` is cleared (write-1-to-clear) before the error is
//! propagated; every system-bus phase starts by polling `sbcs.sbbusy`.

use std::path::Path;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::dmi::{DmiAccess, DmiError};
use crate::elf::{ElfImage, ElfLoadError};
use crate::registers::{
    csr, Abstractcs, AccessRegisterCommand, Cmderr, Data0, Data1, DebugModuleVersion,
    DebugRegister, Dcsr, Dmcontrol, Dmstatus, HaltCause, RegisterId, RiscvBusAccess, Sbaddress0,
    Sbaddress1, Sbcs, Sbdata0, Sberror, Verbosity, CMDERR_W1C, SBERROR_W1C,
};
use crate::Xlen;

/// Errors from Debug Module operations.
#[derive(Debug, Error)]
pub enum DmError {
    /// The DMI transport failed.
    #[error("DMI transport error: {0}")]
    Transport(#[from] DmiError),
    /// A busy poll exceeded its deadline.
    #[error("timed out polling `{0}`")]
    Timeout(&'static str),
    /// An abstract command completed with a nonzero `cmderr`.
    #[error("abstract command failed: {0:?}")]
    AbstractCommand(Cmderr),
    /// A system-bus access completed with a nonzero `sberror`.
    #[error("system bus access failed: {0:?}")]
    SystemBus(Sberror),
    /// The system bus reported `sbbusyerror`.
    #[error("system bus access while busy")]
    SystemBusBusy,
    /// `dmstatus.version` reads as zero.
    #[error("no debug module present")]
    NoDebugModule,
    /// The debug module implements an unsupported specification version.
    #[error("debug module version {0:?} is not supported")]
    UnsupportedVersion(DebugModuleVersion),
    /// A sub-word access straddles a 32-bit boundary or is misaligned.
    #[error("sub-word access of {len} bytes at {addr:#x} is not naturally aligned")]
    UnalignedSubword {
        /// Requested address.
        addr: u64,
        /// Requested length.
        len: usize,
    },
    /// A sub-word access length other than 1, 2 or 4.
    #[error("sub-word access length {0} is not 1, 2 or 4")]
    BadSubwordLength(usize),
    /// The requested range wraps around the top of the address space.
    #[error("address range {addr:#x}+{len} overflows")]
    AddressRange {
        /// Start of the range.
        addr: u64,
        /// Length of the range in bytes.
        len: usize,
    },
    /// ELF loading failed before any memory was written.
    #[error("ELF load failed: {0}")]
    ElfLoad(#[from] ElfLoadError),
}

/// Continue/pause control.
///
/// The mode is advisory for diagnostics, except that only in
/// [`Continue`](RunMode::Continue) or [`Step`](RunMode::Step) may the front
/// end be waiting for a stop reason.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// The hart is halted.
    Paused,
    /// A halt has been requested but `allhalted` has not been observed yet.
    PauseRequested,
    /// The hart is executing a single step.
    Step,
    /// The hart is running freely.
    Continue,
}

/// Outcome of a stop-reason poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopPoll {
    /// The hart is halted; the cause comes from `dcsr.cause`.
    Halted(HaltCause),
    /// The hart is still running.
    Running,
    /// The hart has been running longer than the configured halt-check
    /// budget allows.
    Timeout,
}

/// Busy-poll budgets.
///
/// The defaults (a 1 µs sleep per iteration, one million iterations, so
/// about one second per loop) are part of the design contract with the
/// hardware, not tuning hints.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Sleep between consecutive status reads.
    pub interval: Duration,
    /// Number of status reads before a busy loop gives up.
    pub iterations: u32,
    /// Number of stop-reason polls before a running hart is declared hung
    /// and halted by force. `u32::MAX` disables the check.
    pub cpu_timeout: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_micros(1),
            iterations: 1_000_000,
            cpu_timeout: u32::MAX,
        }
    }
}

/// Back end driving one hart through a v0.13 Debug Module.
///
/// Until [`init`](Self::init) is called every operation is a no-op that
/// reports success and zero data, which lets the front end run without
/// hardware attached.
#[derive(Debug)]
pub struct DebugModule<D: DmiAccess> {
    dmi: D,
    xlen: Xlen,
    run_mode: RunMode,
    initialized: bool,
    poll: PollConfig,
    verbosity: u32,
    halt_checks: u32,
    command_num: u32,
}

impl<D: DmiAccess> DebugModule<D> {
    /// Wrap a DMI transport. The width defaults to RV64 until changed or
    /// picked up from a loaded ELF.
    pub fn new(dmi: D) -> Self {
        DebugModule {
            dmi,
            xlen: Xlen::Rv64,
            run_mode: RunMode::Paused,
            initialized: false,
            poll: PollConfig::default(),
            verbosity: 0,
            halt_checks: 0,
            command_num: 0,
        }
    }

    /// Replace the polling budgets.
    pub fn set_poll_config(&mut self, poll: PollConfig) {
        self.poll = poll;
    }

    /// Mark the back end live; operations before this are no-ops.
    pub fn init(&mut self) {
        tracing::debug!("debug module back end initialized");
        self.initialized = true;
    }

    /// Whether [`init`](Self::init) has been called.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Final actions when the debugger detaches.
    pub fn finalize(&mut self) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        tracing::debug!("debugger detached");
        Ok(())
    }

    /// Current register width.
    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    /// Change the register width.
    pub fn set_xlen(&mut self, xlen: Xlen) {
        self.xlen = xlen;
    }

    /// Current run mode.
    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &D {
        &self.dmi
    }

    /// Mutably borrow the underlying transport.
    pub fn transport_mut(&mut self) -> &mut D {
        &mut self.dmi
    }

    /// Log a separator so the DMI traffic of one debugger command can be
    /// grouped when reading a trace.
    pub fn start_command(&mut self) {
        if !self.initialized {
            return;
        }
        tracing::debug!("======== command {}", self.command_num);
        self.command_num += 1;
    }

    /// Help text for the `monitor help` command.
    pub fn help(&self) -> &'static str {
        "monitor help                       Print this help message\n\
         monitor verbosity n                Set verbosity of target to n\n\
         monitor xlen n                     Set XLEN to n (32 or 64 only)\n\
         monitor reset_dm                   Reset the Debug Module\n\
         monitor reset_ndm                  Reset everything but the Debug Module\n\
         monitor reset_hart                 Reset the hart\n\
         monitor elf_load filename          Load ELF file into target memory\n"
    }

    // ----------------------------------------------------------------
    // DMI register plumbing

    fn read_dm_register<R: DebugRegister>(&mut self) -> Result<R, DmError> {
        let value = self.dmi.dmi_read(u16::from(R::ADDRESS))?;
        tracing::trace!("read {} ({:#04x}) = {:#010x}", R::NAME, R::ADDRESS, value);
        Ok(R::from(value))
    }

    fn write_dm_register<R: DebugRegister>(&mut self, register: R) -> Result<(), DmError> {
        let value: u32 = register.into();
        tracing::trace!("write {} ({:#04x}) = {:#010x}", R::NAME, R::ADDRESS, value);
        self.dmi.dmi_write(u16::from(R::ADDRESS), value)?;
        Ok(())
    }

    /// Raw DMI read, for interactive poking at the Debug Module.
    pub fn dmi_read_raw(&mut self, addr: u16) -> Result<u32, DmError> {
        if !self.initialized {
            return Ok(0);
        }
        Ok(self.dmi.dmi_read(addr)?)
    }

    /// Raw DMI write, for interactive poking at the Debug Module.
    pub fn dmi_write_raw(&mut self, addr: u16, value: u32) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        Ok(self.dmi.dmi_write(addr, value)?)
    }

    // ----------------------------------------------------------------
    // Busy polling

    fn poll_abstractcs_idle(&mut self, what: &'static str) -> Result<Abstractcs, DmError> {
        for _ in 0..self.poll.iterations {
            let abstractcs: Abstractcs = self.read_dm_register()?;
            if !abstractcs.busy() {
                return Ok(abstractcs);
            }
            thread::sleep(self.poll.interval);
        }
        Err(DmError::Timeout(what))
    }

    fn poll_dmstatus<F>(&mut self, what: &'static str, done: F) -> Result<Dmstatus, DmError>
    where
        F: Fn(&Dmstatus) -> bool,
    {
        for _ in 0..self.poll.iterations {
            let dmstatus: Dmstatus = self.read_dm_register()?;
            if done(&dmstatus) {
                return Ok(dmstatus);
            }
            thread::sleep(self.poll.interval);
        }
        Err(DmError::Timeout(what))
    }

    fn poll_sb_idle(&mut self, what: &'static str) -> Result<Sbcs, DmError> {
        for _ in 0..self.poll.iterations {
            let sbcs: Sbcs = self.read_dm_register()?;
            if !sbcs.sbbusy() {
                return Ok(sbcs);
            }
            thread::sleep(self.poll.interval);
        }
        Err(DmError::Timeout(what))
    }

    // ----------------------------------------------------------------
    // Abstract commands

    fn access_register_command(&self, write: bool, regno: RegisterId) -> AccessRegisterCommand {
        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_aarsize(match self.xlen {
            Xlen::Rv32 => RiscvBusAccess::A32,
            Xlen::Rv64 => RiscvBusAccess::A64,
        });
        command.set_transfer(true);
        command.set_write(write);
        command.set_regno(regno.0);
        command
    }

    /// Poll the command to completion; read, clear and propagate `cmderr`.
    fn finish_abstract_command(&mut self, what: &'static str) -> Result<(), DmError> {
        let abstractcs = self.poll_abstractcs_idle(what)?;
        let cmderr = Cmderr::from_bits(abstractcs.cmderr());
        if cmderr == Cmderr::None {
            return Ok(());
        }
        tracing::warn!("{what}: abstract command failed: {cmderr:?}");
        let mut clear = Abstractcs(0);
        clear.set_cmderr(CMDERR_W1C);
        self.write_dm_register(clear)?;
        Err(DmError::AbstractCommand(cmderr))
    }

    /// Clear a stale `cmderr` left over from earlier traffic without
    /// treating it as a failure of the current operation.
    fn clear_stale_cmderr(&mut self, abstractcs: Abstractcs) -> Result<(), DmError> {
        let cmderr = Cmderr::from_bits(abstractcs.cmderr());
        if cmderr != Cmderr::None {
            tracing::warn!("clearing stale abstract command error: {cmderr:?}");
            let mut clear = Abstractcs(0);
            clear.set_cmderr(CMDERR_W1C);
            self.write_dm_register(clear)?;
        }
        Ok(())
    }

    /// Read a register through the Access Register abstract command.
    pub fn read_register(&mut self, regno: RegisterId) -> Result<u64, DmError> {
        if !self.initialized {
            return Ok(0);
        }
        let command = self.access_register_command(false, regno);
        self.write_dm_register(command)?;
        self.finish_abstract_command("read_register")?;

        let data0: Data0 = self.read_dm_register()?;
        let mut value = u64::from(data0.0);
        if self.xlen == Xlen::Rv64 {
            let data1: Data1 = self.read_dm_register()?;
            value |= u64::from(data1.0) << 32;
        }
        tracing::debug!("read register {:#06x} => {value:#x}", regno.0);
        Ok(value)
    }

    /// Write a register through the Access Register abstract command.
    pub fn write_register(&mut self, regno: RegisterId, value: u64) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        tracing::debug!("write register {:#06x} <= {value:#x}", regno.0);
        self.write_dm_register(Data0(value as u32))?;
        if self.xlen == Xlen::Rv64 {
            self.write_dm_register(Data1((value >> 32) as u32))?;
        }
        let command = self.access_register_command(true, regno);
        self.write_dm_register(command)?;
        self.finish_abstract_command("write_register")
    }

    /// Read general-purpose register `x0`..`x31`.
    pub fn read_gpr(&mut self, n: u8) -> Result<u64, DmError> {
        self.read_register(RegisterId::gpr(n))
    }

    /// Write general-purpose register `x0`..`x31`.
    pub fn write_gpr(&mut self, n: u8, value: u64) -> Result<(), DmError> {
        self.write_register(RegisterId::gpr(n), value)
    }

    /// Read floating-point register `f0`..`f31`.
    pub fn read_fpr(&mut self, n: u8) -> Result<u64, DmError> {
        self.read_register(RegisterId::fpr(n))
    }

    /// Write floating-point register `f0`..`f31`.
    pub fn write_fpr(&mut self, n: u8, value: u64) -> Result<(), DmError> {
        self.write_register(RegisterId::fpr(n), value)
    }

    /// Read a CSR by address.
    pub fn read_csr(&mut self, addr: u16) -> Result<u64, DmError> {
        self.read_register(RegisterId::csr(addr))
    }

    /// Write a CSR by address.
    pub fn write_csr(&mut self, addr: u16, value: u64) -> Result<(), DmError> {
        self.write_register(RegisterId::csr(addr), value)
    }

    /// Read the program counter through `dpc`.
    pub fn read_pc(&mut self) -> Result<u64, DmError> {
        self.read_csr(csr::DPC)
    }

    /// Write the program counter through `dpc`.
    pub fn write_pc(&mut self, value: u64) -> Result<(), DmError> {
        self.write_csr(csr::DPC, value)
    }

    /// Read the virtual PRIV register (the privilege level the hart will
    /// resume into), held in `dcsr.prv`.
    pub fn read_priv(&mut self) -> Result<u64, DmError> {
        if !self.initialized {
            return Ok(0);
        }
        let dcsr = Dcsr(self.read_csr(csr::DCSR)? as u32);
        Ok(u64::from(dcsr.prv()))
    }

    /// Write the virtual PRIV register through `dcsr.prv`.
    pub fn write_priv(&mut self, value: u64) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        let mut dcsr = Dcsr(self.read_csr(csr::DCSR)? as u32);
        dcsr.set_prv(value as u8 & 0x3);
        self.write_csr(csr::DCSR, u64::from(dcsr.0))
    }

    // ----------------------------------------------------------------
    // System bus memory access

    fn sbcs_command(
        read_on_addr: bool,
        access: RiscvBusAccess,
        autoincrement: bool,
        read_on_data: bool,
    ) -> Sbcs {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbbusyerror(true);
        sbcs.set_sbreadonaddr(read_on_addr);
        sbcs.set_sbaccess(access);
        sbcs.set_sbautoincrement(autoincrement);
        sbcs.set_sbreadondata(read_on_data);
        sbcs.set_sberror(SBERROR_W1C);
        sbcs
    }

    fn write_sb_address(&mut self, addr: u64) -> Result<(), DmError> {
        if self.xlen == Xlen::Rv64 {
            self.write_dm_register(Sbaddress1((addr >> 32) as u32))?;
        }
        // With sbreadonaddr set this starts the first bus read.
        self.write_dm_register(Sbaddress0(addr as u32))
    }

    /// Single-shot 32-bit read, used for read-modify-write at range edges.
    fn mem32_read(&mut self, addr: u64) -> Result<u32, DmError> {
        assert_eq!(addr & 0x3, 0, "unaligned 32-bit system bus read");
        self.poll_sb_idle("mem32_read")?;
        self.write_dm_register(Self::sbcs_command(true, RiscvBusAccess::A32, false, false))?;
        self.write_sb_address(addr)?;
        self.poll_sb_idle("mem32_read")?;
        let data: Sbdata0 = self.read_dm_register()?;
        Ok(data.0)
    }

    /// Single-shot 32-bit write, used for read-modify-write at range edges.
    fn mem32_write(&mut self, addr: u64, value: u32) -> Result<(), DmError> {
        assert_eq!(addr & 0x3, 0, "unaligned 32-bit system bus write");
        self.poll_sb_idle("mem32_write")?;
        self.write_dm_register(Self::sbcs_command(false, RiscvBusAccess::A32, false, false))?;
        self.poll_sb_idle("mem32_write")?;
        self.write_sb_address(addr)?;
        self.poll_sb_idle("mem32_write")?;
        self.write_dm_register(Sbdata0(value))
    }

    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// No alignment restriction on either end of the range; the bus only
    /// ever sees 32-bit reads and the relevant bytes of the first and last
    /// words are copied out.
    pub fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), DmError> {
        if !self.initialized || buf.is_empty() {
            return Ok(());
        }
        tracing::debug!("read memory {:#x} + {} bytes", addr, buf.len());

        let addr_lim = addr
            .checked_add(buf.len() as u64)
            .filter(|lim| lim.checked_add(3).is_some())
            .ok_or(DmError::AddressRange {
                addr,
                len: buf.len(),
            })?;
        let mut addr4 = addr & !0x3;
        let addr_lim4 = (addr_lim + 3) & !0x3;

        self.poll_sb_idle("read_memory")?;
        self.write_dm_register(Self::sbcs_command(true, RiscvBusAccess::A32, true, true))?;
        self.poll_sb_idle("read_memory")?;
        self.write_sb_address(addr4)?;

        let mut out = 0usize;
        while addr4 < addr_lim4 {
            self.poll_sb_idle("read_memory")?;
            let word: Sbdata0 = self.read_dm_register()?;
            let bytes = word.0.to_le_bytes();
            let lo = (addr.max(addr4) - addr4) as usize;
            let hi = (addr_lim.min(addr4 + 4) - addr4) as usize;
            buf[out..out + (hi - lo)].copy_from_slice(&bytes[lo..hi]);
            out += hi - lo;
            addr4 += 4;
        }

        if self.verbosity > 0 {
            tracing::trace!("read data: {:02x?}", &buf[..buf.len().min(64)]);
        }
        Ok(())
    }

    /// Write `data` to memory starting at `addr`.
    ///
    /// Unaligned leading and trailing fragments are handled by reading the
    /// containing 32-bit word, overlaying the bytes and writing it back;
    /// the aligned middle is streamed with `sbautoincrement`. Sticky bus
    /// errors are checked (and cleared) once at the end.
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), DmError> {
        if !self.initialized || data.is_empty() {
            return Ok(());
        }
        tracing::debug!("write memory {:#x} + {} bytes", addr, data.len());
        if self.verbosity > 0 {
            tracing::trace!("write data: {:02x?}", &data[..data.len().min(64)]);
        }

        let addr_lim = addr
            .checked_add(data.len() as u64)
            .ok_or(DmError::AddressRange {
                addr,
                len: data.len(),
            })?;
        let mut addr4 = addr & !0x3;
        let addr_lim4 = addr_lim & !0x3;
        let mut consumed = 0usize;

        if addr != addr4 {
            let offset = (addr - addr4) as usize;
            let n = usize::min(4 - offset, data.len());
            let mut word = self.mem32_read(addr4)?.to_le_bytes();
            word[offset..offset + n].copy_from_slice(&data[..n]);
            self.mem32_write(addr4, u32::from_le_bytes(word))?;
            addr4 += 4;
            consumed += n;
        }

        if addr4 < addr_lim4 {
            self.poll_sb_idle("write_memory")?;
            self.write_dm_register(Self::sbcs_command(false, RiscvBusAccess::A32, true, false))?;
            self.poll_sb_idle("write_memory")?;
            self.write_sb_address(addr4)?;
            while addr4 < addr_lim4 {
                let word = u32::from_le_bytes([
                    data[consumed],
                    data[consumed + 1],
                    data[consumed + 2],
                    data[consumed + 3],
                ]);
                self.write_dm_register(Sbdata0(word))?;
                addr4 += 4;
                consumed += 4;
            }
        }

        if addr4 < addr_lim {
            let n = (addr_lim - addr4) as usize;
            let mut word = self.mem32_read(addr4)?.to_le_bytes();
            word[..n].copy_from_slice(&data[consumed..consumed + n]);
            self.mem32_write(addr4, u32::from_le_bytes(word))?;
        }

        // Bus errors are sticky, so one check at the end covers the whole
        // transfer.
        let sbcs = self.poll_sb_idle("write_memory")?;
        if sbcs.sbbusyerror() {
            let mut clear = Sbcs(0);
            clear.set_sbbusyerror(true);
            self.write_dm_register(clear)?;
            return Err(DmError::SystemBusBusy);
        }
        let sberror = Sberror::from_bits(sbcs.sberror());
        if sberror != Sberror::None {
            let mut clear = Sbcs(0);
            clear.set_sberror(SBERROR_W1C);
            self.write_dm_register(clear)?;
            return Err(DmError::SystemBus(sberror));
        }
        Ok(())
    }

    fn subword_access(addr: u64, len: usize) -> Result<RiscvBusAccess, DmError> {
        // The access must stay within one 32-bit word.
        let end = addr
            .checked_add(len as u64)
            .ok_or(DmError::AddressRange { addr, len })?;
        if end > (addr | 0x3).wrapping_add(1) {
            return Err(DmError::UnalignedSubword { addr, len });
        }
        match len {
            1 => Ok(RiscvBusAccess::A8),
            2 if addr & 0x1 == 0 => Ok(RiscvBusAccess::A16),
            4 if addr & 0x3 == 0 => Ok(RiscvBusAccess::A32),
            2 | 4 => Err(DmError::UnalignedSubword { addr, len }),
            _ => Err(DmError::BadSubwordLength(len)),
        }
    }

    /// Single naturally-aligned 8/16/32-bit read.
    pub fn read_memory_subword(&mut self, addr: u64, len: usize) -> Result<u32, DmError> {
        if !self.initialized {
            return Ok(0);
        }
        let access = Self::subword_access(addr, len)?;
        self.poll_sb_idle("read_memory_subword")?;
        self.write_dm_register(Self::sbcs_command(true, access, false, false))?;
        self.poll_sb_idle("read_memory_subword")?;
        self.write_sb_address(addr)?;
        self.poll_sb_idle("read_memory_subword")?;
        let data: Sbdata0 = self.read_dm_register()?;
        Ok(data.0)
    }

    /// Single naturally-aligned 8/16/32-bit write.
    pub fn write_memory_subword(&mut self, addr: u64, value: u32, len: usize) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        let access = Self::subword_access(addr, len)?;
        self.poll_sb_idle("write_memory_subword")?;
        self.write_dm_register(Self::sbcs_command(false, access, false, false))?;
        self.poll_sb_idle("write_memory_subword")?;
        self.write_sb_address(addr)?;
        self.write_dm_register(Sbdata0(value))?;
        self.poll_sb_idle("write_memory_subword")?;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Run control

    /// Resume free execution. Clears `dcsr.step` if a step was armed.
    pub fn resume(&mut self) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        let mut dcsr = Dcsr(self.read_csr(csr::DCSR)? as u32);
        if dcsr.step() {
            dcsr.set_step(false);
            self.write_csr(csr::DCSR, u64::from(dcsr.0))?;
        }

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_resumereq(true);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        self.halt_checks = 0;
        self.run_mode = RunMode::Continue;
        tracing::debug!("hart resumed");
        Ok(())
    }

    /// Execute a single instruction. Arms `dcsr.step`, resumes, and waits
    /// for the hart to halt again.
    pub fn step(&mut self) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        let mut dcsr = Dcsr(self.read_csr(csr::DCSR)? as u32);
        if !dcsr.step() {
            dcsr.set_step(true);
            self.write_csr(csr::DCSR, u64::from(dcsr.0))?;
        }

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_resumereq(true);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;
        self.run_mode = RunMode::Step;

        self.poll_dmstatus("step", |dmstatus| dmstatus.allhalted())?;
        self.run_mode = RunMode::Paused;
        tracing::debug!("step complete");
        Ok(())
    }

    /// Request a halt and wait for `allhalted`.
    pub fn halt(&mut self) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        self.run_mode = RunMode::PauseRequested;
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_haltreq(true);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        self.poll_dmstatus("halt", |dmstatus| dmstatus.allhalted())?;
        self.run_mode = RunMode::Paused;
        tracing::debug!("hart halted");
        Ok(())
    }

    /// Poll for a stop reason.
    ///
    /// Polls `dmstatus.allhalted` within the usual budget. A hart that is
    /// still running afterwards reports [`StopPoll::Running`], or
    /// [`StopPoll::Timeout`] once the halt-check budget is spent. A halted
    /// hart reports the `dcsr.cause` value.
    pub fn stop_reason(&mut self) -> Result<StopPoll, DmError> {
        if !self.initialized {
            return Ok(StopPoll::Halted(HaltCause::Reserved(0)));
        }
        match self.poll_dmstatus("stop_reason", |dmstatus| dmstatus.allhalted()) {
            Ok(_) => {}
            Err(DmError::Timeout(_)) => {
                if self.poll.cpu_timeout != u32::MAX && self.halt_checks >= self.poll.cpu_timeout {
                    tracing::warn!("hart exceeded the halt-check budget");
                    return Ok(StopPoll::Timeout);
                }
                self.halt_checks += 1;
                return Ok(StopPoll::Running);
            }
            Err(error) => return Err(error),
        }

        self.run_mode = RunMode::Paused;
        let dcsr = Dcsr(self.read_csr(csr::DCSR)? as u32);
        let cause = HaltCause::from_bits(dcsr.cause());
        tracing::debug!("hart halted, cause {cause:?}");
        Ok(StopPoll::Halted(cause))
    }

    // ----------------------------------------------------------------
    // Resets

    /// Reset the Debug Module itself by dropping `dmactive`, then verify
    /// the module reports specification version 0.13.
    pub fn dm_reset(&mut self) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        tracing::debug!("resetting debug module");
        self.write_dm_register(Dmcontrol(0))?;

        let abstractcs = self.poll_abstractcs_idle("dm_reset")?;
        self.clear_stale_cmderr(abstractcs)?;

        let dmstatus: Dmstatus = self.read_dm_register()?;
        match DebugModuleVersion::from_bits(dmstatus.version()) {
            DebugModuleVersion::Version0_13 => {
                tracing::debug!("debug module version 0.13");
                Ok(())
            }
            DebugModuleVersion::NoModule => Err(DmError::NoDebugModule),
            other => Err(DmError::UnsupportedVersion(other)),
        }
    }

    /// Pulse `ndmreset` to reset everything except the Debug Module, then
    /// wait for the hart to come back.
    pub fn ndm_reset(&mut self, haltreq: bool) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        tracing::debug!("pulsing ndmreset (haltreq = {haltreq})");
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_haltreq(haltreq);
        dmcontrol.set_ndmreset(true);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        dmcontrol.set_ndmreset(false);
        self.write_dm_register(dmcontrol)?;

        self.poll_dmstatus("ndm_reset", |dmstatus| !dmstatus.anyunavail())?;
        Ok(())
    }

    /// Reset the hart via `hartreset`.
    pub fn hart_reset(&mut self, haltreq: bool) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        tracing::debug!("resetting hart (haltreq = {haltreq})");
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_haltreq(haltreq);
        dmcontrol.set_hartreset(true);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        self.poll_dmstatus("hart_reset", |dmstatus| !dmstatus.anyhavereset())?;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Miscellaneous

    /// Set the diagnostic verbosity, both locally (how much transferred
    /// data gets traced) and in the target through the non-standard DM
    /// register 0x60.
    pub fn set_verbosity(&mut self, n: u32) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        self.verbosity = n;
        self.write_dm_register(Verbosity(n))
    }

    /// Load a RISC-V ELF into target memory through the ordinary memory
    /// writer. Adopts the file's register width and records the `_start`,
    /// `exit` and `tohost` symbols in `symbol_table.txt`.
    pub fn load_elf(&mut self, path: &Path) -> Result<(), DmError> {
        if !self.initialized {
            return Ok(());
        }
        let image = ElfImage::from_file(path)?;
        image.symbols.write_table(Path::new("symbol_table.txt"))?;
        self.set_xlen(image.xlen);
        tracing::info!(
            "loading {} bytes at {:#x} ({})",
            image.data.len(),
            image.min_addr,
            image.xlen
        );
        self.write_memory(image.min_addr, &image.data)
    }
}
