//! RSP front end.
//!
//! [`GdbStub`] owns one debugger session: it pulls bytes off the command
//! stream, reassembles and validates packets, dispatches them to the back
//! end, and writes encoded responses. Acks follow GDB's convention: `+`
//! goes out before a packet is dispatched, `-` on checksum failure (the
//! debugger retransmits), and every response we send must itself be acked
//! before the next one goes out.
//!
//! The session also owns the small run-state machine around
//! `waiting_for_stop_reason`: after a `c`/`s`/^C the stub polls the back
//! end each loop iteration and emits exactly one `T%02x` stop-reason
//! packet per halt event.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::debug_module::{DebugModule, StopPoll};
use crate::dmi::DmiAccess;
use crate::protocol::{self, Frame, PacketBuffer, ProtocolError, PACKET_BUF_MAX};
use crate::Xlen;

const RESPONSE_OK: &[u8] = b"OK";
/// Command parse failure.
const RESPONSE_EPARSE: &[u8] = b"E01";
/// Back-end operation failure.
const RESPONSE_EBACKEND: &[u8] = b"E02";

/// Attempts to read an ack byte before the peer is declared gone.
const ACK_ATTEMPTS: u32 = 1_000_000;
/// Sleep between empty ack reads.
const ACK_RETRY_DELAY: Duration = Duration::from_micros(5);

/// Session-fatal errors. Per-command trouble is reported to the debugger
/// as `Enn` responses instead.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The command stream failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The debugger closed the connection.
    #[error("the debugger closed the connection")]
    Disconnected,
    /// No ack arrived for a response we sent.
    #[error("timed out waiting for an acknowledgement")]
    AckTimeout,
    /// The first byte from the debugger was not the expected `+`.
    #[error("expected an initial '+' from the debugger, received {0:#04x}")]
    BadInitialAck(u8),
    /// An ack slot carried something other than `+`/`-`.
    #[error("unexpected acknowledgement byte {0:#04x}")]
    BadAck(u8),
    /// A response could not be encoded (oversized payload).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Front-end tuning knobs.
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Wait between dispatching a resume and the first stop-reason poll,
    /// giving the hart time to actually start running.
    pub resume_delay: Duration,
    /// Idle wait when no complete packet has arrived.
    pub idle_delay: Duration,
    /// Include 32 zeroed FPR slots after the PC in `g`/`G` dumps.
    pub report_fprs: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        StubConfig {
            resume_delay: Duration::from_micros(10),
            idle_delay: Duration::from_micros(10),
            report_fprs: false,
        }
    }
}

enum Event {
    /// Stop channel signalled: terminate before the next packet.
    Stop,
    /// The debugger closed the stream.
    Eof,
    /// Nothing complete buffered yet.
    Idle,
    /// Out-of-band ^C.
    Interrupt,
    /// A validated packet payload.
    Packet(Vec<u8>),
}

/// One GDB session over a bidirectional byte stream.
///
/// The stream is expected to be configured with a short read timeout
/// (1 ms); reads that time out are treated as "no data yet", which
/// together with the stop channel forms the session's select loop.
pub struct GdbStub<'a, C, D: DmiAccess> {
    conn: C,
    backend: &'a mut DebugModule<D>,
    stop: Option<&'a Receiver<()>>,
    config: StubConfig,
    window: PacketBuffer,
    waiting_for_stop_reason: bool,
}

impl<'a, C: Read + Write, D: DmiAccess> GdbStub<'a, C, D> {
    /// Bind a session to a command stream, a back end, and an optional
    /// stop channel.
    pub fn new(conn: C, backend: &'a mut DebugModule<D>, stop: Option<&'a Receiver<()>>) -> Self {
        GdbStub {
            conn,
            backend,
            stop,
            config: StubConfig::default(),
            window: PacketBuffer::new(),
            waiting_for_stop_reason: false,
        }
    }

    /// Override the default configuration.
    pub fn with_config(mut self, config: StubConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the session until the debugger disconnects, the stop channel
    /// fires, or the transport fails.
    pub fn run(&mut self) -> Result<(), SessionError> {
        self.backend.init();

        match self.expect_initial_ack() {
            Ok(()) => {}
            Err(SessionError::Disconnected) => return Ok(()),
            Err(error) => return Err(error),
        }

        loop {
            if self.waiting_for_stop_reason {
                thread::sleep(self.config.resume_delay);
                self.poll_stop_reason()?;
            }

            match self.poll_event()? {
                Event::Stop => {
                    tracing::info!("stop requested, ending session");
                    return Ok(());
                }
                Event::Eof => {
                    tracing::info!("debugger disconnected");
                    return Ok(());
                }
                Event::Idle => thread::sleep(self.config.idle_delay),
                Event::Interrupt => self.handle_interrupt()?,
                Event::Packet(payload) => self.dispatch(&payload)?,
            }
        }
    }

    // ----------------------------------------------------------------
    // Stream plumbing

    fn expect_initial_ack(&mut self) -> Result<(), SessionError> {
        let byte = self.read_ack_byte()?;
        if byte != b'+' {
            return Err(SessionError::BadInitialAck(byte));
        }
        Ok(())
    }

    fn read_ack_byte(&mut self) -> Result<u8, SessionError> {
        let mut byte = [0u8; 1];
        for _ in 0..ACK_ATTEMPTS {
            match self.conn.read(&mut byte) {
                Ok(0) => return Err(SessionError::Disconnected),
                Ok(_) => return Ok(byte[0]),
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    thread::sleep(ACK_RETRY_DELAY);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
        Err(SessionError::AckTimeout)
    }

    fn send_ack(&mut self, ack: u8) -> Result<(), SessionError> {
        self.conn.write_all(&[ack])?;
        self.conn.flush()?;
        Ok(())
    }

    /// Frame and send a response, retransmitting until the debugger acks.
    fn send_packet(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let frame = protocol::encode_frame(payload)?;
        loop {
            self.conn.write_all(&frame)?;
            self.conn.flush()?;
            match self.read_ack_byte()? {
                b'+' => return Ok(()),
                b'-' => {
                    tracing::warn!("debugger nak'd our response, retransmitting");
                }
                other => return Err(SessionError::BadAck(other)),
            }
        }
    }

    fn poll_event(&mut self) -> Result<Event, SessionError> {
        if let Some(stop) = self.stop {
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(Event::Stop),
                Err(TryRecvError::Empty) => {}
            }
        }

        let mut buf = [0u8; 4096];
        match self.conn.read(&mut buf) {
            Ok(0) => return Ok(Event::Eof),
            Ok(n) => {
                if let Err(error) = self.window.extend(&buf[..n]) {
                    tracing::warn!("{error}");
                    self.send_ack(b'-')?;
                    return Ok(Event::Idle);
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }

        match self.window.next_frame() {
            Frame::NeedMore => Ok(Event::Idle),
            Frame::ControlC => {
                tracing::debug!("received ^C interrupt");
                Ok(Event::Interrupt)
            }
            Frame::Packet(payload) => {
                self.send_ack(b'+')?;
                Ok(Event::Packet(payload))
            }
            Frame::BadChecksum { computed, received } => {
                tracing::warn!(
                    "checksum mismatch: computed {computed:#04x}, received {received:#04x}"
                );
                self.send_ack(b'-')?;
                Ok(Event::Idle)
            }
            Frame::Malformed(error) => {
                tracing::warn!("malformed packet payload: {error}");
                self.send_ack(b'+')?;
                self.send_packet(RESPONSE_EPARSE)?;
                Ok(Event::Idle)
            }
        }
    }

    // ----------------------------------------------------------------
    // Run-state coordination

    fn send_stop_reply(&mut self, cause: u8) -> Result<(), SessionError> {
        let response = format!("T{cause:02x}");
        self.send_packet(response.as_bytes())
    }

    /// Poll the back end while a resume is outstanding; emit exactly one
    /// stop-reason packet per halt event.
    fn poll_stop_reason(&mut self) -> Result<(), SessionError> {
        match self.backend.stop_reason() {
            Ok(StopPoll::Halted(cause)) => {
                self.waiting_for_stop_reason = false;
                self.send_stop_reply(cause.bits())
            }
            Ok(StopPoll::Running) => Ok(()),
            Ok(StopPoll::Timeout) => {
                // The hart ran past its budget; force a halt. The next poll
                // observes the halt and reports its cause.
                tracing::warn!("target timed out, issuing halt");
                if self.backend.halt().is_err() {
                    self.waiting_for_stop_reason = false;
                    return self.send_packet(RESPONSE_EBACKEND);
                }
                Ok(())
            }
            Err(error) => {
                tracing::warn!("stop-reason poll failed: {error}");
                self.waiting_for_stop_reason = false;
                self.send_packet(RESPONSE_EBACKEND)
            }
        }
    }

    // ----------------------------------------------------------------
    // Dispatch

    fn dispatch(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let Some(&first) = payload.first() else {
            return self.send_packet(b"");
        };
        self.backend.start_command();
        match first {
            b'?' => self.handle_stop_reason_query(),
            b'c' => self.handle_continue(payload),
            b'D' => self.handle_detach(),
            b'g' => self.handle_read_all_registers(),
            b'G' => self.handle_write_all_registers(payload),
            b'm' => self.handle_read_memory(payload),
            b'M' => self.handle_write_memory_hex(payload),
            b'p' => self.handle_read_register(payload),
            b'P' => self.handle_write_register(payload),
            b'q' => self.handle_query(payload),
            b's' => self.handle_step(payload),
            b'X' => self.handle_write_memory_binary(payload),
            _ => {
                tracing::warn!(
                    "unrecognized packet: {:?}",
                    String::from_utf8_lossy(payload)
                );
                self.send_packet(b"")
            }
        }
    }

    fn handle_interrupt(&mut self) -> Result<(), SessionError> {
        self.backend.start_command();
        match self.backend.halt() {
            Ok(()) => {
                self.waiting_for_stop_reason = true;
                Ok(())
            }
            Err(error) => {
                tracing::warn!("halt on ^C failed: {error}");
                self.send_packet(RESPONSE_EBACKEND)
            }
        }
    }

    fn handle_stop_reason_query(&mut self) -> Result<(), SessionError> {
        match self.backend.stop_reason() {
            Ok(StopPoll::Halted(cause)) => {
                self.waiting_for_stop_reason = false;
                self.send_stop_reply(cause.bits())
            }
            Ok(StopPoll::Running) => {
                self.waiting_for_stop_reason = true;
                Ok(())
            }
            Ok(StopPoll::Timeout) | Err(_) => {
                self.waiting_for_stop_reason = false;
                self.send_packet(RESPONSE_EPARSE)
            }
        }
    }

    /// `c [addr]`: optionally set the PC, then resume.
    fn handle_continue(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let rest = &payload[1..];
        if !rest.is_empty() {
            let Some(pc) = parse_hex_field(rest) else {
                return self.send_packet(RESPONSE_EPARSE);
            };
            if self.backend.write_pc(pc).is_err() {
                return self.send_packet(RESPONSE_EBACKEND);
            }
        }
        match self.backend.resume() {
            Ok(()) => {
                self.waiting_for_stop_reason = true;
                Ok(())
            }
            Err(error) => {
                tracing::warn!("resume failed: {error}");
                self.send_packet(RESPONSE_EBACKEND)
            }
        }
    }

    /// `s [addr]`: optionally set the PC, then single-step.
    fn handle_step(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let rest = &payload[1..];
        if !rest.is_empty() {
            let Some(pc) = parse_hex_field(rest) else {
                return self.send_packet(RESPONSE_EPARSE);
            };
            if self.backend.write_pc(pc).is_err() {
                return self.send_packet(RESPONSE_EBACKEND);
            }
        }
        match self.backend.step() {
            Ok(()) => {
                self.waiting_for_stop_reason = true;
                Ok(())
            }
            Err(error) => {
                tracing::warn!("step failed: {error}");
                self.send_packet(RESPONSE_EBACKEND)
            }
        }
    }

    fn handle_detach(&mut self) -> Result<(), SessionError> {
        match self.backend.finalize() {
            Ok(()) => self.send_packet(RESPONSE_OK),
            Err(_) => self.send_packet(RESPONSE_EBACKEND),
        }
    }

    /// `g`: 32 GPRs then the PC, each as xlen little-endian hex.
    fn handle_read_all_registers(&mut self) -> Result<(), SessionError> {
        let bits = self.backend.xlen().bits();
        let mut response = String::with_capacity(65 * 16);
        for n in 0..32u8 {
            match self.backend.read_gpr(n) {
                Ok(value) => response.push_str(&protocol::val_to_hex(value, bits)),
                Err(_) => return self.send_packet(RESPONSE_EBACKEND),
            }
        }
        match self.backend.read_pc() {
            Ok(value) => response.push_str(&protocol::val_to_hex(value, bits)),
            Err(_) => return self.send_packet(RESPONSE_EBACKEND),
        }
        if self.config.report_fprs {
            for _ in 0..32 {
                response.push_str(&protocol::val_to_hex(0, bits));
            }
        }
        self.send_packet(response.as_bytes())
    }

    /// `G <hex>`: write 32 GPRs and the PC.
    fn handle_write_all_registers(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let digits = &payload[1..];
        let bits = self.backend.xlen().bits();
        let per = bits as usize / 4;
        let slots = if self.config.report_fprs { 65 } else { 33 };
        if digits.len() != slots * per {
            tracing::warn!(
                "register dump has {} digits, expected {}",
                digits.len(),
                slots * per
            );
            return self.send_packet(RESPONSE_EPARSE);
        }

        let mut values = Vec::with_capacity(33);
        for slot in 0..33 {
            match protocol::hex_to_val(&digits[slot * per..], bits) {
                Ok(value) => values.push(value),
                Err(_) => return self.send_packet(RESPONSE_EPARSE),
            }
        }
        // Any FPR slots after the PC are accepted but not written back.

        for (n, &value) in values[..32].iter().enumerate() {
            if self.backend.write_gpr(n as u8, value).is_err() {
                return self.send_packet(RESPONSE_EBACKEND);
            }
        }
        if self.backend.write_pc(values[32]).is_err() {
            return self.send_packet(RESPONSE_EBACKEND);
        }
        self.send_packet(RESPONSE_OK)
    }

    /// `m addr,len`: read memory, reply as hex.
    fn handle_read_memory(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let Some((addr_digits, len_digits)) = split_once(&payload[1..], b',') else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let (Some(addr), Some(length)) =
            (parse_hex_field(addr_digits), parse_hex_field(len_digits))
        else {
            return self.send_packet(RESPONSE_EPARSE);
        };

        // Clamp to what fits in a response packet.
        let mut length = length as usize;
        if length >= PACKET_BUF_MAX / 2 {
            length = (PACKET_BUF_MAX - 1) / 2;
        }

        let mut data = vec![0u8; length];
        if self.backend.read_memory(addr, &mut data).is_err() {
            return self.send_packet(RESPONSE_EBACKEND);
        }
        self.send_packet(protocol::bin2hex(&data).as_bytes())
    }

    /// `M addr,len:<hex>`: write memory from hex data.
    fn handle_write_memory_hex(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let Some((header, hex_data)) = split_once(&payload[1..], b':') else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let Some((addr_digits, len_digits)) = split_once(header, b',') else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let (Some(addr), Some(length)) =
            (parse_hex_field(addr_digits), parse_hex_field(len_digits))
        else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        if length > PACKET_BUF_MAX as u64 || hex_data.len() as u64 != length * 2 {
            tracing::warn!(
                "M packet advertises {length} bytes but carries {} digits",
                hex_data.len()
            );
            return self.send_packet(RESPONSE_EPARSE);
        }
        let Ok(data) = protocol::hex2bin(hex_data) else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        match self.backend.write_memory(addr, &data) {
            Ok(()) => self.send_packet(RESPONSE_OK),
            Err(_) => self.send_packet(RESPONSE_EBACKEND),
        }
    }

    /// `X addr,len:<binary>`: write memory from raw (unescaped) bytes.
    fn handle_write_memory_binary(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let Some((header, data)) = split_once(&payload[1..], b':') else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let Some((addr_digits, len_digits)) = split_once(header, b',') else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let (Some(addr), Some(length)) =
            (parse_hex_field(addr_digits), parse_hex_field(len_digits))
        else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        if length > PACKET_BUF_MAX as u64 || data.len() as u64 != length {
            tracing::warn!(
                "X packet advertises {length} bytes but carries {}",
                data.len()
            );
            return self.send_packet(RESPONSE_EPARSE);
        }
        match self.backend.write_memory(addr, data) {
            Ok(()) => self.send_packet(RESPONSE_OK),
            Err(_) => self.send_packet(RESPONSE_EBACKEND),
        }
    }

    /// `p n`: read one register by GDB register number.
    fn handle_read_register(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let Some(regnum) = parse_hex_field(&payload[1..]) else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let value = match regnum {
            0x00..=0x1f => self.backend.read_gpr(regnum as u8),
            0x20 => self.backend.read_pc(),
            0x21..=0x40 => self.backend.read_fpr((regnum - 0x21) as u8),
            0x41..=0x1040 => self.backend.read_csr((regnum - 0x41) as u16),
            0x1041 => self.backend.read_priv(),
            _ => {
                tracing::warn!("read of unknown register number {regnum:#x}");
                return self.send_packet(RESPONSE_EPARSE);
            }
        };
        match value {
            Ok(value) => {
                let bits = self.backend.xlen().bits();
                self.send_packet(protocol::val_to_hex(value, bits).as_bytes())
            }
            Err(_) => self.send_packet(RESPONSE_EBACKEND),
        }
    }

    /// `P n=v`: write one register by GDB register number.
    fn handle_write_register(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let Some((regnum_digits, value_digits)) = split_once(&payload[1..], b'=') else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let Some(regnum) = parse_hex_field(regnum_digits) else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        // PRIV is a virtual one-byte register; everything else is xlen wide.
        let bits = if regnum == 0x1041 {
            8
        } else {
            self.backend.xlen().bits()
        };
        let Ok(value) = protocol::hex_to_val(value_digits, bits) else {
            return self.send_packet(RESPONSE_EPARSE);
        };
        let status = match regnum {
            0x00..=0x1f => self.backend.write_gpr(regnum as u8, value),
            0x20 => self.backend.write_pc(value),
            0x21..=0x40 => self.backend.write_fpr((regnum - 0x21) as u8, value),
            0x41..=0x1040 => self.backend.write_csr((regnum - 0x41) as u16, value),
            0x1041 => self.backend.write_priv(value),
            _ => {
                tracing::warn!("write of unknown register number {regnum:#x}");
                return self.send_packet(RESPONSE_EPARSE);
            }
        };
        match status {
            Ok(()) => self.send_packet(RESPONSE_OK),
            Err(_) => self.send_packet(RESPONSE_EBACKEND),
        }
    }

    /// `q…` general queries.
    fn handle_query(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if payload.starts_with(b"qAttached") {
            // Attached to an existing process rather than having spawned it.
            self.send_packet(b"1")
        } else if payload.starts_with(b"qSupported") {
            let response = format!("PacketSize={PACKET_BUF_MAX:x}");
            self.send_packet(response.as_bytes())
        } else if let Some(hex) = payload.strip_prefix(b"qRcmd,") {
            let Ok(command) = protocol::hex2bin(hex) else {
                return self.send_packet(RESPONSE_EPARSE);
            };
            self.handle_monitor(&command)
        } else {
            tracing::warn!(
                "unrecognized query packet: {:?}",
                String::from_utf8_lossy(payload)
            );
            self.send_packet(b"")
        }
    }

    /// `monitor` commands, transported hex-encoded in `qRcmd`.
    fn handle_monitor(&mut self, command: &[u8]) -> Result<(), SessionError> {
        let text = String::from_utf8_lossy(command);
        let text = text.trim();
        let (token, rest) = match text.split_once(char::is_whitespace) {
            Some((token, rest)) => (token, rest.trim()),
            None => (text, ""),
        };
        tracing::debug!("monitor command: {token} {rest}");

        match token {
            "help" => {
                let help = self.backend.help();
                let mut reply = String::with_capacity(1 + help.len() * 2);
                reply.push('O');
                reply.push_str(&protocol::bin2hex(help.as_bytes()));
                self.send_packet(reply.as_bytes())?;
                self.send_packet(RESPONSE_OK)
            }
            "verbosity" => match rest.parse::<u32>() {
                Ok(n) => match self.backend.set_verbosity(n) {
                    Ok(()) => self.send_packet(RESPONSE_OK),
                    Err(_) => self.send_packet(RESPONSE_EBACKEND),
                },
                Err(_) => self.send_packet(RESPONSE_EPARSE),
            },
            "xlen" => match rest.parse::<u32>().ok().and_then(Xlen::from_bits) {
                Some(xlen) => {
                    self.backend.set_xlen(xlen);
                    self.send_packet(RESPONSE_OK)
                }
                None => self.send_packet(RESPONSE_EPARSE),
            },
            "reset_dm" => match self.backend.dm_reset() {
                Ok(()) => self.send_packet(RESPONSE_OK),
                Err(_) => self.send_packet(RESPONSE_EBACKEND),
            },
            "reset_ndm" => match self.backend.ndm_reset(true) {
                Ok(()) => self.send_packet(RESPONSE_OK),
                Err(_) => self.send_packet(RESPONSE_EBACKEND),
            },
            "reset_hart" => match self.backend.hart_reset(true) {
                Ok(()) => self.send_packet(RESPONSE_OK),
                Err(_) => self.send_packet(RESPONSE_EBACKEND),
            },
            "elf_load" => {
                if rest.is_empty() {
                    return self.send_packet(RESPONSE_EPARSE);
                }
                match self.backend.load_elf(std::path::Path::new(rest)) {
                    Ok(()) => self.send_packet(RESPONSE_OK),
                    Err(error) => {
                        tracing::warn!("elf_load failed: {error}");
                        self.send_packet(RESPONSE_EBACKEND)
                    }
                }
            }
            _ => {
                tracing::warn!("unrecognized monitor command: {token:?}");
                self.send_packet(b"")
            }
        }
    }
}

fn split_once(bytes: &[u8], separator: u8) -> Option<(&[u8], &[u8])> {
    let position = bytes.iter().position(|&byte| byte == separator)?;
    Some((&bytes[..position], &bytes[position + 1..]))
}

fn parse_hex_field(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u64::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debug_module::PollConfig;
    use crate::dmi::mock::MockDm;
    use crate::protocol::encode_frame;
    use crate::registers::csr;

    use std::cell::RefCell;
    use std::rc::Rc;

    /// In-memory command stream. Reads hand out the scripted bytes one at
    /// a time (so the ack/packet interleaving matches a real socket) and
    /// report EOF when the script is exhausted; writes accumulate in a
    /// shared buffer.
    struct ScriptedConn {
        input: Vec<u8>,
        cursor: usize,
        output: Rc<RefCell<Vec<u8>>>,
    }

    impl ScriptedConn {
        fn new(input: Vec<u8>) -> (Self, Rc<RefCell<Vec<u8>>>) {
            let output = Rc::new(RefCell::new(Vec::new()));
            (
                ScriptedConn {
                    input,
                    cursor: 0,
                    output: Rc::clone(&output),
                },
                output,
            )
        }
    }

    impl io::Read for ScriptedConn {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor >= self.input.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.input[self.cursor];
            self.cursor += 1;
            Ok(1)
        }
    }

    impl io::Write for ScriptedConn {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> StubConfig {
        StubConfig {
            resume_delay: Duration::ZERO,
            idle_delay: Duration::ZERO,
            report_fprs: false,
        }
    }

    fn fast_backend() -> DebugModule<MockDm> {
        let mut backend = DebugModule::new(MockDm::new());
        backend.set_poll_config(PollConfig {
            interval: Duration::ZERO,
            iterations: 4,
            cpu_timeout: u32::MAX,
        });
        backend
    }

    /// Script builder: initial `+`, then each entry, with a `+` appended
    /// for every response the stub is expected to send.
    fn script(entries: &[(&[u8], usize)]) -> Vec<u8> {
        let mut bytes = vec![b'+'];
        for &(chunk, acks) in entries {
            bytes.extend_from_slice(chunk);
            bytes.extend(std::iter::repeat(b'+').take(acks));
        }
        bytes
    }

    fn run_session(backend: &mut DebugModule<MockDm>, input: Vec<u8>) -> Vec<u8> {
        let (conn, output) = ScriptedConn::new(input);
        let mut stub = GdbStub::new(conn, backend, None).with_config(fast_config());
        stub.run().unwrap();
        let bytes = output.borrow().clone();
        bytes
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test]
    fn qsupported_reports_packet_size() {
        let mut backend = fast_backend();
        let input = script(&[(
            &encode_frame(b"qSupported:multiprocess+;swbreak+").unwrap(),
            1,
        )]);
        let output = run_session(&mut backend, input);
        assert_eq!(output[0], b'+');
        assert!(contains(&output, &encode_frame(b"PacketSize=4000").unwrap()));
    }

    #[test]
    fn qattached_reports_attached() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"qAttached").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, &encode_frame(b"1").unwrap()));
    }

    #[test]
    fn read_gpr2_rv64_little_endian_response() {
        let mut backend = fast_backend();
        backend.init();
        backend.transport_mut().regs.insert(0x1002, 0xdead_beef);

        let input = script(&[(&encode_frame(b"p02").unwrap(), 1)]);
        let output = run_session(&mut backend, input);

        assert!(contains(
            &output,
            &encode_frame(b"efbeadde00000000").unwrap()
        ));
        assert!(backend.transport().writes.contains(&(0x17, 0x0032_1002)));
    }

    #[test]
    fn write_pc_rv32_issues_expected_command() {
        let mut backend = fast_backend();
        backend.set_xlen(Xlen::Rv32);
        let input = script(&[(&encode_frame(b"P20=78563412").unwrap(), 1)]);
        let output = run_session(&mut backend, input);

        assert!(contains(&output, b"$OK#9a"));
        assert!(backend.transport().writes.contains(&(0x17, 0x0023_07b1)));
        assert_eq!(backend.transport().regs[&csr::DPC], 0x1234_5678);
    }

    #[test]
    fn priv_register_round_trip() {
        let mut backend = fast_backend();
        let input = script(&[
            (&encode_frame(b"P1041=03").unwrap(), 1),
            (&encode_frame(b"p1041").unwrap(), 1),
        ]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, b"$OK#9a"));
        // PRIV reads back at xlen width.
        assert!(contains(
            &output,
            &encode_frame(b"0300000000000000").unwrap()
        ));
    }

    #[test]
    fn unaligned_binary_write() {
        let mut backend = fast_backend();
        let mut packet = b"X80000003,5:".to_vec();
        packet.extend_from_slice(&[1, 2, 3, 4, 5]);
        let input = script(&[(&encode_frame(&packet).unwrap(), 1)]);
        let output = run_session(&mut backend, input);

        assert!(contains(&output, b"$OK#9a"));
        let mem = &backend.transport().mem;
        assert_eq!(&mem[3..8], &[1, 2, 3, 4, 5]);
        // The aligned middle went out as one streamed word.
        assert!(backend.transport().writes.contains(&(0x3c, 0x0504_0302)));
    }

    #[test]
    fn zero_length_binary_write_is_ok() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"X80000000,0:").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, b"$OK#9a"));
    }

    #[test]
    fn memory_read_and_hex_write() {
        let mut backend = fast_backend();
        backend.init();
        backend
            .write_memory(0x8000_0010, &[0x11, 0x22, 0x33, 0x44])
            .unwrap();

        let input = script(&[
            (&encode_frame(b"m80000010,4").unwrap(), 1),
            (&encode_frame(b"M80000013,3:a1b2c3").unwrap(), 1),
            (&encode_frame(b"m80000012,4").unwrap(), 1),
        ]);
        let output = run_session(&mut backend, input);

        assert!(contains(&output, &encode_frame(b"11223344").unwrap()));
        assert!(contains(&output, &encode_frame(b"33a1b2c3").unwrap()));
    }

    #[test]
    fn continue_interrupt_then_stop_reason() {
        let mut backend = fast_backend();
        let mut input = script(&[(&encode_frame(b"c").unwrap(), 0)]);
        input.push(0x03);
        input.push(b'+'); // ack for the stop reply
        let output = run_session(&mut backend, input);

        assert!(contains(&output, &encode_frame(b"T03").unwrap()));
        assert!(backend.transport().halted);
    }

    #[test]
    fn step_reports_step_cause() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"s").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, &encode_frame(b"T04").unwrap()));
    }

    #[test]
    fn cpu_timeout_forces_a_halt() {
        let mut backend = fast_backend();
        backend.set_poll_config(PollConfig {
            interval: Duration::ZERO,
            iterations: 2,
            cpu_timeout: 1,
        });
        // Two filler bytes keep the stream alive through the two polls
        // (running, then timeout + forced halt) that precede the stop
        // reply; the trailing ack is for the reply itself.
        let mut input = script(&[(&encode_frame(b"c").unwrap(), 0)]);
        input.extend_from_slice(b"\n\n+");
        let output = run_session(&mut backend, input);
        // The forced halt reports a halt-request cause.
        assert!(contains(&output, &encode_frame(b"T03").unwrap()));
    }

    #[test]
    fn checksum_failure_gets_nak_then_retransmission_works() {
        let mut backend = fast_backend();
        let mut input = vec![b'+'];
        input.extend_from_slice(b"$p00#00"); // bad checksum
        input.extend_from_slice(&encode_frame(b"p00").unwrap());
        input.push(b'+');
        let output = run_session(&mut backend, input);

        assert!(output.contains(&b'-'));
        assert!(contains(
            &output,
            &encode_frame(b"0000000000000000").unwrap()
        ));
    }

    #[test]
    fn read_all_registers_dumps_33_values() {
        let mut backend = fast_backend();
        backend.init();
        backend.transport_mut().regs.insert(0x1001, 0x1111);
        backend.transport_mut().regs.insert(csr::DPC, 0x8000_0000);

        let input = script(&[(&encode_frame(b"g").unwrap(), 1)]);
        let output = run_session(&mut backend, input);

        let mut expected = String::new();
        expected.push_str(&protocol::val_to_hex(0, 64)); // x0
        expected.push_str(&protocol::val_to_hex(0x1111, 64)); // x1
        for _ in 2..32 {
            expected.push_str(&protocol::val_to_hex(0, 64));
        }
        expected.push_str(&protocol::val_to_hex(0x8000_0000, 64)); // pc
        assert!(contains(&output, &encode_frame(expected.as_bytes()).unwrap()));
    }

    #[test]
    fn write_all_registers_rv32() {
        let mut backend = fast_backend();
        backend.set_xlen(Xlen::Rv32);

        let mut dump = String::new();
        for n in 0..32u64 {
            dump.push_str(&protocol::val_to_hex(n * 3, 32));
        }
        dump.push_str(&protocol::val_to_hex(0x8000_0040, 32));
        let mut packet = b"G".to_vec();
        packet.extend_from_slice(dump.as_bytes());

        let input = script(&[(&encode_frame(&packet).unwrap(), 1)]);
        let output = run_session(&mut backend, input);

        assert!(contains(&output, b"$OK#9a"));
        assert_eq!(backend.transport().regs[&0x1005], 15);
        assert_eq!(backend.transport().regs[&csr::DPC], 0x8000_0040);
    }

    #[test]
    fn write_all_registers_rejects_wrong_length() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"G0011").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, &encode_frame(b"E01").unwrap()));
    }

    #[test]
    fn unknown_packet_gets_empty_response() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"Z0,8000,4").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, b"$#00"));
    }

    #[test]
    fn unknown_register_number_is_an_error() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"p2000").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, &encode_frame(b"E01").unwrap()));
    }

    #[test]
    fn detach_replies_ok() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"D").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, b"$OK#9a"));
    }

    #[test]
    fn monitor_help_is_sent_as_console_output() {
        let mut backend = fast_backend();
        let mut packet = b"qRcmd,".to_vec();
        packet.extend_from_slice(protocol::bin2hex(b"help").as_bytes());
        let input = script(&[(&encode_frame(&packet).unwrap(), 2)]);
        let output = run_session(&mut backend, input);

        assert!(contains(&output, b"$O"));
        assert!(contains(&output, b"$OK#9a"));
    }

    #[test]
    fn monitor_xlen_switches_width() {
        let mut backend = fast_backend();
        backend.init();
        backend.transport_mut().regs.insert(0x1002, 0xdead_beef);

        let mut xlen_packet = b"qRcmd,".to_vec();
        xlen_packet.extend_from_slice(protocol::bin2hex(b"xlen 32").as_bytes());
        let input = script(&[
            (&encode_frame(&xlen_packet).unwrap(), 1),
            (&encode_frame(b"p02").unwrap(), 1),
        ]);
        let output = run_session(&mut backend, input);

        assert!(contains(&output, b"$OK#9a"));
        // After the switch the response is 8 digits, not 16.
        assert!(contains(&output, &encode_frame(b"efbeadde").unwrap()));
        assert_eq!(backend.xlen(), Xlen::Rv32);
    }

    #[test]
    fn monitor_unknown_command_gets_empty_response() {
        let mut backend = fast_backend();
        let mut packet = b"qRcmd,".to_vec();
        packet.extend_from_slice(protocol::bin2hex(b"frobnicate").as_bytes());
        let input = script(&[(&encode_frame(&packet).unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        assert!(contains(&output, b"$#00"));
    }

    #[test]
    fn oversized_memory_read_is_clamped() {
        let mut backend = fast_backend();
        let input = script(&[(&encode_frame(b"m80000000,4000").unwrap(), 1)]);
        let output = run_session(&mut backend, input);
        // (PACKET_BUF_MAX - 1) / 2 bytes, two digits each.
        let expected_digits = ((PACKET_BUF_MAX - 1) / 2) * 2;
        let start = output
            .windows(2)
            .enumerate()
            .find_map(|(i, w)| (w == b"$0").then_some(i))
            .expect("hex response present");
        let end = output[start..].iter().position(|&b| b == b'#').unwrap();
        assert_eq!(end - 1, expected_digits);
    }
}
