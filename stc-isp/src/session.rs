//! Session state shared by the protocol operations and the life-cycle
//! driver.

use crate::config::{ProtocolConfig, ProtocolId};
use crate::packet::{self, RxParser, RxState};
use crate::protocol::{self, ProtocolOps};
use crate::transport::Transport;
use crate::{Error, Result};

/// Length of the unique ID the newer bootloaders return after erase.
pub const UID_LEN: usize = 7;

/// How the protocol family is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Identify from the magic reported at connect time, with the model
    /// name prefix matcher as fallback.
    Auto,
    /// Caller-imposed family; identification failures are not fatal.
    Manual(ProtocolId),
}

/// Everything learned about the target at connect time.
#[derive(Clone, Debug, Default)]
pub struct McuInfo {
    /// Two-byte die identifier from the status packet.
    pub magic: u16,
    /// Database name, if the magic is on file.
    pub model_name: Option<&'static str>,
    pub flash_size: u32,
    pub eeprom_size: u32,
    /// Measured oscillator frequency in Hz.
    pub clock_hz: f64,
    /// Raw BSL version byte.
    pub bsl_version: u8,
    /// Rendered version, e.g. `7.2.0C`.
    pub bsl_version_str: String,
    /// STC89 only: true when the part runs in 6T (double-speed) mode.
    pub cpu_6t: bool,
    /// Averaged raw period count from the status packet.
    pub freq_counter: u16,
    /// Unique ID, filled in after the first erase on families that
    /// expose it.
    pub uid: [u8; UID_LEN],
    pub uid_valid: bool,
}

/// Result of the RC oscillator trim search.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrimResult {
    /// Trim committed for the user's run frequency.
    pub user_trim: u16,
    /// Trim for the safe programming frequency.
    pub program_trim: u16,
    pub trim_divider: u8,
    pub trim_range: u8,
    /// Calibrated oscillator frequency in Hz, written into the option
    /// bytes later.
    pub final_frequency: f64,
}

/// Serial timing parameters of one programming act.
#[derive(Clone, Copy, Debug)]
pub struct CommConfig {
    /// Baud rate of the initial status exchange.
    pub baud_handshake: u32,
    /// Negotiated transfer baud rate.
    pub baud_transfer: u32,
    pub timeout_ms: u32,
    /// Flash erase can take several seconds on large parts.
    pub erase_timeout_ms: u32,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            baud_handshake: 2400,
            baud_transfer: 115_200,
            timeout_ms: 1000,
            erase_timeout_ms: 15_000,
        }
    }
}

/// State of one target programming act.
///
/// Owns the transport for the whole session. Created per target and
/// discarded afterwards; `reset` rewinds it for a fresh `connect` without
/// losing the transport or the communication parameters.
pub struct Session {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) select_mode: SelectMode,
    pub(crate) proto: Option<ProtocolId>,
    pub(crate) mcu_info: McuInfo,
    pub(crate) trim: TrimResult,
    pub(crate) comm: CommConfig,
    /// Raw copy of the initial status payload. STC15A calibration and the
    /// STC8 option write re-emit bytes from it verbatim, so it is kept
    /// rather than recomputed from derived fields.
    pub(crate) status_payload: Vec<u8>,
    tx_buf: Vec<u8>,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            select_mode: SelectMode::Auto,
            proto: None,
            mcu_info: McuInfo::default(),
            trim: TrimResult::default(),
            comm: CommConfig::default(),
            status_payload: Vec::new(),
            tx_buf: Vec::with_capacity(packet::MAX_FRAME_LEN),
        }
    }

    /// Drop everything learned from the previous target, keeping the
    /// transport, communication parameters and selection mode.
    pub fn reset(&mut self) {
        self.mcu_info = McuInfo::default();
        self.trim = TrimResult::default();
        self.status_payload.clear();
        self.proto = match self.select_mode {
            SelectMode::Manual(id) => Some(id),
            SelectMode::Auto => None,
        };
    }

    pub(crate) fn bind(&mut self, proto: ProtocolId) {
        self.proto = Some(proto);
    }

    /// Bound protocol configuration row.
    pub(crate) fn config(&self) -> Result<&'static ProtocolConfig> {
        self.proto.map(ProtocolId::config).ok_or(Error::Protocol)
    }

    /// Bound protocol operations table.
    pub(crate) fn ops(&self) -> Result<&'static dyn ProtocolOps> {
        self.proto.map(protocol::ops_for).ok_or(Error::Protocol)
    }

    /// Frame `payload` with the bound family's checksum and send it.
    pub(crate) fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let kind = self.config()?.checksum;
        self.tx_buf.clear();
        packet::build_frame(kind, payload, &mut self.tx_buf);
        log::trace!("tx {:02X?}", &self.tx_buf);
        let timeout = self.comm.timeout_ms;
        self.transport.write(&self.tx_buf, timeout)?;
        Ok(())
    }

    /// Receive one complete frame within `timeout_ms` and return its
    /// payload.
    ///
    /// Bytes stream through the receive state machine, so line noise
    /// ahead of the frame is tolerated; the checksum is verified against
    /// the bound family's discipline.
    pub(crate) fn recv_frame(&mut self, timeout_ms: u32) -> Result<Vec<u8>> {
        let kind = self.config()?.checksum;
        let start = self.transport.tick_ms();
        let mut parser = RxParser::new();
        let mut chunk = [0u8; 64];

        loop {
            let elapsed = self.transport.tick_ms().wrapping_sub(start);
            if elapsed >= timeout_ms {
                return Err(Error::Timeout);
            }
            let n = self.transport.read(&mut chunk, timeout_ms - elapsed)?;
            for &byte in &chunk[..n] {
                match parser.push(byte) {
                    RxState::Complete => {
                        log::trace!("rx {:02X?}", parser.frame());
                        let info = packet::parse_frame(kind, parser.frame())?;
                        return Ok(info.payload.to_vec());
                    }
                    RxState::Error => return Err(Error::Frame),
                    _ => {}
                }
            }
        }
    }

    /// Send a payload and wait for the reply payload.
    pub(crate) fn transfer(&mut self, payload: &[u8], timeout_ms: u32) -> Result<Vec<u8>> {
        self.send_frame(payload)?;
        self.recv_frame(timeout_ms)
    }

    /// Stream `count` sync bytes back to back, e.g. to clock the
    /// bootloader's calibration counter.
    pub(crate) fn pulse_sync(&mut self, sync: u8, count: usize) {
        let byte = [sync];
        for _ in 0..count {
            let _ = self.transport.write(&byte, 10);
        }
    }

    pub fn mcu_info(&self) -> &McuInfo {
        &self.mcu_info
    }

    pub fn trim_result(&self) -> &TrimResult {
        &self.trim
    }

    pub fn comm_config(&self) -> &CommConfig {
        &self.comm
    }

    pub fn comm_config_mut(&mut self) -> &mut CommConfig {
        &mut self.comm
    }

    pub fn detected_protocol(&self) -> Option<ProtocolId> {
        self.proto
    }
}
