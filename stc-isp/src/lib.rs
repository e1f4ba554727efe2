//! In-system programming library for STC 8051-compatible microcontrollers.
//!
//! Drives the factory bootloader of the STC89, STC89A, STC10/11/12,
//! STC15/STC15A, STC8/STC8H and STC32 series over an asynchronous serial
//! line: identify the chip, negotiate a fast transfer baud rate, calibrate
//! the internal RC oscillator where the family requires it, erase and
//! program flash, write option bytes and disconnect.
//!
//! The library performs no I/O of its own. All traffic flows through the
//! [`Transport`] trait, so the same core runs against a PC serial port or
//! an embedded UART. A typical programming run:
//!
//! ```no_run
//! # fn run(port: Box<dyn stc_isp::Transport>) -> stc_isp::Result<()> {
//! let mut programmer = stc_isp::Programmer::new(port);
//! programmer.connect(10_000)?;
//! programmer.select_protocol()?;
//! let firmware = [0x02, 0x00, 0x00];
//! programmer.program(&firmware, &stc_isp::ProgramConfig::default())?;
//! # Ok(()) }
//! ```

mod config;
mod models;
pub mod packet;
mod programmer;
mod protocol;
mod session;
#[cfg(test)]
mod testing;
mod transport;

pub use config::{BrtWidth, ChecksumKind, ProtocolConfig, ProtocolId};
pub use models::{find_model_by_magic, find_model_by_name, match_protocol_by_name, models, ModelInfo};
pub use programmer::{ProgramConfig, Programmer};
pub use session::{CommConfig, McuInfo, SelectMode, Session, TrimResult};
pub use transport::{Parity, Transport};

/// Programming error.
///
/// One stable code per failure class of the bootloader conversation; the
/// display strings are the user-visible error table.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("timed out waiting for target")]
    Timeout,
    #[error("checksum mismatch")]
    Checksum,
    #[error("malformed frame")]
    Frame,
    #[error("protocol error")]
    Protocol,
    #[error("unknown model")]
    UnknownModel,
    #[error("flash erase failed")]
    EraseFail,
    #[error("flash programming failed")]
    ProgramFail,
    #[error("block verification failed")]
    VerifyFail,
    #[error("handshake failed")]
    HandshakeFail,
    #[error("frequency calibration failed")]
    CalibrationFail,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("no response from target")]
    NoResponse,
    #[error("target is locked")]
    McuLocked,
}

pub type Result<T> = core::result::Result<T, Error>;
