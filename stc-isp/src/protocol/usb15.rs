//! STC15 USB bootloader (HID) operations.
//!
//! The serial core cannot drive the USB variant; every operation reports
//! a protocol error. The 7-byte block codec itself lives in
//! [`packet`](crate::packet) and is kept current for a future HID
//! transport.

use super::ProtocolOps;
use crate::session::Session;
use crate::{Error, Result};

pub(crate) struct Usb15;

impl ProtocolOps for Usb15 {
    fn parse_status_packet(&self, _session: &mut Session, _payload: &[u8]) -> Result<()> {
        Err(Error::Protocol)
    }

    fn handshake(&self, _session: &mut Session) -> Result<()> {
        Err(Error::Protocol)
    }

    fn erase_flash(&self, _session: &mut Session, _size: u32) -> Result<()> {
        Err(Error::Protocol)
    }

    fn program_block(
        &self,
        _session: &mut Session,
        _addr: u32,
        _data: &[u8],
        _is_first: bool,
    ) -> Result<()> {
        Err(Error::Protocol)
    }

    fn set_options(&self, _session: &mut Session, _options: &[u8]) -> Result<()> {
        Err(Error::Protocol)
    }

    fn disconnect(&self, _session: &mut Session) -> Result<()> {
        Ok(())
    }
}
