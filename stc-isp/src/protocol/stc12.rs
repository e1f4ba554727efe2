//! STC10/11/12 operations.
//!
//! The only family with an 8-bit baud-rate timer. Handshake is the full
//! three-step dance: `0x50` probe, `0x8F` baud test at the new rate,
//! `0x8E` commit. Erase carries the descending countdown sequence and
//! returns the chip UID.

use super::stc15::handshake_request;
use super::{
    iap_delay, parse_status_common, ProtocolOps, CMD_BAUD_SWITCH, CMD_BAUD_TEST, CMD_DISCONNECT,
    CMD_ERASE_84, CMD_FINISH, CMD_SET_OPTIONS_8D,
};
use crate::session::{Session, UID_LEN};
use crate::{Error, Result};

/// 8-bit BRT reload: `256 − clock / (baud × 16)`, clamped to 1..=255.
pub(super) fn transfer_brt(clock_hz: f64, baud_transfer: u32) -> u8 {
    let brt = 256 - (clock_hz / (baud_transfer as f64 * 16.0) + 0.5) as i32;
    brt.clamp(1, 255) as u8
}

fn handshake(session: &mut Session) -> Result<()> {
    let brt = transfer_brt(session.mcu_info.clock_hz, session.comm.baud_transfer);
    let brt_csum = (2 * (256 - brt as u32)) as u8;
    let delay = 0x80;
    let iap_wait = iap_delay(session.mcu_info.clock_hz);
    let timeout = session.comm.timeout_ms;
    let baud_handshake = session.comm.baud_handshake;
    let baud_transfer = session.comm.baud_transfer;

    // Step 1: probe at the handshake baud.
    handshake_request(session)?;

    // Step 2: test the new rate, listening at the transfer baud.
    let test = [CMD_BAUD_TEST, 0xC0, brt, 0x3F, brt_csum, delay, iap_wait];
    session.send_frame(&test)?;
    session.transport.delay_ms(100);
    session.transport.set_baudrate(baud_transfer)?;
    let reply = session.recv_frame(timeout).or_else(|e| {
        session.transport.set_baudrate(baud_handshake)?;
        Err(e)
    })?;
    if reply.first() != Some(&CMD_BAUD_TEST) {
        session.transport.set_baudrate(baud_handshake)?;
        return Err(Error::HandshakeFail);
    }
    session.transport.set_baudrate(baud_handshake)?;

    // Step 3: commit.
    let commit = [CMD_BAUD_SWITCH, 0xC0, brt, 0x3F, brt_csum, delay];
    session.send_frame(&commit)?;
    session.transport.delay_ms(100);
    session.transport.set_baudrate(baud_transfer)?;
    let reply = session.recv_frame(timeout)?;
    if reply.first() != Some(&CMD_ERASE_84) {
        return Err(Error::HandshakeFail);
    }
    Ok(())
}

/// Erase with the sector count and the `0x80 … 0x0D` countdown tail; the
/// reply carries the 7-byte UID.
fn erase_flash(session: &mut Session, size: u32) -> Result<()> {
    let blks = (size.div_ceil(512) * 2) as u8;
    let total_blks = (session.mcu_info.flash_size.div_ceil(512) * 2) as u8;
    let countdown_end = session.config()?.erase_countdown.unwrap_or(0x0D);

    let mut request = vec![CMD_ERASE_84, 0xFF, 0x00, blks, 0x00, 0x00, total_blks];
    request.extend_from_slice(&[0x00; 19]);
    for value in (countdown_end..=0x80).rev() {
        request.push(value);
    }

    session.send_frame(&request)?;
    let timeout = session.comm.erase_timeout_ms;
    let reply = session.recv_frame(timeout).map_err(|_| Error::EraseFail)?;
    if reply.first() != Some(&0x00) {
        return Err(Error::EraseFail);
    }
    if reply.len() >= 1 + UID_LEN && !session.mcu_info.uid_valid {
        session.mcu_info.uid.copy_from_slice(&reply[1..1 + UID_LEN]);
        session.mcu_info.uid_valid = true;
    }
    Ok(())
}

/// Address-and-size block header shared with STC89.
pub(super) fn build_block_request(addr: u32, block_size: usize, data: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(7 + block_size);
    request.extend_from_slice(&[0x00, 0x00, 0x00]);
    request.push((addr >> 8) as u8);
    request.push(addr as u8);
    request.push((block_size >> 8) as u8);
    request.push(block_size as u8);
    request.extend_from_slice(data);
    request
}

fn program_block(session: &mut Session, addr: u32, data: &[u8]) -> Result<()> {
    let block_size = session.config()?.block_size;
    let request = build_block_request(addr, block_size, data);
    let timeout = session.comm.timeout_ms;
    let reply = session
        .transfer(&request, timeout)
        .map_err(|_| Error::ProgramFail)?;
    if reply.first() != Some(&0x00) {
        return Err(Error::ProgramFail);
    }
    Ok(())
}

fn program_finish(session: &mut Session) -> Result<()> {
    let magic = session.mcu_info.magic;
    let request = [
        CMD_FINISH,
        0x00,
        0x00,
        0x36,
        0x01,
        (magic >> 8) as u8,
        magic as u8,
    ];
    let timeout = session.comm.timeout_ms;
    let reply = session.transfer(&request, timeout)?;
    if reply.first() != Some(&CMD_SET_OPTIONS_8D) {
        return Err(Error::ProgramFail);
    }
    Ok(())
}

fn set_options(session: &mut Session, options: &[u8]) -> Result<()> {
    if options.len() < 4 {
        return Err(Error::InvalidParam);
    }
    let mut request = Vec::with_capacity(5);
    request.push(CMD_SET_OPTIONS_8D);
    request.extend_from_slice(&options[..4]);
    let timeout = session.comm.timeout_ms;
    session.transfer(&request, timeout)?;
    Ok(())
}

pub(crate) struct Stc12;

impl ProtocolOps for Stc12 {
    fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
        parse_status_common(session, payload)?;
        session.mcu_info.cpu_6t = false;
        Ok(())
    }

    fn handshake(&self, session: &mut Session) -> Result<()> {
        handshake(session)
    }

    fn erase_flash(&self, session: &mut Session, size: u32) -> Result<()> {
        erase_flash(session, size)
    }

    fn program_block(
        &self,
        session: &mut Session,
        addr: u32,
        data: &[u8],
        _is_first: bool,
    ) -> Result<()> {
        program_block(session, addr, data)
    }

    fn program_finish(&self, session: &mut Session) -> Result<()> {
        program_finish(session)
    }

    fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()> {
        set_options(session, options)
    }

    fn disconnect(&self, session: &mut Session) -> Result<()> {
        session.send_frame(&[CMD_DISCONNECT])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brt_is_clamped_to_valid_reloads() {
        // 11.0592 MHz at 115200 × 16 gives reload 250.
        assert_eq!(transfer_brt(11_059_200.0, 115_200), 250);
        // Absurdly slow clock saturates at 255.
        assert_eq!(transfer_brt(100.0, 115_200), 255);
        // Clock too fast for the divisor pins at 1.
        assert_eq!(transfer_brt(500_000_000.0, 115_200), 1);
    }

    #[test]
    fn erase_countdown_descends_to_the_configured_tail() {
        let blks = (4096u32.div_ceil(512) * 2) as u8;
        assert_eq!(blks, 16);
        let countdown: Vec<u8> = (0x0D..=0x80).rev().collect();
        assert_eq!(countdown.first(), Some(&0x80));
        assert_eq!(countdown.last(), Some(&0x0D));
        assert_eq!(countdown.len(), 0x80 - 0x0D + 1);
    }
}
