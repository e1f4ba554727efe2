//! STC89/90 and STC89A operations.
//!
//! The oldest dialect: single-byte checksums, no parity, a 16-bit
//! baud-rate timer and a per-block data checksum echoed back for
//! verification. The STC89A variant keeps the 16-bit timer but moves to
//! double-byte checksums and flips the line to even parity after the
//! baud test.

use super::{
    parse_status_common, ProtocolOps, CMD_BAUD_SWITCH, CMD_BAUD_TEST, CMD_DISCONNECT,
    CMD_DISCONNECT_FF, CMD_ERASE, CMD_ERASE_84, CMD_PING, CMD_PREPARE, CMD_SET_OPTIONS,
    CMD_SET_OPTIONS_8D, CMD_WRITE_BLOCK, CMD_WRITE_FIRST,
};
use crate::packet::checksum8;
use crate::session::{Session, UID_LEN};
use crate::transport::Parity;
use crate::{Error, Result};

/// 16-bit BRT reload: `65536 − clock / (baud × sample_rate)` with 16
/// samples per bit in 6T mode and 32 in 12T.
pub(super) fn transfer_brt(clock_hz: f64, baud_transfer: u32, cpu_6t: bool) -> u16 {
    let sample_rate = if cpu_6t { 16.0 } else { 32.0 };
    let brt = 65536 - (clock_hz / (baud_transfer as f64 * sample_rate) + 0.5) as i64;
    brt.clamp(0, 65535) as u16
}

/// Coarser wait-state table than the STC12+ one.
fn iap_delay_stc89(clock_hz: f64) -> u8 {
    if clock_hz < 5e6 {
        0x83
    } else if clock_hz < 10e6 {
        0x82
    } else if clock_hz < 20e6 {
        0x81
    } else {
        0x80
    }
}

fn parse_status_stc89(session: &mut Session, payload: &[u8]) -> Result<()> {
    if payload.len() < 20 {
        return Err(Error::InvalidParam);
    }
    parse_status_common(session, payload)?;
    // Bit 0 of byte 19, inverted: 6T (double speed) parts report 0.
    session.mcu_info.cpu_6t = payload[19] & 1 == 0;
    let cpu_t = if session.mcu_info.cpu_6t { 6.0 } else { 12.0 };
    session.mcu_info.clock_hz =
        session.comm.baud_handshake as f64 * session.mcu_info.freq_counter as f64 * cpu_t / 7.0;
    Ok(())
}

fn handshake_stc89(session: &mut Session) -> Result<()> {
    let brt = transfer_brt(
        session.mcu_info.clock_hz,
        session.comm.baud_transfer,
        session.mcu_info.cpu_6t,
    );
    let brt_hi = (brt >> 8) as u8;
    let brt_csum = (2 * (256 - brt_hi as u32)) as u8;
    let delay = 0xA0;
    let iap_wait = iap_delay_stc89(session.mcu_info.clock_hz);
    let timeout = session.comm.timeout_ms;
    let baud_handshake = session.comm.baud_handshake;
    let baud_transfer = session.comm.baud_transfer;

    // Test the new rate.
    let test = [
        CMD_BAUD_TEST,
        brt_hi,
        brt as u8,
        0xFF - brt_hi,
        brt_csum,
        delay,
        iap_wait,
    ];
    session.send_frame(&test)?;
    session.transport.delay_ms(100);
    session.transport.set_baudrate(baud_transfer)?;
    let reply = match session.recv_frame(timeout) {
        Ok(reply) => reply,
        Err(e) => {
            session.transport.set_baudrate(baud_handshake)?;
            return Err(e);
        }
    };
    if reply.first() != Some(&CMD_BAUD_TEST) {
        session.transport.set_baudrate(baud_handshake)?;
        return Err(Error::HandshakeFail);
    }
    session.transport.set_baudrate(baud_handshake)?;

    // Commit it.
    let commit = [CMD_BAUD_SWITCH, brt_hi, brt as u8, 0xFF - brt_hi, brt_csum, delay];
    session.send_frame(&commit)?;
    session.transport.delay_ms(100);
    session.transport.set_baudrate(baud_transfer)?;
    let reply = session.recv_frame(timeout)?;
    if reply.first() != Some(&CMD_BAUD_SWITCH) {
        return Err(Error::HandshakeFail);
    }

    // Four ping-pong rounds at the new rate.
    let magic = session.mcu_info.magic;
    let ping = [
        CMD_PING,
        0x00,
        0x00,
        0x36,
        0x01,
        (magic >> 8) as u8,
        magic as u8,
    ];
    for _ in 0..4 {
        let reply = session.transfer(&ping, timeout)?;
        if reply.first() != Some(&CMD_PING) {
            return Err(Error::HandshakeFail);
        }
    }
    Ok(())
}

fn erase_stc89(session: &mut Session, size: u32) -> Result<()> {
    let blks = (size.div_ceil(512) * 2) as u8;
    let request = [CMD_ERASE_84, blks, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33];
    session.send_frame(&request)?;
    let timeout = session.comm.erase_timeout_ms;
    let reply = session.recv_frame(timeout).map_err(|_| Error::EraseFail)?;
    if reply.first() != Some(&CMD_PING) {
        return Err(Error::EraseFail);
    }
    Ok(())
}

/// Block write plus the echoed data checksum the STC89 loader verifies.
fn program_block_stc89(session: &mut Session, addr: u32, data: &[u8]) -> Result<()> {
    let block_size = session.config()?.block_size;
    let request = super::stc12::build_block_request(addr, block_size, data);
    let data_csum = checksum8(data);

    let timeout = session.comm.timeout_ms;
    let reply = session
        .transfer(&request, timeout)
        .map_err(|_| Error::ProgramFail)?;
    if reply.first() != Some(&CMD_PING) {
        return Err(Error::ProgramFail);
    }
    if reply.len() >= 2 && reply[1] != data_csum {
        return Err(Error::VerifyFail);
    }
    Ok(())
}

pub(crate) struct Stc89;

impl ProtocolOps for Stc89 {
    fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
        parse_status_stc89(session, payload)
    }

    fn handshake(&self, session: &mut Session) -> Result<()> {
        handshake_stc89(session)
    }

    fn erase_flash(&self, session: &mut Session, size: u32) -> Result<()> {
        erase_stc89(session, size)
    }

    fn program_block(
        &self,
        session: &mut Session,
        addr: u32,
        data: &[u8],
        _is_first: bool,
    ) -> Result<()> {
        program_block_stc89(session, addr, data)
    }

    fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()> {
        let msr = *options.first().ok_or(Error::InvalidParam)?;
        let request = [CMD_SET_OPTIONS_8D, msr, 0xFF, 0xFF, 0xFF];
        let timeout = session.comm.timeout_ms;
        let reply = session.transfer(&request, timeout)?;
        if reply.first() != Some(&CMD_SET_OPTIONS_8D) {
            return Err(Error::Protocol);
        }
        Ok(())
    }

    fn disconnect(&self, session: &mut Session) -> Result<()> {
        session.send_frame(&[CMD_DISCONNECT])
    }
}

fn parse_status_stc89a(session: &mut Session, payload: &[u8]) -> Result<()> {
    use byteorder::{BigEndian, ByteOrder};

    if payload.len() < 15 {
        return Err(Error::InvalidParam);
    }
    session.status_payload.clear();
    session.status_payload.extend_from_slice(payload);

    // This variant reports a single period count at 13..14 and derives
    // the clock as 12 × counter × baud.
    session.mcu_info.freq_counter = BigEndian::read_u16(&payload[13..15]);
    session.mcu_info.clock_hz =
        12.0 * session.mcu_info.freq_counter as f64 * session.comm.baud_handshake as f64;
    if payload.len() >= 22 {
        session.mcu_info.magic = BigEndian::read_u16(&payload[20..22]);
    }
    session.mcu_info.cpu_6t = false;
    Ok(())
}

fn handshake_stc89a(session: &mut Session) -> Result<()> {
    let clock = session.mcu_info.clock_hz;
    let brt = (65536.0 - clock / (session.comm.baud_transfer as f64 * 32.0) + 0.5) as u16;
    let iap_wait = if clock < 10e6 {
        0x83
    } else if clock < 30e6 {
        0x82
    } else if clock < 50e6 {
        0x81
    } else {
        0x80
    };
    let timeout = session.comm.timeout_ms;
    let baud_transfer = session.comm.baud_transfer;

    let test = [0x01, (brt >> 8) as u8, brt as u8, iap_wait];
    session.send_frame(&test)?;
    session.transport.delay_ms(200);
    let reply = session.recv_frame(timeout)?;
    if reply.first() != Some(&0x01) {
        return Err(Error::HandshakeFail);
    }

    session.transport.set_baudrate(baud_transfer)?;
    session.transport.set_parity(Parity::Even)?;

    let confirm = [CMD_PREPARE, 0x00, 0x00, 0x46, 0xB9];
    let reply = session.transfer(&confirm, timeout)?;
    if reply.first() != Some(&CMD_PREPARE) {
        return Err(Error::HandshakeFail);
    }
    Ok(())
}

/// Whole-chip erase; the UID follows the opcode echo.
fn erase_stc89a(session: &mut Session) -> Result<()> {
    let request = [CMD_ERASE, 0x00, 0x00, 0x46, 0xB9];
    session.send_frame(&request)?;
    let timeout = session.comm.erase_timeout_ms;
    let reply = session.recv_frame(timeout).map_err(|_| Error::EraseFail)?;
    if reply.first() != Some(&CMD_ERASE) {
        return Err(Error::EraseFail);
    }
    if reply.len() >= 1 + UID_LEN && !session.mcu_info.uid_valid {
        session.mcu_info.uid.copy_from_slice(&reply[1..1 + UID_LEN]);
        session.mcu_info.uid_valid = true;
    }
    Ok(())
}

fn program_block_stc89a(
    session: &mut Session,
    addr: u32,
    data: &[u8],
    is_first: bool,
) -> Result<()> {
    let mut request = Vec::with_capacity(5 + data.len());
    if is_first {
        request.extend_from_slice(&[CMD_WRITE_FIRST, 0x00, 0x00]);
    } else {
        request.extend_from_slice(&[CMD_WRITE_BLOCK, (addr >> 8) as u8, addr as u8]);
    }
    request.extend_from_slice(&[0x46, 0xB9]);
    request.extend_from_slice(data);

    let timeout = session.comm.timeout_ms;
    let reply = session
        .transfer(&request, timeout)
        .map_err(|_| Error::ProgramFail)?;
    if reply.first() != Some(&CMD_WRITE_BLOCK) {
        return Err(Error::ProgramFail);
    }
    Ok(())
}

pub(crate) struct Stc89a;

impl ProtocolOps for Stc89a {
    fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
        parse_status_stc89a(session, payload)
    }

    fn handshake(&self, session: &mut Session) -> Result<()> {
        handshake_stc89a(session)
    }

    fn erase_flash(&self, session: &mut Session, _size: u32) -> Result<()> {
        erase_stc89a(session)
    }

    fn program_block(
        &self,
        session: &mut Session,
        addr: u32,
        data: &[u8],
        is_first: bool,
    ) -> Result<()> {
        program_block_stc89a(session, addr, data, is_first)
    }

    fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()> {
        let mut request = Vec::with_capacity(5);
        request.push(CMD_SET_OPTIONS);
        let take = options.len().min(4);
        request.extend_from_slice(&options[..take]);
        while request.len() < 5 {
            request.push(0xFF);
        }
        let timeout = session.comm.timeout_ms;
        session.transfer(&request, timeout)?;
        Ok(())
    }

    fn disconnect(&self, session: &mut Session) -> Result<()> {
        session.send_frame(&[CMD_DISCONNECT_FF])
    }
}
