//! STC15 and STC15A operations.
//!
//! The STC15 handshake is only the `0x50` exchange at the handshake baud;
//! the real baud switch happens at the end of calibration because the
//! transfer baud derives from the trim the search settles on. Most of
//! these routines are shared verbatim by the STC8 families.

use byteorder::{BigEndian, ByteOrder};

use super::{
    iap_delay, parse_status_common, reply_counters, select_best_trim, select_coarse_trim,
    ProtocolOps, CMD_BAUD_SWITCH, CMD_BAUD_TEST, CMD_DISCONNECT, CMD_ERASE, CMD_FINISH_72,
    CMD_FREQ_CALIB, CMD_HANDSHAKE_REQ, CMD_SET_OPTIONS, CMD_WRITE_BLOCK, CMD_WRITE_FIRST,
};
use crate::packet::SYNC_CHAR;
use crate::session::Session;
use crate::{Error, Result};

/// Fixed programming oscillator of the STC15 series.
pub(super) const PROGRAM_FREQ_STC15: f64 = 22_118_400.0;

/// Reply status byte acknowledging a write.
const ACK_OK: u8 = 0x54;

/// BRT reload for the programming oscillator on STC15 and later.
pub(super) fn transfer_brt(program_freq: f64, baud_transfer: u32) -> u16 {
    (65536.0 - program_freq / (baud_transfer as f64 * 4.0) + 0.5) as u16
}

/// The `0x50` handshake request shared by STC12/15/8.
pub(super) fn handshake_request(session: &mut Session) -> Result<()> {
    let magic = session.mcu_info.magic;
    let request = [
        CMD_HANDSHAKE_REQ,
        0x00,
        0x00,
        0x36,
        0x01,
        (magic >> 8) as u8,
        magic as u8,
    ];
    let timeout = session.comm.timeout_ms;
    let reply = session.transfer(&request, timeout)?;
    if reply.first() != Some(&CMD_BAUD_TEST) {
        return Err(Error::HandshakeFail);
    }
    Ok(())
}

/// Send one calibration challenge set, clock the target with sync bytes
/// and collect the reply.
pub(super) fn run_challenge(session: &mut Session, payload: &[u8], sync: u8) -> Result<Vec<u8>> {
    session.send_frame(payload)?;
    session.transport.delay_ms(100);
    session.pulse_sync(sync, 1000);
    session.recv_frame(2000)
}

/// Commit the chosen trim and switch to the transfer baud rate.
pub(super) fn commit_baudrate(
    session: &mut Session,
    program_freq: f64,
    trim_range: u8,
    trim_value: u8,
) -> Result<()> {
    let brt = transfer_brt(program_freq, session.comm.baud_transfer);
    let commit = [
        0x01,
        0x00,
        0x00,
        (brt >> 8) as u8,
        brt as u8,
        trim_range,
        trim_value,
        iap_delay(program_freq),
    ];
    let timeout = session.comm.timeout_ms;
    session.transfer(&commit, timeout)?;
    let baud = session.comm.baud_transfer;
    session.transport.set_baudrate(baud)?;
    Ok(())
}

/// Coarse + fine trim search of the STC15/STC8 dialects.
///
/// Round one sweeps the 23-step grid to pick a divider and interpolate an
/// approximate trim, round two probes `±1` across four ranges and keeps
/// the closest hit. When nothing brackets the target, mid-scale trim at
/// divider 1 is committed rather than failing the run.
fn calibrate_stc15(session: &mut Session, target_hz: Option<f64>) -> Result<()> {
    let user_speed = match target_hz {
        Some(hz) if hz > 0.0 => hz,
        _ => session.mcu_info.clock_hz,
    };
    let target_count = (session.mcu_info.freq_counter as f64 * user_speed
        / session.mcu_info.clock_hz
        + 0.5) as u32;

    // Round 1: coarse sweep.
    let mut challenge = vec![0x00, 12];
    for i in 1u8..=10 {
        challenge.extend_from_slice(&[23 * i, 0x00]);
    }
    challenge.extend_from_slice(&[255, 0x00, 255, 0x00]);
    let reply = run_challenge(session, &challenge, SYNC_CHAR)?;
    let counts = reply_counters(&reply, 11)?;
    let (divider, approx_trim) = select_coarse_trim(target_count, &counts).unwrap_or((1, 128));

    // Round 2: the approximate trim ±1 across four ranges.
    let mut pairs = Vec::with_capacity(12);
    for range in 0u8..4 {
        for delta in -1i32..=1 {
            pairs.push(((approx_trim as i32 + delta) as u8, range));
        }
    }
    let mut challenge = vec![0x00, pairs.len() as u8];
    for (trim, range) in &pairs {
        challenge.extend_from_slice(&[*trim, *range]);
    }
    let reply = run_challenge(session, &challenge, SYNC_CHAR)?;
    let counts = reply_counters(&reply, pairs.len())?;
    let (best, best_count) = select_best_trim(target_count, &counts);
    let (best_trim, best_range) = pairs[best];

    session.trim.user_trim = best_trim as u16;
    session.trim.trim_range = best_range;
    session.trim.trim_divider = divider;
    session.trim.final_frequency =
        best_count as f64 * session.comm.baud_handshake as f64 / 2.0 / divider as f64;

    let program_target = (session.mcu_info.freq_counter as f64 * PROGRAM_FREQ_STC15
        / session.mcu_info.clock_hz
        + 0.5) as u32;
    session.trim.program_trim =
        (best_trim as f64 * program_target as f64 / best_count as f64 + 0.5) as u16;

    commit_baudrate(session, PROGRAM_FREQ_STC15, best_range, best_trim)
}

/// STC15A trim search: command `0x65`, echoes seven calibration bytes
/// from the saved status payload and commits through the extended `0x8E`
/// parameter list.
fn calibrate_stc15a(session: &mut Session, target_hz: Option<f64>) -> Result<()> {
    let user_speed = match target_hz {
        Some(hz) if hz > 0.0 => hz,
        _ => session.mcu_info.clock_hz,
    };
    let program_speed = PROGRAM_FREQ_STC15;
    let clock = session.mcu_info.clock_hz;
    let counter = session.mcu_info.freq_counter as f64;
    let user_count = (counter * user_speed / clock + 0.5) as u32;
    let program_count = (counter * program_speed / clock + 0.5) as u32;

    let mut challenge = vec![CMD_FREQ_CALIB];
    if session.status_payload.len() >= 25 {
        challenge.extend_from_slice(&session.status_payload[18..25]);
    } else {
        challenge.extend_from_slice(&[0xFF; 7]);
    }
    challenge.extend_from_slice(&[0xFF, 0xFF, 0x06, 0x06]);

    // The challenge grid scales with the requested frequency band.
    let band = if user_speed < 7.5e6 {
        0x18
    } else if user_speed < 15e6 {
        0x58
    } else {
        0x98
    };
    for range in [0x00, 0x80, 0x80, 0xFF] {
        challenge.extend_from_slice(&[band, range, 0x02, 0x00]);
    }
    challenge.extend_from_slice(&[0x98, 0x00, 0x02, 0x00]);
    challenge.extend_from_slice(&[0x98, 0x80, 0x02, 0x00]);

    let reply = run_challenge(session, &challenge, SYNC_CHAR)?;

    // Defaults match the mid-band response of a nominal part.
    let mut program_trim = 0x9880u16;
    let mut user_trim = 0x9840u16;
    if reply.len() >= 40 {
        let trim_at = |i: usize| BigEndian::read_u16(&reply[i..i + 2]);
        let (pt_a, pc_a) = (trim_at(28), trim_at(30));
        let (pt_b, pc_b) = (trim_at(32), trim_at(34));
        if pc_b != pc_a {
            let m = (pt_b as f64 - pt_a as f64) / (pc_b as f64 - pc_a as f64);
            let n = pt_a as f64 - m * pc_a as f64;
            program_trim = (m * program_count as f64 + n + 0.5) as u16;
        }
        let (ut_a, uc_a) = (trim_at(12), trim_at(14));
        let (ut_b, uc_b) = (trim_at(20), trim_at(22));
        if uc_b != uc_a {
            let m = (ut_b as f64 - ut_a as f64) / (uc_b as f64 - uc_a as f64);
            let n = ut_a as f64 - m * uc_a as f64;
            user_trim = (m * user_count as f64 + n + 0.5) as u16;
        }
    }

    session.trim.user_trim = user_trim;
    session.trim.program_trim = program_trim;
    session.trim.trim_divider = 1;
    session.trim.final_frequency = user_speed;

    let baud_div = (230_400 / session.comm.baud_transfer) as u8;
    let commit = [
        CMD_BAUD_SWITCH,
        (program_trim >> 8) as u8,
        program_trim as u8,
        baud_div,
        0xA1,
        0x64,
        0xB8,
        0x00,
        iap_delay(program_speed),
        0x20,
        0xFF,
        0x00,
    ];
    session.send_frame(&commit)?;
    session.transport.delay_ms(100);
    let baud = session.comm.baud_transfer;
    session.transport.set_baudrate(baud)?;
    let timeout = session.comm.timeout_ms;
    session.recv_frame(timeout)?;
    Ok(())
}

/// Whole-chip erase of the STC15 and later bootloaders.
pub(super) fn erase_flash(session: &mut Session, _size: u32) -> Result<()> {
    let request = [CMD_ERASE, 0x00, 0x00, 0x5A, 0xA5];
    session.send_frame(&request)?;
    let timeout = session.comm.erase_timeout_ms;
    let reply = session.recv_frame(timeout).map_err(|_| Error::EraseFail)?;
    if reply.first() != Some(&CMD_ERASE) {
        return Err(Error::EraseFail);
    }
    Ok(())
}

/// Block write with the `0x22`-first/`0x02`-rest opcodes; BSL 7.2+ wants
/// the `5A A5` magic between address and data.
pub(super) fn program_block(
    session: &mut Session,
    addr: u32,
    data: &[u8],
    is_first: bool,
) -> Result<()> {
    let config = session.config()?;
    let mut request = Vec::with_capacity(5 + config.block_size);
    request.push(if is_first { CMD_WRITE_FIRST } else { CMD_WRITE_BLOCK });
    request.push((addr >> 8) as u8);
    request.push(addr as u8);
    if config.bsl_magic_72 {
        request.extend_from_slice(&[0x5A, 0xA5]);
    }
    request.extend_from_slice(data);

    let timeout = session.comm.timeout_ms;
    let reply = session
        .transfer(&request, timeout)
        .map_err(|_| Error::ProgramFail)?;
    if reply.len() < 2 || reply[0] != CMD_WRITE_BLOCK || reply[1] != ACK_OK {
        return Err(Error::ProgramFail);
    }
    Ok(())
}

/// BSL 7.2+ completion command; earlier loaders have no finish step.
pub(super) fn program_finish(session: &mut Session) -> Result<()> {
    if !session.config()?.bsl_magic_72 {
        return Ok(());
    }
    let request = [CMD_FINISH_72, 0x00, 0x00, 0x5A, 0xA5];
    let timeout = session.comm.timeout_ms;
    let reply = session.transfer(&request, timeout)?;
    if reply.len() < 2 || reply[0] != CMD_FINISH_72 || reply[1] != ACK_OK {
        return Err(Error::ProgramFail);
    }
    Ok(())
}

fn set_options(session: &mut Session, options: &[u8]) -> Result<()> {
    let mut request = Vec::with_capacity(3 + options.len());
    request.push(CMD_SET_OPTIONS);
    request.extend_from_slice(options);
    request.push((session.trim.user_trim >> 8) as u8);
    request.push(session.trim.user_trim as u8);
    let timeout = session.comm.timeout_ms;
    session.transfer(&request, timeout)?;
    Ok(())
}

/// Fire-and-forget `0x82`.
pub(super) fn disconnect(session: &mut Session) -> Result<()> {
    session.send_frame(&[CMD_DISCONNECT])
}

pub(crate) struct Stc15;

impl ProtocolOps for Stc15 {
    fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
        parse_status_common(session, payload)
    }

    fn handshake(&self, session: &mut Session) -> Result<()> {
        handshake_request(session)
    }

    fn calibrate_frequency(&self, session: &mut Session, target_hz: Option<f64>) -> Result<()> {
        calibrate_stc15(session, target_hz)
    }

    fn erase_flash(&self, session: &mut Session, size: u32) -> Result<()> {
        erase_flash(session, size)
    }

    fn program_block(
        &self,
        session: &mut Session,
        addr: u32,
        data: &[u8],
        is_first: bool,
    ) -> Result<()> {
        program_block(session, addr, data, is_first)
    }

    fn program_finish(&self, session: &mut Session) -> Result<()> {
        program_finish(session)
    }

    fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()> {
        set_options(session, options)
    }

    fn disconnect(&self, session: &mut Session) -> Result<()> {
        disconnect(session)
    }
}

pub(crate) struct Stc15a;

impl ProtocolOps for Stc15a {
    fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
        parse_status_common(session, payload)
    }

    fn handshake(&self, session: &mut Session) -> Result<()> {
        handshake_request(session)
    }

    fn calibrate_frequency(&self, session: &mut Session, target_hz: Option<f64>) -> Result<()> {
        calibrate_stc15a(session, target_hz)
    }

    fn erase_flash(&self, session: &mut Session, size: u32) -> Result<()> {
        erase_flash(session, size)
    }

    fn program_block(
        &self,
        session: &mut Session,
        addr: u32,
        data: &[u8],
        is_first: bool,
    ) -> Result<()> {
        program_block(session, addr, data, is_first)
    }

    fn program_finish(&self, session: &mut Session) -> Result<()> {
        program_finish(session)
    }

    fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()> {
        set_options(session, options)
    }

    fn disconnect(&self, session: &mut Session) -> Result<()> {
        disconnect(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumKind, ProtocolId};
    use crate::packet::build_frame;
    use crate::testing::{queue_read, MockTransport};

    fn reply(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        build_frame(ChecksumKind::DoubleByte, payload, &mut out);
        out
    }

    #[test]
    fn transfer_brt_matches_the_programming_oscillator() {
        // 22.1184 MHz over 115200 × 4 is exactly 48 bit periods.
        assert_eq!(transfer_brt(PROGRAM_FREQ_STC15, 115_200), 65_488);
        assert_eq!(transfer_brt(24_000_000.0, 115_200), 65_484);
    }

    #[test]
    fn block_payloads_carry_the_bsl72_magic() {
        let firmware: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let (mock, state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.bind(ProtocolId::Stc8);
        queue_read(&state, reply(&[0x02, 0x54]));
        queue_read(&state, reply(&[0x02, 0x54]));

        let mut block = [0u8; 64];
        block.copy_from_slice(&firmware[..64]);
        program_block(&mut session, 0, &block, true).unwrap();

        let mut tail = [0u8; 64];
        tail[..36].copy_from_slice(&firmware[64..]);
        program_block(&mut session, 64, &tail, false).unwrap();

        let mut expected = Vec::new();
        let mut payload = vec![0x22, 0x00, 0x00, 0x5A, 0xA5];
        payload.extend_from_slice(&block);
        build_frame(ChecksumKind::DoubleByte, &payload, &mut expected);
        let mut payload = vec![0x02, 0x00, 0x40, 0x5A, 0xA5];
        payload.extend_from_slice(&tail);
        build_frame(ChecksumKind::DoubleByte, &payload, &mut expected);
        assert_eq!(state.borrow().writes, expected);
    }

    #[test]
    fn erase_expects_the_opcode_echo() {
        let (mock, state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.bind(ProtocolId::Stc15);
        queue_read(&state, reply(&[0x03]));
        erase_flash(&mut session, 8192).unwrap();

        let mut expected = Vec::new();
        build_frame(
            ChecksumKind::DoubleByte,
            &[0x03, 0x00, 0x00, 0x5A, 0xA5],
            &mut expected,
        );
        assert_eq!(state.borrow().writes, expected);

        // A wrong echo is an erase failure.
        let (mock, state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.bind(ProtocolId::Stc15);
        queue_read(&state, reply(&[0x04]));
        assert_eq!(erase_flash(&mut session, 8192).unwrap_err(), Error::EraseFail);
    }

    #[test]
    fn finish_is_skipped_below_bsl_72() {
        // STC15A predates the 7.2 finish command; nothing goes out.
        let (mock, state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.bind(ProtocolId::Stc15a);
        program_finish(&mut session).unwrap();
        assert!(state.borrow().writes.is_empty());

        let (mock, state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.bind(ProtocolId::Stc15);
        queue_read(&state, reply(&[0x07, 0x54]));
        program_finish(&mut session).unwrap();
        let mut expected = Vec::new();
        build_frame(
            ChecksumKind::DoubleByte,
            &[0x07, 0x00, 0x00, 0x5A, 0xA5],
            &mut expected,
        );
        assert_eq!(state.borrow().writes, expected);
    }
}
