//! STC8, STC8H (8d/8g dialects) and STC32 operations.
//!
//! These families share the STC15 framing, handshake, erase, block write
//! and finish routines; what differs is the calibration challenge grid
//! (and the `0xFE` sync byte) plus the 40-byte option image.

use byteorder::{BigEndian, ByteOrder};

use super::stc15;
use super::{
    parse_status_common, reply_counters, select_best_trim, select_coarse_trim, ProtocolOps,
    CMD_SET_OPTIONS,
};
use crate::packet::SYNC_CHAR_STC8;
use crate::session::Session;
use crate::Result;

/// Fixed programming oscillator of the STC8 and STC32 series.
const PROGRAM_FREQ_STC8: f64 = 24_000_000.0;

fn target_count(session: &Session, target_hz: Option<f64>) -> (f64, u32) {
    let user_speed = match target_hz {
        Some(hz) if hz > 0.0 => hz,
        _ => session.mcu_info.clock_hz,
    };
    let count = (user_speed / (session.comm.baud_handshake as f64 / 2.0) + 0.5) as u32;
    (user_speed, count)
}

/// STC8: the 23-step grid with divider search, clocked by `0xFE` bytes.
fn calibrate_stc8(session: &mut Session, target_hz: Option<f64>) -> Result<()> {
    let (_, target) = target_count(session, target_hz);

    let mut challenge = vec![0x00, 12];
    for i in 1u8..=10 {
        challenge.extend_from_slice(&[23 * i, 0x00]);
    }
    challenge.extend_from_slice(&[255, 0x00, 255, 0x00]);
    let reply = stc15::run_challenge(session, &challenge, SYNC_CHAR_STC8)?;
    let counts = reply_counters(&reply, 11)?;
    let (divider, approx_trim) = select_coarse_trim(target, &counts).unwrap_or((1, 128));

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
    let reply = stc15::run_challenge(session, &challenge, SYNC_CHAR_STC8)?;
    let counts = reply_counters(&reply, pairs.len())?;
    let (best, best_count) = select_best_trim(target, &counts);
    let (best_trim, best_range) = pairs[best];

    session.trim.user_trim = best_trim as u16;
    session.trim.trim_range = best_range;
    session.trim.trim_divider = divider;
    session.trim.final_frequency =
        best_count as f64 * session.comm.baud_handshake as f64 / 2.0 / divider as f64;

    stc15::commit_baudrate(session, PROGRAM_FREQ_STC8, best_range, best_trim)
}

/// STC8H (8d dialect): two endpoint probes per range nibble, then a ±6
/// fine sweep inside the chosen range.
fn calibrate_stc8d(session: &mut Session, target_hz: Option<f64>) -> Result<()> {
    let (_, target) = target_count(session, target_hz);

    let mut challenge = vec![0x00, 0x08];
    for range in [0x00u8, 0x10, 0x20, 0x30] {
        challenge.extend_from_slice(&[0x00, range, 0xFF, range]);
    }
    let reply = stc15::run_challenge(session, &challenge, SYNC_CHAR_STC8)?;
    let counts = reply_counters(&reply, 8)?;

    let mut trim_range = 0u8;
    let mut approx_trim = 128u16;
    for range in 0..4usize {
        let low = counts[2 * range] as u32;
        let high = counts[2 * range + 1] as u32;
        if low <= target && high >= target {
            trim_range = (range as u8) * 0x10;
            if high != low {
                let ratio = (target - low) as f64 / (high - low) as f64;
                approx_trim = (ratio * 255.0 + 0.5) as u16;
            }
            break;
        }
    }

    fine_round_and_commit(session, target, approx_trim, trim_range, 0)
}

/// STC8H1K (8g dialect): two half-scale ranges and `0x66` epilogues
/// tail-padding each challenge frame.
fn calibrate_stc8g(session: &mut Session, target_hz: Option<f64>) -> Result<()> {
    let (_, target) = target_count(session, target_hz);

    let mut challenge = vec![0x00, 0x05];
    challenge.extend_from_slice(&[0x00, 0x00, 0x80, 0x00, 0x00, 0x80, 0x80, 0x80, 0xFF, 0x00]);
    challenge.extend_from_slice(&[0x66; 12]);
    let reply = stc15::run_challenge(session, &challenge, SYNC_CHAR_STC8)?;
    let counts = reply_counters(&reply, 4)?;

    let mut trim_range = 0u8;
    let mut approx_trim = 64u16;
    let (low_00, high_00) = (counts[0] as u32, counts[1] as u32);
    let (low_80, high_80) = (counts[2] as u32, counts[3] as u32);
    if low_00 <= target && high_00 >= target {
        trim_range = 0x00;
        if high_00 != low_00 {
            let ratio = (target - low_00) as f64 / (high_00 - low_00) as f64;
            approx_trim = (ratio * 128.0 + 0.5) as u16;
        }
    } else if low_80 <= target && high_80 >= target {
        trim_range = 0x80;
        if high_80 != low_80 {
            let ratio = (target - low_80) as f64 / (high_80 - low_80) as f64;
            approx_trim = (ratio * 128.0 + 0.5) as u16;
        }
    }

    fine_round_and_commit(session, target, approx_trim, trim_range, 19)
}

/// Shared ±6 fine sweep of the 8d/8g dialects, then the baud commit.
fn fine_round_and_commit(
    session: &mut Session,
    target: u32,
    approx_trim: u16,
    trim_range: u8,
    epilogue: usize,
) -> Result<()> {
    let trim_start = (approx_trim as i32 - 6).max(0) as u16;

    let mut challenge = vec![0x00, 0x0C];
    for i in 0..12u16 {
        challenge.extend_from_slice(&[(trim_start + i) as u8, trim_range]);
    }
    for _ in 0..epilogue {
        challenge.push(0x66);
    }
    let reply = stc15::run_challenge(session, &challenge, SYNC_CHAR_STC8)?;
    let counts = reply_counters(&reply, 12)?;
    let (best, best_count) = select_best_trim(target, &counts);
    let best_trim = (trim_start + best as u16) as u8;

    session.trim.user_trim = best_trim as u16;
    session.trim.trim_range = trim_range;
    session.trim.trim_divider = 1;
    session.trim.final_frequency =
        best_count as f64 * session.comm.baud_handshake as f64 / 2.0;

    stc15::commit_baudrate(session, PROGRAM_FREQ_STC8, trim_range, best_trim)
}

/// The 40-byte option image: calibration results at fixed offsets, the
/// caller's option bytes spliced in, everything else `0xFF`.
fn set_options(session: &mut Session, options: &[u8]) -> Result<()> {
    let mut image = [0xFFu8; 40];
    image[3] = 0x00;
    image[6] = 0x00;
    image[22] = 0x00;
    BigEndian::write_u32(&mut image[24..28], session.trim.final_frequency as u32);
    BigEndian::write_u16(&mut image[28..30], session.trim.user_trim);
    image[30] = session.trim.trim_divider;
    if let Some(&msr0) = options.first() {
        image[32] = msr0;
    }
    if options.len() > 1 {
        let extra = (options.len() - 1).min(4);
        image[36..36 + extra].copy_from_slice(&options[1..1 + extra]);
    }

    let mut request = Vec::with_capacity(1 + image.len());
    request.push(CMD_SET_OPTIONS);
    request.extend_from_slice(&image);
    let timeout = session.comm.timeout_ms;
    session.transfer(&request, timeout)?;
    Ok(())
}

macro_rules! stc8_ops {
    ($name:ident, $calibrate:path) => {
        pub(crate) struct $name;

        impl ProtocolOps for $name {
            fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
                parse_status_common(session, payload)
            }

            fn handshake(&self, session: &mut Session) -> Result<()> {
                stc15::handshake_request(session)
            }

            fn calibrate_frequency(
                &self,
                session: &mut Session,
                target_hz: Option<f64>,
            ) -> Result<()> {
                $calibrate(session, target_hz)
            }

            fn erase_flash(&self, session: &mut Session, size: u32) -> Result<()> {
                stc15::erase_flash(session, size)
            }

            fn program_block(
                &self,
                session: &mut Session,
                addr: u32,
                data: &[u8],
                is_first: bool,
            ) -> Result<()> {
                stc15::program_block(session, addr, data, is_first)
            }

            fn program_finish(&self, session: &mut Session) -> Result<()> {
                stc15::program_finish(session)
            }

            fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()> {
                set_options(session, options)
            }

            fn disconnect(&self, session: &mut Session) -> Result<()> {
                stc15::disconnect(session)
            }
        }
    };
}

stc8_ops!(Stc8, calibrate_stc8);
stc8_ops!(Stc8d, calibrate_stc8d);
stc8_ops!(Stc8g, calibrate_stc8g);
// STC32 shares the STC8H calibration dialect.
stc8_ops!(Stc32, calibrate_stc8d);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumKind, ProtocolId};
    use crate::packet::{build_frame, parse_frame};
    use crate::testing::{queue_read, MockTransport};

    #[test]
    fn option_image_places_the_calibration_words() {
        let (mock, state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.bind(ProtocolId::Stc8);
        session.trim.final_frequency = 11_059_200.0;
        session.trim.user_trim = 0x1234;
        session.trim.trim_divider = 3;

        let mut reply = Vec::new();
        build_frame(ChecksumKind::DoubleByte, &[0x04], &mut reply);
        queue_read(&state, reply);

        set_options(&mut session, &[0xBF, 0x01, 0x02, 0x03, 0x04]).unwrap();

        let writes = state.borrow().writes.clone();
        let info = parse_frame(ChecksumKind::DoubleByte, &writes).unwrap();
        let payload = info.payload;
        assert_eq!(payload.len(), 41);
        assert_eq!(payload[0], 0x04);
        let image = &payload[1..];
        assert_eq!((image[3], image[6], image[22]), (0, 0, 0));
        assert_eq!(&image[24..28], &11_059_200u32.to_be_bytes());
        assert_eq!(&image[28..30], &[0x12, 0x34]);
        assert_eq!(image[30], 3);
        assert_eq!(image[32], 0xBF);
        assert_eq!(&image[36..40], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(image[31], 0xFF);
        assert_eq!(image[0], 0xFF);
    }

    #[test]
    fn stc8_target_count_halves_the_handshake_baud() {
        let (mock, _state) = MockTransport::new();
        let mut session = Session::new(Box::new(mock));
        session.mcu_info.clock_hz = 11_059_200.0;
        // 11.0592 MHz over 1200 Hz gauge periods.
        let (speed, count) = target_count(&session, None);
        assert_eq!(speed, 11_059_200.0);
        assert_eq!(count, 9216);
        let (_, count) = target_count(&mut session, Some(24_000_000.0));
        assert_eq!(count, 20_000);
    }
}
