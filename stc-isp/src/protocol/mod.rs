//! Per-family bootloader operations.
//!
//! Each family implements [`ProtocolOps`]; the ten instances are static
//! and freely shareable. Families that lack a step (no calibration on
//! STC89/12, no finish on STC89) inherit the default no-op.

use byteorder::{BigEndian, ByteOrder};

use crate::config::ProtocolId;
use crate::session::Session;
use crate::{Error, Result};

mod stc12;
mod stc15;
mod stc8;
mod stc89;
mod usb15;

// Command opcodes shared across families.
pub(crate) const CMD_WRITE_BLOCK: u8 = 0x02;
pub(crate) const CMD_ERASE: u8 = 0x03;
pub(crate) const CMD_SET_OPTIONS: u8 = 0x04;
pub(crate) const CMD_PREPARE: u8 = 0x05;
pub(crate) const CMD_FINISH_72: u8 = 0x07;
pub(crate) const CMD_WRITE_FIRST: u8 = 0x22;
pub(crate) const CMD_HANDSHAKE_REQ: u8 = 0x50;
pub(crate) const CMD_FREQ_CALIB: u8 = 0x65;
pub(crate) const CMD_FINISH: u8 = 0x69;
pub(crate) const CMD_PING: u8 = 0x80;
pub(crate) const CMD_DISCONNECT: u8 = 0x82;
pub(crate) const CMD_ERASE_84: u8 = 0x84;
pub(crate) const CMD_SET_OPTIONS_8D: u8 = 0x8D;
pub(crate) const CMD_BAUD_SWITCH: u8 = 0x8E;
pub(crate) const CMD_BAUD_TEST: u8 = 0x8F;
pub(crate) const CMD_DISCONNECT_FF: u8 = 0xFF;

/// Operations of one protocol family.
///
/// The seven-step life cycle is driven by the session controller; every
/// method exchanges framed payloads through the session's transport.
pub(crate) trait ProtocolOps: Sync {
    /// Fill `McuInfo` from the initial status payload and retain the raw
    /// bytes the later steps echo.
    fn parse_status_packet(&self, session: &mut Session, payload: &[u8]) -> Result<()>;

    /// Verify the bootloader is listening and, where the family does it
    /// here, negotiate the transfer baud rate.
    fn handshake(&self, session: &mut Session) -> Result<()>;

    /// Two-round RC oscillator trim search. Families with
    /// `needs_freq_calib = false` never get called.
    fn calibrate_frequency(&self, session: &mut Session, target_hz: Option<f64>) -> Result<()> {
        let _ = (session, target_hz);
        Ok(())
    }

    fn erase_flash(&self, session: &mut Session, size: u32) -> Result<()>;

    /// Program one block of exactly `block_size` bytes (tail blocks are
    /// zero-padded by the caller).
    fn program_block(
        &self,
        session: &mut Session,
        addr: u32,
        data: &[u8],
        is_first: bool,
    ) -> Result<()>;

    /// Post-programming confirmation, where the family has one.
    fn program_finish(&self, session: &mut Session) -> Result<()> {
        let _ = session;
        Ok(())
    }

    fn set_options(&self, session: &mut Session, options: &[u8]) -> Result<()>;

    /// Best effort; the bootloader does not reply.
    fn disconnect(&self, session: &mut Session) -> Result<()>;
}

/// Operations table for a family.
pub(crate) fn ops_for(id: ProtocolId) -> &'static dyn ProtocolOps {
    match id {
        ProtocolId::Stc89 => &stc89::Stc89,
        ProtocolId::Stc89a => &stc89::Stc89a,
        ProtocolId::Stc12 => &stc12::Stc12,
        ProtocolId::Stc15a => &stc15::Stc15a,
        ProtocolId::Stc15 => &stc15::Stc15,
        ProtocolId::Stc8 => &stc8::Stc8,
        ProtocolId::Stc8d => &stc8::Stc8d,
        ProtocolId::Stc8g => &stc8::Stc8g,
        ProtocolId::Stc32 => &stc8::Stc32,
        ProtocolId::Usb15 => &usb15::Usb15,
    }
}

/// IAP wait-state byte for the measured clock (STC12 and later).
pub(crate) fn iap_delay(clock_hz: f64) -> u8 {
    if clock_hz < 1e6 {
        0x87
    } else if clock_hz < 2e6 {
        0x86
    } else if clock_hz < 3e6 {
        0x85
    } else if clock_hz < 6e6 {
        0x84
    } else if clock_hz < 12e6 {
        0x83
    } else if clock_hz < 20e6 {
        0x82
    } else if clock_hz < 24e6 {
        0x81
    } else {
        0x80
    }
}

/// Render the BSL version as `major.minor.patch` plus the stepping
/// letter, e.g. `7.2.0C`.
pub(crate) fn bsl_version_string(payload: &[u8]) -> String {
    let version = payload.get(17).copied().unwrap_or(0);
    let minor = payload.get(22).copied().unwrap_or(0) & 0x0F;
    let stepping = payload.get(18).copied().unwrap_or(b' ') as char;
    format!("{}.{}.{}{}", version >> 4, version & 0x0F, minor, stepping)
}

/// Common status-payload fields of the STC12/15/8 families: magic at
/// 20..22, eight period counters at odd offsets, BSL version at 17,
/// clock from `baud × counter × 12 / 7`.
pub(crate) fn parse_status_common(session: &mut Session, payload: &[u8]) -> Result<()> {
    if payload.len() < 20 {
        return Err(Error::InvalidParam);
    }
    session.status_payload.clear();
    session.status_payload.extend_from_slice(payload);

    if payload.len() >= 22 {
        session.mcu_info.magic = BigEndian::read_u16(&payload[20..22]);
    }
    session.mcu_info.freq_counter = average_counter(payload);
    session.mcu_info.bsl_version = payload[17];
    session.mcu_info.bsl_version_str = bsl_version_string(payload);
    session.mcu_info.clock_hz =
        session.comm.baud_handshake as f64 * session.mcu_info.freq_counter as f64 * 12.0 / 7.0;
    Ok(())
}

/// Arithmetic mean of the eight 16-bit period counters at offsets
/// 1,3,…,15.
pub(crate) fn average_counter(payload: &[u8]) -> u16 {
    let sum: u32 = (0..8)
        .map(|i| BigEndian::read_u16(&payload[1 + 2 * i..3 + 2 * i]) as u32)
        .sum();
    (sum / 8) as u16
}

/// Read `n` big-endian counters from a calibration reply, starting at
/// offset 2.
pub(crate) fn reply_counters(reply: &[u8], n: usize) -> Result<Vec<u16>> {
    if reply.len() < 2 + 2 * n {
        return Err(Error::Frame);
    }
    Ok((0..n)
        .map(|i| BigEndian::read_u16(&reply[2 + 2 * i..4 + 2 * i]))
        .collect())
}

/// Coarse round of the 23-step challenge grid: walk dividers 1..=5, find
/// the first adjacent counter pair bracketing the (divider-scaled) target
/// and interpolate a trim between the pair's challenge values.
pub(crate) fn select_coarse_trim(target_count: u32, counts: &[u16]) -> Option<(u8, u16)> {
    for divider in 1u8..=5 {
        let scaled = target_count * divider as u32;
        for i in 0..counts.len().saturating_sub(1).min(10) {
            let (a, b) = (counts[i] as u32, counts[i + 1] as u32);
            if a <= scaled && b >= scaled {
                let trim_a = 23 * (i as u32 + 1);
                let trim_b = 23 * (i as u32 + 2);
                let trim = if b == a {
                    trim_a
                } else {
                    let m = (trim_b - trim_a) as f64 / (b - a) as f64;
                    (trim_a as f64 + m * (scaled - a) as f64 + 0.5) as u32
                };
                return Some((divider, trim as u16));
            }
        }
    }
    None
}

/// Fine round: the challenge whose returned counter lands closest to the
/// target wins; on a tie the earlier challenge is kept.
pub(crate) fn select_best_trim(target_count: u32, counts: &[u16]) -> (usize, u16) {
    let mut best = (0usize, counts[0]);
    let mut best_diff = u32::MAX;
    for (i, &count) in counts.iter().enumerate() {
        let diff = (count as u32).abs_diff(target_count);
        if diff < best_diff {
            best_diff = diff;
            best = (i, count);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iap_delay_thresholds() {
        assert_eq!(iap_delay(0.5e6), 0x87);
        assert_eq!(iap_delay(5.9e6), 0x84);
        assert_eq!(iap_delay(11.0592e6), 0x83);
        assert_eq!(iap_delay(22.1184e6), 0x81);
        assert_eq!(iap_delay(24e6), 0x80);
        assert_eq!(iap_delay(35e6), 0x80);
    }

    #[test]
    fn bsl_version_renders_with_stepping() {
        let mut payload = [0u8; 23];
        payload[17] = 0x72;
        payload[18] = b'C';
        payload[22] = 0x00;
        assert_eq!(bsl_version_string(&payload), "7.2.0C");

        payload[17] = 0x66;
        payload[18] = b'A';
        payload[22] = 0x05;
        assert_eq!(bsl_version_string(&payload), "6.6.5A");
    }

    #[test]
    fn coarse_selection_interpolates_within_the_bracket() {
        // Counters rise linearly: 1000, 2000, … 10000, then two sentinels.
        let counts: Vec<u16> = (1..=12).map(|i| (i * 1000).min(11000) as u16).collect();
        let (divider, trim) = select_coarse_trim(4500, &counts).unwrap();
        assert_eq!(divider, 1);
        // Bracket is counters[3]=4000 (trim 92) .. counters[4]=5000 (trim
        // 115); halfway lands on 103 or 104 depending on rounding.
        assert_eq!(trim, 104);
    }

    #[test]
    fn coarse_selection_scales_by_divider_when_out_of_range() {
        let counts: Vec<u16> = (1..=12).map(|i| (i * 1000) as u16).collect();
        // 700 is below the first counter, but 700 × 2 = 1400 brackets.
        let (divider, _) = select_coarse_trim(700, &counts).unwrap();
        assert_eq!(divider, 2);
        // Unreachable even at divider 5.
        assert!(select_coarse_trim(100, &counts).is_none());
    }

    #[test]
    fn best_trim_is_deterministic_and_prefers_earlier_on_ties() {
        let counts = [4990u16, 5005, 4998, 5005];
        let (index, count) = select_best_trim(5000, &counts);
        assert_eq!((index, count), (2, 4998));

        // 5005 appears twice at equal distance; the earlier one wins.
        let (index, _) = select_best_trim(5010, &counts);
        assert_eq!(index, 1);
    }
}
