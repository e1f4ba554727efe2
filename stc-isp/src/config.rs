use core::fmt;
use core::str::FromStr;

use crate::transport::Parity;
use crate::Error;

/// Bootloader protocol family.
///
/// One variant per wire-protocol dialect; several marketing series share a
/// dialect (STC90 speaks `Stc89`, STC10/11 speak `Stc12`, the STC8H parts
/// split between `Stc8d` and `Stc8g`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolId {
    Stc89,
    Stc89a,
    Stc12,
    Stc15a,
    Stc15,
    Stc8,
    Stc8d,
    Stc8g,
    Stc32,
    Usb15,
}

impl ProtocolId {
    /// Every protocol family, in registry order.
    pub const ALL: [ProtocolId; 10] = [
        ProtocolId::Stc89,
        ProtocolId::Stc89a,
        ProtocolId::Stc12,
        ProtocolId::Stc15a,
        ProtocolId::Stc15,
        ProtocolId::Stc8,
        ProtocolId::Stc8d,
        ProtocolId::Stc8g,
        ProtocolId::Stc32,
        ProtocolId::Usb15,
    ];

    /// Static framing and behavior parameters for this family.
    #[inline]
    pub fn config(self) -> &'static ProtocolConfig {
        &CONFIGS[self as usize]
    }

    /// Human-readable series name for display.
    pub fn display_name(self) -> &'static str {
        match self {
            ProtocolId::Stc89 => "STC89/90 series",
            ProtocolId::Stc89a => "STC89A series",
            ProtocolId::Stc12 => "STC10/11/12 series",
            ProtocolId::Stc15a => "STC15A series",
            ProtocolId::Stc15 => "STC15 series",
            ProtocolId::Stc8 => "STC8 series",
            ProtocolId::Stc8d => "STC8H series",
            ProtocolId::Stc8g => "STC8H1K series",
            ProtocolId::Stc32 => "STC32 series",
            ProtocolId::Usb15 => "STC15 USB",
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config().name)
    }
}

impl FromStr for ProtocolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let id = match s.to_ascii_lowercase().as_str() {
            "stc89" => ProtocolId::Stc89,
            "stc89a" => ProtocolId::Stc89a,
            "stc12" => ProtocolId::Stc12,
            "stc15a" => ProtocolId::Stc15a,
            "stc15" => ProtocolId::Stc15,
            "stc8" => ProtocolId::Stc8,
            "stc8d" => ProtocolId::Stc8d,
            "stc8g" => ProtocolId::Stc8g,
            "stc32" => ProtocolId::Stc32,
            "usb15" => ProtocolId::Usb15,
            _ => return Err(Error::InvalidParam),
        };
        Ok(id)
    }
}

/// Checksum discipline of the outer frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumKind {
    /// Additive sum modulo 256, one trailing byte (STC89 only).
    SingleByte,
    /// Additive sum modulo 65536, two trailing bytes big-endian.
    DoubleByte,
    /// Subtractive per-7-byte-group checksum, no outer envelope.
    UsbBlock,
}

/// Width of the baud-rate timer reload value.
///
/// Absent on STC15 and later, where the transfer baud derives from the
/// calibrated programming oscillator instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrtWidth {
    Eight,
    Sixteen,
    None,
}

/// Static per-family parameter bundle.
///
/// Immutable; the single source of truth for framing parameters and the
/// behavioral branches of the protocol operations.
#[derive(Debug)]
pub struct ProtocolConfig {
    pub name: &'static str,
    pub checksum: ChecksumKind,
    pub parity: Parity,
    pub brt_width: BrtWidth,
    /// Programming block size in bytes, 64 or 128.
    pub block_size: usize,
    pub option_bytes_len: u8,
    pub needs_freq_calib: bool,
    /// Tail value of the descending erase countdown sequence, if the
    /// family uses one.
    pub erase_countdown: Option<u8>,
    pub has_uid: bool,
    /// Host parity flips to even after the baud test (STC89A).
    pub parity_switch_after_handshake: bool,
    /// BSL 7.2+ prefixes programming payloads with `5A A5`.
    pub bsl_magic_72: bool,
}

static CONFIGS: [ProtocolConfig; 10] = [
    ProtocolConfig {
        name: "STC89",
        checksum: ChecksumKind::SingleByte,
        parity: Parity::None,
        brt_width: BrtWidth::Sixteen,
        block_size: 128,
        option_bytes_len: 1,
        needs_freq_calib: false,
        erase_countdown: None,
        has_uid: false,
        parity_switch_after_handshake: false,
        bsl_magic_72: false,
    },
    ProtocolConfig {
        name: "STC89A",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::Sixteen,
        block_size: 128,
        option_bytes_len: 4,
        needs_freq_calib: false,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: true,
        bsl_magic_72: false,
    },
    ProtocolConfig {
        name: "STC12",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::Eight,
        block_size: 128,
        option_bytes_len: 4,
        needs_freq_calib: false,
        erase_countdown: Some(0x0D),
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: false,
    },
    ProtocolConfig {
        name: "STC15A",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::None,
        block_size: 64,
        option_bytes_len: 13,
        needs_freq_calib: true,
        erase_countdown: Some(0x5E),
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: false,
    },
    ProtocolConfig {
        name: "STC15",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::None,
        block_size: 64,
        option_bytes_len: 5,
        needs_freq_calib: true,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: true,
    },
    ProtocolConfig {
        name: "STC8",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::None,
        block_size: 64,
        option_bytes_len: 5,
        needs_freq_calib: true,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: true,
    },
    ProtocolConfig {
        name: "STC8D",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::None,
        block_size: 64,
        option_bytes_len: 5,
        needs_freq_calib: true,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: true,
    },
    ProtocolConfig {
        name: "STC8G",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::None,
        block_size: 64,
        option_bytes_len: 5,
        needs_freq_calib: true,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: true,
    },
    ProtocolConfig {
        name: "STC32",
        checksum: ChecksumKind::DoubleByte,
        parity: Parity::Even,
        brt_width: BrtWidth::None,
        block_size: 64,
        option_bytes_len: 5,
        needs_freq_calib: true,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: true,
    },
    ProtocolConfig {
        name: "USB15",
        checksum: ChecksumKind::UsbBlock,
        parity: Parity::None,
        brt_width: BrtWidth::None,
        block_size: 128,
        option_bytes_len: 5,
        needs_freq_calib: false,
        erase_countdown: None,
        has_uid: true,
        parity_switch_after_handshake: false,
        bsl_magic_72: false,
    },
];

#[cfg(test)]
mod tests {
    use super::{BrtWidth, ChecksumKind, ProtocolId};
    use crate::transport::Parity;

    #[test]
    fn stc89_is_the_only_single_byte_row() {
        for id in ProtocolId::ALL {
            let config = id.config();
            if id == ProtocolId::Stc89 {
                assert_eq!(config.checksum, ChecksumKind::SingleByte);
                assert_eq!(config.parity, Parity::None);
            } else if id != ProtocolId::Usb15 {
                assert_eq!(config.checksum, ChecksumKind::DoubleByte);
            }
        }
    }

    #[test]
    fn brt_and_calibration_rows() {
        assert_eq!(ProtocolId::Stc12.config().brt_width, BrtWidth::Eight);
        assert_eq!(ProtocolId::Stc89.config().brt_width, BrtWidth::Sixteen);
        let calibrated = [
            ProtocolId::Stc15a,
            ProtocolId::Stc15,
            ProtocolId::Stc8,
            ProtocolId::Stc8d,
            ProtocolId::Stc8g,
            ProtocolId::Stc32,
        ];
        for id in ProtocolId::ALL {
            assert_eq!(
                id.config().needs_freq_calib,
                calibrated.contains(&id),
                "{id:?}"
            );
        }
        assert_eq!(ProtocolId::Stc12.config().erase_countdown, Some(0x0D));
        assert_eq!(ProtocolId::Stc15a.config().erase_countdown, Some(0x5E));
    }

    #[test]
    fn protocol_id_parses_from_str() {
        assert_eq!("stc8g".parse::<ProtocolId>().unwrap(), ProtocolId::Stc8g);
        assert_eq!("STC89A".parse::<ProtocolId>().unwrap(), ProtocolId::Stc89a);
        assert!("stc99".parse::<ProtocolId>().is_err());
    }
}
