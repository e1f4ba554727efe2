//! Model database: magic code to model record, plus the name-prefix
//! fallback used when a magic is not on file.
//!
//! The table is a trimmed copy of the vendor list covering the commonly
//! programmed parts; lookups are linear over a few dozen entries.

use crate::config::ProtocolId;

/// One database row, keyed by the two-byte magic the bootloader reports.
#[derive(Clone, Copy, Debug)]
pub struct ModelInfo {
    pub magic: u16,
    pub name: &'static str,
    /// User flash in bytes.
    pub flash_size: u32,
    /// On-chip EEPROM in bytes.
    pub eeprom_size: u32,
    pub protocol: ProtocolId,
}

macro_rules! model {
    ($magic:expr, $name:expr, $flash:expr, $eeprom:expr, $proto:ident) => {
        ModelInfo {
            magic: $magic,
            name: $name,
            flash_size: $flash,
            eeprom_size: $eeprom,
            protocol: ProtocolId::$proto,
        }
    };
}

#[rustfmt::skip]
static MODELS: &[ModelInfo] = &[
    // STC89 series
    model!(0xE001, "STC89C51RC",      4096,    0, Stc89),
    model!(0xE002, "STC89C52RC",      8192,    0, Stc89),
    model!(0xE003, "STC89C53RC",     13312,    0, Stc89),
    model!(0xE004, "STC89C54RD+",    16384,    0, Stc89),
    model!(0xE006, "STC89C58RD+",    32768,    0, Stc89),
    model!(0xE101, "STC89LE51RC",     4096,    0, Stc89),
    model!(0xE102, "STC89LE52RC",     8192,    0, Stc89),
    model!(0xE103, "STC89LE53RC",    13312,    0, Stc89),
    model!(0xE104, "STC89LE54RD+",   16384,    0, Stc89),
    model!(0xE106, "STC89LE58RD+",   32768,    0, Stc89),

    // STC90 series
    model!(0xE042, "STC90C52RC",      8192,    0, Stc89),
    model!(0xE046, "STC90C58RD+",    32768,    0, Stc89),
    model!(0xE142, "STC90LE52RC",     8192,    0, Stc89),
    model!(0xE146, "STC90LE58RD+",   32768,    0, Stc89),

    // STC12x5052 parts speak the STC89A dialect
    model!(0xD102, "STC12C5052",      5120,    0, Stc89a),
    model!(0xD162, "STC12LE5052",     5120,    0, Stc89a),
    model!(0xD172, "STC12C5052AD",    5120,    0, Stc89a),
    model!(0xD1F2, "STC12LE5052AD",   5120,    0, Stc89a),

    // STC12 series
    model!(0xD164, "STC12C5A60S2",   61440, 1024, Stc12),
    model!(0xD168, "STC12C5A56S2",   57344, 1024, Stc12),
    model!(0xD16C, "STC12C5A52S2",   53248, 1024, Stc12),
    model!(0xD170, "STC12C5A48S2",   49152, 1024, Stc12),
    model!(0xD174, "STC12C5A40S2",   40960, 1024, Stc12),
    model!(0xD178, "STC12C5A32S2",   32768, 1024, Stc12),
    model!(0xD17C, "STC12C5A16S2",   16384, 1024, Stc12),
    model!(0xD180, "STC12C5A08S2",    8192, 1024, Stc12),
    model!(0xD1E4, "STC12LE5A60S2",  61440, 1024, Stc12),
    model!(0xD1E8, "STC12LE5A56S2",  57344, 1024, Stc12),
    model!(0xD1EC, "STC12LE5A52S2",  53248, 1024, Stc12),
    model!(0xD1F0, "STC12LE5A48S2",  49152, 1024, Stc12),

    // STC15A series
    model!(0xF410, "STC15F104E",      4096,    0, Stc15a),
    model!(0xF411, "STC15F104W",      4096,    0, Stc15a),
    model!(0xF440, "STC15L104E",      4096,    0, Stc15a),
    model!(0xF441, "STC15L104W",      4096,    0, Stc15a),

    // STC15 series
    model!(0xF449, "STC15W408AS",     8192, 4096, Stc15),
    model!(0xF44D, "STC15W404AS",     4096, 4096, Stc15),
    model!(0xF44E, "STC15W401AS",     1024, 4096, Stc15),
    model!(0xF450, "STC15W4K64S4",   65536, 1024, Stc15),
    model!(0xF451, "STC15W4K56S4",   57344, 1024, Stc15),
    model!(0xF452, "STC15W4K48S4",   49152, 1024, Stc15),
    model!(0xF453, "STC15W4K40S4",   40960, 1024, Stc15),
    model!(0xF454, "STC15W4K32S4",   32768, 1024, Stc15),
    model!(0xF455, "STC15W4K16S4",   16384, 1024, Stc15),
    model!(0xF488, "IAP15W4K61S4",   61440, 1024, Stc15),
    model!(0xF489, "IAP15W4K58S4",   59392, 1024, Stc15),

    // STC8A/STC8G series
    model!(0xF730, "STC8A8K64S4A12", 65536, 1024, Stc8),
    model!(0xF731, "STC8A8K60S4A12", 61440, 1024, Stc8),
    model!(0xF732, "STC8A8K56S4A12", 57344, 1024, Stc8),
    model!(0xF733, "STC8A8K52S4A12", 53248, 1024, Stc8),
    model!(0xF734, "STC8A8K48S4A12", 49152, 1024, Stc8),
    model!(0xF735, "STC8A8K32S4A12", 32768, 1024, Stc8),
    model!(0xF736, "STC8A8K16S4A12", 16384, 1024, Stc8),
    model!(0xF7A0, "STC8G1K08",       8192, 1024, Stc8),
    model!(0xF7A1, "STC8G1K08A",      8192, 1024, Stc8),
    model!(0xF7A4, "STC8G1K12",      12288, 1024, Stc8),
    model!(0xF7A5, "STC8G1K12A",     12288, 1024, Stc8),
    model!(0xF7A8, "STC8G1K17",      17408, 1024, Stc8),
    model!(0xF7A9, "STC8G1K17A",     17408, 1024, Stc8),
    model!(0xF7B0, "STC8G2K64S4",    65536, 1024, Stc8),
    model!(0xF7B1, "STC8G2K60S4",    61440, 1024, Stc8),
    model!(0xF7B2, "STC8G2K48S4",    49152, 1024, Stc8),
    model!(0xF7B3, "STC8G2K32S4",    32768, 1024, Stc8),
    model!(0xF7B4, "STC8G2K16S4",    16384, 1024, Stc8),

    // STC8H series
    model!(0xF7C0, "STC8H1K08",       8192, 4096, Stc8g),
    model!(0xF7C1, "STC8H1K12",      12288, 4096, Stc8g),
    model!(0xF7C2, "STC8H1K17",      17408, 4096, Stc8g),
    model!(0xF7C3, "STC8H1K24",      24576, 4096, Stc8g),
    model!(0xF7C4, "STC8H1K28",      28672, 4096, Stc8g),
    model!(0xF7C5, "STC8H1K33",      33792, 4096, Stc8g),
    model!(0xF7D0, "STC8H3K64S4",    65536, 1024, Stc8d),
    model!(0xF7D1, "STC8H3K64S2",    65536, 1024, Stc8d),
    model!(0xF7D2, "STC8H3K60S4",    61440, 1024, Stc8d),
    model!(0xF7D3, "STC8H3K60S2",    61440, 1024, Stc8d),
    model!(0xF7D4, "STC8H3K48S4",    49152, 1024, Stc8d),
    model!(0xF7D5, "STC8H3K48S2",    49152, 1024, Stc8d),
    model!(0xF7D6, "STC8H3K32S4",    32768, 1024, Stc8d),
    model!(0xF7D7, "STC8H3K32S2",    32768, 1024, Stc8d),
    model!(0xF7E0, "STC8H8K64U",     65536, 1024, Stc8d),
    model!(0xF7E1, "STC8H8K60U",     61440, 1024, Stc8d),
    model!(0xF7E2, "STC8H8K48U",     49152, 1024, Stc8d),
    model!(0xF7E3, "STC8H8K32U",     32768, 1024, Stc8d),

    // STC32 series
    model!(0xF800, "STC32G12K128",  131072, 4096, Stc32),
    model!(0xF801, "STC32G11K128",  131072, 4096, Stc32),
    model!(0xF802, "STC32G10K128",  131072, 4096, Stc32),
    model!(0xF810, "STC32G8K64",     65536, 4096, Stc32),
    model!(0xF811, "STC32G8K48",     49152, 4096, Stc32),
    model!(0xF812, "STC32G8K32",     32768, 4096, Stc32),
];

/// The whole database, for listing.
#[inline]
pub fn models() -> &'static [ModelInfo] {
    MODELS
}

/// Look up a model by the magic the bootloader reported.
pub fn find_model_by_magic(magic: u16) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.magic == magic)
}

/// Look up a model by its exact name.
pub fn find_model_by_name(name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.name == name)
}

/// Derive the protocol family from a model name.
///
/// Ordered from most to least specific; the ordering is part of the
/// contract because several prefixes shadow each other (STC8H1K inside
/// STC8H inside STC8, the 5052 parts inside STC12).
pub fn match_protocol_by_name(name: &str) -> Option<ProtocolId> {
    const STC15A_PREFIXES: [&str; 6] = [
        "STC15F10", "STC15L10", "STC15F20", "STC15L20", "IAP15F10", "IAP15L10",
    ];

    if name.starts_with("STC32") {
        Some(ProtocolId::Stc32)
    } else if name.starts_with("STC8H1K") {
        Some(ProtocolId::Stc8g)
    } else if name.starts_with("STC8H") {
        Some(ProtocolId::Stc8d)
    } else if name.starts_with("STC8") {
        Some(ProtocolId::Stc8)
    } else if STC15A_PREFIXES.iter().any(|p| name.starts_with(p)) {
        Some(ProtocolId::Stc15a)
    } else if ["STC15", "IAP15", "IRC15"].iter().any(|p| name.starts_with(p)) {
        Some(ProtocolId::Stc15)
    } else if name.contains("5052") {
        Some(ProtocolId::Stc89a)
    } else if ["STC10", "STC11", "STC12", "IAP10", "IAP11", "IAP12"]
        .iter()
        .any(|p| name.starts_with(p))
    {
        Some(ProtocolId::Stc12)
    } else if name.starts_with("STC89") || name.starts_with("STC90") {
        Some(ProtocolId::Stc89)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_lookup_returns_expected_records() {
        let m = find_model_by_magic(0xE001).unwrap();
        assert_eq!(m.name, "STC89C51RC");
        assert_eq!(m.protocol, ProtocolId::Stc89);
        assert_eq!(m.flash_size, 4096);

        let m = find_model_by_magic(0xF454).unwrap();
        assert_eq!(m.name, "STC15W4K32S4");
        assert_eq!(m.protocol, ProtocolId::Stc15);

        let m = find_model_by_magic(0xF7A1).unwrap();
        assert_eq!(m.name, "STC8G1K08A");
        assert_eq!(m.protocol, ProtocolId::Stc8);
        assert_eq!(m.flash_size, 8192);

        let m = find_model_by_magic(0xF800).unwrap();
        assert_eq!(m.name, "STC32G12K128");
        assert_eq!(m.protocol, ProtocolId::Stc32);

        assert!(find_model_by_magic(0x0000).is_none());
        assert_eq!(find_model_by_name("STC15W4K32S4").unwrap().magic, 0xF454);
        assert!(find_model_by_name("STC15W4K32S5").is_none());
    }

    #[test]
    fn every_row_name_matches_its_stored_protocol() {
        for m in models() {
            assert_eq!(
                match_protocol_by_name(m.name),
                Some(m.protocol),
                "{}",
                m.name
            );
        }
    }

    #[test]
    fn prefix_priority_is_most_specific_first() {
        assert_eq!(match_protocol_by_name("STC8H1K08"), Some(ProtocolId::Stc8g));
        assert_eq!(match_protocol_by_name("STC8H3K64S4"), Some(ProtocolId::Stc8d));
        assert_eq!(
            match_protocol_by_name("STC8A8K64S4A12"),
            Some(ProtocolId::Stc8)
        );
        assert_eq!(match_protocol_by_name("STC32G8K64"), Some(ProtocolId::Stc32));
        assert_eq!(match_protocol_by_name("STC15F104E"), Some(ProtocolId::Stc15a));
        assert_eq!(match_protocol_by_name("IAP15W4K61S4"), Some(ProtocolId::Stc15));
        assert_eq!(match_protocol_by_name("STC12C5052"), Some(ProtocolId::Stc89a));
        assert_eq!(match_protocol_by_name("STC12C5A60S2"), Some(ProtocolId::Stc12));
        assert_eq!(match_protocol_by_name("STC89C52RC"), Some(ProtocolId::Stc89));
        assert_eq!(match_protocol_by_name("AT89S52"), None);
    }
}
