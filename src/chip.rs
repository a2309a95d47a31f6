//! Chip identification, MAC derivation and security info parsing.

use std::convert::{TryFrom, TryInto};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Register holding the chip detection magic on every supported chip.
pub const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

// =============================================================================
// Public Interface
// =============================================================================

/// The chips the client knows how to identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chip {
    Esp32,
    Esp32s2,
    Esp32s3,
    Esp32c2,
    Esp32c3,
    Esp32c6,
    Esp32h2,
}

impl Chip {
    pub const ALL: [Chip; 7] = [
        Chip::Esp32,
        Chip::Esp32s2,
        Chip::Esp32s3,
        Chip::Esp32c2,
        Chip::Esp32c3,
        Chip::Esp32c6,
        Chip::Esp32h2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Chip::Esp32 => "ESP32",
            Chip::Esp32s2 => "ESP32-S2",
            Chip::Esp32s3 => "ESP32-S3",
            Chip::Esp32c2 => "ESP32-C2",
            Chip::Esp32c3 => "ESP32-C3",
            Chip::Esp32c6 => "ESP32-C6",
            Chip::Esp32h2 => "ESP32-H2",
        }
    }

    /// Values of [`CHIP_DETECT_MAGIC_REG`] identifying the chip. Several
    /// silicon revisions of the same chip report different values.
    pub fn magic_values(self) -> &'static [u32] {
        match self {
            Chip::Esp32 => &[0x00f0_1d83],
            Chip::Esp32s2 => &[0x0000_07c6],
            Chip::Esp32s3 => &[0x9],
            Chip::Esp32c2 => &[0x6f51_306f, 0x7c41_a06f],
            Chip::Esp32c3 => &[0x6921_506f, 0x1b31_506f, 0x4881_606f, 0x4361_606f],
            Chip::Esp32c6 => &[0x2ce0_806f],
            Chip::Esp32h2 => &[0xd7b7_3e80],
        }
    }

    /// Chip id reported by GET_SECURITY_INFO. The ESP32 ROM predates the
    /// command.
    pub fn chip_id(self) -> Option<u32> {
        match self {
            Chip::Esp32 => None,
            Chip::Esp32s2 => Some(2),
            Chip::Esp32s3 => Some(9),
            Chip::Esp32c2 => Some(12),
            Chip::Esp32c3 => Some(5),
            Chip::Esp32c6 => Some(13),
            Chip::Esp32h2 => Some(16),
        }
    }

    pub fn supports_security_info(self) -> bool {
        self != Chip::Esp32
    }

    /// The eFuse registers holding the factory MAC, as `(low, high)`.
    pub fn mac_registers(self) -> (u32, u32) {
        let low = match self {
            Chip::Esp32 => 0x3ff5_a004,
            Chip::Esp32s2 => 0x3f41_a044,
            Chip::Esp32s3 => 0x6000_7044,
            Chip::Esp32c2 => 0x6000_8840,
            Chip::Esp32c3 => 0x6000_8844,
            Chip::Esp32c6 | Chip::Esp32h2 => 0x600b_0844,
        };
        (low, low + 4)
    }

    pub fn from_magic(magic: u32) -> Option<Chip> {
        Chip::ALL
            .iter()
            .copied()
            .find(|chip| chip.magic_values().contains(&magic))
    }

    pub fn from_chip_id(chip_id: u32) -> Option<Chip> {
        Chip::ALL
            .iter()
            .copied()
            .find(|chip| chip.chip_id() == Some(chip_id))
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Format the factory MAC held by the two eFuse words.
///
/// The six octets are the low 16 bits of `high` followed by all of `low`,
/// most significant first.
pub fn format_mac(high: u32, low: u32) -> String {
    let high = high.to_be_bytes();
    let low = low.to_be_bytes();
    [high[2], high[3], low[0], low[1], low[2], low[3]]
        .iter()
        .map(|octet| format!("{:02x}", octet))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decoded GET_SECURITY_INFO response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityInfo {
    pub flags: u32,
    pub flash_crypt_cnt: u8,
    pub key_purposes: [u8; 7],
    /// Absent on the ESP32-S2.
    pub chip_id: Option<u32>,
    /// Absent on the ESP32-S2.
    pub api_version: Option<u32>,
}

impl SecurityInfo {
    pub fn is_set(&self, flag: SecurityFlag) -> bool {
        self.flags & flag.mask() != 0
    }

    /// Flash encryption is on when an odd number of crypt count bits is
    /// burnt.
    pub fn flash_encryption(&self) -> bool {
        self.flash_crypt_cnt.count_ones() % 2 != 0
    }

    /// Human readable security facts, one per line of a report.
    pub fn facts(&self) -> Vec<String> {
        let mut facts = vec![];
        let enabled = |on: bool| if on { "enabled" } else { "disabled" };

        facts.push(format!(
            "Secure boot: {}",
            enabled(self.is_set(SecurityFlag::SecureBootEn))
        ));
        if self.is_set(SecurityFlag::SecureBootEn) {
            if self.is_set(SecurityFlag::SecureBootAggressiveRevoke) {
                facts.push("Secure boot aggressive key revocation: enabled".into());
            }
            for (index, flag) in [
                SecurityFlag::SecureBootKeyRevoke0,
                SecurityFlag::SecureBootKeyRevoke1,
                SecurityFlag::SecureBootKeyRevoke2,
            ]
            .iter()
            .enumerate()
            {
                if self.is_set(*flag) {
                    facts.push(format!("Secure boot key {} is revoked", index));
                }
            }
        }
        if self.is_set(SecurityFlag::SecureDownloadEnable) {
            facts.push("Secure download mode: enabled".into());
        }

        facts.push(format!(
            "Flash encryption: {}",
            enabled(self.flash_encryption())
        ));
        facts.push(format!(
            "SPI boot crypt count: 0x{:x}",
            self.flash_crypt_cnt
        ));
        for (index, purpose) in self.key_purposes.iter().enumerate() {
            facts.push(format!("Key {} purpose: {}", index, purpose));
        }

        if self.is_set(SecurityFlag::HardDisJtag) {
            facts.push("JTAG: permanently disabled".into());
        } else if self.is_set(SecurityFlag::SoftDisJtag) {
            facts.push("JTAG: software access disabled".into());
        }
        if self.is_set(SecurityFlag::DisUsb) {
            facts.push("USB access: disabled".into());
        }
        if self.is_set(SecurityFlag::DisDownloadDcache) {
            facts.push("Dcache in download mode: disabled".into());
        }
        if self.is_set(SecurityFlag::DisDownloadIcache) {
            facts.push("Icache in download mode: disabled".into());
        }

        if let Some(chip_id) = self.chip_id {
            facts.push(format!("Chip id: {}", chip_id));
        }
        if let Some(api_version) = self.api_version {
            facts.push(format!("API version: {}", api_version));
        }
        facts
    }
}

impl TryFrom<&[u8]> for SecurityInfo {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(ProtocolError::InvalidResponse(format!(
                "security info of {} bytes, expected at least 12",
                bytes.len()
            )));
        }

        let flags = u32::from_le_bytes(word(&bytes[0..4])?);
        let flash_crypt_cnt = bytes[4];
        let key_purposes: [u8; 7] = bytes[5..12]
            .try_into()
            .map_err(|_| ProtocolError::InvalidResponse("truncated key purposes".into()))?;

        // The ESP32-S2 ROM stops after the key purposes.
        let (chip_id, api_version) = if bytes.len() == 12 {
            (None, None)
        } else if bytes.len() < 20 {
            return Err(ProtocolError::InvalidResponse(format!(
                "security info of {} bytes, expected 12 or at least 20",
                bytes.len()
            )));
        } else {
            (
                Some(u32::from_le_bytes(word(&bytes[12..16])?)),
                Some(u32::from_le_bytes(word(&bytes[16..20])?)),
            )
        };

        Ok(SecurityInfo {
            flags,
            flash_crypt_cnt,
            key_purposes,
            chip_id,
            api_version,
        })
    }
}

/// Bits of [`SecurityInfo::flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityFlag {
    SecureBootEn,
    SecureBootAggressiveRevoke,
    SecureDownloadEnable,
    SecureBootKeyRevoke0,
    SecureBootKeyRevoke1,
    SecureBootKeyRevoke2,
    SoftDisJtag,
    HardDisJtag,
    DisUsb,
    DisDownloadDcache,
    DisDownloadIcache,
}

impl SecurityFlag {
    pub fn mask(self) -> u32 {
        1 << self as u32
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn word(bytes: &[u8]) -> Result<[u8; 4]> {
    bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidResponse("truncated word".into()))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn security_bytes(flags: u32, crypt_cnt: u8, tail: &[u32]) -> Vec<u8> {
    let mut bytes = flags.to_le_bytes().to_vec();
    bytes.push(crypt_cnt);
    bytes.extend_from_slice(&[0, 1, 2, 3, 4, 5, 6]);
    for word in tail {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

#[test]
fn detect_by_magic() {
    assert_eq!(Chip::from_magic(0x9), Some(Chip::Esp32s3));
    assert_eq!(Chip::from_magic(0x00f0_1d83), Some(Chip::Esp32));
    assert_eq!(Chip::from_magic(0x1b31_506f), Some(Chip::Esp32c3));
    assert_eq!(Chip::from_magic(0xdead_beef), None);
}

#[test]
fn detect_by_chip_id() {
    assert_eq!(Chip::from_chip_id(9), Some(Chip::Esp32s3));
    assert_eq!(Chip::from_chip_id(13), Some(Chip::Esp32c6));
    assert_eq!(Chip::from_chip_id(0), None);
}

#[test]
fn mac_is_six_lowercase_octets() {
    assert_eq!(format_mac(0x0000_3485, 0x1895_6b4c), "34:85:18:95:6b:4c");
    assert_eq!(format_mac(0xffff_00ab, 0xcdef_0102), "00:ab:cd:ef:01:02");
}

#[test]
fn mac_registers_are_adjacent() {
    assert_eq!(Chip::Esp32s3.mac_registers(), (0x6000_7044, 0x6000_7048));
    assert_eq!(Chip::Esp32.mac_registers(), (0x3ff5_a004, 0x3ff5_a008));
}

#[test]
fn security_info_with_chip_id() {
    let info = SecurityInfo::try_from(&security_bytes(0, 0, &[9, 0])[..]).unwrap();
    assert_eq!(info.chip_id, Some(9));
    assert_eq!(info.api_version, Some(0));
    assert_eq!(info.key_purposes, [0, 1, 2, 3, 4, 5, 6]);

    let facts = info.facts();
    assert!(facts.contains(&"Secure boot: disabled".to_string()));
    assert!(facts.contains(&"Flash encryption: disabled".to_string()));
    assert!(facts.contains(&"Chip id: 9".to_string()));
    assert_eq!(
        facts.iter().filter(|f| f.starts_with("Key ")).count(),
        7
    );
}

#[test]
fn security_info_of_esp32s2() {
    let info = SecurityInfo::try_from(&security_bytes(0, 0, &[])[..]).unwrap();
    assert_eq!(info.chip_id, None);
    assert_eq!(info.api_version, None);
}

#[test]
fn security_info_too_short() {
    let err = SecurityInfo::try_from(&[0u8; 11][..]).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InvalidResponse);
    let err = SecurityInfo::try_from(&[0u8; 16][..]).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InvalidResponse);
}

#[test]
fn security_flags_become_facts() {
    let flags = SecurityFlag::SecureBootEn.mask()
        | SecurityFlag::SecureBootKeyRevoke1.mask()
        | SecurityFlag::HardDisJtag.mask()
        | SecurityFlag::DisUsb.mask();
    let info = SecurityInfo::try_from(&security_bytes(flags, 0b0000_0001, &[9, 1])[..]).unwrap();
    assert!(info.flash_encryption());

    let facts = info.facts();
    assert!(facts.contains(&"Secure boot: enabled".to_string()));
    assert!(facts.contains(&"Secure boot key 1 is revoked".to_string()));
    assert!(facts.contains(&"Flash encryption: enabled".to_string()));
    assert!(facts.contains(&"JTAG: permanently disabled".to_string()));
    assert!(facts.contains(&"USB access: disabled".to_string()));
}

#[test]
fn flag_masks() {
    assert_eq!(SecurityFlag::SecureBootEn.mask(), 1);
    assert_eq!(SecurityFlag::SoftDisJtag.mask(), 1 << 6);
    assert_eq!(SecurityFlag::DisDownloadIcache.mask(), 1 << 10);
}
