//! Software package format for gateway downloads.
//!
//! Every download stream begins with a fixed 64-byte header followed by
//! the raw payload. The header names the ECU the payload is meant for,
//! so the gateway can decide whether to stage it locally or forward it.
//!
//! # Wire format (all fields big-endian)
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  magic "SWPG" (4)                           │  offset 0
//! │  target_ecu_id (2)                          │  offset 4
//! │  software_type (1)  compression (1)         │  offset 6
//! │  payload_size (4)                           │  offset 8
//! │  uncompressed_size (4)                      │  offset 12
//! │  version major/minor/patch/build (4 x 1)    │  offset 16
//! │  version_timestamp (4)                      │  offset 20
//! │  version_serial (4)                         │  offset 24
//! │  payload_crc32 (4)                          │  offset 28
//! │  signature slots (3 x 4, reserved)          │  offset 32
//! │  source_ecu_id (2)  hop_count (2)           │  offset 44
//! │  sequence_number (4)                        │  offset 48
//! │  reserved (12)                              │  offset 52
//! ├─────────────────────────────────────────────┤
//! │  payload (payload_size bytes)               │  offset 64
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use zgw_doip::sw_package::{self, ecu_id, SoftwarePackageHeader, SoftwareType, SoftwareVersion};
//!
//! let header = SoftwarePackageHeader::new(
//!     ecu_id::ZONE_1,
//!     SoftwareType::Application,
//!     SoftwareVersion::new(1, 2, 0, 7),
//! );
//! let package = sw_package::build(header, &[0xAB; 512]);
//!
//! let verified = sw_package::verify(&package).unwrap();
//! assert_eq!(verified.payload_size, 512);
//! ```

use std::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use crate::uds::NegativeResponseCode;

// ── Layout constants ───────────────────────────────────────────────────────

/// Header size; the payload starts right after it.
pub const HEADER_LEN: usize = 64;

/// "SWPG"
pub const SW_PKG_MAGIC: u32 = 0x5357_5047;

/// Largest payload a package may declare.
pub const MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Reflected CRC-32, polynomial 0xEDB88320, init/xorout 0xFFFFFFFF.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// ECU identities used in `target_ecu_id` / `source_ecu_id`.
pub mod ecu_id {
    pub const INVALID: u16 = 0x0000;
    pub const ZONE_1: u16 = 0x0011;
    pub const ZONE_2: u16 = 0x0012;
    pub const ZONE_3: u16 = 0x0013;
    pub const ZGW: u16 = 0x0091;
    pub const BROADCAST: u16 = 0xFFFF;
}

/// Human-readable ECU name for logs.
pub fn ecu_name(id: u16) -> &'static str {
    match id {
        ecu_id::ZGW => "ECU_091 (ZGW)",
        ecu_id::ZONE_1 => "ECU_011 (Zone 1)",
        ecu_id::ZONE_2 => "ECU_012 (Zone 2)",
        ecu_id::ZONE_3 => "ECU_013 (Zone 3)",
        ecu_id::BROADCAST => "BROADCAST (All)",
        _ => "UNKNOWN",
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackageError {
    #[error("Package too small: {got} bytes (minimum {need})")]
    TooSmall { need: usize, got: usize },

    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    #[error("Integrity error: header CRC 0x{expected:08X}, computed 0x{actual:08X}")]
    IntegrityError { expected: u32, actual: u32 },

    #[error("Unknown target ECU 0x{0:04X}")]
    UnknownTarget(u16),
}

impl PackageError {
    pub fn nrc(&self) -> NegativeResponseCode {
        match self {
            Self::UnknownTarget(_) => NegativeResponseCode::RequestOutOfRange,
            _ => NegativeResponseCode::GeneralProgrammingFailure,
        }
    }
}

pub type PackageResult<T> = Result<T, PackageError>;

// ── Header fields ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftwareType {
    Application,
    Bootloader,
    Calibration,
    Configuration,
    Unknown(u8),
}

impl From<u8> for SoftwareType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Application,
            0x02 => Self::Bootloader,
            0x03 => Self::Calibration,
            0x04 => Self::Configuration,
            other => Self::Unknown(other),
        }
    }
}

impl From<SoftwareType> for u8 {
    fn from(t: SoftwareType) -> Self {
        match t {
            SoftwareType::Application => 0x01,
            SoftwareType::Bootloader => 0x02,
            SoftwareType::Calibration => 0x03,
            SoftwareType::Configuration => 0x04,
            SoftwareType::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Unknown(u8),
}

impl From<u8> for Compression {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::None,
            0x01 => Self::Gzip,
            other => Self::Unknown(other),
        }
    }
}

impl From<Compression> for u8 {
    fn from(c: Compression) -> Self {
        match c {
            Compression::None => 0x00,
            Compression::Gzip => 0x01,
            Compression::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl SoftwareVersion {
    pub fn new(major: u8, minor: u8, patch: u8, build: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} (build {})",
            self.major, self.minor, self.patch, self.build
        )
    }
}

// ── Parsed header ──────────────────────────────────────────────────────────

/// The 64-byte header that precedes every package payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwarePackageHeader {
    pub magic: u32,
    pub target_ecu_id: u16,
    pub software_type: SoftwareType,
    pub compression: Compression,
    pub payload_size: u32,
    pub uncompressed_size: u32,
    pub version: SoftwareVersion,
    pub version_timestamp: u32,
    pub version_serial: u32,
    pub payload_crc32: u32,
    /// Reserved for signature material; carried but not interpreted.
    pub signature: [u32; 3],
    pub source_ecu_id: u16,
    pub hop_count: u16,
    pub sequence_number: u32,
    pub reserved: [u8; 12],
}

impl SoftwarePackageHeader {
    /// Header with sizes and CRC left at zero; [`build`] fills them in.
    pub fn new(target_ecu_id: u16, software_type: SoftwareType, version: SoftwareVersion) -> Self {
        Self {
            magic: SW_PKG_MAGIC,
            target_ecu_id,
            software_type,
            compression: Compression::None,
            payload_size: 0,
            uncompressed_size: 0,
            version,
            version_timestamp: 0,
            version_serial: 0,
            payload_crc32: 0,
            signature: [0; 3],
            source_ecu_id: ecu_id::INVALID,
            hop_count: 0,
            sequence_number: 0,
            reserved: [0; 12],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.target_ecu_id.to_be_bytes());
        buf[6] = self.software_type.into();
        buf[7] = self.compression.into();
        buf[8..12].copy_from_slice(&self.payload_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.uncompressed_size.to_be_bytes());
        buf[16] = self.version.major;
        buf[17] = self.version.minor;
        buf[18] = self.version.patch;
        buf[19] = self.version.build;
        buf[20..24].copy_from_slice(&self.version_timestamp.to_be_bytes());
        buf[24..28].copy_from_slice(&self.version_serial.to_be_bytes());
        buf[28..32].copy_from_slice(&self.payload_crc32.to_be_bytes());
        for (i, slot) in self.signature.iter().enumerate() {
            let at = 32 + i * 4;
            buf[at..at + 4].copy_from_slice(&slot.to_be_bytes());
        }
        buf[44..46].copy_from_slice(&self.source_ecu_id.to_be_bytes());
        buf[46..48].copy_from_slice(&self.hop_count.to_be_bytes());
        buf[48..52].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[52..64].copy_from_slice(&self.reserved);
        buf
    }

    /// Parse the first 64 bytes of `data`. Field values are not validated.
    pub fn from_bytes(data: &[u8]) -> PackageResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(PackageError::TooSmall {
                need: HEADER_LEN,
                got: data.len(),
            });
        }

        let u16_at = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        let u32_at =
            |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

        let mut reserved = [0u8; 12];
        reserved.copy_from_slice(&data[52..64]);

        Ok(Self {
            magic: u32_at(0),
            target_ecu_id: u16_at(4),
            software_type: SoftwareType::from(data[6]),
            compression: Compression::from(data[7]),
            payload_size: u32_at(8),
            uncompressed_size: u32_at(12),
            version: SoftwareVersion::new(data[16], data[17], data[18], data[19]),
            version_timestamp: u32_at(20),
            version_serial: u32_at(24),
            payload_crc32: u32_at(28),
            signature: [u32_at(32), u32_at(36), u32_at(40)],
            source_ecu_id: u16_at(44),
            hop_count: u16_at(46),
            sequence_number: u32_at(48),
            reserved,
        })
    }

    /// Field checks that need no payload: magic, size bound, target.
    pub fn validate(&self) -> PackageResult<()> {
        if self.magic != SW_PKG_MAGIC {
            return Err(PackageError::MalformedPackage(format!(
                "invalid magic 0x{:08X}",
                self.magic
            )));
        }
        if self.payload_size == 0 || self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(PackageError::MalformedPackage(format!(
                "payload size {} outside 1..={}",
                self.payload_size, MAX_PAYLOAD_SIZE
            )));
        }
        if self.target_ecu_id == ecu_id::INVALID {
            return Err(PackageError::MalformedPackage(
                "target ECU 0x0000 is invalid".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the package stream of `total_size` bytes matches this header.
    pub fn validate_total_size(&self, total_size: u32) -> PackageResult<()> {
        let expected = HEADER_LEN as u64 + self.payload_size as u64;
        if expected != total_size as u64 {
            return Err(PackageError::MalformedPackage(format!(
                "payload_size {} + {} header bytes != transfer size {}",
                self.payload_size, HEADER_LEN, total_size
            )));
        }
        Ok(())
    }

    /// Packages addressed to `own_ecu_id` or to everyone are applied locally.
    pub fn is_for(&self, own_ecu_id: u16) -> bool {
        self.target_ecu_id == own_ecu_id || self.target_ecu_id == ecu_id::BROADCAST
    }
}

// ── Routing ────────────────────────────────────────────────────────────────

/// What the gateway should do with a verified package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageDisposition {
    /// Apply on this ECU
    Local,
    /// Queue for forwarding to another ECU
    Forward { target_ecu_id: u16 },
}

/// SPI flash staging slot reserved for one ECU's packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingArea {
    pub start: u32,
    pub size: u32,
}

const STAGING_SLOT_SIZE: u32 = 0x0040_0000;

/// Staging slot for a concrete ECU id.
pub fn staging_area(id: u16) -> Option<StagingArea> {
    let start = match id {
        ecu_id::ZGW => 0x0000_0000,
        ecu_id::ZONE_1 => 0x0040_0000,
        ecu_id::ZONE_2 => 0x0080_0000,
        ecu_id::ZONE_3 => 0x00C0_0000,
        _ => return None,
    };
    Some(StagingArea {
        start,
        size: STAGING_SLOT_SIZE,
    })
}

/// Decide where a package goes and which staging slot it lands in.
///
/// Broadcast packages stage in the slot of `own_ecu_id`.
pub fn resolve_target(
    header: &SoftwarePackageHeader,
    own_ecu_id: u16,
) -> PackageResult<(PackageDisposition, StagingArea)> {
    let (disposition, slot_owner) = if header.is_for(own_ecu_id) {
        (PackageDisposition::Local, own_ecu_id)
    } else {
        (
            PackageDisposition::Forward {
                target_ecu_id: header.target_ecu_id,
            },
            header.target_ecu_id,
        )
    };
    let area = staging_area(slot_owner).ok_or(PackageError::UnknownTarget(header.target_ecu_id))?;
    Ok((disposition, area))
}

// ── Build / verify ─────────────────────────────────────────────────────────

pub fn payload_crc32(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

/// Serialize `header` + `payload`, filling in sizes and the payload CRC.
pub fn build(mut header: SoftwarePackageHeader, payload: &[u8]) -> Vec<u8> {
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    header.payload_size = size;
    if header.uncompressed_size == 0 {
        header.uncompressed_size = size;
    }
    header.payload_crc32 = payload_crc32(payload);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Header-only inspection of a stream whose total length is `total_size`.
///
/// Used once the first 64 bytes of a download have arrived.
pub fn inspect_header(prefix: &[u8], total_size: u32) -> PackageResult<SoftwarePackageHeader> {
    let header = SoftwarePackageHeader::from_bytes(prefix)?;
    header.validate()?;
    header.validate_total_size(total_size)?;
    Ok(header)
}

/// Full verification of an assembled package buffer.
pub fn verify(package: &[u8]) -> PackageResult<SoftwarePackageHeader> {
    let total_size = u32::try_from(package.len())
        .map_err(|_| PackageError::MalformedPackage("package exceeds 4 GiB".to_string()))?;
    let header = inspect_header(package, total_size)?;

    let end = HEADER_LEN + header.payload_size as usize;
    let actual = payload_crc32(&package[HEADER_LEN..end]);
    if actual != header.payload_crc32 {
        return Err(PackageError::IntegrityError {
            expected: header.payload_crc32,
            actual,
        });
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_header(target: u16) -> SoftwarePackageHeader {
        let mut header = SoftwarePackageHeader::new(
            target,
            SoftwareType::Application,
            SoftwareVersion::new(2, 1, 0, 42),
        );
        header.version_timestamp = 0x6500_0000;
        header.version_serial = 7;
        header.source_ecu_id = ecu_id::ZGW;
        header.hop_count = 1;
        header.sequence_number = 3;
        header
    }

    #[test]
    fn test_crc_matches_reference_check_value() {
        assert_eq!(payload_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_header_layout_offsets() {
        let package = build(sample_header(ecu_id::ZONE_2), &[0x11; 100]);
        assert_eq!(&package[0..4], b"SWPG");
        assert_eq!(&package[4..6], &[0x00, 0x12]);
        assert_eq!(package[6], 0x01);
        assert_eq!(&package[8..12], &100u32.to_be_bytes());
        assert_eq!(&package[16..20], &[2, 1, 0, 42]);
        assert_eq!(&package[28..32], &payload_crc32(&[0x11; 100]).to_be_bytes());
        assert_eq!(&package[44..46], &[0x00, 0x91]);
        assert_eq!(&package[48..52], &3u32.to_be_bytes());
        assert_eq!(package.len(), HEADER_LEN + 100);
    }

    #[test]
    fn test_header_from_bytes_preserves_fields() {
        let package = build(sample_header(ecu_id::ZONE_1), &[1, 2, 3]);
        let parsed = SoftwarePackageHeader::from_bytes(&package).unwrap();
        let mut expected = sample_header(ecu_id::ZONE_1);
        expected.payload_size = 3;
        expected.uncompressed_size = 3;
        expected.payload_crc32 = payload_crc32(&[1, 2, 3]);
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_verify_accepts_valid_package() {
        let package = build(sample_header(ecu_id::ZGW), &[0x5A; 1000]);
        let header = verify(&package).unwrap();
        assert_eq!(header.payload_size, 1000);
        assert_eq!(header.version.to_string(), "2.1.0 (build 42)");
    }

    #[test]
    fn test_any_single_byte_flip_is_integrity_error() {
        let payload: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();
        let package = build(sample_header(ecu_id::ZGW), &payload);
        for offset in HEADER_LEN..package.len() {
            let mut corrupted = package.clone();
            corrupted[offset] ^= 0x01;
            assert!(
                matches!(verify(&corrupted), Err(PackageError::IntegrityError { .. })),
                "flip at {offset} not detected"
            );
        }
    }

    #[test]
    fn test_bad_magic_is_malformed() {
        let mut package = build(sample_header(ecu_id::ZGW), &[0; 8]);
        package[0] = b'X';
        assert!(matches!(verify(&package), Err(PackageError::MalformedPackage(_))));
    }

    #[test]
    fn test_size_mismatch_is_malformed() {
        let mut package = build(sample_header(ecu_id::ZGW), &[0; 8]);
        package.push(0);
        assert!(matches!(verify(&package), Err(PackageError::MalformedPackage(_))));
        assert!(matches!(
            inspect_header(&package[..HEADER_LEN], 64 + 8 + 1),
            Err(PackageError::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_invalid_target_and_zero_payload() {
        let package = build(sample_header(ecu_id::INVALID), &[0; 4]);
        assert!(matches!(verify(&package), Err(PackageError::MalformedPackage(_))));

        let package = build(sample_header(ecu_id::ZGW), &[]);
        assert!(matches!(verify(&package), Err(PackageError::MalformedPackage(_))));
    }

    #[test]
    fn test_too_small() {
        assert_eq!(
            verify(&[0u8; 10]),
            Err(PackageError::TooSmall {
                need: HEADER_LEN,
                got: 10
            })
        );
    }

    #[test]
    fn test_resolve_target() {
        let local = sample_header(ecu_id::ZGW);
        assert_eq!(
            resolve_target(&local, ecu_id::ZGW).unwrap(),
            (
                PackageDisposition::Local,
                StagingArea {
                    start: 0,
                    size: 0x0040_0000
                }
            )
        );

        let broadcast = sample_header(ecu_id::BROADCAST);
        assert_eq!(
            resolve_target(&broadcast, ecu_id::ZGW).unwrap().0,
            PackageDisposition::Local
        );

        let zone = sample_header(ecu_id::ZONE_3);
        let (disposition, area) = resolve_target(&zone, ecu_id::ZGW).unwrap();
        assert_eq!(
            disposition,
            PackageDisposition::Forward {
                target_ecu_id: ecu_id::ZONE_3
            }
        );
        assert_eq!(area.start, 0x00C0_0000);

        let unknown = sample_header(0x0042);
        assert_eq!(
            resolve_target(&unknown, ecu_id::ZGW),
            Err(PackageError::UnknownTarget(0x0042))
        );
        assert_eq!(
            PackageError::UnknownTarget(0x0042).nrc(),
            NegativeResponseCode::RequestOutOfRange
        );
    }

    #[test]
    fn test_ecu_names() {
        assert_eq!(ecu_name(ecu_id::ZGW), "ECU_091 (ZGW)");
        assert_eq!(ecu_name(ecu_id::ZONE_1), "ECU_011 (Zone 1)");
        assert_eq!(ecu_name(0x1234), "UNKNOWN");
    }
}
