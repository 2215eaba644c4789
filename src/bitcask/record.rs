//! On-disk record codecs for the append-only log.
//!
//! Format v2 (current, self-delimiting, little-endian):
//!
//! ```text
//! [Magic:4 = 'ACR2'][FormatVer:2 = 2][Flags:2]
//! [KeyLen:4][PayloadLen:4][Timestamp:8][Version:4]
//! [CRC32:4][KeyBytes:KeyLen][PayloadBytes:PayloadLen]
//! ```
//!
//! The CRC32 covers `KeyBytes ∥ PayloadBytes`. A tombstone has the flag set,
//! `PayloadLen = 0`, and a CRC over the key bytes only.
//!
//! Format v1 (legacy, read-only): 20-byte header
//! `[Magic='ACOR'][Version:4][Timestamp:8][PayloadLen:4]`, then a
//! null-terminated UTF-8 key, then the payload. No CRC.

use crc32fast::Hasher as Crc32Hasher;

pub const MAGIC_V2: [u8; 4] = *b"ACR2";
pub const MAGIC_V1: [u8; 4] = *b"ACOR";

pub const HEADER_V2_LEN: usize = 32;
pub const HEADER_V1_LEN: usize = 20;

pub const FORMAT_VER_V2: u16 = 2;

/// Keys above this are rejected and records claiming more are unparseable.
pub const MAX_KEY_LEN: u32 = 1 << 20;
/// Payloads above this are unparseable.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 30;
/// How far past a v1 header the loader scans for the key's null terminator.
pub const V1_KEY_SCAN_LIMIT: usize = 64 * 1024;

/// Record flag bits. Other bits are reserved; new formats extend the bitset,
/// never repurpose existing bits.
pub mod flags {
    pub const TOMBSTONE: u16 = 1 << 0;
    pub const COMPRESSED: u16 = 1 << 1;
    pub const ENCRYPTED: u16 = 1 << 2;
}

/// Parsed v2 header (magic and format version already validated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeaderV2 {
    pub flags: u16,
    pub key_len: u32,
    pub payload_len: u32,
    pub timestamp_micros: i64,
    pub version: u32,
    pub crc: u32,
}

impl RecordHeaderV2 {
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.flags & flags::TOMBSTONE != 0
    }

    /// Total record length including header, key, and payload.
    #[must_use]
    pub const fn record_len(&self) -> u64 {
        HEADER_V2_LEN as u64 + self.key_len as u64 + self.payload_len as u64
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_V2_LEN] {
        let mut out = [0u8; HEADER_V2_LEN];
        out[0..4].copy_from_slice(&MAGIC_V2);
        out[4..6].copy_from_slice(&FORMAT_VER_V2.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.key_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp_micros.to_le_bytes());
        out[24..28].copy_from_slice(&self.version.to_le_bytes());
        out[28..32].copy_from_slice(&self.crc.to_le_bytes());
        out
    }

    /// Parse a v2 header. Returns `None` on wrong magic or format version;
    /// length sanity belongs to the caller, who knows the file bounds.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_V2_LEN || buf[0..4] != MAGIC_V2 {
            return None;
        }
        let format = u16::from_le_bytes([buf[4], buf[5]]);
        if format != FORMAT_VER_V2 {
            return None;
        }
        Some(Self {
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            key_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload_len: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            timestamp_micros: i64::from_le_bytes(buf[16..24].try_into().ok()?),
            version: u32::from_le_bytes(buf[24..28].try_into().ok()?),
            crc: u32::from_le_bytes(buf[28..32].try_into().ok()?),
        })
    }

    /// Lengths a loader can trust before touching the body.
    #[must_use]
    pub fn lengths_sane(&self) -> bool {
        self.key_len > 0 && self.key_len <= MAX_KEY_LEN && self.payload_len <= MAX_PAYLOAD_LEN
    }
}

/// Parsed v1 header (magic already validated). The key length is implicit;
/// the loader scans for the null terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeaderV1 {
    pub version: u32,
    pub timestamp_micros: i64,
    pub payload_len: u32,
}

impl RecordHeaderV1 {
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_V1_LEN || buf[0..4] != MAGIC_V1 {
            return None;
        }
        Some(Self {
            version: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            timestamp_micros: i64::from_le_bytes(buf[8..16].try_into().ok()?),
            payload_len: u32::from_le_bytes(buf[16..20].try_into().ok()?),
        })
    }
}

/// CRC32 over `key ∥ payload`. For tombstones pass an empty payload: the CRC
/// then covers only the key bytes.
#[must_use]
pub fn record_crc(key: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(key);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_v2_round_trip() {
        let hdr = RecordHeaderV2 {
            flags: flags::TOMBSTONE,
            key_len: 3,
            payload_len: 0,
            timestamp_micros: 1_700_000_000_000_000,
            version: 9,
            crc: 0xDEAD_BEEF,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), HEADER_V2_LEN);
        let back = RecordHeaderV2::decode(&bytes).unwrap();
        assert_eq!(back, hdr);
        assert!(back.is_tombstone());
    }

    #[test]
    fn decode_rejects_foreign_magic() {
        let mut bytes = RecordHeaderV2 {
            flags: 0,
            key_len: 1,
            payload_len: 1,
            timestamp_micros: 0,
            version: 1,
            crc: 0,
        }
        .encode();
        bytes[0] = b'X';
        assert!(RecordHeaderV2::decode(&bytes).is_none());
    }
}
