//! Superblock: page 0 of the data file and the tree's commit point.
//!
//! Layout (42 bytes used, little-endian):
//!
//! ```text
//! [Magic:4 = 'APLS'][FormatVer:2][PageSize:2]
//! [EntryCount:8][RootPageId:8][RootGeneration:8]
//! [FreeListHead:4][Reserved:2][SuperblockCRC:4]
//! ```
//!
//! The CRC covers bytes 0..38. `PageSize` stores `page_size as u16`; 65536
//! wraps to 0, which is decoded back to 65536 (sizes below 4096 are invalid,
//! so 0 is unambiguous).

use crc32fast::Hasher as Crc32Hasher;

use crate::errors::{TrunkError, TrunkResult};

pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"APLS";
pub const SUPERBLOCK_LEN: usize = 42;
pub const SUPERBLOCK_FORMAT_VER: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub format_version: u16,
    pub page_size: usize,
    pub entry_count: u64,
    pub root_page: u64,
    pub root_generation: u64,
    pub free_list_head: u32,
}

impl Superblock {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            format_version: SUPERBLOCK_FORMAT_VER,
            page_size,
            entry_count: 0,
            root_page: 0,
            root_generation: 0,
            free_list_head: 0,
        }
    }

    /// Encode into the head of a page buffer and stamp the superblock CRC.
    pub fn encode(&self, page: &mut [u8]) {
        debug_assert!(page.len() >= SUPERBLOCK_LEN);
        page[0..4].copy_from_slice(&SUPERBLOCK_MAGIC);
        page[4..6].copy_from_slice(&self.format_version.to_le_bytes());
        page[6..8].copy_from_slice(&(self.page_size as u16).to_le_bytes());
        page[8..16].copy_from_slice(&self.entry_count.to_le_bytes());
        page[16..24].copy_from_slice(&self.root_page.to_le_bytes());
        page[24..32].copy_from_slice(&self.root_generation.to_le_bytes());
        page[32..36].copy_from_slice(&self.free_list_head.to_le_bytes());
        page[36..38].copy_from_slice(&[0u8; 2]);
        let mut hasher = Crc32Hasher::new();
        hasher.update(&page[0..38]);
        page[38..42].copy_from_slice(&hasher.finalize().to_le_bytes());
    }

    /// Decode and validate page 0. The CRC must validate before the file is
    /// usable.
    ///
    /// # Errors
    /// `InvalidArgument` on a foreign magic, `CorruptedSuperblock` on a CRC
    /// mismatch.
    pub fn decode(page: &[u8]) -> TrunkResult<Self> {
        if page.len() < SUPERBLOCK_LEN {
            return Err(TrunkError::InvalidArgument("superblock shorter than 42 bytes".into()));
        }
        if page[0..4] != SUPERBLOCK_MAGIC {
            return Err(TrunkError::InvalidArgument("bad superblock magic".into()));
        }
        let stored = u32::from_le_bytes(page[38..42].try_into().expect("4-byte slice"));
        let mut hasher = Crc32Hasher::new();
        hasher.update(&page[0..38]);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(TrunkError::CorruptedSuperblock { stored, computed });
        }
        let raw_page_size = u16::from_le_bytes(page[6..8].try_into().expect("2-byte slice"));
        let page_size = if raw_page_size == 0 { 65536 } else { raw_page_size as usize };
        Ok(Self {
            format_version: u16::from_le_bytes(page[4..6].try_into().expect("2-byte slice")),
            page_size,
            entry_count: u64::from_le_bytes(page[8..16].try_into().expect("8-byte slice")),
            root_page: u64::from_le_bytes(page[16..24].try_into().expect("8-byte slice")),
            root_generation: u64::from_le_bytes(page[24..32].try_into().expect("8-byte slice")),
            free_list_head: u32::from_le_bytes(page[32..36].try_into().expect("4-byte slice")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut sb = Superblock::new(8192);
        sb.entry_count = 12;
        sb.root_page = 3;
        sb.root_generation = 9;
        sb.free_list_head = 7;
        let mut page = vec![0u8; 8192];
        sb.encode(&mut page);
        assert_eq!(Superblock::decode(&page).unwrap(), sb);
    }

    #[test]
    fn page_size_wraps_at_64k() {
        let sb = Superblock::new(65536);
        let mut page = vec![0u8; 65536];
        sb.encode(&mut page);
        assert_eq!(u16::from_le_bytes([page[6], page[7]]), 0);
        assert_eq!(Superblock::decode(&page).unwrap().page_size, 65536);
    }

    #[test]
    fn crc_mismatch_detected() {
        let sb = Superblock::new(4096);
        let mut page = vec![0u8; 4096];
        sb.encode(&mut page);
        page[20] ^= 0x01;
        assert!(matches!(
            Superblock::decode(&page),
            Err(TrunkError::CorruptedSuperblock { .. })
        ));
    }
}
