//! Leaf and internal node codecs over fixed-size pages.
//!
//! Leaf body (after the 16-byte page header): repeated cells
//! `[KeyLen:2][ValLen:4][KeyBytes][ValueBytes]`, sorted by key. The header's
//! 8-byte slot chains leaves in key order.
//!
//! Internal body: `[Child0:8]` then repeated `[KeyLen:2][KeyBytes][Child:8]`.
//! `children[i]` holds keys `< keys[i]`; `children[i+1]` holds keys
//! `>= keys[i]`.

use crate::errors::{TrunkError, TrunkResult};
use crate::pager::{HDR_SIZE, page_kind, stamp_page_crc};

const LEAF_CELL_OVERHEAD: usize = 6;
const INTERNAL_CELL_OVERHEAD: usize = 10;

fn malformed(kind: &str) -> TrunkError {
    TrunkError::InvalidArgument(format!("malformed {kind} node page"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub entries: Vec<(String, Vec<u8>)>,
    pub next_leaf: u64,
}

impl LeafNode {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HDR_SIZE
            + self
                .entries
                .iter()
                .map(|(k, v)| LEAF_CELL_OVERHEAD + k.len() + v.len())
                .sum::<usize>()
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_len() <= page_size
    }

    /// Encode into a fresh page image with the page CRC stamped.
    ///
    /// # Errors
    /// `InvalidArgument` if the node does not fit the page.
    pub fn encode(&self, page_size: usize) -> TrunkResult<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(TrunkError::InvalidArgument(format!(
                "leaf node of {} bytes exceeds page size {page_size}",
                self.encoded_len()
            )));
        }
        let mut page = vec![0u8; page_size];
        page[0] = page_kind::LEAF;
        page[2..4].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        page[4..12].copy_from_slice(&self.next_leaf.to_le_bytes());
        let mut at = HDR_SIZE;
        for (key, value) in &self.entries {
            page[at..at + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            page[at + 2..at + 6].copy_from_slice(&(value.len() as u32).to_le_bytes());
            at += LEAF_CELL_OVERHEAD;
            page[at..at + key.len()].copy_from_slice(key.as_bytes());
            at += key.len();
            page[at..at + value.len()].copy_from_slice(value);
            at += value.len();
        }
        stamp_page_crc(&mut page);
        Ok(page)
    }

    /// # Errors
    /// `InvalidArgument` if the page is not a structurally valid leaf.
    pub fn decode(page: &[u8]) -> TrunkResult<Self> {
        if page.first() != Some(&page_kind::LEAF) {
            return Err(malformed("leaf"));
        }
        let count = u16::from_le_bytes([page[2], page[3]]) as usize;
        let next_leaf = u64::from_le_bytes(page[4..12].try_into().map_err(|_| malformed("leaf"))?);
        let mut entries = Vec::with_capacity(count);
        let mut at = HDR_SIZE;
        for _ in 0..count {
            if at + LEAF_CELL_OVERHEAD > page.len() {
                return Err(malformed("leaf"));
            }
            let key_len = u16::from_le_bytes([page[at], page[at + 1]]) as usize;
            let val_len =
                u32::from_le_bytes(page[at + 2..at + 6].try_into().expect("4-byte slice")) as usize;
            at += LEAF_CELL_OVERHEAD;
            if at + key_len + val_len > page.len() {
                return Err(malformed("leaf"));
            }
            let key = std::str::from_utf8(&page[at..at + key_len])
                .map_err(|_| malformed("leaf"))?
                .to_string();
            at += key_len;
            entries.push((key, page[at..at + val_len].to_vec()));
            at += val_len;
        }
        Ok(Self { entries, next_leaf })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub keys: Vec<String>,
    /// Always `keys.len() + 1` children.
    pub children: Vec<u64>,
}

impl InternalNode {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HDR_SIZE
            + 8
            + self.keys.iter().map(|k| INTERNAL_CELL_OVERHEAD + k.len()).sum::<usize>()
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_len() <= page_size
    }

    /// Index of the child subtree that covers `key`.
    #[must_use]
    pub fn child_index(&self, key: &str) -> usize {
        self.keys.partition_point(|k| k.as_str() <= key)
    }

    /// Encode into a fresh page image with the page CRC stamped.
    ///
    /// # Errors
    /// `InvalidArgument` if the node does not fit the page or is ill-formed.
    pub fn encode(&self, page_size: usize) -> TrunkResult<Vec<u8>> {
        if self.children.len() != self.keys.len() + 1 {
            return Err(malformed("internal"));
        }
        if !self.fits(page_size) {
            return Err(TrunkError::InvalidArgument(format!(
                "internal node of {} bytes exceeds page size {page_size}",
                self.encoded_len()
            )));
        }
        let mut page = vec![0u8; page_size];
        page[0] = page_kind::INTERNAL;
        page[2..4].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        let mut at = HDR_SIZE;
        page[at..at + 8].copy_from_slice(&self.children[0].to_le_bytes());
        at += 8;
        for (key, child) in self.keys.iter().zip(self.children.iter().skip(1)) {
            page[at..at + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            at += 2;
            page[at..at + key.len()].copy_from_slice(key.as_bytes());
            at += key.len();
            page[at..at + 8].copy_from_slice(&child.to_le_bytes());
            at += 8;
        }
        stamp_page_crc(&mut page);
        Ok(page)
    }

    /// # Errors
    /// `InvalidArgument` if the page is not a structurally valid internal node.
    pub fn decode(page: &[u8]) -> TrunkResult<Self> {
        if page.first() != Some(&page_kind::INTERNAL) {
            return Err(malformed("internal"));
        }
        let count = u16::from_le_bytes([page[2], page[3]]) as usize;
        let mut at = HDR_SIZE;
        if at + 8 > page.len() {
            return Err(malformed("internal"));
        }
        let mut children = Vec::with_capacity(count + 1);
        children.push(u64::from_le_bytes(page[at..at + 8].try_into().expect("8-byte slice")));
        at += 8;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            if at + 2 > page.len() {
                return Err(malformed("internal"));
            }
            let key_len = u16::from_le_bytes([page[at], page[at + 1]]) as usize;
            at += 2;
            if at + key_len + 8 > page.len() {
                return Err(malformed("internal"));
            }
            let key = std::str::from_utf8(&page[at..at + key_len])
                .map_err(|_| malformed("internal"))?
                .to_string();
            at += key_len;
            children
                .push(u64::from_le_bytes(page[at..at + 8].try_into().expect("8-byte slice")));
            at += 8;
            keys.push(key);
        }
        Ok(Self { keys, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{page_crc, stored_page_crc};

    #[test]
    fn leaf_round_trip() {
        let leaf = LeafNode {
            entries: vec![
                ("alpha".into(), b"1".to_vec()),
                ("beta".into(), b"22".to_vec()),
            ],
            next_leaf: 7,
        };
        let page = leaf.encode(4096).unwrap();
        assert_eq!(stored_page_crc(&page), page_crc(&page));
        assert_eq!(LeafNode::decode(&page).unwrap(), leaf);
    }

    #[test]
    fn internal_round_trip_and_routing() {
        let node = InternalNode {
            keys: vec!["m".into()],
            children: vec![2, 3],
        };
        let page = node.encode(4096).unwrap();
        let back = InternalNode::decode(&page).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.child_index("a"), 0);
        assert_eq!(back.child_index("m"), 1);
        assert_eq!(back.child_index("z"), 1);
    }
}
