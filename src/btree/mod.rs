//! The page-based B+Tree trunk: fixed-size CRC'd pages, a superblock commit
//! point, a clock-eviction page cache, and a write-ahead log for crash
//! safety.

pub mod engine;
pub mod node;

pub use engine::{BPlusTrunk, DATA_FILE_NAME, WAL_FILE_NAME};
pub use node::{InternalNode, LeafNode};
