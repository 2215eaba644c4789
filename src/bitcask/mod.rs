//! The bitcask-style log trunk: an append-only binary log over a
//! memory-mapped file, a concurrent keydir pointing at payload offsets, and
//! background compaction of dead records.

mod compaction;
pub mod engine;
pub mod holder;
pub mod record;

pub use engine::{BitcaskStats, BitcaskTrunk, DATA_FILE_NAME, INITIAL_CAPACITY};
pub use holder::{HolderGuard, MapHolder};
