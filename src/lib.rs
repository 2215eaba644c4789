//! trunkdb: an embedded, single-process storage engine for typed documents.
//!
//! Records ("nuts") are stored by interchangeable backends ("trunks") that
//! all satisfy the [`Trunk`] contract:
//!
//! - [`BitcaskTrunk`]: an append-only binary log over a memory-mapped file
//!   with an in-memory keydir, tombstone deletes, and automatic compaction.
//! - [`BPlusTrunk`]: fixed-size CRC'd pages navigated as a B+Tree, with a
//!   write-ahead log, a clock-eviction page cache, and a superblock commit
//!   point.
//!
//! Both backends feed a shared pipeline of stackable byte transforms
//! ("roots") applied ascending on write and descending on read; compression,
//! encryption, and policy enforcement are all just roots.
//!
//! ```no_run
//! use trunkdb::{BitcaskTrunk, Nut, Trunk};
//!
//! let trunk = BitcaskTrunk::open("acorns")?;
//! trunk.stash("k1", &Nut::new("k1", serde_json::json!({"v": 1})))?;
//! trunk.flush()?;
//! assert!(trunk.crack("k1")?.is_some());
//! # Ok::<(), trunkdb::TrunkError>(())
//! ```

pub mod bitcask;
pub mod btree;
pub mod config;
pub mod errors;
pub mod fsutil;
pub mod keydir;
pub mod logger;
pub mod nut;
pub mod pagecache;
pub mod pager;
pub mod pool;
pub mod roots;
pub mod trunk;
pub mod wal;

pub use bitcask::{BitcaskStats, BitcaskTrunk};
pub use btree::BPlusTrunk;
pub use config::{BPlusOptions, BitcaskOptions, CompactionOptions};
pub use errors::{TrunkError, TrunkResult};
pub use nut::Nut;
pub use nut::serializer::{JsonSerializer, NutSerializer};
pub use pagecache::{CacheStatsSnapshot, PageCache};
pub use roots::{GzipRoot, Root, RootContext, RootOperation, RootPipeline};
pub use trunk::{Trunk, TrunkCapabilities};
