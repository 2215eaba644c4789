use serde::Deserialize;

use crate::errors::{TrunkError, TrunkResult};

/// Thresholds that drive automatic compaction of the bitcask log.
///
/// Compaction fires when any one threshold is exceeded while the logical file
/// size is above `minimum_file_size_bytes`. Setting `manual` suppresses the
/// automatic evaluation entirely; `compact()` can still be called directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionOptions {
    /// Trigger when `dead / total` reaches this ratio.
    pub dead_space_ratio_threshold: f64,
    /// Trigger when the absolute dead-record count reaches this value.
    pub dead_record_count_threshold: u64,
    /// Trigger after this many mutations since the last compaction.
    pub mutation_count_threshold: Option<u64>,
    /// Files smaller than this are never auto-compacted.
    pub minimum_file_size_bytes: u64,
    /// If set, a background timer re-evaluates the thresholds at this period.
    pub background_check_interval_ms: Option<u64>,
    /// Disable automatic compaction; only explicit `compact()` calls run.
    pub manual: bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            dead_space_ratio_threshold: 0.4,
            dead_record_count_threshold: 10_000,
            mutation_count_threshold: None,
            minimum_file_size_bytes: 1024 * 1024,
            background_check_interval_ms: None,
            manual: false,
        }
    }
}

impl CompactionOptions {
    /// A configuration with automatic compaction disabled.
    #[must_use]
    pub fn manual_only() -> Self {
        Self { manual: true, ..Self::default() }
    }
}

/// Options for the bitcask log trunk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitcaskOptions {
    /// Validate record CRC32 on every read and during keydir load.
    pub validate_crc_on_read: bool,
    /// Pending unsynced writes that force an inline fsync.
    pub batch_threshold: usize,
    /// Period of the background flush tick.
    pub flush_interval_ms: u64,
    pub compaction: CompactionOptions,
}

impl Default for BitcaskOptions {
    fn default() -> Self {
        Self {
            validate_crc_on_read: false,
            batch_threshold: 256,
            flush_interval_ms: 100,
            compaction: CompactionOptions::default(),
        }
    }
}

/// Options for the page-based B+Tree trunk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BPlusOptions {
    /// Page size chosen at file creation; power of two in 4096..=65536.
    /// Ignored when opening an existing file (the superblock wins).
    pub page_size: usize,
    /// Page cache capacity in pages.
    pub max_cache_pages: usize,
    /// Fsync the WAL and superblock at every commit.
    pub fsync_on_commit: bool,
    /// WAL entries accumulated before a checkpoint runs.
    pub checkpoint_threshold: u64,
    /// Validate page CRC32 on every read.
    pub validate_page_crc: bool,
}

impl Default for BPlusOptions {
    fn default() -> Self {
        Self {
            page_size: 8192,
            max_cache_pages: 256,
            fsync_on_commit: true,
            checkpoint_threshold: 1000,
            validate_page_crc: true,
        }
    }
}

impl BPlusOptions {
    /// # Errors
    /// Returns `InvalidArgument` if the page size is not a power of two in 4096..=65536.
    pub fn validate(&self) -> TrunkResult<()> {
        let ps = self.page_size;
        if !(4096..=65536).contains(&ps) || !ps.is_power_of_two() {
            return Err(TrunkError::InvalidArgument(format!(
                "page_size must be a power of two in 4096..=65536, got {ps}"
            )));
        }
        Ok(())
    }
}
