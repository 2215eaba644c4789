use thiserror::Error;

/// Crate-wide error taxonomy. Read errors surface to the caller; write errors
/// surface without mutating the keydir.
#[derive(Debug, Error)]
pub enum TrunkError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error(
        "corrupted record at offset {offset}: stored crc {stored:#010x}, computed {computed:#010x}"
    )]
    Corrupted { offset: u64, stored: u32, computed: u32 },

    #[error("corrupted page {page_id}: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptedPage { page_id: u64, stored: u32, computed: u32 },

    #[error("corrupted superblock: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptedSuperblock { stored: u32, computed: u32 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("root '{root}' failed: {source}")]
    Pipeline {
        root: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("concurrency fault: {0}")]
    Concurrency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TrunkResult<T> = Result<T, TrunkError>;

impl TrunkError {
    /// True for CRC-mismatch errors of any flavour (record, page, superblock).
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. } | Self::CorruptedPage { .. } | Self::CorruptedSuperblock { .. }
        )
    }
}
