use dashmap::DashMap;

/// On-disk record format a keydir entry points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// Legacy 20-byte header, null-terminated key, no CRC. Read-only.
    V1,
    /// Current 32-byte header with CRC32.
    V2,
}

/// Location and metadata of the latest record for a live key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeydirEntry {
    pub record_offset: u64,
    pub payload_offset: u64,
    pub payload_len: i32,
    pub timestamp_micros: i64,
    pub version: u32,
    pub format: RecordFormat,
}

impl KeydirEntry {
    /// Length of the key bytes, recovered from the layout (v2 only).
    #[must_use]
    pub fn key_len_v2(&self) -> u64 {
        self.payload_offset - self.record_offset - crate::bitcask::record::HEADER_V2_LEN as u64
    }
}

/// In-memory map from key to the location of its latest record.
///
/// Reads are lock-free; writers use the map's atomic update-or-insert.
/// Counters (dead, total, mutations) live on the engine, not here: the keydir
/// only reports what an insert or remove displaced.
#[derive(Debug, Default)]
pub struct Keydir {
    map: DashMap<String, KeydirEntry>,
}

impl Keydir {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<KeydirEntry> {
        self.map.get(key).map(|e| *e)
    }

    /// Update-or-insert. Returns the entry this one displaced, if any.
    pub fn insert(&self, key: String, entry: KeydirEntry) -> Option<KeydirEntry> {
        self.map.insert(key, entry)
    }

    pub fn remove(&self, key: &str) -> Option<KeydirEntry> {
        self.map.remove(key).map(|(_, e)| e)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Point-in-time copy of the live set. Concurrent writers may land either
    /// side of the snapshot; each key is consistent.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, KeydirEntry)> {
        self.map.iter().map(|kv| (kv.key().clone(), *kv.value())).collect()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.map.iter().map(|kv| kv.key().clone()).collect()
    }
}
