use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bitcask::holder::{HolderGuard, MapHolder};
use crate::bitcask::record::{
    self, HEADER_V1_LEN, HEADER_V2_LEN, MAGIC_V1, MAGIC_V2, MAX_KEY_LEN, MAX_PAYLOAD_LEN,
    RecordHeaderV1, RecordHeaderV2, V1_KEY_SCAN_LIMIT, flags,
};
use crate::config::BitcaskOptions;
use crate::errors::{TrunkError, TrunkResult};
use crate::fsutil;
use crate::keydir::{Keydir, KeydirEntry, RecordFormat};
use crate::nut::Nut;
use crate::nut::serializer::{JsonSerializer, NutSerializer};
use crate::pool::BufferPool;
use crate::roots::RootPipeline;
use crate::trunk::{Trunk, TrunkCapabilities};

/// Data file name inside the trunk directory. A fresh directory is a valid
/// empty database.
pub const DATA_FILE_NAME: &str = "btree_v2.db";

/// Initial mapped capacity; doubles on overflow.
pub const INITIAL_CAPACITY: u64 = 64 * 1024 * 1024;

/// Logical append cursor and mapped capacity, guarded by the write semaphore.
/// `position` is tracked separately from the on-disk length: the file is
/// extended to the mmap capacity, so the length on disk is never the record
/// end.
pub(crate) struct WriterState {
    pub position: u64,
    pub capacity: u64,
}

/// Live/dead bookkeeping that drives auto-compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitcaskStats {
    pub live_keys: usize,
    pub total_records: u64,
    pub dead_records: u64,
    pub mutations_since_compaction: u64,
    pub logical_size: u64,
}

pub(crate) struct Inner {
    pub(crate) path: PathBuf,
    pub(crate) file: RwLock<fs::File>,
    pub(crate) holder: RwLock<Arc<MapHolder>>,
    pub(crate) keydir: Keydir,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) position: AtomicU64,
    loaded: AtomicBool,
    load_monitor: Mutex<()>,
    pub(crate) dead: AtomicU64,
    pub(crate) total: AtomicU64,
    pub(crate) mutations: AtomicU64,
    pub(crate) pending_sync: AtomicUsize,
    pub(crate) compacting: AtomicBool,
    writes_disabled: AtomicBool,
    pub(crate) options: BitcaskOptions,
    pub(crate) pipeline: RootPipeline,
    pub(crate) serializer: Box<dyn NutSerializer>,
    pool: BufferPool,
}

/// The bitcask-style log trunk: an append-only binary log over a
/// memory-mapped file, indexed by an in-memory keydir.
pub struct BitcaskTrunk {
    inner: Arc<Inner>,
}

impl BitcaskTrunk {
    /// Open (or create) a trunk directory with default options.
    ///
    /// # Errors
    /// Returns an error if the directory or data file cannot be prepared.
    pub fn open(dir: impl AsRef<Path>) -> TrunkResult<Self> {
        Self::open_with(dir, BitcaskOptions::default())
    }

    /// Open (or create) a trunk directory.
    ///
    /// # Errors
    /// Returns an error if the directory or data file cannot be prepared.
    pub fn open_with(dir: impl AsRef<Path>, options: BitcaskOptions) -> TrunkResult<Self> {
        Self::open_with_serializer(dir, options, Box::new(JsonSerializer))
    }

    /// Open with a caller-provided serializer.
    ///
    /// # Errors
    /// Returns an error if the directory or data file cannot be prepared.
    pub fn open_with_serializer(
        dir: impl AsRef<Path>,
        options: BitcaskOptions,
        serializer: Box<dyn NutSerializer>,
    ) -> TrunkResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(DATA_FILE_NAME);
        let file = fsutil::create_secure(&path)?;
        let disk_len = file.metadata()?.len();
        let capacity = disk_len.max(INITIAL_CAPACITY);
        if disk_len < capacity {
            file.set_len(capacity).map_err(|e| {
                TrunkError::ResourceExhausted(format!(
                    "failed to reserve {capacity} bytes for {}: {e}",
                    path.display()
                ))
            })?;
        }
        let holder = Arc::new(MapHolder::map(&file)?);

        let inner = Arc::new(Inner {
            path,
            file: RwLock::new(file),
            holder: RwLock::new(holder),
            keydir: Keydir::new(),
            writer: Mutex::new(WriterState { position: 0, capacity }),
            position: AtomicU64::new(0),
            loaded: AtomicBool::new(false),
            load_monitor: Mutex::new(()),
            dead: AtomicU64::new(0),
            total: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
            pending_sync: AtomicUsize::new(0),
            compacting: AtomicBool::new(false),
            writes_disabled: AtomicBool::new(false),
            options,
            pipeline: RootPipeline::new(),
            serializer,
            pool: BufferPool::new(),
        });

        inner.spawn_flusher();
        inner.spawn_compaction_timer();
        Ok(Self { inner })
    }

    /// Rewrite the live set into a fresh file, dropping tombstones and
    /// superseded records. No-op if a compaction is already running.
    ///
    /// # Errors
    /// Returns an error if the rewrite fails; the original file is untouched
    /// until the atomic replace.
    pub fn compact(&self) -> TrunkResult<()> {
        self.inner.compact()
    }

    #[must_use]
    pub fn stats(&self) -> BitcaskStats {
        let inner = &self.inner;
        BitcaskStats {
            live_keys: inner.keydir.len(),
            total_records: inner.total.load(Ordering::Relaxed),
            dead_records: inner.dead.load(Ordering::Relaxed),
            mutations_since_compaction: inner.mutations.load(Ordering::Relaxed),
            logical_size: inner.position.load(Ordering::Relaxed),
        }
    }

    /// Stash with an inline fsync regardless of batching configuration.
    ///
    /// # Errors
    /// Same contract as [`Trunk::stash`].
    pub fn stash_durable(&self, key: &str, nut: &Nut) -> TrunkResult<()> {
        self.inner.stash_inner(key, nut, true)
    }
}

/// Flush any batched writes when the trunk is closed.
impl Drop for BitcaskTrunk {
    fn drop(&mut self) {
        if self.inner.pending_sync.load(Ordering::Acquire) > 0
            && let Err(e) = self.inner.sync()
        {
            log::error!("flush on close failed: {e}");
        }
    }
}

impl Trunk for BitcaskTrunk {
    fn stash(&self, key: &str, nut: &Nut) -> TrunkResult<()> {
        self.inner.stash_inner(key, nut, false)
    }

    fn crack(&self, key: &str) -> TrunkResult<Option<Nut>> {
        match self.inner.crack_inner(key) {
            Ok(nut) => Ok(Some(nut)),
            Err(TrunkError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn crack_all(&self) -> TrunkResult<Vec<Nut>> {
        self.inner.ensure_loaded()?;
        let mut snapshot = self.inner.keydir.snapshot();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = Vec::with_capacity(snapshot.len());
        for (key, _) in snapshot {
            match self.inner.crack_inner(&key) {
                Ok(nut) => out.push(nut),
                // Tossed between snapshot and read; skip.
                Err(TrunkError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn toss(&self, key: &str) -> TrunkResult<()> {
        self.inner.toss_inner(key)
    }

    fn get_history(&self, _key: &str) -> TrunkResult<Vec<Nut>> {
        Err(TrunkError::NotSupported("bitcask trunk does not keep version history"))
    }

    fn flush(&self) -> TrunkResult<()> {
        self.inner.ensure_loaded()?;
        self.inner.sync()
    }

    fn roots(&self) -> &RootPipeline {
        &self.inner.pipeline
    }

    fn capabilities(&self) -> TrunkCapabilities {
        TrunkCapabilities {
            supports_history: false,
            supports_sync: true,
            is_durable: true,
            supports_async: false,
            trunk_type: "bitcask",
        }
    }
}

impl Inner {
    fn spawn_flusher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.options.flush_interval_ms.max(1));
        let _ = std::thread::Builder::new().name("trunkdb-flush".into()).spawn(move || {
            loop {
                std::thread::sleep(interval);
                let Some(inner) = weak.upgrade() else { break };
                if inner.pending_sync.load(Ordering::Acquire) > 0
                    && let Err(e) = inner.sync()
                {
                    log::error!("background flush failed: {e}");
                }
            }
        });
    }

    fn spawn_compaction_timer(self: &Arc<Self>) {
        let Some(ms) = self.options.compaction.background_check_interval_ms else {
            return;
        };
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(ms.max(1));
        let _ = std::thread::Builder::new().name("trunkdb-compact".into()).spawn(move || {
            loop {
                std::thread::sleep(interval);
                let Some(inner) = weak.upgrade() else { break };
                inner.maybe_auto_compact();
            }
        });
    }

    /// Lazy keydir load, double-checked so a single loader wins.
    pub(crate) fn ensure_loaded(&self) -> TrunkResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.load_monitor.lock();
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.load_keydir()?;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Walk the file from offset 0 rebuilding the keydir. Stops at the first
    /// unparseable record; everything past it is treated as unwritten tail.
    fn load_keydir(&self) -> TrunkResult<()> {
        let holder = self.holder.read().clone();
        let bytes = holder.bytes();
        let len = bytes.len();
        let mut pos = 0usize;
        let mut total = 0u64;
        let mut dead = 0u64;

        loop {
            if pos + 4 > len {
                break;
            }
            let magic: [u8; 4] = bytes[pos..pos + 4].try_into().expect("4-byte slice");
            if magic == MAGIC_V2 {
                if pos + HEADER_V2_LEN > len {
                    break;
                }
                let Some(hdr) = RecordHeaderV2::decode(&bytes[pos..pos + HEADER_V2_LEN]) else {
                    break;
                };
                if !hdr.lengths_sane() {
                    break;
                }
                let rec_len = hdr.record_len();
                if pos as u64 + rec_len > len as u64 {
                    break;
                }
                let key_start = pos + HEADER_V2_LEN;
                let key_end = key_start + hdr.key_len as usize;
                let payload_end = key_end + hdr.payload_len as usize;
                if self.options.validate_crc_on_read {
                    let computed =
                        record::record_crc(&bytes[key_start..key_end], &bytes[key_end..payload_end]);
                    if computed != hdr.crc {
                        // End of valid data; the tail is torn or corrupt.
                        break;
                    }
                }
                let Ok(key) = std::str::from_utf8(&bytes[key_start..key_end]) else {
                    break;
                };
                total += 1;
                if hdr.is_tombstone() {
                    // A tombstone kills itself and the record it supersedes.
                    dead += if self.keydir.remove(key).is_some() { 2 } else { 1 };
                } else {
                    let entry = KeydirEntry {
                        record_offset: pos as u64,
                        payload_offset: key_end as u64,
                        payload_len: hdr.payload_len as i32,
                        timestamp_micros: hdr.timestamp_micros,
                        version: hdr.version,
                        format: RecordFormat::V2,
                    };
                    if self.keydir.insert(key.to_string(), entry).is_some() {
                        dead += 1;
                    }
                }
                pos += rec_len as usize;
            } else if magic == MAGIC_V1 {
                if pos + HEADER_V1_LEN > len {
                    break;
                }
                let Some(hdr) = RecordHeaderV1::decode(&bytes[pos..pos + HEADER_V1_LEN]) else {
                    break;
                };
                let key_start = pos + HEADER_V1_LEN;
                let scan_end = (key_start + V1_KEY_SCAN_LIMIT).min(len);
                // Records lacking a null terminator are unrecoverable.
                let Some(nul) = bytes[key_start..scan_end].iter().position(|&b| b == 0) else {
                    break;
                };
                let key_end = key_start + nul;
                let payload_start = key_end + 1;
                let payload_end = payload_start as u64 + hdr.payload_len as u64;
                if payload_end > len as u64 {
                    break;
                }
                let Ok(key) = std::str::from_utf8(&bytes[key_start..key_end]) else {
                    break;
                };
                total += 1;
                let entry = KeydirEntry {
                    record_offset: pos as u64,
                    payload_offset: payload_start as u64,
                    payload_len: hdr.payload_len as i32,
                    timestamp_micros: hdr.timestamp_micros,
                    version: hdr.version,
                    format: RecordFormat::V1,
                };
                if self.keydir.insert(key.to_string(), entry).is_some() {
                    dead += 1;
                }
                pos = payload_end as usize;
            } else {
                break;
            }
        }

        self.total.store(total, Ordering::Relaxed);
        self.dead.store(dead, Ordering::Relaxed);
        {
            let mut writer = self.writer.lock();
            writer.position = pos as u64;
        }
        self.position.store(pos as u64, Ordering::Release);
        log::info!(
            "indexed {} live keys ({total} records, {dead} dead) in {}",
            self.keydir.len(),
            self.path.display()
        );
        Ok(())
    }

    fn check_writable(&self) -> TrunkResult<()> {
        if self.writes_disabled.load(Ordering::Acquire) {
            return Err(TrunkError::Concurrency(
                "writes disabled after corruption; reopen the trunk".into(),
            ));
        }
        Ok(())
    }

    fn validate_key(key: &str) -> TrunkResult<()> {
        if key.is_empty() {
            return Err(TrunkError::InvalidArgument("key must not be empty".into()));
        }
        if key.len() as u32 >= MAX_KEY_LEN {
            return Err(TrunkError::InvalidArgument(format!(
                "key length {} exceeds {MAX_KEY_LEN}",
                key.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn stash_inner(&self, key: &str, nut: &Nut, force_flush: bool) -> TrunkResult<()> {
        self.ensure_loaded()?;
        self.check_writable()?;
        Self::validate_key(key)?;

        let serialized = self.serializer.serialize(nut)?;
        let payload = if self.pipeline.is_empty() {
            serialized
        } else {
            self.pipeline.apply_stash(serialized, key)?
        };
        if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(TrunkError::InvalidArgument(format!(
                "payload length {} exceeds {MAX_PAYLOAD_LEN}",
                payload.len()
            )));
        }

        let key_bytes = key.as_bytes();
        let crc = record::record_crc(key_bytes, &payload);
        let header = RecordHeaderV2 {
            flags: 0,
            key_len: key_bytes.len() as u32,
            payload_len: payload.len() as u32,
            timestamp_micros: nut.timestamp_micros(),
            version: nut.version,
            crc,
        };

        let offset = self.append_record(&header, key_bytes, &payload)?;

        let entry = KeydirEntry {
            record_offset: offset,
            payload_offset: offset + HEADER_V2_LEN as u64 + key_bytes.len() as u64,
            payload_len: payload.len() as i32,
            timestamp_micros: header.timestamp_micros,
            version: header.version,
            format: RecordFormat::V2,
        };
        if self.keydir.insert(key.to_string(), entry).is_some() {
            self.dead.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.mutations.fetch_add(1, Ordering::Relaxed);

        if force_flush {
            self.sync()?;
        } else {
            let pending = self.pending_sync.fetch_add(1, Ordering::AcqRel) + 1;
            if pending >= self.options.batch_threshold {
                self.sync()?;
            }
        }

        self.maybe_auto_compact();
        Ok(())
    }

    pub(crate) fn toss_inner(&self, key: &str) -> TrunkResult<()> {
        self.ensure_loaded()?;
        self.check_writable()?;
        Self::validate_key(key)?;

        let key_bytes = key.as_bytes();
        let crc = record::record_crc(key_bytes, &[]);
        let header = RecordHeaderV2 {
            flags: flags::TOMBSTONE,
            key_len: key_bytes.len() as u32,
            payload_len: 0,
            timestamp_micros: chrono::Utc::now().timestamp_micros(),
            // Tombstone versions carry no meaning; readers ignore them.
            version: 0,
            crc,
        };

        self.append_record(&header, key_bytes, &[])?;

        let displaced = self.keydir.remove(key);
        self.dead.fetch_add(if displaced.is_some() { 2 } else { 1 }, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.mutations.fetch_add(1, Ordering::Relaxed);

        // Deletes must survive restart: never batched.
        self.sync()?;
        self.maybe_auto_compact();
        Ok(())
    }

    /// Reserve a range under the write semaphore (remapping on overflow) and
    /// write the record segments into it. Returns the record offset.
    fn append_record(
        &self,
        header: &RecordHeaderV2,
        key_bytes: &[u8],
        payload: &[u8],
    ) -> TrunkResult<u64> {
        let total_len = header.record_len();
        let offset = {
            let mut writer = self.writer.lock();
            let offset = writer.position;
            let end = offset.checked_add(total_len).ok_or_else(|| {
                TrunkError::ResourceExhausted("data file position overflow".into())
            })?;
            if end > writer.capacity {
                self.grow(&mut writer, end)?;
            }
            writer.position = end;
            self.position.store(end, Ordering::Release);
            offset
        };

        let file = self.file.read();
        fsutil::write_at(&file, offset, &header.encode())?;
        fsutil::write_at(&file, offset + HEADER_V2_LEN as u64, key_bytes)?;
        if !payload.is_empty() {
            fsutil::write_at(&file, offset + HEADER_V2_LEN as u64 + key_bytes.len() as u64, payload)?;
        }
        Ok(offset)
    }

    /// Double the capacity (or reserve just enough), swap in a fresh holder,
    /// and release the previous owner reference. Callers hold the write
    /// semaphore. In-flight readers keep the old map alive via their refs.
    fn grow(&self, writer: &mut WriterState, needed_end: u64) -> TrunkResult<()> {
        let new_capacity = writer.capacity.saturating_mul(2).max(needed_end);
        {
            let file = self.file.read();
            file.set_len(new_capacity).map_err(|e| {
                TrunkError::ResourceExhausted(format!(
                    "failed to grow data file to {new_capacity} bytes: {e}"
                ))
            })?;
        }
        let new_holder = {
            let file = self.file.read();
            Arc::new(MapHolder::map(&file)?)
        };
        let old = {
            let mut slot = self.holder.write();
            std::mem::replace(&mut *slot, new_holder)
        };
        old.release();
        writer.capacity = new_capacity;
        log::debug!("remapped {} to {new_capacity} bytes", self.path.display());
        Ok(())
    }

    pub(crate) fn sync(&self) -> TrunkResult<()> {
        self.file.read().sync_data()?;
        self.pending_sync.store(0, Ordering::Release);
        Ok(())
    }

    /// Snapshot the current holder and acquire a reader reference, retrying
    /// if a swap lands in between.
    pub(crate) fn acquire_holder(&self) -> TrunkResult<HolderGuard> {
        for _ in 0..64 {
            let holder = self.holder.read().clone();
            if holder.try_add_ref() {
                return Ok(HolderGuard::new(holder));
            }
        }
        Err(TrunkError::Concurrency("accessor holder released while acquiring".into()))
    }

    pub(crate) fn crack_inner(&self, key: &str) -> TrunkResult<Nut> {
        self.ensure_loaded()?;
        let entry = self
            .keydir
            .get(key)
            .ok_or_else(|| TrunkError::NotFound(key.to_string()))?;
        let guard = self.acquire_holder()?;
        self.read_entry(&guard, key, &entry)
    }

    fn read_entry(&self, bytes: &[u8], key: &str, entry: &KeydirEntry) -> TrunkResult<Nut> {
        let payload_len = usize::try_from(entry.payload_len).map_err(|_| {
            TrunkError::InvalidArgument(format!("negative payload length {}", entry.payload_len))
        })?;
        let start = entry.payload_offset as usize;
        let end = start.checked_add(payload_len).filter(|&e| e <= bytes.len()).ok_or_else(
            || TrunkError::Concurrency("keydir entry out of accessor bounds".into()),
        )?;

        if entry.format == RecordFormat::V2 && self.options.validate_crc_on_read {
            let rec = entry.record_offset as usize;
            let stored = u32::from_le_bytes(
                bytes[rec + 28..rec + 32].try_into().expect("4-byte slice"),
            );
            let key_start = rec + HEADER_V2_LEN;
            let computed = record::record_crc(&bytes[key_start..start], &bytes[start..end]);
            if stored != computed {
                return Err(TrunkError::Corrupted {
                    offset: entry.record_offset,
                    stored,
                    computed,
                });
            }
        }

        // Both formats carry the full serialized envelope as their payload;
        // metadata comes from the keydir, the payload from the envelope.
        // With no roots registered the payload is decoded from a pooled
        // buffer; otherwise the pipeline takes ownership (roots may resize).
        let decoded = if self.pipeline.is_empty() {
            let mut raw = self.pool.rent(payload_len);
            raw.as_mut_slice().copy_from_slice(&bytes[start..end]);
            self.serializer.deserialize(raw.as_slice())?
        } else {
            let raw = self.pipeline.apply_crack(bytes[start..end].to_vec(), key)?;
            self.serializer.deserialize(&raw)?
        };
        Ok(Nut {
            key: key.to_string(),
            payload: decoded.payload,
            timestamp: Nut::datetime_from_micros(entry.timestamp_micros),
            version: entry.version,
            expires_at: decoded.expires_at,
        })
    }

    pub(crate) fn maybe_auto_compact(&self) {
        let opts = &self.options.compaction;
        if opts.manual || self.compacting.load(Ordering::Relaxed) {
            return;
        }
        if self.position.load(Ordering::Acquire) < opts.minimum_file_size_bytes {
            return;
        }
        let dead = self.dead.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let ratio_hit = total > 0
            && (dead as f64 / total as f64) >= opts.dead_space_ratio_threshold;
        let count_hit = dead >= opts.dead_record_count_threshold;
        let mutation_hit = opts
            .mutation_count_threshold
            .is_some_and(|t| self.mutations.load(Ordering::Relaxed) >= t);
        if (ratio_hit || count_hit || mutation_hit)
            && let Err(e) = self.compact()
        {
            log::error!("auto-compaction of {} failed: {e}", self.path.display());
            if e.is_corruption() {
                self.writes_disabled.store(true, Ordering::Release);
            }
        }
    }
}
