//! Compaction: rewrite the live keydir snapshot into a fresh file in v2
//! format, dropping tombstones, superseded records, and legacy v1 records.

use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bitcask::engine::{INITIAL_CAPACITY, Inner};
use crate::bitcask::holder::MapHolder;
use crate::bitcask::record::{self, HEADER_V2_LEN, RecordHeaderV2};
use crate::errors::{TrunkError, TrunkResult};
use crate::fsutil;
use crate::keydir::{KeydirEntry, RecordFormat};

/// Clears the in-progress flag on every exit path.
struct CompactionGuard<'a>(&'a AtomicBool);

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Inner {
    /// At most one compaction runs at a time; a losing caller returns
    /// immediately. New writes block on the write semaphore for the duration;
    /// readers continue against the old accessor through their held refs.
    pub(crate) fn compact(&self) -> TrunkResult<()> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let _guard = CompactionGuard(&self.compacting);

        self.ensure_loaded()?;
        // Drain batched writes so the snapshot is durable before we rewrite.
        self.sync()?;

        let mut writer = self.writer.lock();

        let mut snapshot = self.keydir.snapshot();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let tmp_path = self.path.with_extension("compact");
        let tmp = fsutil::create_secure(&tmp_path)?;
        tmp.set_len(0)?;
        let mut out = BufWriter::with_capacity(1 << 20, &tmp);

        let source = self.acquire_holder()?;
        let mut new_entries: Vec<(String, KeydirEntry)> = Vec::with_capacity(snapshot.len());
        let mut position = 0u64;

        for (key, entry) in &snapshot {
            let start = entry.payload_offset as usize;
            let end = start
                .checked_add(entry.payload_len.max(0) as usize)
                .filter(|&e| e <= source.len())
                .ok_or_else(|| {
                    TrunkError::Concurrency("keydir entry out of accessor bounds".into())
                })?;
            let payload = &source[start..end];
            let key_bytes = key.as_bytes();
            let crc = record::record_crc(key_bytes, payload);
            let header = RecordHeaderV2 {
                flags: 0,
                key_len: key_bytes.len() as u32,
                payload_len: payload.len() as u32,
                timestamp_micros: entry.timestamp_micros,
                version: entry.version,
                crc,
            };
            out.write_all(&header.encode())?;
            out.write_all(key_bytes)?;
            out.write_all(payload)?;
            new_entries.push((
                key.clone(),
                KeydirEntry {
                    record_offset: position,
                    payload_offset: position + HEADER_V2_LEN as u64 + key_bytes.len() as u64,
                    payload_len: payload.len() as i32,
                    timestamp_micros: entry.timestamp_micros,
                    version: entry.version,
                    format: RecordFormat::V2,
                },
            ));
            position += header.record_len();
        }

        out.flush()?;
        drop(out);
        tmp.sync_data()?;
        drop(source);
        drop(tmp);

        fsutil::atomic_replace(&tmp_path, &self.path)?;

        let new_file = fsutil::open_rw_no_trunc(&self.path)?;
        let new_capacity = position.max(INITIAL_CAPACITY);
        new_file.set_len(new_capacity).map_err(|e| {
            TrunkError::ResourceExhausted(format!(
                "failed to reserve {new_capacity} bytes after compaction: {e}"
            ))
        })?;
        let new_holder = Arc::new(MapHolder::map(&new_file)?);
        *self.file.write() = new_file;
        let old_holder = {
            let mut slot = self.holder.write();
            std::mem::replace(&mut *slot, new_holder)
        };
        // Owner reference; in-flight readers keep the old map alive until
        // they release.
        old_holder.release();

        let live = new_entries.len() as u64;
        for (key, entry) in new_entries {
            self.keydir.insert(key, entry);
        }

        writer.position = position;
        writer.capacity = new_capacity;
        self.position.store(position, Ordering::Release);
        self.dead.store(0, Ordering::Relaxed);
        self.mutations.store(0, Ordering::Relaxed);
        self.total.store(live, Ordering::Relaxed);
        self.pending_sync.store(0, Ordering::Release);

        log::info!(
            "compacted {} to {live} live records ({position} bytes)",
            self.path.display()
        );
        Ok(())
    }
}
