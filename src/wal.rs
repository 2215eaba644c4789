//! Append-only log of page images used for crash recovery of the B+Tree
//! trunk.
//!
//! Record layout: `[PageId:8][PageImage:PageSize][CRC32:4]`, little-endian.
//! The CRC covers the page-id bytes and the image. Replay stops at the first
//! short or CRC-invalid record (torn tail); checkpoint applies all replayed
//! images to the data file, fsyncs, then truncates the WAL.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher as Crc32Hasher;
use parking_lot::Mutex;

use crate::errors::TrunkResult;
use crate::fsutil;

pub struct WalManager {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    /// Entries appended since the last checkpoint.
    entries: AtomicU64,
}

impl WalManager {
    /// Open (or create) the WAL. The entry counter starts at the number of
    /// whole records already present so a restart does not defer the next
    /// checkpoint indefinitely.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn open(path: &Path, page_size: usize) -> TrunkResult<Self> {
        let file = fsutil::open_rw_no_trunc(path)?;
        let record_len = Self::record_len_for(page_size);
        let entries = file.metadata()?.len() / record_len;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_size,
            entries: AtomicU64::new(entries),
        })
    }

    const fn record_len_for(page_size: usize) -> u64 {
        8 + page_size as u64 + 4
    }

    #[must_use]
    pub fn record_len(&self) -> u64 {
        Self::record_len_for(self.page_size)
    }

    #[must_use]
    pub fn entries_since_checkpoint(&self) -> u64 {
        self.entries.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file.lock().metadata().map(|m| m.len() == 0).unwrap_or(true)
    }

    /// Append one page image.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn append(&self, page_id: u64, image: &[u8]) -> TrunkResult<()> {
        debug_assert_eq!(image.len(), self.page_size);
        let id_bytes = page_id.to_le_bytes();
        let mut hasher = Crc32Hasher::new();
        hasher.update(&id_bytes);
        hasher.update(image);
        let crc = hasher.finalize();

        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&id_bytes)?;
        file.write_all(image)?;
        file.write_all(&crc.to_le_bytes())?;
        self.entries.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Fsync the WAL.
    ///
    /// # Errors
    /// Propagates the fsync failure.
    pub fn sync(&self) -> TrunkResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Walk the WAL from the start, invoking `for_each_image` on every record
    /// whose CRC validates. Stops at the first short or mismatching record
    /// (torn tail) and returns how many records were replayed.
    ///
    /// # Errors
    /// Propagates I/O failures and callback errors.
    pub fn replay(
        &self,
        mut for_each_image: impl FnMut(u64, &[u8]) -> TrunkResult<()>,
    ) -> TrunkResult<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut id_buf = [0u8; 8];
        let mut image = vec![0u8; self.page_size];
        let mut crc_buf = [0u8; 4];
        let mut replayed = 0usize;
        loop {
            match file.read_exact(&mut id_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if file.read_exact(&mut image).is_err() || file.read_exact(&mut crc_buf).is_err() {
                // Torn tail.
                break;
            }
            let mut hasher = Crc32Hasher::new();
            hasher.update(&id_buf);
            hasher.update(&image);
            if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                break;
            }
            for_each_image(u64::from_le_bytes(id_buf), &image)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Remove all entries (after a checkpoint).
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn truncate(&self) -> TrunkResult<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        file.sync_data()?;
        self.entries.store(0, Ordering::Release);
        log::debug!("truncated WAL {}", self.path.display());
        Ok(())
    }
}
