use std::fs::File;
use std::io;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::Mmap;

/// Reference-counted owner of a read-only memory map over the data file.
///
/// The owner reference (count 1) belongs to the engine; readers `try_add_ref`
/// for the duration of a read and `release` on exit. When the engine grows
/// the file it swaps in a fresh holder and releases the owner reference; the
/// old map stays valid for every reader that still holds a reference and is
/// unmapped once the last `Arc` drops.
pub struct MapHolder {
    map: Mmap,
    refs: AtomicI64,
}

impl MapHolder {
    /// Map the file read-only. The count starts at 1: the owner reference.
    ///
    /// # Errors
    /// Returns an error if the mapping fails.
    pub fn map(file: &File) -> io::Result<Self> {
        // Safety: the map is read-only and the file is only ever appended to
        // or replaced wholesale (never truncated while a holder exists), so
        // mapped bytes stay valid for the holder's lifetime.
        let map = unsafe { Mmap::map(file)? };
        Ok(Self { map, refs: AtomicI64::new(1) })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Acquire a reader reference. Refuses to resurrect a holder whose count
    /// already reached zero (it is being torn down).
    #[must_use]
    pub fn try_add_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "holder released below zero");
    }

    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MapHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapHolder")
            .field("len", &self.map.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Scope guard over an acquired reader reference; releases on every exit
/// path, including failures.
pub struct HolderGuard {
    holder: Arc<MapHolder>,
}

impl HolderGuard {
    #[must_use]
    pub fn new(holder: Arc<MapHolder>) -> Self {
        Self { holder }
    }

    #[must_use]
    pub fn holder(&self) -> &MapHolder {
        &self.holder
    }
}

impl Deref for HolderGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.holder.bytes()
    }
}

impl Drop for HolderGuard {
    fn drop(&mut self) {
        self.holder.release();
    }
}
