//! Fixed-size page I/O with CRC validation, a superblock, and a persistent
//! free list.
//!
//! Every page begins with a 16-byte header whose last 4 bytes
//! (`HDR_PAGE_CRC`) hold a CRC32 over the entire page with those 4 bytes
//! treated as zero:
//!
//! ```text
//! [Kind:1][Flags:1][EntryCount:2][NextLeaf:8][PageCrc:4]
//! ```
//!
//! Free pages reuse the 8-byte slot at offset 4 as the next-free pointer.

pub mod superblock;

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crc32fast::Hasher as Crc32Hasher;
use parking_lot::Mutex;

use crate::errors::{TrunkError, TrunkResult};
use crate::fsutil;
use crate::wal::WalManager;

pub use superblock::{SUPERBLOCK_LEN, SUPERBLOCK_MAGIC, Superblock};

pub type PageId = u64;

pub const HDR_SIZE: usize = 16;
pub const HDR_PAGE_CRC: usize = 12;
/// Offset of the 8-byte next-free pointer inside a free page.
pub const FREE_NEXT_OFFSET: usize = 4;

pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 65536;

pub mod page_kind {
    pub const INTERNAL: u8 = 0x01;
    pub const LEAF: u8 = 0x02;
    pub const FREE: u8 = 0x03;
}

/// CRC32 over the entire page with the 4 CRC bytes treated as zero.
#[must_use]
pub fn page_crc(page: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(&page[..HDR_PAGE_CRC]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[HDR_PAGE_CRC + 4..]);
    hasher.finalize()
}

pub fn stamp_page_crc(page: &mut [u8]) {
    let crc = page_crc(page);
    page[HDR_PAGE_CRC..HDR_PAGE_CRC + 4].copy_from_slice(&crc.to_le_bytes());
}

#[must_use]
pub fn stored_page_crc(page: &[u8]) -> u32 {
    u32::from_le_bytes(page[HDR_PAGE_CRC..HDR_PAGE_CRC + 4].try_into().expect("4-byte slice"))
}

struct AllocState {
    free_head: PageId,
}

/// Owns the single data file: page-granular reads and writes, allocation
/// from the free list, and the superblock commit point.
pub struct PageManager {
    file: File,
    page_size: usize,
    validate_crc: bool,
    fsync_enabled: bool,
    next_page: AtomicU64,
    alloc: Mutex<AllocState>,
    free_dirty: AtomicBool,
}

impl PageManager {
    /// Open (or create) the data file. `page_size` is only consulted when
    /// creating; an existing superblock wins.
    ///
    /// # Errors
    /// Fails on I/O errors, an invalid page size, or a superblock whose CRC
    /// does not validate.
    pub fn open(
        path: &Path,
        page_size: usize,
        validate_crc: bool,
        fsync_enabled: bool,
    ) -> TrunkResult<(Self, Superblock)> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(TrunkError::InvalidArgument(format!(
                "page_size must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        let file = fsutil::create_secure(path)?;
        let len = file.metadata()?.len();

        let sb = if len == 0 {
            let sb = Superblock::new(page_size);
            let mut page = vec![0u8; page_size];
            sb.encode(&mut page);
            fsutil::write_at(&file, 0, &page)?;
            file.sync_data()?;
            sb
        } else {
            let mut head = [0u8; SUPERBLOCK_LEN];
            fsutil::read_exact_at(&file, 0, &mut head)?;
            Superblock::decode(&head)?
        };

        let ps = sb.page_size as u64;
        let next_page = (len.div_ceil(ps)).max(1);
        let manager = Self {
            file,
            page_size: sb.page_size,
            validate_crc,
            fsync_enabled,
            next_page: AtomicU64::new(next_page),
            alloc: Mutex::new(AllocState { free_head: sb.free_list_head as PageId }),
            free_dirty: AtomicBool::new(false),
        };
        Ok((manager, sb))
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn next_page_id(&self) -> PageId {
        self.next_page.load(Ordering::Acquire)
    }

    /// Read a page into `buf`, validating the page CRC when enabled.
    ///
    /// # Errors
    /// `CorruptedPage` on a CRC mismatch; `InvalidArgument` for page 0.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> TrunkResult<()> {
        if page_id == 0 {
            return Err(TrunkError::InvalidArgument("page 0 is the superblock".into()));
        }
        debug_assert_eq!(buf.len(), self.page_size);
        fsutil::read_exact_at(&self.file, page_id * self.page_size as u64, buf)?;
        if self.validate_crc {
            let stored = stored_page_crc(buf);
            let computed = page_crc(buf);
            if stored != computed {
                return Err(TrunkError::CorruptedPage { page_id, stored, computed });
            }
        }
        Ok(())
    }

    /// Write a page image, extending the file as needed and advancing the
    /// next-page counter (lock-free CAS spin).
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> TrunkResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        fsutil::write_at(&self.file, page_id * self.page_size as u64, buf)?;
        let mut current = self.next_page.load(Ordering::Acquire);
        while page_id + 1 > current {
            match self.next_page.compare_exchange_weak(
                current,
                page_id + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Ok(())
    }

    /// Allocate a page: pop the free-list head if non-zero, else extend.
    ///
    /// # Errors
    /// Propagates I/O failures while reading the free page's next pointer.
    pub fn allocate(&self) -> TrunkResult<PageId> {
        let mut alloc = self.alloc.lock();
        if alloc.free_head != 0 {
            let page_id = alloc.free_head;
            let mut page = vec![0u8; self.page_size];
            self.read_page(page_id, &mut page)?;
            if page[0] != page_kind::FREE {
                return Err(TrunkError::Concurrency(format!(
                    "free-list head {page_id} is not a free page"
                )));
            }
            alloc.free_head = u64::from_le_bytes(
                page[FREE_NEXT_OFFSET..FREE_NEXT_OFFSET + 8].try_into().expect("8-byte slice"),
            );
            self.free_dirty.store(true, Ordering::Release);
            return Ok(page_id);
        }
        Ok(self.next_page.fetch_add(1, Ordering::AcqRel))
    }

    /// Overwrite a page with the free-page marker, log the image to the WAL,
    /// and push the id onto the in-memory free list. The head is persisted on
    /// the next superblock write.
    ///
    /// # Errors
    /// Propagates WAL and data-file I/O failures.
    pub fn free_page(&self, page_id: PageId, wal: &WalManager) -> TrunkResult<()> {
        let mut alloc = self.alloc.lock();
        let mut page = vec![0u8; self.page_size];
        page[0] = page_kind::FREE;
        page[FREE_NEXT_OFFSET..FREE_NEXT_OFFSET + 8]
            .copy_from_slice(&alloc.free_head.to_le_bytes());
        stamp_page_crc(&mut page);
        wal.append(page_id, &page)?;
        self.write_page(page_id, &page)?;
        alloc.free_head = page_id;
        self.free_dirty.store(true, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn free_list_head(&self) -> PageId {
        self.alloc.lock().free_head
    }

    /// Whether the free-list head moved since the last superblock write.
    #[must_use]
    pub fn free_list_dirty(&self) -> bool {
        self.free_dirty.load(Ordering::Acquire)
    }

    /// The commit point: publish a new root generation by rewriting page 0
    /// and fsyncing (when enabled). Clients must not treat a new root as
    /// durable until this returns.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn write_superblock(
        &self,
        entry_count: u64,
        root_page: PageId,
        root_generation: u64,
    ) -> TrunkResult<()> {
        let free_head = self.alloc.lock().free_head;
        let mut sb = Superblock::new(self.page_size);
        sb.entry_count = entry_count;
        sb.root_page = root_page;
        sb.root_generation = root_generation;
        sb.free_list_head = free_head as u32;
        let mut page = vec![0u8; self.page_size];
        sb.encode(&mut page);
        fsutil::write_at(&self.file, 0, &page)?;
        if self.fsync_enabled {
            self.file.sync_data()?;
        }
        self.free_dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Fsync the data file (checkpoint step).
    ///
    /// # Errors
    /// Propagates the fsync failure.
    pub fn sync(&self) -> TrunkResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
