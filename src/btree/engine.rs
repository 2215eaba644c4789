use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use crate::btree::node::{InternalNode, LeafNode};
use crate::config::BPlusOptions;
use crate::errors::{TrunkError, TrunkResult};
use crate::nut::Nut;
use crate::nut::serializer::{JsonSerializer, NutSerializer};
use crate::pagecache::{CacheStatsSnapshot, PageCache};
use crate::pager::{PageId, PageManager, page_kind};
use crate::pool::BufferPool;
use crate::roots::RootPipeline;
use crate::trunk::{Trunk, TrunkCapabilities};
use crate::wal::WalManager;

pub const DATA_FILE_NAME: &str = "trunk.db";
pub const WAL_FILE_NAME: &str = "trunk.wal";

/// Root pointer, generation, and entry count, guarded by the write
/// semaphore. The on-disk twin lives in the superblock and is only advanced
/// by `commit`.
struct TreeState {
    root: PageId,
    generation: u64,
    entry_count: u64,
}

/// A batch of page mutations plus the entry-count delta they imply. Pages in
/// `freed` are released only after the superblock commit lands: a crash
/// before the commit must leave every page the old root reaches untouched.
struct Mutation {
    dirty: Vec<(PageId, Vec<u8>)>,
    freed: Vec<PageId>,
    entry_delta: i64,
}

/// The page-based B+Tree trunk. Keys are UTF-8 strings, values the same
/// envelope bytes the log trunk stores (after the root pipeline). Leaves are
/// chained in key order for scans.
pub struct BPlusTrunk {
    pager: PageManager,
    wal: WalManager,
    cache: PageCache,
    state: Mutex<TreeState>,
    options: BPlusOptions,
    pipeline: RootPipeline,
    serializer: Box<dyn NutSerializer>,
    pool: BufferPool,
}

impl BPlusTrunk {
    /// Open (or create) a trunk directory with default options.
    ///
    /// # Errors
    /// Propagates file preparation and recovery failures.
    pub fn open(dir: impl AsRef<Path>) -> TrunkResult<Self> {
        Self::open_with(dir, BPlusOptions::default())
    }

    /// Open (or create) a trunk directory. If the WAL is non-empty, every
    /// CRC-valid image is applied to the data file before the tree is used
    /// (recovery); the first invalid record is treated as a torn tail.
    ///
    /// # Errors
    /// Propagates file preparation and recovery failures.
    pub fn open_with(dir: impl AsRef<Path>, options: BPlusOptions) -> TrunkResult<Self> {
        options.validate()?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let data_path = dir.join(DATA_FILE_NAME);
        let wal_path = dir.join(WAL_FILE_NAME);

        let (pager, sb) = PageManager::open(
            &data_path,
            options.page_size,
            options.validate_page_crc,
            options.fsync_on_commit,
        )?;
        let wal = WalManager::open(&wal_path, pager.page_size())?;

        if !wal.is_empty() {
            let replayed = wal.replay(|page_id, image| pager.write_page(page_id, image))?;
            pager.sync()?;
            wal.truncate()?;
            log::info!("recovered {replayed} page images from {}", wal_path.display());
        }

        let cache = PageCache::new(options.max_cache_pages, pager.page_size());
        let trunk = Self {
            pager,
            wal,
            cache,
            state: Mutex::new(TreeState {
                root: sb.root_page,
                generation: sb.root_generation,
                entry_count: sb.entry_count,
            }),
            options,
            pipeline: RootPipeline::new(),
            serializer: Box::new(JsonSerializer),
            pool: BufferPool::new(),
        };

        // An older format reused these bytes; a zero count next to a live
        // root means the stored value cannot be trusted.
        if sb.entry_count == 0 && sb.root_page != 0 {
            let counted = trunk.recount_entries(sb.root_page)?;
            trunk.state.lock().entry_count = counted;
            log::warn!(
                "entry count was zero with root page {}; recounted {counted} entries",
                sb.root_page
            );
        }

        Ok(trunk)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    #[must_use]
    pub fn root_generation(&self) -> u64 {
        self.state.lock().generation
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.state.lock().entry_count
    }

    fn read_page_cached(&self, page_id: PageId, buf: &mut [u8]) -> TrunkResult<()> {
        if self.cache.try_get(page_id, buf) {
            return Ok(());
        }
        self.pager.read_page(page_id, buf)?;
        self.cache.put(page_id, buf);
        Ok(())
    }

    /// Descend from `root` to the leaf covering `key`, recording the
    /// internal path as `(page_id, node, taken_child_index)`.
    fn descend(
        &self,
        root: PageId,
        key: &str,
    ) -> TrunkResult<(PageId, LeafNode, Vec<(PageId, InternalNode, usize)>)> {
        let mut path = Vec::new();
        let mut page_id = root;
        let mut buf = self.pool.rent(self.pager.page_size());
        loop {
            self.read_page_cached(page_id, buf.as_mut_slice())?;
            let page = buf.as_slice();
            match page[0] {
                page_kind::LEAF => return Ok((page_id, LeafNode::decode(page)?, path)),
                page_kind::INTERNAL => {
                    let node = InternalNode::decode(page)?;
                    let idx = node.child_index(key);
                    let next = node.children[idx];
                    path.push((page_id, node, idx));
                    page_id = next;
                }
                kind => {
                    return Err(TrunkError::InvalidArgument(format!(
                        "unexpected page kind {kind:#04x} at page {page_id}"
                    )));
                }
            }
        }
    }

    fn leftmost_leaf(&self, root: PageId) -> TrunkResult<PageId> {
        let mut page_id = root;
        let mut buf = self.pool.rent(self.pager.page_size());
        loop {
            self.read_page_cached(page_id, buf.as_mut_slice())?;
            let page = buf.as_slice();
            match page[0] {
                page_kind::LEAF => return Ok(page_id),
                page_kind::INTERNAL => {
                    page_id = InternalNode::decode(page)?.children[0];
                }
                kind => {
                    return Err(TrunkError::InvalidArgument(format!(
                        "unexpected page kind {kind:#04x} at page {page_id}"
                    )));
                }
            }
        }
    }

    /// Walk the leaf chain counting entries; used when the stored count
    /// cannot be trusted.
    fn recount_entries(&self, root: PageId) -> TrunkResult<u64> {
        let mut count = 0u64;
        let mut page_id = self.leftmost_leaf(root)?;
        let mut buf = vec![0u8; self.pager.page_size()];
        while page_id != 0 {
            self.read_page_cached(page_id, &mut buf)?;
            let leaf = LeafNode::decode(&buf)?;
            count += leaf.entries.len() as u64;
            page_id = leaf.next_leaf;
        }
        Ok(count)
    }

    /// Ordered scan of the keys in `start..end` along the leaf chain.
    ///
    /// # Errors
    /// Propagates page read and envelope decode failures.
    pub fn scan_range(&self, start: &str, end: &str) -> TrunkResult<Vec<Nut>> {
        let mut raw_entries: Vec<(String, Vec<u8>)> = Vec::new();
        {
            let state = self.state.lock();
            if state.root == 0 || start >= end {
                return Ok(Vec::new());
            }
            let (_, mut leaf, _) = self.descend(state.root, start)?;
            let mut buf = self.pool.rent(self.pager.page_size());
            'chain: loop {
                for (key, value) in &leaf.entries {
                    if key.as_str() < start {
                        continue;
                    }
                    if key.as_str() >= end {
                        break 'chain;
                    }
                    raw_entries.push((key.clone(), value.clone()));
                }
                if leaf.next_leaf == 0 {
                    break;
                }
                self.read_page_cached(leaf.next_leaf, buf.as_mut_slice())?;
                leaf = LeafNode::decode(buf.as_slice())?;
            }
        }
        raw_entries
            .into_iter()
            .map(|(key, raw)| self.decode_envelope(&key, raw))
            .collect()
    }

    /// Point lookup under the tree monitor: structural changes (splits,
    /// frees) must not land mid-traversal.
    fn point_lookup(&self, key: &str) -> TrunkResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        if state.root == 0 {
            return Ok(None);
        }
        let (_, leaf, _) = self.descend(state.root, key)?;
        Ok(leaf
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }

    /// Insert or overwrite under the write semaphore. Returns the mutation
    /// batch; callers commit it.
    fn build_insert(
        &self,
        state: &TreeState,
        key: &str,
        value: Vec<u8>,
    ) -> TrunkResult<(Mutation, PageId)> {
        let page_size = self.pager.page_size();

        if state.root == 0 {
            let page_id = self.pager.allocate()?;
            let leaf = LeafNode { entries: vec![(key.to_string(), value)], next_leaf: 0 };
            let image = leaf.encode(page_size)?;
            let mutation =
                Mutation { dirty: vec![(page_id, image)], freed: Vec::new(), entry_delta: 1 };
            return Ok((mutation, page_id));
        }

        let (leaf_id, mut leaf, mut path) = self.descend(state.root, key)?;
        let entry_delta = match leaf.entries.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(i) => {
                leaf.entries[i].1 = value;
                0
            }
            Err(i) => {
                leaf.entries.insert(i, (key.to_string(), value));
                1
            }
        };

        let mut dirty: Vec<(PageId, Vec<u8>)> = Vec::new();
        let mut new_root = state.root;

        if leaf.fits(page_size) {
            dirty.push((leaf_id, leaf.encode(page_size)?));
        } else {
            // Split the leaf; the left half keeps the original page id so
            // parent pointers and the chain stay valid.
            let mid = leaf.entries.len() / 2;
            let right_entries = leaf.entries.split_off(mid);
            let right_id = self.pager.allocate()?;
            let right = LeafNode { entries: right_entries, next_leaf: leaf.next_leaf };
            leaf.next_leaf = right_id;
            let mut promoted = right.entries[0].0.clone();
            dirty.push((leaf_id, leaf.encode(page_size)?));
            dirty.push((right_id, right.encode(page_size)?));

            let mut split_left = leaf_id;
            let mut split_right = right_id;
            let mut absorbed = false;
            while let Some((node_id, mut node, idx)) = path.pop() {
                node.keys.insert(idx, promoted.clone());
                node.children.insert(idx + 1, split_right);
                if node.fits(page_size) {
                    dirty.push((node_id, node.encode(page_size)?));
                    absorbed = true;
                    break;
                }
                let mid = node.keys.len() / 2;
                let up = node.keys[mid].clone();
                let right_keys = node.keys.split_off(mid + 1);
                node.keys.pop();
                let right_children = node.children.split_off(mid + 1);
                let right_node = InternalNode { keys: right_keys, children: right_children };
                let right_node_id = self.pager.allocate()?;
                dirty.push((node_id, node.encode(page_size)?));
                dirty.push((right_node_id, right_node.encode(page_size)?));
                promoted = up;
                split_left = node_id;
                split_right = right_node_id;
            }
            if !absorbed {
                let root_node =
                    InternalNode { keys: vec![promoted], children: vec![split_left, split_right] };
                let root_id = self.pager.allocate()?;
                dirty.push((root_id, root_node.encode(page_size)?));
                new_root = root_id;
            }
        }

        Ok((Mutation { dirty, freed: Vec::new(), entry_delta }, new_root))
    }

    /// Remove a key under the write semaphore. Empty leaves with a left
    /// sibling under the same parent are unlinked and freed; a root left
    /// with a single child collapses.
    fn build_remove(
        &self,
        state: &TreeState,
        key: &str,
    ) -> TrunkResult<Option<(Mutation, PageId)>> {
        if state.root == 0 {
            return Ok(None);
        }
        let page_size = self.pager.page_size();
        let (leaf_id, mut leaf, mut path) = self.descend(state.root, key)?;
        let Ok(pos) = leaf.entries.binary_search_by(|(k, _)| k.as_str().cmp(key)) else {
            return Ok(None);
        };
        leaf.entries.remove(pos);

        let mut dirty: Vec<(PageId, Vec<u8>)> = Vec::new();
        let mut freed: Vec<PageId> = Vec::new();
        let mut new_root = state.root;

        if leaf.entries.is_empty() && path.is_empty() {
            // Last entry of a root leaf: the tree is empty again.
            freed.push(leaf_id);
            new_root = 0;
        } else if leaf.entries.is_empty() {
            let (parent_id, mut parent, idx) = path.pop().expect("non-root leaf has a parent");
            if idx > 0 {
                // Splice the leaf out of the chain through its left sibling.
                let left_id = parent.children[idx - 1];
                let mut buf = vec![0u8; page_size];
                self.read_page_cached(left_id, &mut buf)?;
                let mut left = LeafNode::decode(&buf)?;
                left.next_leaf = leaf.next_leaf;
                dirty.push((left_id, left.encode(page_size)?));
                parent.keys.remove(idx - 1);
                parent.children.remove(idx);
                freed.push(leaf_id);

                if parent.keys.is_empty() {
                    // Single child left: splice the parent out as well.
                    let only = parent.children[0];
                    freed.push(parent_id);
                    if let Some((grand_id, mut grand, gidx)) = path.pop() {
                        grand.children[gidx] = only;
                        dirty.push((grand_id, grand.encode(page_size)?));
                    } else {
                        new_root = only;
                    }
                } else {
                    dirty.push((parent_id, parent.encode(page_size)?));
                }
            } else {
                // Leftmost child: keep the empty leaf so the chain head and
                // the parent's low fence stay intact.
                dirty.push((leaf_id, leaf.encode(page_size)?));
            }
        } else {
            dirty.push((leaf_id, leaf.encode(page_size)?));
        }

        Ok(Some((Mutation { dirty, freed, entry_delta: -1 }, new_root)))
    }

    /// Commit sequence for a batch of modifications: WAL first, fsync, page
    /// cache, then the superblock with the incremented generation. Crossing
    /// the checkpoint threshold runs the checkpoint protocol.
    fn commit(&self, state: &mut TreeState, mutation: Mutation, new_root: PageId) -> TrunkResult<()> {
        for (page_id, image) in &mutation.dirty {
            self.wal.append(*page_id, image)?;
        }
        if self.options.fsync_on_commit {
            self.wal.sync()?;
        }
        for (page_id, image) in &mutation.dirty {
            self.pager.write_page(*page_id, image)?;
            self.cache.put(*page_id, image);
        }
        state.root = new_root;
        state.generation += 1;
        state.entry_count = state
            .entry_count
            .checked_add_signed(mutation.entry_delta)
            .unwrap_or_default();
        self.pager
            .write_superblock(state.entry_count, state.root, state.generation)?;

        // Only after the commit point may pages the old root reached be
        // recycled; a crash above replays into the pre-commit state.
        for page_id in &mutation.freed {
            self.pager.free_page(*page_id, &self.wal)?;
            self.cache.invalidate(*page_id);
        }

        if self.wal.entries_since_checkpoint() >= self.options.checkpoint_threshold {
            self.checkpoint(state)?;
        }
        Ok(())
    }

    /// Checkpoint protocol: make the already-applied pages durable in the
    /// data file, then truncate the WAL. Rewrites the superblock if the
    /// free-list head moved since it was last persisted.
    fn checkpoint(&self, state: &TreeState) -> TrunkResult<()> {
        self.pager.sync()?;
        self.wal.sync()?;
        self.wal.truncate()?;
        if self.pager.free_list_dirty() {
            self.pager
                .write_superblock(state.entry_count, state.root, state.generation)?;
        }
        log::debug!("checkpoint complete at generation {}", state.generation);
        Ok(())
    }

    fn decode_envelope(&self, key: &str, raw: Vec<u8>) -> TrunkResult<Nut> {
        let raw = if self.pipeline.is_empty() {
            raw
        } else {
            self.pipeline.apply_crack(raw, key)?
        };
        let mut nut = self.serializer.deserialize(&raw)?;
        nut.key = key.to_string();
        Ok(nut)
    }

    fn validate_key(key: &str) -> TrunkResult<()> {
        if key.is_empty() {
            return Err(TrunkError::InvalidArgument("key must not be empty".into()));
        }
        if key.len() >= 1 << 20 {
            return Err(TrunkError::InvalidArgument(format!(
                "key length {} exceeds {}",
                key.len(),
                1 << 20
            )));
        }
        Ok(())
    }
}

impl Trunk for BPlusTrunk {
    fn stash(&self, key: &str, nut: &Nut) -> TrunkResult<()> {
        Self::validate_key(key)?;
        let serialized = self.serializer.serialize(nut)?;
        let value = if self.pipeline.is_empty() {
            serialized
        } else {
            self.pipeline.apply_stash(serialized, key)?
        };

        let mut state = self.state.lock();
        let (mutation, new_root) = self.build_insert(&state, key, value)?;
        self.commit(&mut state, mutation, new_root)
    }

    fn crack(&self, key: &str) -> TrunkResult<Option<Nut>> {
        Self::validate_key(key)?;
        match self.point_lookup(key)? {
            Some(raw) => Ok(Some(self.decode_envelope(key, raw)?)),
            None => Ok(None),
        }
    }

    fn crack_all(&self) -> TrunkResult<Vec<Nut>> {
        // Collect raw values under the tree monitor, decode after releasing
        // it (roots may run arbitrary user code).
        let mut raw_entries: Vec<(String, Vec<u8>)> = Vec::new();
        {
            let state = self.state.lock();
            if state.root == 0 {
                return Ok(Vec::new());
            }
            let mut page_id = self.leftmost_leaf(state.root)?;
            let mut buf = vec![0u8; self.pager.page_size()];
            while page_id != 0 {
                self.read_page_cached(page_id, &mut buf)?;
                let leaf = LeafNode::decode(&buf)?;
                raw_entries.extend(leaf.entries);
                page_id = leaf.next_leaf;
            }
        }
        raw_entries
            .into_iter()
            .map(|(key, raw)| self.decode_envelope(&key, raw))
            .collect()
    }

    fn toss(&self, key: &str) -> TrunkResult<()> {
        Self::validate_key(key)?;
        let mut state = self.state.lock();
        match self.build_remove(&state, key)? {
            Some((mutation, new_root)) => self.commit(&mut state, mutation, new_root),
            // Deleting an absent key is a no-op, not an error.
            None => Ok(()),
        }
    }

    fn get_history(&self, _key: &str) -> TrunkResult<Vec<Nut>> {
        Err(TrunkError::NotSupported("bplustree trunk does not keep version history"))
    }

    fn flush(&self) -> TrunkResult<()> {
        self.wal.sync()?;
        self.pager.sync()
    }

    fn roots(&self) -> &RootPipeline {
        &self.pipeline
    }

    fn capabilities(&self) -> TrunkCapabilities {
        TrunkCapabilities {
            supports_history: false,
            supports_sync: true,
            is_durable: true,
            supports_async: false,
            trunk_type: "bplustree",
        }
    }
}
