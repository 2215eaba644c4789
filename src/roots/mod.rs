pub mod compress;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::{TrunkError, TrunkResult};

pub use compress::GzipRoot;

/// The operation a pipeline pass is running under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOperation {
    Stash,
    Crack,
}

/// Per-operation context handed to every root.
#[derive(Debug, Clone, Copy)]
pub struct RootContext<'a> {
    pub operation: RootOperation,
    pub key: &'a str,
}

/// A byte-to-byte transform in the pipeline, identified by name and ordered
/// by sequence. The engine does not interpret a root's semantics;
/// compression, encryption, and policy enforcement are all just roots.
/// A root may veto the operation by returning an error.
pub trait Root: Send + Sync {
    fn name(&self) -> &str;
    fn sequence(&self) -> i32;

    /// # Errors
    /// An error aborts the write and surfaces as `TrunkError::Pipeline`.
    fn on_stash(
        &self,
        bytes: Vec<u8>,
        ctx: &RootContext<'_>,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

    /// # Errors
    /// An error aborts the read and surfaces as `TrunkError::Pipeline`.
    fn on_crack(
        &self,
        bytes: Vec<u8>,
        ctx: &RootContext<'_>,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Ordered stack of roots shared by all operations on a trunk.
///
/// Writes apply roots ascending by sequence, reads descending. The list is
/// guarded by a monitor; applications run on a snapshot so no lock is held
/// while user code executes.
#[derive(Default)]
pub struct RootPipeline {
    roots: Mutex<Vec<Arc<dyn Root>>>,
}

impl RootPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root, keeping the list sorted ascending by sequence.
    /// Roots with equal sequence keep insertion order.
    pub fn add(&self, root: Arc<dyn Root>) {
        let mut roots = self.roots.lock();
        let at = roots.partition_point(|r| r.sequence() <= root.sequence());
        roots.insert(at, root);
    }

    /// Remove a root by name. Returns whether one was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut roots = self.roots.lock();
        let before = roots.len();
        roots.retain(|r| r.name() != name);
        roots.len() != before
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.roots.lock().iter().map(|r| r.name().to_string()).collect()
    }

    /// Run the write-side pass, ascending by sequence.
    ///
    /// # Errors
    /// Propagates the first failing root as `TrunkError::Pipeline`.
    pub fn apply_stash(&self, bytes: Vec<u8>, key: &str) -> TrunkResult<Vec<u8>> {
        let snapshot: Vec<Arc<dyn Root>> = self.roots.lock().clone();
        let ctx = RootContext { operation: RootOperation::Stash, key };
        let mut bytes = bytes;
        for root in &snapshot {
            bytes = root.on_stash(bytes, &ctx).map_err(|source| TrunkError::Pipeline {
                root: root.name().to_string(),
                source,
            })?;
        }
        Ok(bytes)
    }

    /// Run the read-side pass, descending by sequence.
    ///
    /// # Errors
    /// Propagates the first failing root as `TrunkError::Pipeline`.
    pub fn apply_crack(&self, bytes: Vec<u8>, key: &str) -> TrunkResult<Vec<u8>> {
        let snapshot: Vec<Arc<dyn Root>> = self.roots.lock().clone();
        let ctx = RootContext { operation: RootOperation::Crack, key };
        let mut bytes = bytes;
        for root in snapshot.iter().rev() {
            bytes = root.on_crack(bytes, &ctx).map_err(|source| TrunkError::Pipeline {
                root: root.name().to_string(),
                source,
            })?;
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for RootPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootPipeline").field("roots", &self.names()).finish()
    }
}
