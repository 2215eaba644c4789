use std::sync::Arc;

use crate::errors::TrunkResult;
use crate::nut::Nut;
use crate::roots::{Root, RootPipeline};

/// Static metadata a backend exposes so hosts can reason about it without
/// probing for `NotSupported` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkCapabilities {
    pub supports_history: bool,
    pub supports_sync: bool,
    pub is_durable: bool,
    pub supports_async: bool,
    pub trunk_type: &'static str,
}

/// The contract every storage backend satisfies.
///
/// Implementations are safe for concurrent use: writes on one instance are
/// serialised internally, reads observe committed state.
pub trait Trunk: Send + Sync {
    /// Durable insert or overwrite. May batch the fsync; the record must
    /// survive a crash once `flush` returns.
    ///
    /// # Errors
    /// Fails without mutating the index on invalid keys, pipeline vetoes,
    /// or exhausted storage.
    fn stash(&self, key: &str, nut: &Nut) -> TrunkResult<()>;

    /// Point read.
    ///
    /// # Errors
    /// Returns `Ok(None)` for absent keys; corruption and pipeline failures
    /// surface as errors.
    fn crack(&self, key: &str) -> TrunkResult<Option<Nut>>;

    /// Snapshot iteration over live keys. Concurrent writes may land either
    /// side of the snapshot.
    ///
    /// # Errors
    /// Propagates read failures.
    fn crack_all(&self) -> TrunkResult<Vec<Nut>>;

    /// Logical delete; survives a crash.
    ///
    /// # Errors
    /// Propagates write failures.
    fn toss(&self, key: &str) -> TrunkResult<()>;

    /// Ordered prior versions of a key.
    ///
    /// # Errors
    /// `NotSupported` on engines without versioning (check `capabilities`).
    fn get_history(&self, key: &str) -> TrunkResult<Vec<Nut>>;

    /// Snapshot suitable for replication.
    ///
    /// # Errors
    /// Propagates read failures.
    fn export_changes(&self) -> TrunkResult<Vec<Nut>> {
        self.crack_all()
    }

    /// Apply a sequence of records, preserving their embedded timestamps and
    /// versions.
    ///
    /// # Errors
    /// Stops at the first failing record.
    fn import_changes(&self, nuts: Vec<Nut>) -> TrunkResult<()> {
        for nut in &nuts {
            self.stash(&nut.key, nut)?;
        }
        self.flush()
    }

    /// Force pending writes to durable media.
    ///
    /// # Errors
    /// Propagates fsync failures.
    fn flush(&self) -> TrunkResult<()>;

    /// The shared byte-transform pipeline. Add/remove roots through it.
    fn roots(&self) -> &RootPipeline;

    fn add_root(&self, root: Arc<dyn Root>) {
        self.roots().add(root);
    }

    fn remove_root(&self, name: &str) -> bool {
        self.roots().remove(name)
    }

    fn capabilities(&self) -> TrunkCapabilities;
}
