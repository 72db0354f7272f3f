// src/status/mod.rs

//! Durable record of per-(stage, fragment) completion state.
//!
//! - [`StatusStore`] is the interface the runtime and planner talk to.
//! - [`MemoryStatusStore`] keeps everything in memory (lost on exit).
//! - [`FileStatusStore`] journals every change to `<dir>/status` so a later
//!   `resume` can skip the fragments that already completed.
//!
//! Both enforce the same rules: writes are idempotent and a `complete`
//! fragment is never moved back to a lesser state.

pub mod journal;
pub mod table;

use std::collections::BTreeMap;

use anyhow::Result;

use crate::types::{FragmentKey, FragmentStatus};

pub use journal::{FileStatusStore, STATUS_DIR, STATUS_FILE};
pub use table::StatusTable;

/// Abstract storage for fragment status.
pub trait StatusStore: Send {
    /// Record a status. Recording the current status again is a no-op, and
    /// illegal transitions (anything out of `complete`) are ignored.
    fn record_status(
        &mut self,
        stage: &str,
        fragment: FragmentKey,
        status: FragmentStatus,
    ) -> Result<()>;

    fn status_of(&self, stage: &str, fragment: FragmentKey) -> Option<FragmentStatus>;

    /// Every recorded fragment of a stage.
    fn fragments_of(&self, stage: &str) -> BTreeMap<FragmentKey, FragmentStatus>;

    /// Stages with at least one recorded fragment or a fingerprint.
    fn stages(&self) -> Vec<String>;

    /// Forget everything recorded for a stage, fingerprint included. The
    /// stage stays invalidated until the store is cleared.
    fn reset_stage(&mut self, stage: &str) -> Result<()>;

    /// Whether `stage` was reset, so outputs it left behind must not count
    /// as complete work.
    fn is_invalidated(&self, stage: &str) -> bool;

    /// Forget everything.
    fn clear(&mut self) -> Result<()>;

    /// Parameter fingerprint stored alongside the stage's fragments.
    fn fingerprint(&self, stage: &str) -> Option<String>;

    fn set_fingerprint(&mut self, stage: &str, fingerprint: &str) -> Result<()>;

    /// True iff every expected fragment is complete and the number of
    /// recorded fragments matches the expected count.
    fn is_stage_complete(&self, stage: &str, expected: &[FragmentKey]) -> bool {
        let recorded = self.fragments_of(stage);
        recorded.len() == expected.len()
            && expected
                .iter()
                .all(|key| recorded.get(key) == Some(&FragmentStatus::Complete))
    }

    /// Expected fragments that are not yet complete, in `expected` order.
    fn pending_fragments(&self, stage: &str, expected: &[FragmentKey]) -> Vec<FragmentKey> {
        let recorded = self.fragments_of(stage);
        expected
            .iter()
            .filter(|key| recorded.get(*key) != Some(&FragmentStatus::Complete))
            .copied()
            .collect()
    }
}

/// Stores status in memory only.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    table: StatusTable,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for MemoryStatusStore {
    fn record_status(
        &mut self,
        stage: &str,
        fragment: FragmentKey,
        status: FragmentStatus,
    ) -> Result<()> {
        self.table.record(stage, fragment, status);
        Ok(())
    }

    fn status_of(&self, stage: &str, fragment: FragmentKey) -> Option<FragmentStatus> {
        self.table.status_of(stage, fragment)
    }

    fn fragments_of(&self, stage: &str) -> BTreeMap<FragmentKey, FragmentStatus> {
        self.table.fragments_of(stage)
    }

    fn stages(&self) -> Vec<String> {
        self.table.stages()
    }

    fn reset_stage(&mut self, stage: &str) -> Result<()> {
        self.table.reset_stage(stage);
        Ok(())
    }

    fn is_invalidated(&self, stage: &str) -> bool {
        self.table.is_invalidated(stage)
    }

    fn clear(&mut self) -> Result<()> {
        self.table = StatusTable::default();
        Ok(())
    }

    fn fingerprint(&self, stage: &str) -> Option<String> {
        self.table.fingerprint(stage).map(str::to_string)
    }

    fn set_fingerprint(&mut self, stage: &str, fingerprint: &str) -> Result<()> {
        self.table.set_fingerprint(stage, fingerprint);
        Ok(())
    }
}
