// src/status/journal.rs

//! File-backed status store.
//!
//! Every change is appended to `<dir>/status` as one tab-separated line:
//!
//! ```text
//! fragment    <stage>    <fov:N | whole>    <pending|running|complete|failed>
//! fingerprint <stage>    <blake3 hex>
//! reset       <stage>
//! ```
//!
//! Opening the store replays the journal (last write wins), demotes
//! `running` fragments to `pending`, and compacts the file to one line per
//! live record. `reset` lines survive compaction so a reset stage stays
//! invalidated. A torn last line from a crash is skipped with a warning.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use super::{StatusStore, StatusTable};
use crate::fs::FileSystem;
use crate::types::{FragmentKey, FragmentStatus};

/// Default status directory name, created under the dataset root.
pub const STATUS_DIR: &str = ".fovdag";

/// Journal file name inside the status directory.
pub const STATUS_FILE: &str = "status";

#[derive(Debug)]
pub struct FileStatusStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    table: StatusTable,
}

impl FileStatusStore {
    /// Open (or create) the journal in `dir`.
    pub fn open(fs: Arc<dyn FileSystem>, dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(STATUS_FILE);
        let mut table = StatusTable::default();

        if fs.exists(&path) {
            let contents = fs
                .read_to_string(&path)
                .with_context(|| format!("reading status journal at {:?}", path))?;
            replay(&contents, &mut table, &path);
        }

        let demoted = table.demote_running();
        if demoted > 0 {
            info!(
                demoted,
                "fragments left running by a previous process are pending again"
            );
        }

        let store = Self { fs, path, table };
        store.compact()?;

        debug!(path = ?store.path, stages = store.table.stages().len(), "opened status journal");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal with one line per live record.
    fn compact(&self) -> Result<()> {
        let mut out = String::new();
        // Resets replay first; later lines for the same stage still apply.
        for stage in self.table.invalidated() {
            let _ = writeln!(out, "reset\t{stage}");
        }
        for (stage, hash) in self.table.fingerprint_entries() {
            let _ = writeln!(out, "fingerprint\t{stage}\t{hash}");
        }
        for (stage, key, status) in self.table.entries() {
            let _ = writeln!(out, "fragment\t{stage}\t{key}\t{status}");
        }

        let tmp = self.path.with_extension("tmp");
        self.fs
            .write(&tmp, out.as_bytes())
            .with_context(|| format!("writing compacted status journal at {:?}", tmp))?;
        self.fs.rename(&tmp, &self.path)?;
        Ok(())
    }

    fn append_line(&self, line: String) -> Result<()> {
        self.fs
            .append(&self.path, line.as_bytes())
            .with_context(|| format!("appending to status journal at {:?}", self.path))
    }
}

fn check_stage_name(stage: &str) -> Result<()> {
    if stage.contains(['\t', '\n', '\r']) {
        return Err(anyhow!(
            "stage name {:?} cannot be journaled (contains tab or newline)",
            stage
        ));
    }
    Ok(())
}

fn replay(contents: &str, table: &mut StatusTable, path: &Path) {
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let applied = match fields.as_slice() {
            ["fragment", stage, key, status] => match (key.parse::<FragmentKey>(), status.parse::<FragmentStatus>()) {
                (Ok(key), Ok(status)) => {
                    table.set_raw(stage, key, status);
                    true
                }
                _ => false,
            },
            ["fingerprint", stage, hash] => {
                table.set_fingerprint(stage, hash);
                true
            }
            ["reset", stage] => {
                table.reset_stage(stage);
                true
            }
            _ => false,
        };

        if !applied {
            warn!(
                path = ?path,
                line = lineno + 1,
                "skipping malformed status journal line"
            );
        }
    }
}

impl StatusStore for FileStatusStore {
    fn record_status(
        &mut self,
        stage: &str,
        fragment: FragmentKey,
        status: FragmentStatus,
    ) -> Result<()> {
        check_stage_name(stage)?;
        if self.table.record(stage, fragment, status) {
            self.append_line(format!("fragment\t{stage}\t{fragment}\t{status}\n"))?;
        }
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
        check_stage_name(stage)?;
        self.table.reset_stage(stage);
        self.append_line(format!("reset\t{stage}\n"))?;
        info!(stage = %stage, "reset stage status (file)");
        Ok(())
    }

    fn is_invalidated(&self, stage: &str) -> bool {
        self.table.is_invalidated(stage)
    }

    fn clear(&mut self) -> Result<()> {
        self.table = StatusTable::default();
        self.fs.write(&self.path, b"")?;
        info!(path = ?self.path, "cleared status journal");
        Ok(())
    }

    fn fingerprint(&self, stage: &str) -> Option<String> {
        self.table.fingerprint(stage).map(str::to_string)
    }

    fn set_fingerprint(&mut self, stage: &str, fingerprint: &str) -> Result<()> {
        check_stage_name(stage)?;
        if self.table.set_fingerprint(stage, fingerprint) {
            self.append_line(format!("fingerprint\t{stage}\t{fingerprint}\n"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use FragmentStatus::*;

    fn open(fs: &MockFileSystem) -> FileStatusStore {
        FileStatusStore::open(Arc::new(fs.clone()), "/data/.fovdag").unwrap()
    }

    #[test]
    fn completed_fragments_survive_reopen() -> Result<()> {
        let fs = MockFileSystem::new();
        {
            let mut store = open(&fs);
            store.record_status("Preprocess", FragmentKey::Fov(0), Running)?;
            store.record_status("Preprocess", FragmentKey::Fov(0), Complete)?;
            store.record_status("Preprocess", FragmentKey::Fov(1), Running)?;
            store.set_fingerprint("Preprocess", "f00d")?;
        }

        let store = open(&fs);
        assert_eq!(store.status_of("Preprocess", FragmentKey::Fov(0)), Some(Complete));
        // The process died while fov 1 was running.
        assert_eq!(store.status_of("Preprocess", FragmentKey::Fov(1)), Some(Pending));
        assert_eq!(store.fingerprint("Preprocess").as_deref(), Some("f00d"));
        Ok(())
    }

    #[test]
    fn reopen_compacts_the_journal() -> Result<()> {
        let fs = MockFileSystem::new();
        {
            let mut store = open(&fs);
            for status in [Running, Failed, Pending, Running, Complete] {
                store.record_status("Decode", FragmentKey::Fov(3), status)?;
            }
            store.record_status("Segment", FragmentKey::Whole, Complete)?;
            store.reset_stage("Segment")?;
        }
        let reopened = open(&fs);
        assert!(reopened.is_invalidated("Segment"));
        assert!(!reopened.is_invalidated("Decode"));

        let contents = fs.contents("/data/.fovdag/status").unwrap();
        assert_eq!(contents, "reset\tSegment\nfragment\tDecode\tfov:3\tcomplete\n");
        Ok(())
    }

    #[test]
    fn torn_lines_are_skipped() -> Result<()> {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/data/.fovdag/status",
            "fragment\tDecode\tfov:1\tcomplete\nfragment\tDecode\tfov:2\tcomp",
        );

        let store = open(&fs);
        assert_eq!(store.status_of("Decode", FragmentKey::Fov(1)), Some(Complete));
        assert_eq!(store.status_of("Decode", FragmentKey::Fov(2)), None);
        Ok(())
    }

    #[test]
    fn clear_empties_the_journal() -> Result<()> {
        let fs = MockFileSystem::new();
        let mut store = open(&fs);
        store.record_status("Decode", FragmentKey::Fov(1), Complete)?;
        store.clear()?;
        assert!(store.stages().is_empty());

        let reopened = open(&fs);
        assert!(reopened.stages().is_empty());
        Ok(())
    }

    #[test]
    fn names_with_tabs_are_rejected() {
        let fs = MockFileSystem::new();
        let mut store = open(&fs);
        assert!(store
            .record_status("bad\tname", FragmentKey::Whole, Complete)
            .is_err());
    }
}
