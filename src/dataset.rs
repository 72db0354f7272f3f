// src/dataset.rs

//! The dataset collaborator: the authoritative list of fields of view.
//!
//! Image I/O lives in the stage runners; the orchestrator only needs to know
//! which FOVs exist so it can count the fragments a stage is expected to
//! produce.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::model::DatasetSection;
use crate::types::{FovId, FragmentKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    name: String,
    root: PathBuf,
    fovs: Vec<FovId>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, mut fovs: Vec<FovId>) -> Self {
        fovs.sort_unstable();
        fovs.dedup();
        Self {
            name: name.into(),
            root: root.into(),
            fovs,
        }
    }

    /// Build from the `dataset` section; relative roots resolve against
    /// `base_dir` (the config file's directory).
    pub fn from_section(section: &DatasetSection, base_dir: &Path) -> Self {
        let root = match &section.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => base_dir.join(root),
            None => base_dir.to_path_buf(),
        };

        let fovs = match (&section.fovs, section.fov_count) {
            (Some(list), _) => list.clone(),
            (None, Some(count)) => (0..count).collect(),
            (None, None) => {
                warn!("dataset declares neither `fovs` nor `fov_count`; per-FOV stages have no work");
                Vec::new()
            }
        };

        let name = section.name.clone().unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dataset".to_string())
        });

        Self::new(name, root, fovs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fovs(&self) -> &[FovId] {
        &self.fovs
    }

    /// One fragment key per FOV.
    pub fn fov_fragments(&self) -> Vec<FragmentKey> {
        self.fovs.iter().copied().map(FragmentKey::Fov).collect()
    }
}
