#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use fovdag::config::model::{RawPipelineFile, RawTaskDeclaration};
use fovdag::errors::Result;
use fovdag::fs::FileSystem;
use fovdag::fs::mock::MockFileSystem;
use fovdag::pipeline::Pipeline;
use fovdag::stage::StageRegistry;
use fovdag::types::StatusStorageMode;

/// Builder for `RawPipelineFile` to simplify test setup.
///
/// Starts from a three-FOV dataset rooted at `/data/run1`, in-memory status
/// storage and millisecond retry backoff.
pub struct PipelineBuilder {
    raw: RawPipelineFile,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        let mut raw = RawPipelineFile::default();
        raw.dataset.root = Some(PathBuf::from("/data/run1"));
        raw.dataset.fov_count = Some(3);
        raw.execution.status_storage = StatusStorageMode::Memory;
        raw.execution.retry_base_delay_ms = 5;
        raw.execution.retry_max_delay_ms = 20;
        Self { raw }
    }

    pub fn with_task(mut self, task: TaskBuilder) -> Self {
        self.raw.analysis_tasks.push(task.build());
        self
    }

    pub fn fov_count(mut self, n: u32) -> Self {
        self.raw.dataset.fov_count = Some(n);
        self.raw.dataset.fovs = None;
        self
    }

    pub fn dataset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.raw.dataset.root = Some(root.into());
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.raw.execution.max_workers = Some(n);
        self
    }

    pub fn max_per_stage(mut self, n: usize) -> Self {
        self.raw.execution.max_per_stage = Some(n);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.raw.execution.max_attempts = n;
        self
    }

    pub fn retry_delay_ms(mut self, base: u64, max: u64) -> Self {
        self.raw.execution.retry_base_delay_ms = base;
        self.raw.execution.retry_max_delay_ms = max;
        self
    }

    pub fn file_status(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw.execution.status_storage = StatusStorageMode::File;
        self.raw.execution.status_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> RawPipelineFile {
        self.raw
    }

    /// Prepare against an empty in-memory filesystem.
    pub fn prepare(self, registry: &StageRegistry) -> Result<Pipeline> {
        self.prepare_with_fs(registry, Arc::new(MockFileSystem::new()))
    }

    pub fn prepare_with_fs(self, registry: &StageRegistry, fs: Arc<dyn FileSystem>) -> Result<Pipeline> {
        Pipeline::prepare(self.raw, "/data", registry, fs)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one `analysis_tasks` entry.
pub struct TaskBuilder {
    decl: RawTaskDeclaration,
}

impl TaskBuilder {
    pub fn new(task: &str, module: Option<&str>) -> Self {
        Self {
            decl: RawTaskDeclaration {
                task: task.to_string(),
                module: module.map(str::to_string),
                analysis_name: None,
                parameters: BTreeMap::new(),
                run_after: vec![],
                max_parallel: None,
            },
        }
    }

    /// A stage bound to the `scripted` test runner.
    pub fn scripted(task: &str) -> Self {
        Self::new(task, Some(crate::runners::SCRIPTED_STAGE_TYPE))
    }

    /// A stage bound to the built-in command runner.
    pub fn command(task: &str, cmd: &str) -> Self {
        Self::new(task, Some("command")).param("cmd", cmd)
    }

    pub fn analysis_name(mut self, name: &str) -> Self {
        self.decl.analysis_name = Some(name.to_string());
        self
    }

    pub fn param(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.decl.parameters.insert(name.to_string(), value.into());
        self
    }

    /// Consume the output of `stage` through the parameter `<stage>_task`
    /// (lowercased).
    pub fn uses(self, stage: &str) -> Self {
        let name = format!("{}_task", stage.to_lowercase());
        self.param(&name, stage)
    }

    pub fn run_after(mut self, stage: &str) -> Self {
        self.decl.run_after.push(stage.to_string());
        self
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.decl.max_parallel = Some(n);
        self
    }

    pub fn build(self) -> RawTaskDeclaration {
        self.decl
    }
}
