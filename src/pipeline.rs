// src/pipeline.rs

//! A fully validated pipeline: resolved config, dependency graph and one
//! bound runner per stage.
//!
//! [`Pipeline::prepare`] is the only place every configuration problem is
//! collected: reference resolution, cycles and runner binding are all
//! reported together, and nothing is executed when any of them fails.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::loader::load_from_path;
use crate::config::model::{PipelineConfig, RawPipelineFile, StageInstance, StageParameters};
use crate::config::validate::resolve_declarations;
use crate::dag::{DagGraph, SchedulerOptions, StageId};
use crate::dataset::Dataset;
use crate::errors::{ConfigError, ConfigErrors, FovdagError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::stage::{PipelineContext, StageRegistry, StageRunner};
use crate::status::{FileStatusStore, MemoryStatusStore, StatusStore, STATUS_DIR};
use crate::types::StatusStorageMode;

/// One stage instance with its runner.
pub struct BoundStage {
    pub id: StageId,
    pub instance: StageInstance,
    pub runner: Arc<dyn StageRunner>,
    /// Shared with every fragment task of the stage.
    pub parameters: Arc<StageParameters>,
}

impl BoundStage {
    pub fn name(&self) -> &str {
        &self.instance.name
    }
}

impl fmt::Debug for BoundStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundStage")
            .field("id", &self.id)
            .field("name", &self.instance.name)
            .field("stage_type", &self.instance.stage_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    graph: Arc<DagGraph>,
    /// Indexed by [`StageId`].
    stages: Arc<[BoundStage]>,
    context: PipelineContext,
}

impl Pipeline {
    /// Resolve, graph and bind a raw document.
    ///
    /// `base_dir` is the directory relative paths in the document resolve
    /// against (normally the config file's directory).
    pub fn prepare(
        raw: RawPipelineFile,
        base_dir: impl Into<PathBuf>,
        registry: &StageRegistry,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        let (config, mut errors) = resolve_declarations(raw)?;

        // Without unique names there is nothing meaningful to graph.
        let has_duplicates = errors
            .iter()
            .any(|e| matches!(e, ConfigError::DuplicateName { .. }));
        let graph = if has_duplicates {
            None
        } else {
            DagGraph::build(&config)
                .map_err(|cycles| errors.extend(cycles.0))
                .ok()
        };

        let dataset = Arc::new(Dataset::from_section(&config.dataset, &base_dir));
        let context = PipelineContext {
            dataset,
            base_dir,
            fs,
        };

        let (runners, bind_errors) = registry.bind_all(&config, &context);
        errors.extend(bind_errors);

        let runners: Option<Vec<Arc<dyn StageRunner>>> = runners.into_iter().collect();
        let (graph, runners) = match (graph, runners) {
            (Some(graph), Some(runners)) if errors.is_empty() => (graph, runners),
            _ => return Err(ConfigErrors(errors).into()),
        };

        let stages: Arc<[BoundStage]> = config
            .stages()
            .iter()
            .zip(runners)
            .enumerate()
            .map(|(i, (instance, runner))| BoundStage {
                id: StageId(i),
                instance: instance.clone(),
                runner,
                parameters: Arc::new(instance.parameters.clone()),
            })
            .collect();

        info!(
            stages = stages.len(),
            edges = config.edges().len(),
            fovs = context.dataset.fovs().len(),
            dataset = %context.dataset.name(),
            "pipeline prepared"
        );

        Ok(Self {
            config,
            graph: Arc::new(graph),
            stages,
            context,
        })
    }

    /// Load a pipeline file from disk and prepare it.
    pub fn from_path(path: impl AsRef<Path>, registry: &StageRegistry) -> Result<Self> {
        let path = path.as_ref();
        let raw = load_from_path(path)?;
        debug!(path = ?path, "loaded pipeline document");
        Self::prepare(raw, config_base_dir(path), registry, Arc::new(RealFileSystem))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<DagGraph> {
        &self.graph
    }

    pub fn stages(&self) -> &Arc<[BoundStage]> {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> &BoundStage {
        &self.stages[id.0]
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&BoundStage> {
        let id = self.graph.id_of(name)?;
        Some(self.stage(id))
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn dataset(&self) -> &Dataset {
        &self.context.dataset
    }

    pub fn base_dir(&self) -> &Path {
        &self.context.base_dir
    }

    /// Scheduler limits from the `execution` section.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions::from_execution(&self.config.execution)
    }

    /// Directory of the status journal: `execution.status_dir` relative to
    /// the config file, else `.fovdag` under the dataset root.
    pub fn status_dir(&self) -> PathBuf {
        match &self.config.execution.status_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.context.base_dir.join(dir),
            None => self.context.dataset.root().join(STATUS_DIR),
        }
    }

    /// Open the status store selected by `execution.status_storage`.
    pub fn open_status_store(&self) -> Result<Box<dyn StatusStore>> {
        match self.config.execution.status_storage {
            StatusStorageMode::Memory => Ok(Box::new(MemoryStatusStore::default())),
            StatusStorageMode::File => {
                let store = FileStatusStore::open(Arc::clone(&self.context.fs), self.status_dir())
                    .map_err(FovdagError::status_store)?;
                Ok(Box::new(store))
            }
        }
    }
}

/// Directory relative paths in a pipeline file resolve against.
///
/// A bare file name (parent = "") falls back to the current directory.
pub fn config_base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::model::RawTaskDeclaration;
    use crate::fs::mock::MockFileSystem;

    fn decl(task: &str, params: serde_json::Value) -> RawTaskDeclaration {
        serde_json::from_value(json!({ "task": task, "module": "command", "parameters": params }))
            .unwrap()
    }

    fn prepare(decls: Vec<RawTaskDeclaration>) -> Result<Pipeline> {
        let raw = RawPipelineFile {
            analysis_tasks: decls,
            ..RawPipelineFile::default()
        };
        Pipeline::prepare(
            raw,
            "/data",
            &StageRegistry::with_builtins(),
            Arc::new(MockFileSystem::new()),
        )
    }

    #[test]
    fn binds_one_runner_per_stage() -> Result<()> {
        let pipeline = prepare(vec![
            decl("Preprocess", json!({ "cmd": "true" })),
            decl("Decode", json!({ "cmd": "true", "preprocess_task": "Preprocess" })),
        ])?;

        assert_eq!(pipeline.stages().len(), 2);
        let decode = pipeline.stage_by_name("Decode").unwrap();
        assert_eq!(pipeline.graph().dependency_names(decode.name()), vec!["Preprocess"]);
        assert_eq!(pipeline.status_dir(), PathBuf::from("/data/.fovdag"));
        Ok(())
    }

    #[test]
    fn reports_resolution_cycle_and_binding_errors_together() {
        let err = prepare(vec![
            decl("A", json!({ "cmd": "true", "b_task": "B" })),
            decl("B", json!({ "cmd": "true", "a_task": "A" })),
            decl("C", json!({ "cmd": "true", "warp_task": "Missing" })),
            decl("D", json!({})),
        ])
        .unwrap_err();

        let errors = match err {
            FovdagError::Config(errors) => errors,
            other => panic!("expected configuration errors, got {other:?}"),
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| matches!(e, ConfigError::UnresolvedReference { .. })));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::CyclicDependency { .. })));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::InvalidParameters { stage, .. } if stage == "D")));
    }

    #[test]
    fn duplicate_names_still_bind_every_runner() {
        let err = prepare(vec![
            decl("Decode", json!({ "cmd": "true" })),
            decl("Decode", json!({ "cmd": "true" })),
            decl("Export", json!({})),
        ])
        .unwrap_err();

        let errors = match err {
            FovdagError::Config(errors) => errors,
            other => panic!("expected configuration errors, got {other:?}"),
        };
        assert_eq!(errors.len(), 2, "errors: {errors}");
        assert!(errors.iter().any(|e| matches!(e, ConfigError::DuplicateName { .. })));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::InvalidParameters { stage, .. } if stage == "Export")));
    }

    #[test]
    fn unknown_stage_type_is_a_config_error() {
        let raw: RawTaskDeclaration =
            serde_json::from_value(json!({ "task": "SegmentCells", "module": "cellpose" })).unwrap();
        let err = prepare(vec![raw]).unwrap_err();
        assert!(err.to_string().contains("unknown stage type 'cellpose.SegmentCells'"));
    }
}
