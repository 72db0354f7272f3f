// src/stage/mod.rs

//! Opaque stage runners and the registry that selects them.
//!
//! The orchestrator never looks inside a stage. It only needs the
//! capability set in [`StageRunner`]: which fragments a stage has, how to
//! run one, and whether a fragment's output already exists.
//!
//! - [`registry`] maps stage-type identifiers to runner factories.
//! - [`command`] is the built-in runner that executes a shell command per
//!   fragment.

pub mod command;
pub mod registry;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::model::StageParameters;
use crate::dataset::Dataset;
use crate::fs::FileSystem;
use crate::types::FragmentKey;

pub use command::CommandStage;
pub use registry::{StageFactory, StageRegistry};

/// Future returned by [`StageRunner::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Immutable context shared by every stage of one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub dataset: Arc<Dataset>,
    /// Directory of the pipeline file; relative paths resolve against it.
    pub base_dir: PathBuf,
    pub fs: Arc<dyn FileSystem>,
}

/// Capability set every stage implementation provides.
pub trait StageRunner: Send + Sync {
    /// Fragments this stage splits into for the given dataset.
    fn fragment_keys(&self, dataset: &Dataset) -> Vec<FragmentKey>;

    /// Run one fragment. An `Err` is a fragment failure and may be retried.
    fn run<'a>(&'a self, fragment: FragmentKey, parameters: &'a StageParameters) -> RunFuture<'a>;

    /// Whether the fragment's output already exists (consulted on resume for
    /// fragments the status store does not know to be complete).
    fn is_already_complete(&self, _fragment: FragmentKey) -> bool {
        false
    }

    /// Rough memory requirement per fragment, in MiB.
    fn estimated_memory_mb(&self) -> Option<u64> {
        None
    }

    /// Rough wall time per fragment, in minutes.
    fn estimated_minutes(&self) -> Option<u64> {
        None
    }
}
