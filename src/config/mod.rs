// src/config/mod.rs

//! Pipeline configuration for fovdag.
//!
//! Responsibilities:
//! - Define the serde-backed document model (`model.rs`).
//! - Load a JSON or TOML document from disk (`loader.rs`).
//! - Name stage instances and resolve stage references into edges
//!   (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_from_path, parse_str, ConfigFormat};
pub use model::{
    DatasetSection, DependencyEdge, EdgeKind, ExecutionSection, ParameterValue, PipelineConfig,
    RawPipelineDocument, RawPipelineFile, RawTaskDeclaration, StageInstance, StageName,
    StageParameters,
};
pub use validate::{accepts_reference, resolve_declarations};
