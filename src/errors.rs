// src/errors.rs

//! Crate-wide error types.
//!
//! Configuration problems are collected into [`ConfigErrors`] so that a
//! single `validate` reports every violation at once instead of stopping at
//! the first one.

use std::fmt;

use thiserror::Error;

/// A single problem found while loading, resolving or binding a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pipeline declares no analysis tasks")]
    EmptyPipeline,

    #[error(
        "duplicate analysis name '{name}' (declarations #{first} and #{second}); set a distinct `analysis_name`"
    )]
    DuplicateName {
        name: String,
        first: usize,
        second: usize,
    },

    #[error("invalid stage name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("stage '{stage}' parameter '{parameter}' references unknown stage '{target}'")]
    UnresolvedReference {
        stage: String,
        parameter: String,
        target: String,
    },

    #[error("cyclic dependency between stages: {}", .stages.join(" -> "))]
    CyclicDependency { stages: Vec<String> },

    #[error("stage '{stage}' has unknown stage type '{stage_type}'")]
    UnknownStageType { stage: String, stage_type: String },

    #[error("stage '{stage}' has invalid parameters: {reason}")]
    InvalidParameters { stage: String, reason: String },

    #[error("invalid setting `{setting}`: {reason}")]
    InvalidSetting { setting: String, reason: String },
}

/// Every [`ConfigError`] found in one validation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(())` when no errors were collected.
    pub fn into_result(self) -> std::result::Result<(), ConfigErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            many => {
                write!(f, "{} configuration errors:", many.len())?;
                for err in many {
                    write!(f, "\n  - {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<ConfigError> for ConfigErrors {
    fn from(err: ConfigError) -> Self {
        ConfigErrors(vec![err])
    }
}

#[derive(Error, Debug)]
pub enum FovdagError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Status store error: {0}")]
    StatusStore(String),

    #[error("Stage not found: {0}")]
    UnknownStage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FovdagError {
    /// Wrap a failure reported by a status store implementation.
    pub fn status_store(err: anyhow::Error) -> Self {
        FovdagError::StatusStore(format!("{err:#}"))
    }
}

impl From<ConfigError> for FovdagError {
    fn from(err: ConfigError) -> Self {
        FovdagError::Config(err.into())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FovdagError>;
