use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::StatusStorageMode;

/// A pipeline document exactly as read from disk.
///
/// Two shapes are accepted. A bare list of stage declarations:
///
/// ```json
/// [
///   { "task": "Preprocess", "module": "command",
///     "parameters": { "cmd": "preprocess --fov {fov}" } },
///   { "task": "Decode", "module": "command",
///     "parameters": { "preprocess_task": "Preprocess", "cmd": "decode {fov}" } }
/// ]
/// ```
///
/// or a full document with optional `execution` and `dataset` sections and
/// the declarations under `analysis_tasks`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPipelineDocument {
    // Must come first: a struct also deserializes from a sequence.
    Declarations(Vec<RawTaskDeclaration>),
    Full(RawPipelineFile),
}

impl From<RawPipelineDocument> for RawPipelineFile {
    fn from(doc: RawPipelineDocument) -> Self {
        match doc {
            RawPipelineDocument::Full(file) => file,
            RawPipelineDocument::Declarations(analysis_tasks) => RawPipelineFile {
                analysis_tasks,
                ..RawPipelineFile::default()
            },
        }
    }
}

/// Unvalidated top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPipelineFile {
    /// Scheduling behaviour from `execution`.
    #[serde(default)]
    pub execution: ExecutionSection,

    /// The dataset the pipeline runs over.
    #[serde(default)]
    pub dataset: DatasetSection,

    /// Ordered stage declarations.
    #[serde(default)]
    pub analysis_tasks: Vec<RawTaskDeclaration>,
}

/// One entry of `analysis_tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTaskDeclaration {
    /// Stage type; also the instance name unless `analysis_name` is set.
    pub task: String,

    /// Implementation selector consulted by the stage registry.
    #[serde(default)]
    pub module: Option<String>,

    /// Instance name override, needed when one stage type appears twice.
    #[serde(default)]
    pub analysis_name: Option<String>,

    /// Literal values, or names of other stage instances.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    /// Stages this one must start after, without consuming their output.
    #[serde(default)]
    pub run_after: Vec<String>,

    /// Per-stage cap on concurrently running fragments.
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl RawTaskDeclaration {
    /// Effective instance name.
    pub fn instance_name(&self) -> &str {
        self.analysis_name.as_deref().unwrap_or(&self.task)
    }
}

/// `execution` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    /// Global cap on concurrently running fragments.
    ///
    /// Defaults to the machine's available parallelism.
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Cap on concurrently running fragments of any single stage.
    #[serde(default)]
    pub max_per_stage: Option<usize>,

    /// Attempts per fragment, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry; doubled for every later one.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for the backoff delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default)]
    pub status_storage: StatusStorageMode,

    /// Directory holding the status journal, relative to the config file.
    #[serde(default)]
    pub status_dir: Option<PathBuf>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_workers: None,
            max_per_stage: None,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            status_storage: StatusStorageMode::default(),
            status_dir: None,
        }
    }
}

impl ExecutionSection {
    /// `max_workers`, falling back to the available parallelism.
    pub fn effective_max_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// `dataset` section.
///
/// `fovs` lists the field of view ids explicitly; otherwise `fov_count`
/// yields ids `0..fov_count`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatasetSection {
    #[serde(default)]
    pub name: Option<String>,

    /// Dataset root; relative paths resolve against the config directory.
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub fovs: Option<Vec<u32>>,

    #[serde(default)]
    pub fov_count: Option<u32>,
}

/// Canonical stage instance name used throughout the crate.
pub type StageName = String;

/// A parameter value after reference resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Literal(serde_json::Value),
    /// The value named another declared stage instance.
    Reference(StageName),
}

impl ParameterValue {
    /// JSON rendering; references render as the referenced stage name.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParameterValue::Literal(v) => v.clone(),
            ParameterValue::Reference(name) => serde_json::Value::String(name.clone()),
        }
    }
}

/// Resolved parameters of one stage instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageParameters {
    values: BTreeMap<String, ParameterValue>,
}

impl StageParameters {
    pub fn new(values: BTreeMap<String, ParameterValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// String literal, or the referenced stage name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParameterValue::Literal(serde_json::Value::String(s)) => Some(s),
            ParameterValue::Reference(stage) => Some(stage),
            ParameterValue::Literal(_) => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            ParameterValue::Literal(v) => v.as_bool(),
            ParameterValue::Reference(_) => None,
        }
    }

    /// The stage referenced by `name`, if that parameter is a reference.
    pub fn reference(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParameterValue::Reference(stage) => Some(stage),
            ParameterValue::Literal(_) => None,
        }
    }

    /// Canonical JSON object (keys sorted) used for fingerprinting.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// One declared stage after naming and reference resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInstance {
    pub name: StageName,
    pub stage_type: String,
    pub module: Option<String>,
    pub parameters: StageParameters,
    pub run_after: Vec<StageName>,
    pub max_parallel: Option<usize>,
}

/// Why an edge exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    /// Derived from the named reference-valued parameter.
    Parameter(String),
    /// Derived from a `run_after` entry.
    RunAfter,
}

/// `from` must be complete before `to` may start.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyEdge {
    pub from: StageName,
    pub to: StageName,
    pub kind: EdgeKind,
}

/// Validated pipeline: instances in declaration order plus resolved edges.
///
/// Immutable after construction; build it with `PipelineConfig::try_from`
/// on a [`RawPipelineFile`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub execution: ExecutionSection,
    pub dataset: DatasetSection,
    stages: Vec<StageInstance>,
    edges: Vec<DependencyEdge>,
}

impl PipelineConfig {
    pub(crate) fn new_unchecked(
        execution: ExecutionSection,
        dataset: DatasetSection,
        stages: Vec<StageInstance>,
        edges: Vec<DependencyEdge>,
    ) -> Self {
        Self {
            execution,
            dataset,
            stages,
            edges,
        }
    }

    pub fn stages(&self) -> &[StageInstance] {
        &self.stages
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn stage(&self, name: &str) -> Option<&StageInstance> {
        self.stages.iter().find(|s| s.name == name)
    }
}
