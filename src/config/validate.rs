// src/config/validate.rs

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::config::model::{
    DependencyEdge, EdgeKind, ExecutionSection, ParameterValue, PipelineConfig, RawPipelineFile,
    StageInstance, StageParameters,
};
use crate::errors::{ConfigError, ConfigErrors};

/// Parameters with this suffix must name another stage instance.
pub const REFERENCE_PARAMETER_SUFFIX: &str = "_task";

impl TryFrom<RawPipelineFile> for PipelineConfig {
    type Error = ConfigErrors;

    fn try_from(raw: RawPipelineFile) -> std::result::Result<Self, Self::Error> {
        let (config, errors) = resolve_declarations(raw)?;
        ConfigErrors(errors).into_result()?;
        Ok(config)
    }
}

/// Name every declaration and resolve stage references into typed edges.
///
/// Returns `Err` only for an empty declaration list. Every other problem
/// (duplicate names, unresolved references, bad names or settings) is
/// returned next to a best-effort config so the caller can keep validating
/// and report all violations together. Unresolved references are left as
/// literals and produce no edge. When names are duplicated, references are
/// not resolved at all: the config has no edges and every parameter is a
/// literal.
pub fn resolve_declarations(
    raw: RawPipelineFile,
) -> std::result::Result<(PipelineConfig, Vec<ConfigError>), ConfigErrors> {
    ensure_has_declarations(&raw)?;

    let duplicates = check_unique_names(&raw);
    let resolve_references = duplicates.is_empty();
    let mut errors = duplicates;
    errors.extend(validate_execution(&raw.execution));

    let names: HashSet<&str> = raw
        .analysis_tasks
        .iter()
        .map(|d| d.instance_name())
        .collect();

    let mut stages = Vec::with_capacity(raw.analysis_tasks.len());
    let mut edges = Vec::new();

    for decl in raw.analysis_tasks.iter() {
        let name = decl.instance_name().to_string();
        if name.contains(['\t', '\n', '\r']) {
            errors.push(ConfigError::InvalidName {
                name: name.clone(),
                reason: "contains a tab or newline".to_string(),
            });
        }

        let mut values = BTreeMap::new();
        let mut run_after = Vec::new();

        if resolve_references {
            for (param, value) in decl.parameters.iter() {
                let resolved = match value {
                    serde_json::Value::String(target) if names.contains(target.as_str()) => {
                        edges.push(DependencyEdge {
                            from: target.clone(),
                            to: name.clone(),
                            kind: EdgeKind::Parameter(param.clone()),
                        });
                        ParameterValue::Reference(target.clone())
                    }
                    serde_json::Value::String(target) if accepts_reference(param) => {
                        errors.push(ConfigError::UnresolvedReference {
                            stage: name.clone(),
                            parameter: param.clone(),
                            target: target.clone(),
                        });
                        ParameterValue::Literal(value.clone())
                    }
                    other => ParameterValue::Literal(other.clone()),
                };
                values.insert(param.clone(), resolved);
            }

            for target in decl.run_after.iter() {
                if names.contains(target.as_str()) {
                    edges.push(DependencyEdge {
                        from: target.clone(),
                        to: name.clone(),
                        kind: EdgeKind::RunAfter,
                    });
                    run_after.push(target.clone());
                } else {
                    errors.push(ConfigError::UnresolvedReference {
                        stage: name.clone(),
                        parameter: "run_after".to_string(),
                        target: target.clone(),
                    });
                }
            }
        } else {
            values = decl
                .parameters
                .iter()
                .map(|(param, value)| (param.clone(), ParameterValue::Literal(value.clone())))
                .collect();
        }

        if decl.max_parallel == Some(0) {
            errors.push(ConfigError::InvalidSetting {
                setting: format!("{name}.max_parallel"),
                reason: "must be >= 1".to_string(),
            });
        }

        stages.push(StageInstance {
            name,
            stage_type: decl.task.clone(),
            module: decl.module.clone(),
            parameters: StageParameters::new(values),
            run_after,
            max_parallel: decl.max_parallel,
        });
    }

    debug!(
        stages = stages.len(),
        edges = edges.len(),
        resolved = resolve_references,
        "resolved stage declarations"
    );

    let config = PipelineConfig::new_unchecked(raw.execution, raw.dataset, stages, edges);
    Ok((config, errors))
}

/// Whether a parameter is declared to hold a stage reference.
pub fn accepts_reference(parameter: &str) -> bool {
    parameter.ends_with(REFERENCE_PARAMETER_SUFFIX)
}

fn ensure_has_declarations(raw: &RawPipelineFile) -> std::result::Result<(), ConfigErrors> {
    if raw.analysis_tasks.is_empty() {
        return Err(ConfigError::EmptyPipeline.into());
    }
    Ok(())
}

fn check_unique_names(raw: &RawPipelineFile) -> Vec<ConfigError> {
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut errors = Vec::new();

    for (idx, decl) in raw.analysis_tasks.iter().enumerate() {
        let name = decl.instance_name();
        match first_seen.get(name) {
            Some(&first) => errors.push(ConfigError::DuplicateName {
                name: name.to_string(),
                first,
                second: idx,
            }),
            None => {
                first_seen.insert(name, idx);
            }
        }
    }

    errors
}

fn validate_execution(execution: &ExecutionSection) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let mut at_least_one = |setting: &str, value: Option<usize>| {
        if value == Some(0) {
            errors.push(ConfigError::InvalidSetting {
                setting: format!("execution.{setting}"),
                reason: "must be >= 1 (got 0)".to_string(),
            });
        }
    };

    at_least_one("max_workers", execution.max_workers);
    at_least_one("max_per_stage", execution.max_per_stage);
    at_least_one("max_attempts", Some(execution.max_attempts as usize));

    if execution.retry_max_delay_ms < execution.retry_base_delay_ms {
        errors.push(ConfigError::InvalidSetting {
            setting: "execution.retry_max_delay_ms".to_string(),
            reason: format!(
                "must be >= retry_base_delay_ms ({} < {})",
                execution.retry_max_delay_ms, execution.retry_base_delay_ms
            ),
        });
    }

    errors
}
