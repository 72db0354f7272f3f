// src/engine/plan.rs

//! Resume planning: decide, per stage, which fragments still have to run.
//!
//! For every stage the planner
//! 1. asks the runner for the stage's fragment keys,
//! 2. compares the stored parameter fingerprint with the current one and
//!    resets the stage plus everything downstream when they differ,
//! 3. takes the fragments the status store does not know to be complete and
//!    asks the runner whether their output already exists. Outputs of a
//!    stage that was reset (explicitly or by a parameter change) are stale
//!    and never asked about.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::config::model::StageParameters;
use crate::dag::{StageId, StagePlan};
use crate::errors::{FovdagError, Result};
use crate::pipeline::Pipeline;
use crate::status::StatusStore;
use crate::types::FragmentStatus;

/// blake3 hash (hex) of a stage's canonical parameters.
///
/// Parameters serialize as a JSON object with sorted keys, so the
/// fingerprint does not depend on declaration order.
pub fn parameter_fingerprint(parameters: &StageParameters) -> String {
    let canonical = parameters.to_json().to_string();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// Build one [`StagePlan`] per stage, indexed by [`StageId`], updating the
/// status store along the way (fingerprints, resets, fragments whose output
/// already exists).
pub fn plan_stages(pipeline: &Pipeline, store: &mut dyn StatusStore) -> Result<Vec<StagePlan>> {
    let graph = pipeline.graph();

    let fingerprints: Vec<String> = pipeline
        .stages()
        .iter()
        .map(|stage| parameter_fingerprint(&stage.parameters))
        .collect();

    let mut stale: BTreeSet<StageId> = BTreeSet::new();
    for stage in pipeline.stages().iter() {
        let current = &fingerprints[stage.id.0];
        match store.fingerprint(stage.name()) {
            Some(stored) if &stored != current => {
                warn!(
                    stage = %stage.name(),
                    "parameters changed since the last run; recomputing the stage and its dependents"
                );
                stale.insert(stage.id);
                stale.extend(graph.transitive_dependents(stage.id));
            }
            _ => {}
        }
    }

    for id in &stale {
        store
            .reset_stage(graph.name_of(*id))
            .map_err(FovdagError::status_store)?;
    }

    let mut plans = Vec::with_capacity(pipeline.stages().len());
    let mut total = 0usize;
    let mut already = 0usize;

    for stage in pipeline.stages().iter() {
        let name = stage.name();
        store
            .set_fingerprint(name, &fingerprints[stage.id.0])
            .map_err(FovdagError::status_store)?;

        let keys = stage.runner.fragment_keys(pipeline.dataset());
        let mut complete: BTreeSet<_> = keys.iter().copied().collect();
        let trust_outputs = !store.is_invalidated(name);
        if !trust_outputs {
            debug!(stage = %name, "stage was reset; ignoring outputs already on disk");
        }

        for key in store.pending_fragments(name, &keys) {
            if trust_outputs && stage.runner.is_already_complete(key) {
                debug!(stage = %name, fragment = %key, "output already present; marking complete");
                store
                    .record_status(name, key, FragmentStatus::Complete)
                    .map_err(FovdagError::status_store)?;
            } else {
                complete.remove(&key);
            }
        }

        debug!(
            stage = %name,
            fragments = keys.len(),
            complete = complete.len(),
            "planned stage"
        );
        total += keys.len();
        already += complete.len();

        plans.push(
            StagePlan::new(keys)
                .with_complete(complete)
                .with_max_parallel(stage.instance.max_parallel),
        );
    }

    info!(
        fragments = total,
        already_complete = already,
        reset_stages = stale.len(),
        "resume plan ready"
    );
    Ok(plans)
}

/// Forget the recorded fragments of `stage`, and of everything downstream
/// when `with_dependents` is set. Returns the names that were reset.
pub fn reset_stages(
    pipeline: &Pipeline,
    store: &mut dyn StatusStore,
    stage: &str,
    with_dependents: bool,
) -> Result<Vec<String>> {
    let graph = pipeline.graph();
    let id = graph
        .id_of(stage)
        .ok_or_else(|| FovdagError::UnknownStage(stage.to_string()))?;

    let mut ids = vec![id];
    if with_dependents {
        ids.extend(graph.transitive_dependents(id));
    }

    let mut names = Vec::with_capacity(ids.len());
    for id in ids {
        let name = graph.name_of(id);
        store.reset_stage(name).map_err(FovdagError::status_store)?;
        names.push(name.to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::model::{ParameterValue, RawPipelineFile};
    use crate::fs::mock::MockFileSystem;
    use crate::stage::StageRegistry;
    use crate::status::MemoryStatusStore;
    use crate::types::FragmentKey;

    fn pipeline(fs: &MockFileSystem, sigma: u32) -> Pipeline {
        let raw: RawPipelineFile = serde_json::from_value(json!({
            "dataset": { "root": "/data/run1", "fov_count": 3 },
            "analysis_tasks": [
                { "task": "Preprocess", "module": "command",
                  "parameters": { "cmd": "pre {fov}", "sigma": sigma,
                                  "output": "pre/{fov}.tif" } },
                { "task": "Decode", "module": "command",
                  "parameters": { "cmd": "dec {fov}", "preprocess_task": "Preprocess" } }
            ]
        }))
        .unwrap();
        Pipeline::prepare(raw, "/data", &StageRegistry::with_builtins(), Arc::new(fs.clone()))
            .unwrap()
    }

    fn complete_count(plan: &StagePlan) -> usize {
        plan.complete.len()
    }

    #[test]
    fn fingerprint_follows_parameter_values() {
        let params = |sigma: u32| {
            let values: BTreeMap<_, _> = [
                ("sigma".to_string(), ParameterValue::Literal(json!(sigma))),
                ("preprocess_task".to_string(), ParameterValue::Reference("Preprocess".into())),
            ]
            .into_iter()
            .collect();
            StageParameters::new(values)
        };

        assert_eq!(parameter_fingerprint(&params(3)), parameter_fingerprint(&params(3)));
        assert_ne!(parameter_fingerprint(&params(3)), parameter_fingerprint(&params(4)));
        assert_eq!(parameter_fingerprint(&params(3)).len(), 64);
    }

    #[test]
    fn completed_fragments_are_not_planned_again() -> Result<()> {
        let fs = MockFileSystem::new();
        let p = pipeline(&fs, 3);
        let mut store = MemoryStatusStore::default();
        store
            .record_status("Preprocess", FragmentKey::Fov(0), FragmentStatus::Complete)
            .unwrap();

        // Fov 2 has no status record, but its output exists.
        fs.add_file("/data/run1/pre/2.tif", "");

        let plans = plan_stages(&p, &mut store)?;
        assert_eq!(complete_count(&plans[0]), 2);
        assert_eq!(complete_count(&plans[1]), 0);
        assert_eq!(
            store.status_of("Preprocess", FragmentKey::Fov(2)),
            Some(FragmentStatus::Complete)
        );
        Ok(())
    }

    #[test]
    fn changed_parameters_reset_the_stage_and_its_dependents() -> Result<()> {
        let fs = MockFileSystem::new();
        let mut store = MemoryStatusStore::default();

        let first = pipeline(&fs, 3);
        plan_stages(&first, &mut store)?;
        for stage in ["Preprocess", "Decode"] {
            for fov in 0..3 {
                store
                    .record_status(stage, FragmentKey::Fov(fov), FragmentStatus::Complete)
                    .unwrap();
            }
        }

        let same = plan_stages(&first, &mut store)?;
        assert!(same.iter().all(|p| complete_count(p) == 3));

        let changed = pipeline(&fs, 5);
        let plans = plan_stages(&changed, &mut store)?;
        assert!(plans.iter().all(|p| complete_count(p) == 0));
        assert!(store.fragments_of("Decode").is_empty());
        Ok(())
    }

    fn write_outputs(fs: &MockFileSystem) {
        for fov in 0..3 {
            fs.add_file(format!("/data/run1/pre/{fov}.tif"), "");
        }
    }

    #[test]
    fn changed_parameters_ignore_stale_outputs() -> Result<()> {
        let fs = MockFileSystem::new();
        let mut store = MemoryStatusStore::default();

        plan_stages(&pipeline(&fs, 3), &mut store)?;
        write_outputs(&fs);
        for stage in ["Preprocess", "Decode"] {
            for fov in 0..3 {
                store
                    .record_status(stage, FragmentKey::Fov(fov), FragmentStatus::Complete)
                    .unwrap();
            }
        }

        let plans = plan_stages(&pipeline(&fs, 5), &mut store)?;
        let pending: Vec<usize> = plans.iter().map(|p| p.pending().count()).collect();
        assert_eq!(pending, vec![3, 3]);
        assert_eq!(store.status_of("Preprocess", FragmentKey::Fov(0)), None);

        // Still stale on the next plan, until the fragments are recorded again.
        let plans = plan_stages(&pipeline(&fs, 5), &mut store)?;
        assert_eq!(plans[0].pending().count(), 3);
        Ok(())
    }

    #[test]
    fn reset_stage_does_not_trust_existing_outputs() -> Result<()> {
        let fs = MockFileSystem::new();
        let p = pipeline(&fs, 3);
        let mut store = MemoryStatusStore::default();
        write_outputs(&fs);

        let plans = plan_stages(&p, &mut store)?;
        assert_eq!(plans[0].pending().count(), 0);

        reset_stages(&p, &mut store, "Preprocess", false)?;
        let plans = plan_stages(&p, &mut store)?;
        assert_eq!(plans[0].pending().count(), 3);
        Ok(())
    }

    #[test]
    fn reset_with_dependents_walks_downstream() -> Result<()> {
        let fs = MockFileSystem::new();
        let p = pipeline(&fs, 3);
        let mut store = MemoryStatusStore::default();

        let names = reset_stages(&p, &mut store, "Preprocess", true)?;
        assert_eq!(names, vec!["Preprocess", "Decode"]);

        assert!(matches!(
            reset_stages(&p, &mut store, "Nope", false),
            Err(FovdagError::UnknownStage(_))
        ));
        Ok(())
    }
}
