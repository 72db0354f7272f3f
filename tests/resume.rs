// tests/resume.rs

mod common;
use crate::common::{
    init_tracing, merfish_pipeline, with_timeout, PipelineBuilder, Script, ScriptedStages,
    TaskBuilder,
};

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use fovdag::cli::{CliArgs, Command, RunArgs};
use fovdag::dag::StageState;
use fovdag::execute;
use fovdag::fs::RealFileSystem;
use fovdag::pipeline::Pipeline;
use fovdag::status::StatusStore;
use fovdag::types::{FragmentKey, FragmentStatus};
use fovdag::run_with_registry;
use tempfile::tempdir;

type TestResult = Result<(), Box<dyn Error>>;

fn prepare(
    builder: PipelineBuilder,
    stages: &ScriptedStages,
    status_dir: &Path,
) -> fovdag::errors::Result<Pipeline> {
    builder
        .max_workers(16)
        .max_attempts(1)
        .file_status(status_dir)
        .prepare_with_fs(&stages.registry(), Arc::new(RealFileSystem))
}

async fn run_once(pipeline: &Pipeline) -> Result<fovdag::engine::PipelineReport, Box<dyn Error>> {
    let mut store = pipeline.open_status_store()?;
    let report = with_timeout(execute(pipeline, store.as_mut(), pipeline.scheduler_options())).await?;
    Ok(report)
}

#[tokio::test]
async fn resume_dispatches_only_what_did_not_complete() -> TestResult {
    init_tracing();
    let dir = tempdir()?;

    let first = ScriptedStages::new().script("Decode", Script::new().broken(FragmentKey::Fov(1)));
    let report = run_once(&prepare(merfish_pipeline(), &first, dir.path())?).await?;
    assert_eq!(report.state_of("Decode"), Some(StageState::Failed));
    assert_eq!(report.state_of("AdaptiveThreshold"), Some(StageState::Complete));

    // Fresh process, same journal, Decode fixed.
    let second = ScriptedStages::new();
    let trace = second.trace();
    let report = run_once(&prepare(merfish_pipeline(), &second, dir.path())?).await?;

    assert!(report.is_success(), "report:\n{report}");
    assert_eq!(report.dispatched, 1);
    assert_eq!(trace.started("Decode"), vec![FragmentKey::Fov(1)]);
    for stage in ["Preprocess", "Optimize", "AdaptiveThreshold"] {
        assert_eq!(trace.start_count(stage), 0, "{stage} ran again");
    }
    Ok(())
}

#[tokio::test]
async fn changed_parameters_recompute_the_stage() -> TestResult {
    init_tracing();
    let dir = tempdir()?;

    let with_threshold = |threshold: u32| {
        PipelineBuilder::new()
            .with_task(TaskBuilder::scripted("Preprocess"))
            .with_task(
                TaskBuilder::scripted("Decode")
                    .uses("Preprocess")
                    .param("distance_threshold", threshold),
            )
    };

    let stages = ScriptedStages::new();
    let report = run_once(&prepare(with_threshold(3), &stages, dir.path())?).await?;
    assert!(report.is_success());

    let stages = ScriptedStages::new();
    let trace = stages.trace();
    let report = run_once(&prepare(with_threshold(5), &stages, dir.path())?).await?;

    assert!(report.is_success());
    assert_eq!(trace.start_count("Preprocess"), 0);
    assert_eq!(trace.start_count("Decode"), 3);
    Ok(())
}

#[tokio::test]
async fn existing_outputs_are_not_recomputed() -> TestResult {
    init_tracing();
    let dir = tempdir()?;

    let stages = ScriptedStages::new().script(
        "Preprocess",
        Script::new().already_complete(FragmentKey::Fov(0)),
    );
    let trace = stages.trace();
    let pipeline = prepare(merfish_pipeline(), &stages, dir.path())?;
    let report = run_once(&pipeline).await?;

    assert!(report.is_success());
    let mut started = trace.started("Preprocess");
    started.sort();
    assert_eq!(started, vec![FragmentKey::Fov(1), FragmentKey::Fov(2)]);

    let store = pipeline.open_status_store()?;
    assert_eq!(
        store.status_of("Preprocess", FragmentKey::Fov(0)),
        Some(FragmentStatus::Complete)
    );
    Ok(())
}

fn write_config(dir: &Path) -> Result<std::path::PathBuf, Box<dyn Error>> {
    fs::create_dir_all(dir.join("data"))?;
    let config = serde_json::json!({
        "execution": {
            "max_workers": 4,
            "max_attempts": 1,
            "retry_base_delay_ms": 1
        },
        "dataset": { "root": "data", "fov_count": 2 },
        "analysis_tasks": [
            { "task": "Preprocess", "module": "scripted" },
            { "task": "Decode", "module": "scripted",
              "parameters": { "preprocess_task": "Preprocess" } }
        ]
    });
    let path = dir.join("pipeline.json");
    fs::write(&path, serde_json::to_string_pretty(&config)?)?;
    Ok(path)
}

fn args(config: &Path, command: Command) -> CliArgs {
    CliArgs {
        config: config.to_path_buf(),
        log_level: None,
        command,
    }
}

#[tokio::test]
async fn cli_run_starts_over_while_resume_continues() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let config = write_config(dir.path())?;
    let run = || Command::Run(RunArgs { max_workers: None });
    let resume = || Command::Resume(RunArgs { max_workers: Some(2) });

    let stages = ScriptedStages::new();
    let trace = stages.trace();
    let registry = stages.registry();

    assert!(with_timeout(run_with_registry(args(&config, run()), &registry)).await?);
    assert!(dir.path().join("data/.fovdag/status").exists());
    assert_eq!(trace.start_count("Preprocess"), 2);

    // Nothing left to do.
    assert!(with_timeout(run_with_registry(args(&config, resume()), &registry)).await?);
    assert_eq!(trace.start_count("Preprocess"), 2);
    assert_eq!(trace.start_count("Decode"), 2);

    // `run` ignores recorded progress.
    assert!(with_timeout(run_with_registry(args(&config, run()), &registry)).await?);
    assert_eq!(trace.start_count("Preprocess"), 4);
    assert_eq!(trace.start_count("Decode"), 4);

    // `reset` forgets Decode only.
    let reset = Command::Reset {
        stage: "Decode".to_string(),
        with_dependents: false,
    };
    assert!(run_with_registry(args(&config, reset), &registry).await?);
    assert!(with_timeout(run_with_registry(args(&config, resume()), &registry)).await?);
    assert_eq!(trace.start_count("Preprocess"), 4);
    assert_eq!(trace.start_count("Decode"), 6);

    assert!(run_with_registry(args(&config, Command::Status), &registry).await?);
    assert!(run_with_registry(args(&config, Command::Plan), &registry).await?);
    Ok(())
}

#[tokio::test]
async fn zero_max_workers_is_rejected() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let config = write_config(dir.path())?;
    let registry = ScriptedStages::new().registry();

    let err = run_with_registry(
        args(&config, Command::Run(RunArgs { max_workers: Some(0) })),
        &registry,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("--max-workers"));
    Ok(())
}
