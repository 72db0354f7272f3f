// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod dataset;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod pipeline;
pub mod stage;
pub mod status;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::dag::{Scheduler, SchedulerOptions};
use crate::engine::plan::reset_stages;
use crate::engine::{plan_stages, CoreRuntime, PipelineReport, Runtime, RuntimeEvent};
use crate::errors::{ConfigError, FovdagError, Result};
use crate::exec::{ExecutorBackend, RealExecutorBackend};
use crate::pipeline::Pipeline;
use crate::stage::StageRegistry;
use crate::status::StatusStore;
use crate::types::FragmentStatus;

/// High-level entry point used by `main.rs`, with the built-in runners.
///
/// Returns whether the command succeeded (exit status 0).
pub async fn run(args: CliArgs) -> Result<bool> {
    run_with_registry(args, &StageRegistry::with_builtins()).await
}

/// Like [`run`], with a caller-supplied stage registry.
pub async fn run_with_registry(args: CliArgs, registry: &StageRegistry) -> Result<bool> {
    let pipeline = Pipeline::from_path(&args.config, registry)?;

    match args.command {
        Command::Validate => {
            print_validation(&args.config, &pipeline);
            Ok(true)
        }
        Command::Plan => {
            let store = pipeline.open_status_store()?;
            print_plan(&pipeline, store.as_ref());
            Ok(true)
        }
        Command::Status => {
            let store = pipeline.open_status_store()?;
            print_status(&pipeline, store.as_ref());
            Ok(true)
        }
        Command::Reset {
            stage,
            with_dependents,
        } => {
            let mut store = pipeline.open_status_store()?;
            let names = reset_stages(&pipeline, store.as_mut(), &stage, with_dependents)?;
            for name in names {
                println!("reset {name}");
            }
            Ok(true)
        }
        Command::Run(run_args) => run_pipeline(&pipeline, &run_args, true).await,
        Command::Resume(run_args) => run_pipeline(&pipeline, &run_args, false).await,
    }
}

async fn run_pipeline(pipeline: &Pipeline, args: &RunArgs, fresh: bool) -> Result<bool> {
    let mut options = pipeline.scheduler_options();
    if let Some(n) = args.max_workers {
        if n == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "--max-workers".to_string(),
                reason: "must be >= 1".to_string(),
            }
            .into());
        }
        options = options.with_max_workers(n);
    }

    let mut store = pipeline.open_status_store()?;
    if fresh {
        store.clear().map_err(FovdagError::status_store)?;
        info!("cleared previous progress; running every stage");
    }

    let stages = Arc::clone(pipeline.stages());
    let report = execute_with_backend(pipeline, store.as_mut(), options, |tx| {
        spawn_ctrl_c_listener(tx.clone());
        RealExecutorBackend::new(stages, tx)
    })
    .await?;

    println!("{}", if report.is_success() { "pipeline complete" } else { "pipeline incomplete" });
    print!("{report}");
    Ok(report.is_success())
}

/// Plan against the status store and run the pipeline with the real
/// executor until every stage is complete, failed or skipped.
pub async fn execute(
    pipeline: &Pipeline,
    store: &mut dyn StatusStore,
    options: SchedulerOptions,
) -> Result<PipelineReport> {
    let stages = Arc::clone(pipeline.stages());
    execute_with_backend(pipeline, store, options, |tx| RealExecutorBackend::new(stages, tx)).await
}

/// [`execute`] with a caller-built executor backend. `make_backend` gets
/// the sender its completions must go to.
pub async fn execute_with_backend<E, F>(
    pipeline: &Pipeline,
    store: &mut dyn StatusStore,
    options: SchedulerOptions,
    make_backend: F,
) -> Result<PipelineReport>
where
    E: ExecutorBackend,
    F: FnOnce(mpsc::Sender<RuntimeEvent>) -> E,
{
    let plans = plan_stages(pipeline, store)?;
    let scheduler = Scheduler::new(Arc::clone(pipeline.graph()), plans, options);

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(256);
    let executor = make_backend(rt_tx.clone());

    let core = CoreRuntime::new(scheduler);
    Runtime::new(core, store, rt_tx, rt_rx, executor).run().await
}

/// Ctrl-C → graceful shutdown.
fn spawn_ctrl_c_listener(tx: mpsc::Sender<RuntimeEvent>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
    });
}

fn print_validation(path: &Path, pipeline: &Pipeline) {
    println!(
        "{}: ok ({} stages, {} dependencies, {} FOVs)",
        path.display(),
        pipeline.stages().len(),
        pipeline.config().edges().len(),
        pipeline.dataset().fovs().len()
    );
}

/// Stages in dependency order with fragment counts, estimates and progress.
fn print_plan(pipeline: &Pipeline, store: &dyn StatusStore) {
    let graph = pipeline.graph();
    println!(
        "fovdag plan: dataset {} ({} FOVs)",
        pipeline.dataset().name(),
        pipeline.dataset().fovs().len()
    );

    for &id in graph.topological_order() {
        let stage = pipeline.stage(id);
        let keys = stage.runner.fragment_keys(pipeline.dataset());
        let recorded = store.fragments_of(stage.name());
        let done = keys
            .iter()
            .filter(|k| recorded.get(*k) == Some(&FragmentStatus::Complete))
            .count();

        println!("  - {}", stage.name());
        println!("      type: {}", stage.instance.stage_type);
        let deps = graph.dependency_names(stage.name());
        if !deps.is_empty() {
            println!("      after: {}", deps.join(", "));
        }
        println!("      fragments: {} ({} complete)", keys.len(), done);
        if let Some(limit) = stage.instance.max_parallel {
            println!("      max_parallel: {limit}");
        }
        if let Some(mb) = stage.runner.estimated_memory_mb() {
            println!("      est. memory: {mb} MiB per fragment");
        }
        if let Some(minutes) = stage.runner.estimated_minutes() {
            println!("      est. time: {minutes} min per fragment");
        }
    }

    debug!("plan complete (no execution)");
}

fn print_status(pipeline: &Pipeline, store: &dyn StatusStore) {
    let width = pipeline
        .stages()
        .iter()
        .map(|s| s.name().len())
        .max()
        .unwrap_or(0);

    for stage in pipeline.stages().iter() {
        let keys = stage.runner.fragment_keys(pipeline.dataset());
        let recorded = store.fragments_of(stage.name());
        let count = |status: FragmentStatus| {
            keys.iter()
                .filter(|k| recorded.get(*k) == Some(&status))
                .count()
        };

        let label = if store.is_stage_complete(stage.name(), &keys) {
            "complete"
        } else if count(FragmentStatus::Failed) > 0 {
            "failed"
        } else if recorded.is_empty() {
            "not started"
        } else {
            "partial"
        };

        println!(
            "  {:<width$}  {:<11}  {}/{} complete, {} failed",
            stage.name(),
            label,
            count(FragmentStatus::Complete),
            keys.len(),
            count(FragmentStatus::Failed)
        );
    }
}
