// src/exec/task_runner.rs

//! Runs one attempt of one fragment.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::ScheduledFragment;
use crate::engine::{FragmentOutcome, RuntimeEvent};
use crate::pipeline::BoundStage;

/// Run a single fragment attempt and emit the `FragmentCompleted` event.
///
/// The runner future runs in its own Tokio task, so a panicking runner is
/// reported as a failed attempt instead of taking the executor down.
pub async fn run_fragment(
    stage: &BoundStage,
    scheduled: ScheduledFragment,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
) {
    let ScheduledFragment {
        stage: stage_id,
        fragment,
        attempt,
    } = scheduled;

    info!(
        stage = %stage.name(),
        fragment = %fragment,
        attempt,
        "starting fragment"
    );
    let started = Instant::now();

    let runner = Arc::clone(&stage.runner);
    let parameters = Arc::clone(&stage.parameters);
    let handle = tokio::spawn(async move { runner.run(fragment, &parameters).await });

    let outcome = match handle.await {
        Ok(Ok(())) => FragmentOutcome::Success,
        Ok(Err(err)) => FragmentOutcome::Failed(format!("{err:#}")),
        Err(join_err) if join_err.is_panic() => {
            FragmentOutcome::Failed("stage runner panicked".to_string())
        }
        Err(join_err) => FragmentOutcome::Failed(format!("stage runner was cancelled: {join_err}")),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        FragmentOutcome::Success => info!(
            stage = %stage.name(),
            fragment = %fragment,
            attempt,
            elapsed_ms,
            "fragment finished"
        ),
        FragmentOutcome::Failed(error) => warn!(
            stage = %stage.name(),
            fragment = %fragment,
            attempt,
            elapsed_ms,
            error = %error,
            "fragment attempt failed"
        ),
    }

    let event = RuntimeEvent::FragmentCompleted {
        stage: stage_id,
        fragment,
        outcome,
    };
    if runtime_tx.send(event).await.is_err() {
        debug!(
            stage = %stage.name(),
            fragment = %fragment,
            "runtime already gone; dropping fragment completion"
        );
    }
}
