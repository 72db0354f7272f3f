// src/exec/executor_loop.rs

//! Main executor loop that runs scheduled fragments.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::ScheduledFragment;
use crate::engine::RuntimeEvent;
use crate::exec::task_runner::run_fragment;
use crate::pipeline::BoundStage;

/// Spawn the background executor loop.
///
/// The returned `mpsc::Sender<ScheduledFragment>` is what
/// `RealExecutorBackend` forwards dispatched fragments to. Each fragment is
/// executed in its own Tokio task; how many run at once is decided entirely
/// by the scheduler.
pub fn spawn_executor(
    stages: Arc<[BoundStage]>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> mpsc::Sender<ScheduledFragment> {
    let (tx, mut rx) = mpsc::channel::<ScheduledFragment>(64);

    tokio::spawn(async move {
        info!(stages = stages.len(), "executor loop started");

        while let Some(scheduled) = rx.recv().await {
            if stages.get(scheduled.stage.0).is_none() {
                warn!(stage = %scheduled.stage, "fragment for unknown stage; ignoring");
                continue;
            }

            let task_stages = Arc::clone(&stages);
            let rt_tx = runtime_tx.clone();
            tokio::spawn(async move {
                run_fragment(&task_stages[scheduled.stage.0], scheduled, &rt_tx).await;
            });
            debug!(
                stage = %stages[scheduled.stage.0].name(),
                fragment = %scheduled.fragment,
                "fragment task spawned"
            );
        }

        info!("executor loop finished (channel closed)");
    });

    tx
}
