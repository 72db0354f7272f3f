use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use fovdag::dag::{ScheduledFragment, StageId};
use fovdag::engine::{FragmentOutcome, RuntimeEvent};
use fovdag::exec::ExecutorBackend;
use fovdag::errors::Result;
use fovdag::types::FragmentKey;

/// A fake executor that:
/// - records which fragments were "run"
/// - immediately reports `FragmentCompleted` for each one, failing the
///   fragments it was told to fail.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    executed: Arc<Mutex<Vec<ScheduledFragment>>>,
    failing: HashSet<(StageId, FragmentKey)>,
}

impl FakeExecutor {
    pub fn new(
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        executed: Arc<Mutex<Vec<ScheduledFragment>>>,
    ) -> Self {
        Self {
            runtime_tx,
            executed,
            failing: HashSet::new(),
        }
    }

    /// Fail every attempt of `fragment`.
    pub fn failing(mut self, stage: StageId, fragment: FragmentKey) -> Self {
        self.failing.insert((stage, fragment));
        self
    }
}

impl ExecutorBackend for FakeExecutor {
    fn spawn_fragments(
        &mut self,
        fragments: Vec<ScheduledFragment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let executed = Arc::clone(&self.executed);
        let failing = self.failing.clone();

        Box::pin(async move {
            for f in fragments {
                executed.lock().unwrap().push(f);

                let outcome = if failing.contains(&(f.stage, f.fragment)) {
                    FragmentOutcome::Failed("fake failure".to_string())
                } else {
                    FragmentOutcome::Success
                };

                // The runtime keeps its own receiver alive, so send only
                // fails when the run is over.
                let _ = tx
                    .send(RuntimeEvent::FragmentCompleted {
                        stage: f.stage,
                        fragment: f.fragment,
                        outcome,
                    })
                    .await;
            }
            Ok(())
        })
    }
}
