// src/engine/runtime.rs

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dag::{ScheduledFragment, ScheduledRetry, StatusUpdate};
use crate::errors::{FovdagError, Result};
use crate::exec::ExecutorBackend;
use crate::status::StatusStore;

use super::core::CoreRuntime;
use super::report::PipelineReport;
use super::{CoreCommand, CoreStep, RuntimeEvent};

/// Drives the scheduler in response to `RuntimeEvent`s, persists status
/// changes, and delegates fragment execution to an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. It is the only writer of the status store, so status
/// writes are applied in the order the core decided them.
pub struct Runtime<'s, E: ExecutorBackend> {
    core: CoreRuntime,
    store: &'s mut dyn StatusStore,
    event_tx: mpsc::Sender<RuntimeEvent>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<'s, E: ExecutorBackend> Runtime<'s, E> {
    /// `event_tx` must feed `event_rx`; retry timers post through it.
    pub fn new(
        core: CoreRuntime,
        store: &'s mut dyn StatusStore,
        event_tx: mpsc::Sender<RuntimeEvent>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        executor: E,
    ) -> Self {
        Self {
            core,
            store,
            event_tx,
            event_rx,
            executor,
        }
    }

    /// Main event loop.
    ///
    /// - Starts the run (first dispatches).
    /// - Consumes `RuntimeEvent`s from `event_rx` and feeds them into the
    ///   core runtime.
    /// - Executes commands returned by the core until it reports the run
    ///   finished.
    pub async fn run(mut self) -> Result<PipelineReport> {
        info!("fovdag runtime started");

        let step = self.core.start();
        let mut keep_running = self.apply(step).await?;

        while keep_running {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            // Feed the event into the pure core and execute what it decided.
            let step = self.core.step(event);
            keep_running = self.apply(step).await?;
        }

        let report = self.core.report();
        info!(
            success = report.is_success(),
            interrupted = report.interrupted,
            dispatched = report.dispatched,
            "runtime exiting"
        );
        Ok(report)
    }

    async fn apply(&mut self, step: CoreStep) -> Result<bool> {
        for command in step.commands {
            self.execute_command(command).await?;
        }
        if !step.keep_running {
            info!("core reported the run finished; stopping runtime");
        }
        Ok(step.keep_running)
    }

    /// Execute a single command from the core.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::RecordStatus(updates) => self.record_status(updates)?,
            CoreCommand::Dispatch(fragments) => self.dispatch(fragments).await?,
            CoreCommand::ScheduleRetry(retries) => self.arm_retry_timers(retries),
            CoreCommand::Finish => debug!("core issued Finish command"),
        }
        Ok(())
    }

    fn record_status(&mut self, updates: Vec<StatusUpdate>) -> Result<()> {
        let graph = self.core.scheduler().graph();
        for update in updates {
            self.store
                .record_status(graph.name_of(update.stage), update.fragment, update.status)
                .map_err(FovdagError::status_store)?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, fragments: Vec<ScheduledFragment>) -> Result<()> {
        if fragments.is_empty() {
            return Ok(());
        }
        debug!(count = fragments.len(), "dispatching fragments");
        self.executor.spawn_fragments(fragments).await
    }

    fn arm_retry_timers(&self, retries: Vec<ScheduledRetry>) {
        for retry in retries {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(retry.delay).await;
                // The runtime may have finished in the meantime.
                let _ = tx
                    .send(RuntimeEvent::RetryDue {
                        stage: retry.stage,
                        fragment: retry.fragment,
                    })
                    .await;
            });
        }
    }
}
