// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use tracing::debug;

use crate::dag::{
    ScheduledFragment, ScheduledRetry, Scheduler, SchedulerStep, StageId, StatusUpdate,
};
use crate::engine::FragmentOutcome;
use crate::types::FragmentKey;

/// Command produced by the pure core, to be executed by the outer IO shell.
///
/// Within one [`CoreStep`] the commands are ordered: status writes come
/// before the dispatches they describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Persist these status changes in the status store.
    RecordStatus(Vec<StatusUpdate>),
    /// Send these fragments to the executor.
    Dispatch(Vec<ScheduledFragment>),
    /// Arm one timer per retry; each posts `RuntimeEvent::RetryDue`.
    ScheduleRetry(Vec<ScheduledRetry>),
    /// Nothing is left to run; the shell should stop.
    Finish,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    /// Fragments dispatched by this step, across all `Dispatch` commands.
    pub fn dispatched(&self) -> impl Iterator<Item = &ScheduledFragment> {
        self.commands.iter().flat_map(|c| match c {
            CoreCommand::Dispatch(fragments) => fragments.as_slice(),
            _ => &[][..],
        })
    }
}

/// Translate a scheduler step into shell commands.
pub fn commands_from_step(step: SchedulerStep) -> CoreStep {
    let mut commands = Vec::new();

    if !step.status_updates.is_empty() {
        commands.push(CoreCommand::RecordStatus(step.status_updates));
    }
    if !step.dispatched.is_empty() {
        commands.push(CoreCommand::Dispatch(step.dispatched));
    }
    if !step.retries.is_empty() {
        commands.push(CoreCommand::ScheduleRetry(step.retries));
    }

    let keep_running = !step.run_just_finished;
    if !keep_running {
        commands.push(CoreCommand::Finish);
    }

    CoreStep {
        commands,
        keep_running,
    }
}

/// Kick off the run.
pub fn handle_start(scheduler: &mut Scheduler) -> CoreStep {
    commands_from_step(scheduler.start())
}

/// Handle a fragment completion event.
pub fn handle_fragment_completed(
    scheduler: &mut Scheduler,
    stage: StageId,
    fragment: FragmentKey,
    outcome: FragmentOutcome,
) -> CoreStep {
    commands_from_step(scheduler.handle_completion(stage, fragment, outcome))
}

/// Handle a retry timer coming due.
pub fn handle_retry_due(scheduler: &mut Scheduler, stage: StageId, fragment: FragmentKey) -> CoreStep {
    commands_from_step(scheduler.handle_retry_due(stage, fragment))
}

/// Handle a shutdown request: stop dispatching and exit right away.
///
/// Fragments still running are abandoned; their `running` status becomes
/// `pending` the next time the status store is opened.
pub fn handle_shutdown(scheduler: &mut Scheduler) -> CoreStep {
    let step = scheduler.request_shutdown();
    debug!(in_flight = scheduler.in_flight(), "shutdown: abandoning in-flight fragments");

    let mut core_step = commands_from_step(step);
    if core_step.keep_running {
        core_step.commands.push(CoreCommand::Finish);
        core_step.keep_running = false;
    }
    core_step
}
