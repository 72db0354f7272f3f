// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated core state
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - writing status updates to the status store
//! - sending fragments to the executor and arming retry timers
//!
//! The core is intended to be extensively unit tested without any Tokio,
//! channels, filesystem, or processes.

use crate::dag::Scheduler;
use crate::engine::event_handlers::{
    handle_fragment_completed, handle_retry_due, handle_shutdown, handle_start, CoreStep,
};
use crate::engine::report::PipelineReport;
use crate::engine::RuntimeEvent;

/// Pure core runtime state.
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    scheduler: Scheduler,
    interrupted: bool,
    dispatched: usize,
}

impl CoreRuntime {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            interrupted: false,
            dispatched: 0,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_finished(&self) -> bool {
        self.scheduler.is_finished()
    }

    /// Fragment attempts dispatched so far, retries included.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Promote ready stages and fill the worker slots.
    pub fn start(&mut self) -> CoreStep {
        let step = handle_start(&mut self.scheduler);
        self.count(step)
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        let step = match event {
            RuntimeEvent::FragmentCompleted {
                stage,
                fragment,
                outcome,
            } => handle_fragment_completed(&mut self.scheduler, stage, fragment, outcome),
            RuntimeEvent::RetryDue { stage, fragment } => {
                handle_retry_due(&mut self.scheduler, stage, fragment)
            }
            RuntimeEvent::ShutdownRequested => {
                self.interrupted = true;
                handle_shutdown(&mut self.scheduler)
            }
        };
        self.count(step)
    }

    /// Snapshot of every stage's outcome.
    pub fn report(&self) -> PipelineReport {
        PipelineReport::from_scheduler(&self.scheduler, self.interrupted, self.dispatched)
    }

    fn count(&mut self, step: CoreStep) -> CoreStep {
        self.dispatched += step.dispatched().count();
        step
    }
}
