// src/dag/scheduler_step.rs

//! Result type of a single scheduler step.

use std::time::Duration;

use crate::dag::graph::StageId;
use crate::dag::stage_state::{ScheduledFragment, StatusUpdate};
use crate::types::FragmentKey;

/// A failed fragment that should be re-queued after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub stage: StageId,
    pub fragment: FragmentKey,
    /// Attempt number the retry will run as.
    pub next_attempt: u32,
    pub delay: Duration,
}

/// Everything that changed as a result of one scheduler step.
///
/// The runtime shell applies the fields in order: persist `status_updates`,
/// hand `dispatched` to the executor, arm timers for `retries`.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Fragments to run now, already marked running.
    pub dispatched: Vec<ScheduledFragment>,
    pub retries: Vec<ScheduledRetry>,
    pub status_updates: Vec<StatusUpdate>,
    pub newly_complete: Vec<StageId>,
    /// Stages whose fragment exhausted its attempts in this step.
    pub newly_failed: Vec<StageId>,
    /// Dependents of `newly_failed`, never to be dispatched.
    pub newly_skipped: Vec<StageId>,
    /// Whether this step left nothing running, queued or waiting.
    pub run_just_finished: bool,
}
