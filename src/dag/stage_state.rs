// src/dag/stage_state.rs

//! Per-stage and per-fragment bookkeeping for the scheduler.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use crate::dag::graph::StageId;
use crate::types::{FragmentKey, FragmentStatus};

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    /// At least one dependency is not complete yet.
    Blocked,
    /// Dependencies complete; no fragment dispatched yet in this run.
    Ready,
    /// At least one fragment has been dispatched.
    Running,
    Complete,
    /// A fragment exhausted its attempts.
    Failed,
    /// Never dispatched because an upstream stage failed.
    Skipped,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Blocked => "blocked",
            StageState::Ready => "ready",
            StageState::Running => "running",
            StageState::Complete => "complete",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageState::Complete | StageState::Failed | StageState::Skipped
        )
    }

    /// Whether fragments of a stage in this state may be dispatched.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, StageState::Ready | StageState::Running)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What the scheduler needs to know about one stage before the run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePlan {
    /// Every fragment of the stage, in dispatch order.
    pub fragments: Vec<FragmentKey>,
    /// Fragments already complete (from the status store or the runner's
    /// own output check). These are never dispatched.
    pub complete: BTreeSet<FragmentKey>,
    /// Per-stage cap on concurrently running fragments.
    pub max_parallel: Option<usize>,
}

impl StagePlan {
    pub fn new(fragments: Vec<FragmentKey>) -> Self {
        Self {
            fragments,
            ..Self::default()
        }
    }

    pub fn with_complete(mut self, complete: impl IntoIterator<Item = FragmentKey>) -> Self {
        self.complete.extend(complete);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Fragments that still have to run, in dispatch order.
    pub fn pending(&self) -> impl Iterator<Item = FragmentKey> + '_ {
        self.fragments
            .iter()
            .copied()
            .filter(|key| !self.complete.contains(key))
    }
}

/// A fragment handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledFragment {
    pub stage: StageId,
    pub fragment: FragmentKey,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A status write the runtime shell has to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub stage: StageId,
    pub fragment: FragmentKey,
    pub status: FragmentStatus,
}

/// Mutable per-run bookkeeping of one stage.
#[derive(Debug, Clone)]
pub(crate) struct StageProgress {
    pub state: StageState,
    pub max_parallel: Option<usize>,
    pub total: usize,
    pub complete: usize,
    /// Fragments waiting for a worker slot.
    pub queue: VecDeque<FragmentKey>,
    /// Fragments handed to the executor and not yet reported back.
    pub running: BTreeSet<FragmentKey>,
    /// Fragments whose failed attempt is waiting out its backoff.
    pub awaiting_retry: BTreeSet<FragmentKey>,
    /// Attempts started so far, per fragment.
    pub attempts: HashMap<FragmentKey, u32>,
    pub failed_fragment: Option<FragmentKey>,
}

impl StageProgress {
    pub fn from_plan(plan: StagePlan) -> Self {
        let queue: VecDeque<FragmentKey> = plan.pending().collect();
        let total = plan.fragments.len();
        Self {
            state: StageState::Blocked,
            max_parallel: plan.max_parallel,
            total,
            complete: total - queue.len(),
            queue,
            running: BTreeSet::new(),
            awaiting_retry: BTreeSet::new(),
            attempts: HashMap::new(),
            failed_fragment: None,
        }
    }

    /// Nothing left to run or wait for.
    pub fn all_fragments_complete(&self) -> bool {
        self.queue.is_empty()
            && self.running.is_empty()
            && self.awaiting_retry.is_empty()
            && self.complete >= self.total
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn attempts_of(&self, fragment: FragmentKey) -> u32 {
        self.attempts.get(&fragment).copied().unwrap_or(0)
    }
}

/// Read-only summary of a stage after (or during) a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub stage: StageId,
    pub state: StageState,
    pub total_fragments: usize,
    pub complete_fragments: usize,
    /// Fragment that exhausted its attempts, for failed stages.
    pub failed_fragment: Option<FragmentKey>,
}
