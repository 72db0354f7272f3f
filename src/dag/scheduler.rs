// src/dag/scheduler.rs

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::model::ExecutionSection;
use crate::dag::graph::{DagGraph, StageId};
use crate::dag::scheduler_step::{ScheduledRetry, SchedulerStep};
use crate::dag::stage_state::{
    ScheduledFragment, StagePlan, StageProgress, StageState, StageSummary, StatusUpdate,
};
use crate::engine::FragmentOutcome;
use crate::types::{FragmentKey, FragmentStatus};

/// Retry budget and backoff for failed fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per fragment, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_execution(&ExecutionSection::default())
    }
}

impl RetryPolicy {
    pub fn from_execution(exec: &ExecutionSection) -> Self {
        Self {
            max_attempts: exec.max_attempts,
            base_delay: Duration::from_millis(exec.retry_base_delay_ms),
            max_delay: Duration::from_millis(exec.retry_max_delay_ms),
        }
    }

    /// Backoff after the given (1-based) failed attempt:
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Concurrency limits and retry policy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Global cap on concurrently running fragments.
    pub max_workers: usize,
    /// Cap on concurrently running fragments of any one stage.
    pub max_per_stage: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_execution(&ExecutionSection::default())
    }
}

impl SchedulerOptions {
    pub fn from_execution(exec: &ExecutionSection) -> Self {
        Self {
            max_workers: exec.effective_max_workers(),
            max_per_stage: exec.max_per_stage,
            retry: RetryPolicy::from_execution(exec),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}

/// Scheduler holds the immutable DAG plus the mutable state of one run.
///
/// It is responsible for:
/// - promoting a stage once every dependency is complete
/// - handing out fragments within the concurrency limits
/// - retrying failed fragments and failing stages that run out of attempts
/// - skipping everything downstream of a failed stage
///
/// It performs no IO. Every decision is returned as a [`SchedulerStep`].
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<DagGraph>,
    stages: Vec<StageProgress>,
    options: SchedulerOptions,
    in_flight: usize,
    /// Position in topological order where the next dispatch pass starts.
    cursor: usize,
    started: bool,
    stopping: bool,
    finished: bool,
}

impl Scheduler {
    /// Build a scheduler from the graph and one plan per stage, indexed by
    /// [`StageId`].
    pub fn new(graph: Arc<DagGraph>, mut plans: Vec<StagePlan>, options: SchedulerOptions) -> Self {
        if plans.len() != graph.len() {
            warn!(
                plans = plans.len(),
                stages = graph.len(),
                "stage plan count does not match the graph; missing stages get no fragments"
            );
            plans.resize_with(graph.len(), StagePlan::default);
        }

        let stages = plans.into_iter().map(StageProgress::from_plan).collect();

        Self {
            graph,
            stages,
            options,
            in_flight: 0,
            cursor: 0,
            started: false,
            stopping: false,
            finished: false,
        }
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn state_of(&self, stage: StageId) -> Option<StageState> {
        self.stages.get(stage.0).map(|p| p.state)
    }

    /// Attempts started so far for a fragment.
    pub fn attempts_of(&self, stage: StageId, fragment: FragmentKey) -> u32 {
        self.stages
            .get(stage.0)
            .map_or(0, |p| p.attempts_of(fragment))
    }

    /// Fragments currently handed out to the executor.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn summary(&self, stage: StageId) -> Option<StageSummary> {
        let progress = self.stages.get(stage.0)?;
        Some(StageSummary {
            stage,
            state: progress.state,
            total_fragments: progress.total,
            complete_fragments: progress.complete,
            failed_fragment: progress.failed_fragment,
        })
    }

    /// Summaries of every stage, in declaration order.
    pub fn summaries(&self) -> Vec<StageSummary> {
        self.graph.ids().filter_map(|id| self.summary(id)).collect()
    }

    /// Promote every stage whose dependencies are already complete and fill
    /// the available worker slots.
    pub fn start(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.started {
            warn!("scheduler already started; ignoring");
            return step;
        }
        self.started = true;

        info!(
            stages = self.graph.len(),
            max_workers = self.options.max_workers,
            "scheduler: starting run"
        );

        let seeds = self.graph.topological_order().to_vec();
        self.promote(seeds, &mut step);
        self.dispatch(&mut step);
        self.check_finished(&mut step);
        step
    }

    /// Record the outcome of one dispatched fragment.
    pub fn handle_completion(
        &mut self,
        stage: StageId,
        fragment: FragmentKey,
        outcome: FragmentOutcome,
    ) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        let Some(progress) = self.stages.get_mut(stage.0) else {
            warn!(stage = %stage, fragment = %fragment, "completion for unknown stage; ignoring");
            return step;
        };
        if !progress.running.remove(&fragment) {
            warn!(
                stage = %self.graph.name_of(stage),
                fragment = %fragment,
                "completion for a fragment that is not running; ignoring"
            );
            return step;
        }

        self.in_flight -= 1;
        let attempt = progress.attempts_of(fragment);
        let name = self.graph.name_of(stage);

        match outcome {
            FragmentOutcome::Success => {
                progress.complete += 1;
                step.status_updates.push(StatusUpdate {
                    stage,
                    fragment,
                    status: FragmentStatus::Complete,
                });
                debug!(
                    stage = %name,
                    fragment = %fragment,
                    attempt,
                    complete = progress.complete,
                    total = progress.total,
                    "fragment complete"
                );

                if progress.state == StageState::Running && progress.all_fragments_complete() {
                    self.complete_stage(stage, &mut step);
                }
            }
            FragmentOutcome::Failed(reason) => {
                step.status_updates.push(StatusUpdate {
                    stage,
                    fragment,
                    status: FragmentStatus::Failed,
                });

                if progress.state != StageState::Running {
                    debug!(
                        stage = %name,
                        fragment = %fragment,
                        state = %progress.state,
                        error = %reason,
                        "fragment failed after its stage stopped running"
                    );
                } else if attempt < self.options.retry.max_attempts && !self.stopping {
                    let delay = self.options.retry.delay_for(attempt);
                    progress.awaiting_retry.insert(fragment);
                    warn!(
                        stage = %name,
                        fragment = %fragment,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "fragment failed; retrying after backoff"
                    );
                    step.retries.push(ScheduledRetry {
                        stage,
                        fragment,
                        next_attempt: attempt + 1,
                        delay,
                    });
                } else {
                    error!(
                        stage = %name,
                        fragment = %fragment,
                        attempt,
                        error = %reason,
                        "fragment failed on its last attempt; failing stage"
                    );
                    self.fail_stage(stage, fragment, &mut step);
                }
            }
        }

        self.dispatch(&mut step);
        self.check_finished(&mut step);
        step
    }

    /// A retry's backoff elapsed: queue the fragment again.
    pub fn handle_retry_due(&mut self, stage: StageId, fragment: FragmentKey) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        let Some(progress) = self.stages.get_mut(stage.0) else {
            warn!(stage = %stage, fragment = %fragment, "retry for unknown stage; ignoring");
            return step;
        };

        if !progress.awaiting_retry.remove(&fragment) {
            debug!(
                stage = %self.graph.name_of(stage),
                fragment = %fragment,
                "retry no longer wanted; dropping"
            );
            return step;
        }

        debug!(
            stage = %self.graph.name_of(stage),
            fragment = %fragment,
            "retry due; fragment queued again"
        );
        progress.queue.push_back(fragment);
        step.status_updates.push(StatusUpdate {
            stage,
            fragment,
            status: FragmentStatus::Pending,
        });

        self.dispatch(&mut step);
        self.check_finished(&mut step);
        step
    }

    /// Stop dispatching. Fragments already running are allowed to report
    /// back; waiting retries are abandoned.
    pub fn request_shutdown(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if !self.stopping {
            info!(in_flight = self.in_flight, "scheduler: shutdown requested; no further dispatch");
            self.stopping = true;
            for progress in &mut self.stages {
                progress.awaiting_retry.clear();
            }
        }
        self.check_finished(&mut step);
        step
    }

    /// Walk `seeds` and everything downstream of a stage that completes on
    /// promotion, moving Blocked stages whose dependencies are all complete
    /// to Ready (or straight to Complete when nothing is left to run).
    fn promote(&mut self, seeds: Vec<StageId>, step: &mut SchedulerStep) {
        let graph = Arc::clone(&self.graph);
        let mut work = seeds;
        work.reverse();

        while let Some(id) = work.pop() {
            if self.stages[id.0].state != StageState::Blocked {
                continue;
            }
            let deps_complete = graph
                .dependencies_of(id)
                .iter()
                .all(|dep| self.stages[dep.0].state == StageState::Complete);
            if !deps_complete {
                continue;
            }

            let progress = &mut self.stages[id.0];
            if progress.all_fragments_complete() {
                progress.state = StageState::Complete;
                info!(
                    stage = %graph.name_of(id),
                    fragments = progress.total,
                    "stage already complete; nothing to run"
                );
                step.newly_complete.push(id);
                work.extend(graph.dependents_of(id).iter().rev().copied());
            } else {
                progress.state = StageState::Ready;
                debug!(
                    stage = %graph.name_of(id),
                    pending = progress.queue.len(),
                    "dependencies complete; stage ready"
                );
            }
        }
    }

    fn complete_stage(&mut self, stage: StageId, step: &mut SchedulerStep) {
        self.stages[stage.0].state = StageState::Complete;
        info!(stage = %self.graph.name_of(stage), "stage complete");
        step.newly_complete.push(stage);

        let dependents = self.graph.dependents_of(stage).to_vec();
        self.promote(dependents, step);
    }

    fn fail_stage(&mut self, stage: StageId, fragment: FragmentKey, step: &mut SchedulerStep) {
        let progress = &mut self.stages[stage.0];
        progress.state = StageState::Failed;
        progress.failed_fragment = Some(fragment);
        let dropped = progress.queue.len() + progress.awaiting_retry.len();
        progress.queue.clear();
        progress.awaiting_retry.clear();
        step.newly_failed.push(stage);

        warn!(
            stage = %self.graph.name_of(stage),
            dropped,
            still_running = progress.in_flight(),
            "stage failed; dropping its queued fragments"
        );

        for dependent in self.graph.transitive_dependents(stage) {
            let progress = &mut self.stages[dependent.0];
            if progress.state.is_terminal() {
                continue;
            }
            progress.state = StageState::Skipped;
            progress.queue.clear();
            progress.awaiting_retry.clear();
            warn!(
                stage = %self.graph.name_of(dependent),
                upstream = %self.graph.name_of(stage),
                "skipping stage because an upstream stage failed"
            );
            step.newly_skipped.push(dependent);
        }
    }

    /// Fill free worker slots, taking one fragment per stage per pass so
    /// concurrently ready stages share the workers.
    fn dispatch(&mut self, step: &mut SchedulerStep) {
        if self.stopping {
            return;
        }

        let graph = Arc::clone(&self.graph);
        let order = graph.topological_order();
        if order.is_empty() {
            return;
        }
        let max_workers = self.options.max_workers.max(1);

        while self.in_flight < max_workers {
            let start = self.cursor;
            let mut last_dispatched = None;

            for offset in 0..order.len() {
                if self.in_flight >= max_workers {
                    break;
                }
                let idx = (start + offset) % order.len();
                if let Some(scheduled) = self.take_next(order[idx]) {
                    self.in_flight += 1;
                    step.status_updates.push(StatusUpdate {
                        stage: scheduled.stage,
                        fragment: scheduled.fragment,
                        status: FragmentStatus::Running,
                    });
                    step.dispatched.push(scheduled);
                    last_dispatched = Some(idx);
                }
            }

            match last_dispatched {
                Some(idx) => self.cursor = (idx + 1) % order.len(),
                None => break,
            }
        }
    }

    fn take_next(&mut self, stage: StageId) -> Option<ScheduledFragment> {
        let limit = match (self.options.max_per_stage, self.stages[stage.0].max_parallel) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let progress = &mut self.stages[stage.0];
        if !progress.state.is_dispatchable() {
            return None;
        }
        if limit.is_some_and(|limit| progress.in_flight() >= limit.max(1)) {
            return None;
        }

        let fragment = progress.queue.pop_front()?;
        let attempt = {
            let count = progress.attempts.entry(fragment).or_insert(0);
            *count += 1;
            *count
        };
        progress.running.insert(fragment);

        if progress.state == StageState::Ready {
            progress.state = StageState::Running;
            info!(
                stage = %self.graph.name_of(stage),
                fragments = progress.queue.len() + 1,
                "stage started"
            );
        }

        debug!(
            stage = %self.graph.name_of(stage),
            fragment = %fragment,
            attempt,
            "dispatching fragment"
        );

        Some(ScheduledFragment {
            stage,
            fragment,
            attempt,
        })
    }

    fn check_finished(&mut self, step: &mut SchedulerStep) {
        if self.finished || !self.started || self.in_flight > 0 {
            return;
        }

        let idle = self.stopping
            || self.stages.iter().all(|p| {
                p.awaiting_retry.is_empty() && !p.state.is_dispatchable()
            });
        if !idle {
            return;
        }

        self.finished = true;
        step.run_just_finished = true;

        let blocked: Vec<&str> = self
            .graph
            .ids()
            .filter(|id| self.stages[id.0].state == StageState::Blocked)
            .map(|id| self.graph.name_of(id))
            .collect();
        if !blocked.is_empty() {
            warn!(?blocked, "run finished with stages still blocked");
        }
        info!(interrupted = self.stopping, "scheduler: run finished");
    }
}
