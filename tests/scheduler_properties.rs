// tests/scheduler_properties.rs

mod common;
use crate::common::{PipelineBuilder, TaskBuilder};

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use fovdag::config::model::PipelineConfig;
use fovdag::dag::{
    DagGraph, RetryPolicy, ScheduledFragment, ScheduledRetry, Scheduler, SchedulerOptions,
    SchedulerStep, StagePlan, StageState,
};
use fovdag::engine::FragmentOutcome;
use fovdag::types::FragmentKey;

/// A random acyclic pipeline: stage N may only depend on stages 0..N-1.
#[derive(Debug, Clone)]
struct Case {
    deps: Vec<Vec<usize>>,
    fragments: Vec<u32>,
    failing: HashSet<usize>,
    max_workers: usize,
    max_attempts: u32,
}

fn case_strategy(max_stages: usize) -> impl Strategy<Value = Case> {
    (1..=max_stages).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(0..4u32, n),
            proptest::collection::vec(0..n, 0..3),
            1..5usize,
            1..4u32,
        )
            .prop_map(move |(raw_deps, fragments, failing, max_workers, max_attempts)| {
                let deps = raw_deps
                    .into_iter()
                    .enumerate()
                    .map(|(i, candidates)| {
                        let set: HashSet<usize> = if i == 0 {
                            HashSet::new()
                        } else {
                            candidates.into_iter().map(|c| c % i).collect()
                        };
                        let mut deps: Vec<usize> = set.into_iter().collect();
                        deps.sort_unstable();
                        deps
                    })
                    .collect();
                Case {
                    deps,
                    fragments,
                    failing: failing.into_iter().collect(),
                    max_workers,
                    max_attempts,
                }
            })
    })
}

fn graph_for(case: &Case) -> Arc<DagGraph> {
    let mut builder = PipelineBuilder::new();
    for (i, deps) in case.deps.iter().enumerate() {
        let mut task = TaskBuilder::scripted(&format!("stage_{i}"));
        for dep in deps {
            task = task.run_after(&format!("stage_{dep}"));
        }
        builder = builder.with_task(task);
    }
    let cfg = PipelineConfig::try_from(builder.build()).expect("generated config is valid");
    Arc::new(DagGraph::build(&cfg).expect("generated config is acyclic"))
}

/// Drive the scheduler to completion, completing fragments in dispatch
/// order and firing retries as soon as nothing is running.
fn simulate(case: &Case) -> Result<Scheduler, TestCaseError> {
    let graph = graph_for(case);
    let plans = case
        .fragments
        .iter()
        .map(|&n| StagePlan::new((0..n).map(FragmentKey::Fov).collect()))
        .collect();
    let options = SchedulerOptions {
        max_workers: case.max_workers,
        max_per_stage: None,
        retry: RetryPolicy {
            max_attempts: case.max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    };
    let mut scheduler = Scheduler::new(Arc::clone(&graph), plans, options);

    let mut running: VecDeque<ScheduledFragment> = VecDeque::new();
    let mut retries: VecDeque<ScheduledRetry> = VecDeque::new();

    let absorb = |scheduler: &Scheduler,
                  step: SchedulerStep,
                  running: &mut VecDeque<ScheduledFragment>,
                  retries: &mut VecDeque<ScheduledRetry>|
     -> Result<(), TestCaseError> {
        for f in step.dispatched {
            // Readiness barrier.
            for dep in graph.dependencies_of(f.stage) {
                prop_assert_eq!(scheduler.state_of(*dep), Some(StageState::Complete));
            }
            prop_assert!(f.attempt <= case.max_attempts);
            running.push_back(f);
        }
        prop_assert!(scheduler.in_flight() <= case.max_workers);
        prop_assert_eq!(scheduler.in_flight(), running.len());
        retries.extend(step.retries);
        Ok(())
    };

    let step = scheduler.start();
    absorb(&scheduler, step, &mut running, &mut retries)?;

    let mut steps = 0;
    while !scheduler.is_finished() {
        steps += 1;
        prop_assert!(steps < 10_000, "scheduler did not terminate");

        let step = if let Some(f) = running.pop_front() {
            let outcome = if case.failing.contains(&f.stage.0) {
                FragmentOutcome::Failed("scripted".to_string())
            } else {
                FragmentOutcome::Success
            };
            scheduler.handle_completion(f.stage, f.fragment, outcome)
        } else if let Some(r) = retries.pop_front() {
            scheduler.handle_retry_due(r.stage, r.fragment)
        } else {
            return Err(TestCaseError::fail("scheduler stalled with work outstanding"));
        };
        absorb(&scheduler, step, &mut running, &mut retries)?;
    }

    prop_assert!(running.is_empty());
    Ok(scheduler)
}

/// Outcome each stage must end in, derived from the graph alone.
fn expected_states(case: &Case) -> Vec<StageState> {
    let mut expected: Vec<StageState> = Vec::with_capacity(case.deps.len());
    for (i, deps) in case.deps.iter().enumerate() {
        let upstream_broken = deps
            .iter()
            .any(|d| matches!(expected[*d], StageState::Failed | StageState::Skipped));
        let state = if upstream_broken {
            StageState::Skipped
        } else if case.failing.contains(&i) && case.fragments[i] > 0 {
            StageState::Failed
        } else {
            StageState::Complete
        };
        expected.push(state);
    }
    expected
}

proptest! {
    #[test]
    fn scheduler_always_terminates_in_the_expected_states(case in case_strategy(8)) {
        let scheduler = simulate(&case)?;
        let expected = expected_states(&case);

        for (i, want) in expected.iter().enumerate() {
            let id = scheduler.graph().id_of(&format!("stage_{i}")).expect("stage exists");
            prop_assert_eq!(scheduler.state_of(id), Some(*want), "stage_{}", i);
        }
    }

    #[test]
    fn failing_fragments_use_their_whole_budget_before_the_stage_fails(
        attempts in 1..5u32,
        workers in 1..4usize,
    ) {
        let case = Case {
            deps: vec![vec![], vec![0]],
            fragments: vec![1, 2],
            failing: [0].into_iter().collect(),
            max_workers: workers,
            max_attempts: attempts,
        };
        let scheduler = simulate(&case)?;
        let id = scheduler.graph().id_of("stage_0").expect("stage exists");
        prop_assert_eq!(scheduler.attempts_of(id, FragmentKey::Fov(0)), attempts);
        prop_assert_eq!(scheduler.state_of(id), Some(StageState::Failed));
    }
}
