// src/dag/mod.rs

//! Dependency graph and scheduling.
//!
//! - [`graph`] holds the immutable stage graph (cycle detection, topological
//!   order, dependency lookups).
//! - [`scheduler`] contains the per-run state machine that decides which
//!   fragments run next and when dependents may start.
//! - [`stage_state`] provides the per-stage bookkeeping and the types the
//!   scheduler hands out.
//! - [`scheduler_step`] defines the result type for scheduler steps.

pub mod graph;
pub mod scheduler;
pub mod scheduler_step;
pub mod stage_state;

pub use graph::{DagGraph, StageId};
pub use scheduler::{RetryPolicy, Scheduler, SchedulerOptions};
pub use scheduler_step::{ScheduledRetry, SchedulerStep};
pub use stage_state::{ScheduledFragment, StagePlan, StageState, StageSummary, StatusUpdate};
