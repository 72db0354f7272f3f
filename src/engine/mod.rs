// src/engine/mod.rs

//! Orchestration engine for fovdag.
//!
//! This module ties together:
//! - the scheduler (what runs next)
//! - resume planning against the status store ([`plan`])
//! - the main runtime event loop that reacts to:
//!   - fragment completions from the executor
//!   - retry timers coming due
//!   - shutdown signals
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use crate::dag::StageId;
use crate::types::FragmentKey;

/// Outcome of one fragment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Success,
    /// The runner returned an error (or panicked); the message is logged.
    Failed(String),
}

impl FragmentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FragmentOutcome::Success)
    }
}

/// Events flowing into the runtime from the executor, timers and signals.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A dispatched fragment finished one attempt.
    FragmentCompleted {
        stage: StageId,
        fragment: FragmentKey,
        outcome: FragmentOutcome,
    },
    /// The backoff of a failed fragment elapsed.
    RetryDue {
        stage: StageId,
        fragment: FragmentKey,
    },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod plan;
pub mod report;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use plan::{parameter_fingerprint, plan_stages};
pub use report::{PipelineReport, StageReport};
pub use runtime::Runtime;
