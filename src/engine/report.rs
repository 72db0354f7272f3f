// src/engine/report.rs

//! Final outcome of a pipeline run.

use std::fmt;

use crate::dag::{Scheduler, StageState};
use crate::types::FragmentKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub state: StageState,
    pub total_fragments: usize,
    pub complete_fragments: usize,
    /// Fragment that exhausted its attempts, for failed stages.
    pub failed_fragment: Option<FragmentKey>,
}

/// Per-stage outcome of one run, in declaration order.
///
/// Partial success is a valid outcome: independent branches complete even
/// when another branch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    /// The run was stopped by a shutdown request.
    pub interrupted: bool,
    /// Fragment attempts dispatched, retries included.
    pub dispatched: usize,
}

impl PipelineReport {
    pub fn from_scheduler(scheduler: &Scheduler, interrupted: bool, dispatched: usize) -> Self {
        let graph = scheduler.graph();
        let stages = scheduler
            .summaries()
            .into_iter()
            .map(|s| StageReport {
                name: graph.name_of(s.stage).to_string(),
                state: s.state,
                total_fragments: s.total_fragments,
                complete_fragments: s.complete_fragments,
                failed_fragment: s.failed_fragment,
            })
            .collect();

        Self {
            stages,
            interrupted,
            dispatched,
        }
    }

    /// Every stage complete and the run was not interrupted.
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.stages.iter().all(|s| s.state == StageState::Complete)
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<StageState> {
        self.stage(name).map(|s| s.state)
    }

    pub fn names_in(&self, state: StageState) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.name.as_str())
            .collect()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.stages.iter().map(|s| s.name.len()).max().unwrap_or(0);
        for s in &self.stages {
            write!(
                f,
                "  {:<width$}  {:<8}  {}/{}",
                s.name, s.state, s.complete_fragments, s.total_fragments
            )?;
            if let Some(fragment) = s.failed_fragment {
                write!(f, "  (failed at {fragment})")?;
            }
            writeln!(f)?;
        }
        if self.interrupted {
            writeln!(f, "interrupted before completion")?;
        }
        Ok(())
    }
}
