// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of a raw mpsc sender.
//! This makes it easy to swap in a fake executor in tests while keeping the
//! production executor in [`super::executor_loop`].
//!
//! - `RealExecutorBackend` is the default implementation used by `fovdag`.
//!   It wraps the `spawn_executor` loop and just forwards scheduled
//!   fragments over an mpsc channel.
//! - Tests can provide their own `ExecutorBackend` that, for example, records
//!   which fragments were scheduled and directly emits `FragmentCompleted`
//!   events.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::dag::ScheduledFragment;
use crate::engine::RuntimeEvent;
use crate::errors::{FovdagError, Result};
use crate::pipeline::BoundStage;

use super::executor_loop::spawn_executor;

/// Trait abstracting how scheduled fragments are executed.
///
/// Every dispatched fragment must eventually produce exactly one
/// `RuntimeEvent::FragmentCompleted`, or the run never finishes.
pub trait ExecutorBackend: Send {
    /// Dispatch the given fragments for execution.
    fn spawn_fragments(
        &mut self,
        fragments: Vec<ScheduledFragment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Real executor backend used in production.
///
/// The runtime calls `spawn_fragments`, which forwards the fragments to the
/// background executor loop via an mpsc channel.
pub struct RealExecutorBackend {
    tx: mpsc::Sender<ScheduledFragment>,
}

impl RealExecutorBackend {
    /// Create a new real executor backend for the given stages, wiring it to
    /// the runtime event sender.
    ///
    /// This spawns the background executor loop immediately.
    pub fn new(stages: Arc<[BoundStage]>, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        let tx = spawn_executor(stages, runtime_tx);
        Self { tx }
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn spawn_fragments(
        &mut self,
        fragments: Vec<ScheduledFragment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            for fragment in fragments {
                tx.send(fragment)
                    .await
                    .map_err(|_| FovdagError::Other(anyhow!("executor loop has shut down")))?;
            }
            Ok(())
        })
    }
}
