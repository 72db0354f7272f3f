// src/exec/mod.rs

//! Fragment execution layer.
//!
//! This module is responsible for actually running scheduled fragments
//! through their stage's runner and reporting back to the orchestration
//! runtime via `RuntimeEvent`s.
//!
//! - [`executor_loop`] owns the loop that receives scheduled fragments and
//!   runs each one in its own Tokio task.
//! - [`task_runner`] runs a single fragment attempt.
//! - [`backend`] provides the `ExecutorBackend` trait and a concrete
//!   `RealExecutorBackend` that the runtime uses in production, and which
//!   tests can replace with a fake implementation.

pub mod backend;
pub mod executor_loop;
pub mod task_runner;

pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use executor_loop::spawn_executor;
