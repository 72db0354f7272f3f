#![allow(dead_code)]

pub use fovdag_test_utils::builders::{PipelineBuilder, TaskBuilder};
pub use fovdag_test_utils::runners::{Script, ScriptedStages, Trace};
pub use fovdag_test_utils::{init_tracing, with_timeout};

/// The four-stage MERFISH layout:
///
/// ```text
/// Preprocess ──> Optimize ──> Decode
///      │  └──────────────────────^
///      └──> AdaptiveThreshold
/// ```
pub fn merfish_pipeline() -> PipelineBuilder {
    PipelineBuilder::new()
        .with_task(TaskBuilder::scripted("Preprocess"))
        .with_task(TaskBuilder::scripted("Optimize").uses("Preprocess"))
        .with_task(
            TaskBuilder::scripted("Decode")
                .uses("Preprocess")
                .uses("Optimize"),
        )
        .with_task(TaskBuilder::scripted("AdaptiveThreshold").uses("Preprocess"))
}
