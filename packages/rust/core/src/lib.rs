//! Pipeline driver for curator: staged, resumable execution over the
//! durable state in `curator-storage`.

pub mod pipeline;
pub mod stage;

pub use pipeline::{
    run_pipeline, ProgressReporter, RunOptions, RunOutcome, RunReport, SilentProgress,
};
pub use stage::{BoxedStage, CommandStage, PipelineStage, StageContext, StageOutcome};
