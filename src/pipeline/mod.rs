//! Per-tick stage pipeline.
//!
//! Every tick a source captures one frame and hands it to its executor:
//!
//! ```text
//! [Capture] ──► [motion] ──► [scene_hash] ──► [detection*] ──► [artifact] ──► PipelineRecord
//!                                                  │
//!                                      * holds an accelerator grant
//! ```
//!
//! # Design
//!
//! - **Enum dispatch on hot path**: `BuiltinStage` for the built-in stages,
//!   `StagePlugin` trait objects for everything else.
//! - **Owned frame, borrowed views**: stages see a `FrameView`; the executor
//!   drops the frame after the last stage, which releases it to its producer.
//! - **Fail fast per tick**: the first `Error` ends the tick, never the loop.

pub mod executor;
pub mod record;
pub mod stage;
pub mod stages;

pub use executor::{
    accelerator_stages, ExecutorStats, GrantSummary, PipelineExecutor, StageRegistry, StageRun,
    StageStats, TickReport,
};
pub use record::{ArtifactPayload, PipelineRecord, StageOutput};
pub use stage::{AnyStage, BuiltinStage, StageConfig, StageContext, StageOutcome, StagePlugin};
