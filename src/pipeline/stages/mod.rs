//! Built-in pipeline stages, in default priority order:
//!
//! | Stage | Priority | Accelerator | Output |
//! |---|---|---|---|
//! | [`MotionStage`] | 10 | no | `Motion { score }` |
//! | [`SceneHashStage`] | 20 | no | `SceneHash { hash }` |
//! | [`DetectionStage`] | 30 | yes | `Detections { .. }` |
//! | [`ArtifactStage`] | 90 | no | `Artifact(..)` when requested |

pub mod artifact;
pub mod detection;
pub mod motion;
pub mod scene_hash;

pub use artifact::{ArtifactStage, ArtifactStats};
#[cfg(feature = "synthetic")]
pub use detection::SyntheticDetector;
pub use detection::{DetectionStage, InferenceBackend};
pub use motion::MotionStage;
pub use scene_hash::{scene_hash, SceneHashStage};
