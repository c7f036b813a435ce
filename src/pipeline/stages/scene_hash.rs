//! Coarse scene fingerprint: DJB2 over every `sample_stride`-th byte.

use crate::error::{ArbiterError, Result};
use crate::pipeline::record::StageOutput;
use crate::pipeline::stage::{StageConfig, StageContext, StageOutcome, StagePlugin};

pub const DEFAULT_HASH_STRIDE: usize = 1000;

const DJB2_SEED: u32 = 5381;

/// Sampled DJB2 hash of `data`
pub fn scene_hash(data: &[u8], stride: usize) -> u32 {
    data.iter()
        .step_by(stride.max(1))
        .fold(DJB2_SEED, |hash, &byte| {
            (hash << 5).wrapping_add(hash).wrapping_add(byte as u32)
        })
}

pub struct SceneHashStage {
    sample_stride: usize,
}

impl Default for SceneHashStage {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneHashStage {
    pub const NAME: &'static str = "scene_hash";

    pub fn new() -> Self {
        Self {
            sample_stride: DEFAULT_HASH_STRIDE,
        }
    }
}

impl StagePlugin for SceneHashStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        20
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        let stride = config.get_u64("sample_stride", DEFAULT_HASH_STRIDE as u64);
        if stride == 0 {
            return Err(ArbiterError::stage(Self::NAME, "sample_stride must be > 0"));
        }
        self.sample_stride = stride as usize;
        Ok(())
    }

    fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
        let hash = scene_hash(ctx.frame.data, self.sample_stride);
        ctx.record.insert(Self::NAME, StageOutput::SceneHash { hash });
        StageOutcome::Success
    }
}
