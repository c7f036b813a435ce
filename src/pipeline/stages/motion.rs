//! Motion score by sampled frame differencing.
//!
//! Every `sample_stride`-th pixel is compared with the same pixel of the
//! previous frame. The score is the fraction of samples whose absolute
//! difference exceeds `pixel_threshold`. The first frame, and the first frame
//! after a geometry change, score 0.

use crate::error::{ArbiterError, Result};
use crate::pipeline::record::StageOutput;
use crate::pipeline::stage::{StageConfig, StageContext, StageOutcome, StagePlugin};

pub const DEFAULT_SAMPLE_STRIDE: usize = 100;
pub const DEFAULT_PIXEL_THRESHOLD: u8 = 30;

pub struct MotionStage {
    sample_stride: usize,
    pixel_threshold: u8,
    previous: Option<Vec<u8>>,
    last_score: f64,
}

impl Default for MotionStage {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionStage {
    pub const NAME: &'static str = "motion";

    pub fn new() -> Self {
        Self {
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            previous: None,
            last_score: 0.0,
        }
    }

    pub fn last_score(&self) -> f64 {
        self.last_score
    }

    fn sample(&self, data: &[u8]) -> Vec<u8> {
        data.iter().step_by(self.sample_stride).copied().collect()
    }
}

impl StagePlugin for MotionStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        10
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        let stride = config.get_u64("sample_stride", DEFAULT_SAMPLE_STRIDE as u64);
        if stride == 0 {
            return Err(ArbiterError::stage(Self::NAME, "sample_stride must be > 0"));
        }
        let threshold = config.get_u64("pixel_threshold", DEFAULT_PIXEL_THRESHOLD as u64);
        self.sample_stride = stride as usize;
        self.pixel_threshold = threshold.min(255) as u8;
        Ok(())
    }

    fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
        let current = self.sample(ctx.frame.data);

        let score = match &self.previous {
            Some(prev) if prev.len() == current.len() && !current.is_empty() => {
                let changed = prev
                    .iter()
                    .zip(&current)
                    .filter(|(a, b)| a.abs_diff(**b) > self.pixel_threshold)
                    .count();
                changed as f64 / current.len() as f64
            }
            _ => 0.0,
        };

        self.previous = Some(current);
        self.last_score = score;
        ctx.record.insert(Self::NAME, StageOutput::Motion { score });
        StageOutcome::Success
    }

    fn cleanup(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMeta, FrameView};
    use crate::pipeline::record::PipelineRecord;
    use crate::types::SourceId;

    fn run(stage: &mut MotionStage, data: &[u8]) -> f64 {
        let meta = FrameMeta {
            width: data.len() as u32,
            height: 1,
            timestamp_ms: 0,
            tick_id: 0,
        };
        let mut record = PipelineRecord::new(SourceId::new("t"), 0, 0);
        let mut ctx = StageContext {
            frame: FrameView { meta: &meta, data },
            record: &mut record,
            tick_id: 0,
            timestamp_ms: 0,
            degraded: false,
        };
        assert_eq!(stage.process(&mut ctx), StageOutcome::Success);
        record.motion_score().unwrap()
    }

    #[test]
    fn test_first_frame_scores_zero() {
        let mut stage = MotionStage::new();
        assert_eq!(run(&mut stage, &[200; 1000]), 0.0);
    }

    #[test]
    fn test_identical_frames_score_zero() {
        let mut stage = MotionStage::new();
        run(&mut stage, &[100; 1000]);
        assert_eq!(run(&mut stage, &[100; 1000]), 0.0);
    }

    #[test]
    fn test_fraction_of_changed_samples() {
        let mut stage = MotionStage::new();
        let mut config = toml::Table::new();
        config.insert("sample_stride".into(), toml::Value::Integer(1));
        stage.init(&StageConfig::new(config)).unwrap();

        run(&mut stage, &[0; 10]);
        let mut next = [0u8; 10];
        for px in next.iter_mut().take(4) {
            *px = 31;
        }
        next[4] = 30; // not above threshold
        assert!((run(&mut stage, &next) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_geometry_change_resets_baseline() {
        let mut stage = MotionStage::new();
        run(&mut stage, &[0; 1000]);
        assert_eq!(run(&mut stage, &[255; 2000]), 0.0);
    }

    #[test]
    fn test_zero_stride_rejected() {
        let mut stage = MotionStage::new();
        let mut config = toml::Table::new();
        config.insert("sample_stride".into(), toml::Value::Integer(0));
        assert!(stage.init(&StageConfig::new(config)).is_err());
    }
}
