//! Object detection on the shared accelerator.
//!
//! The model itself is an external collaborator behind [`InferenceBackend`].
//! This stage only gates it on the accelerator slot, filters by confidence
//! and records the result. With no backend loaded the stage reports
//! `NotReady` so the rest of the pipeline keeps running without ML.

use crate::capture::FrameMeta;
use crate::error::{ArbiterError, Result};
use crate::pipeline::record::StageOutput;
use crate::pipeline::stage::{StageConfig, StageContext, StageOutcome, StagePlugin};
use crate::types::Detection;
use std::time::Instant;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MAX_DETECTIONS: u64 = 50;

/// Accelerator-backed object detector
pub trait InferenceBackend: Send {
    fn name(&self) -> &str;

    /// False until the model is loaded onto the accelerator
    fn is_ready(&self) -> bool {
        true
    }

    fn infer(&mut self, meta: &FrameMeta, pixels: &[u8]) -> Result<Vec<Detection>>;
}

pub struct DetectionStage {
    backend: Option<Box<dyn InferenceBackend>>,
    confidence_threshold: f32,
    max_detections: usize,
    inferences: u64,
}

impl DetectionStage {
    pub const NAME: &'static str = "detection";

    pub fn new(backend: Option<Box<dyn InferenceBackend>>) -> Self {
        Self {
            backend,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD as f32,
            max_detections: DEFAULT_MAX_DETECTIONS as usize,
            inferences: 0,
        }
    }

    pub fn inferences(&self) -> u64 {
        self.inferences
    }
}

impl StagePlugin for DetectionStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        30
    }

    fn requires_accelerator(&self) -> bool {
        true
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        let threshold = config.get_f64("confidence_threshold", DEFAULT_CONFIDENCE_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ArbiterError::stage(
                Self::NAME,
                format!("confidence_threshold {} outside [0, 1]", threshold),
            ));
        }
        self.confidence_threshold = threshold as f32;
        self.max_detections = config.get_u64("max_detections", DEFAULT_MAX_DETECTIONS) as usize;

        match &self.backend {
            Some(backend) => tracing::info!(
                "Detection stage using backend '{}' (threshold {:.2})",
                backend.name(),
                self.confidence_threshold
            ),
            None => tracing::warn!("Detection stage has no inference backend, running without ML"),
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
        let Some(backend) = self.backend.as_mut() else {
            return StageOutcome::NotReady;
        };
        if !backend.is_ready() {
            return StageOutcome::NotReady;
        }

        let started = Instant::now();
        let result = backend.infer(ctx.frame.meta, ctx.frame.data);
        let inference_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut detections) => {
                self.inferences += 1;
                detections.retain(|d| d.confidence >= self.confidence_threshold);
                detections.truncate(self.max_detections);
                tracing::trace!(
                    "Tick {}: {} detections in {} ms",
                    ctx.tick_id,
                    detections.len(),
                    inference_ms
                );
                ctx.record.insert(
                    Self::NAME,
                    StageOutput::Detections {
                        detections,
                        inference_ms,
                    },
                );
                StageOutcome::Success
            }
            Err(e) => StageOutcome::Error(e.to_string()),
        }
    }

    fn cleanup(&mut self) {
        self.backend = None;
    }
}

/// Brightness-driven stand-in for a real detector
///
/// Reports one object of `class_id` whenever enough sampled pixels are
/// brighter than `bright_level`, with confidence proportional to coverage.
#[cfg(feature = "synthetic")]
pub struct SyntheticDetector {
    class_id: u32,
    bright_level: u8,
    min_coverage: f64,
    latency: std::time::Duration,
}

#[cfg(feature = "synthetic")]
impl SyntheticDetector {
    pub fn new(class_id: u32) -> Self {
        Self {
            class_id,
            bright_level: 192,
            min_coverage: 0.02,
            latency: std::time::Duration::ZERO,
        }
    }

    /// Simulated accelerator time per inference
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[cfg(feature = "synthetic")]
impl InferenceBackend for SyntheticDetector {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn infer(&mut self, _meta: &FrameMeta, pixels: &[u8]) -> Result<Vec<Detection>> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if pixels.is_empty() {
            return Ok(Vec::new());
        }
        let samples = pixels.iter().step_by(16).count().max(1);
        let bright = pixels
            .iter()
            .step_by(16)
            .filter(|&&p| p >= self.bright_level)
            .count();
        let coverage = bright as f64 / samples as f64;
        if coverage < self.min_coverage {
            return Ok(Vec::new());
        }
        let confidence = (0.5 + coverage * 4.0).min(0.99) as f32;
        Ok(vec![
            Detection::new(self.class_id, confidence).with_bbox(0.0, 0.0, coverage as f32, 1.0)
        ])
    }
}
