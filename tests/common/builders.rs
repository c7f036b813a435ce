//! Test data builders for creating test objects

use edge_arbiter::config::{ArbiterConfig, ArbitrationMode, SourceSettings};
use edge_arbiter::pipeline::{PipelineRecord, StageOutput};
use edge_arbiter::types::{Detection, SourceId};

/// Builder for per-tick records as a source would publish them
pub struct RecordBuilder {
    record: PipelineRecord,
}

impl RecordBuilder {
    pub fn new(source: &str, tick_id: u64) -> Self {
        Self {
            record: PipelineRecord::new(SourceId::new(source), tick_id, 1_000 * tick_id),
        }
    }

    pub fn timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.record.timestamp_ms = timestamp_ms;
        self
    }

    pub fn motion(mut self, score: f64) -> Self {
        self.record.insert("motion", StageOutput::Motion { score });
        self
    }

    pub fn scene_hash(mut self, hash: u32) -> Self {
        self.record.insert("scene_hash", StageOutput::SceneHash { hash });
        self
    }

    pub fn detection(mut self, class_id: u32, confidence: f32) -> Self {
        let mut detections = self.record.detections().to_vec();
        detections.push(Detection::new(class_id, confidence));
        self.record.insert(
            "detection",
            StageOutput::Detections {
                detections,
                inference_ms: 5,
            },
        );
        self
    }

    pub fn build(self) -> PipelineRecord {
        self.record
    }
}

/// Builder for small, fast configurations
pub struct ConfigBuilder {
    config: ArbiterConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = ArbiterConfig::default();
        config.publisher.heartbeat_interval_ms = 60_000;
        Self { config }
    }

    /// `count` sources sharing a cycle of `slot_ms * count`
    pub fn sources(mut self, count: usize, slot_ms: u64) -> Self {
        self.config.schedule.max_sources = count;
        self.config.schedule.slot_duration_ms = slot_ms;
        self.config.schedule.cycle_duration_ms = slot_ms * count as u64;
        self.config.pipeline.tick_period_ms = slot_ms * count as u64;
        self.config.sources = (0..count)
            .map(|i| SourceSettings::new(format!("cam{}", i), i))
            .collect();
        self
    }

    pub fn locked(mut self, ttl_ms: u64) -> Self {
        self.config.schedule.mode = ArbitrationMode::Locked;
        self.config.schedule.lock_ttl_ms = ttl_ms;
        self.config.schedule.lock_poll_interval_ms = 1;
        self
    }

    pub fn backoff(mut self, schedule_ms: &[u64]) -> Self {
        self.config.publisher.retry_backoff_schedule_ms = schedule_ms.to_vec();
        self
    }

    pub fn retry_depth(mut self, depth: usize) -> Self {
        self.config.publisher.retry_queue_depth = depth;
        self
    }

    pub fn build(self) -> ArbiterConfig {
        self.config
            .validate()
            .expect("test configuration should validate");
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = RecordBuilder::new("cam1", 3)
            .motion(0.5)
            .scene_hash(7)
            .detection(2, 0.9)
            .build();

        assert_eq!(record.tick_id, 3);
        assert_eq!(record.motion_score(), Some(0.5));
        assert_eq!(record.scene_hash(), Some(7));
        assert_eq!(record.detections().len(), 1);
    }

    #[test]
    fn test_config_builder_is_valid() {
        let config = ConfigBuilder::new().sources(4, 50).locked(100).build();
        assert_eq!(config.schedule.cycle_duration_ms, 200);
        assert_eq!(config.effective_sources().len(), 4);
    }
}
