//! Per-tick aggregate record
//!
//! One [`PipelineRecord`] is created per tick, filled by stages in priority
//! order and handed by value to the publisher, its only consumer. It is not
//! `Clone`.

use crate::types::{Detection, SourceId, TriggerReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full-resolution artifact answering a coordinator request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub request_id: String,
    pub reason: TriggerReason,
    pub width: u32,
    pub height: u32,
    /// Pixel format of the decoded bytes
    pub format: String,
    /// Base64 of the pixel bytes
    pub data: String,
}

/// Structured output of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Motion {
        score: f64,
    },
    SceneHash {
        hash: u32,
    },
    Detections {
        detections: Vec<Detection>,
        inference_ms: u64,
    },
    Artifact(ArtifactPayload),
    Custom {
        value: serde_json::Value,
    },
}

/// Everything one tick produced for one source
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub source_id: SourceId,
    pub tick_id: u64,
    pub timestamp_ms: u64,
    /// Accelerator stages ran without exclusive access
    #[serde(default)]
    pub degraded: bool,
    /// Keyed by stage name
    pub outputs: BTreeMap<String, StageOutput>,
}

impl PipelineRecord {
    pub fn new(source_id: SourceId, tick_id: u64, timestamp_ms: u64) -> Self {
        Self {
            source_id,
            tick_id,
            timestamp_ms,
            degraded: false,
            outputs: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, stage: impl Into<String>, output: StageOutput) {
        self.outputs.insert(stage.into(), output);
    }

    pub fn get(&self, stage: &str) -> Option<&StageOutput> {
        self.outputs.get(stage)
    }

    pub fn remove(&mut self, stage: &str) -> Option<StageOutput> {
        self.outputs.remove(stage)
    }

    pub fn motion_score(&self) -> Option<f64> {
        self.outputs.values().find_map(|o| match o {
            StageOutput::Motion { score } => Some(*score),
            _ => None,
        })
    }

    pub fn scene_hash(&self) -> Option<u32> {
        self.outputs.values().find_map(|o| match o {
            StageOutput::SceneHash { hash } => Some(*hash),
            _ => None,
        })
    }

    pub fn detections(&self) -> &[Detection] {
        self.outputs
            .values()
            .find_map(|o| match o {
                StageOutput::Detections { detections, .. } => Some(detections.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn artifact(&self) -> Option<&ArtifactPayload> {
        self.outputs.values().find_map(|o| match o {
            StageOutput::Artifact(a) => Some(a),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
