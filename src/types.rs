//! Core data types shared across edge-arbiter
//!
//! # Main Types
//!
//! - [`SourceId`] - Stable identifier of an edge source (one camera, one process)
//! - [`GuaranteeTier`] - Delivery-guarantee tier attached to every outbound message
//! - [`Detection`] - A single object reported by the inference stage
//! - [`FrameRequest`] - Coordinator request for a full-resolution artifact
//!
//! Timestamps inside the crate are milliseconds since the Unix epoch as
//! reported by a [`Clock`](crate::clock::Clock). Conversions to `chrono`
//! values happen only at the wire boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Delivery-guarantee tier requested from the transport
///
/// Ordered from weakest to strongest. Retry-queue eviction removes the
/// weakest tier first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeTier {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl GuaranteeTier {
    /// All tiers, weakest first
    pub const ALL: [GuaranteeTier; 3] = [
        GuaranteeTier::AtMostOnce,
        GuaranteeTier::AtLeastOnce,
        GuaranteeTier::ExactlyOnce,
    ];

    /// Numeric level as understood by MQTT-style brokers
    pub fn level(self) -> u8 {
        match self {
            GuaranteeTier::AtMostOnce => 0,
            GuaranteeTier::AtLeastOnce => 1,
            GuaranteeTier::ExactlyOnce => 2,
        }
    }

    /// Array index for per-tier counters
    pub fn index(self) -> usize {
        self.level() as usize
    }
}

impl fmt::Display for GuaranteeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuaranteeTier::AtMostOnce => write!(f, "at-most-once"),
            GuaranteeTier::AtLeastOnce => write!(f, "at-least-once"),
            GuaranteeTier::ExactlyOnce => write!(f, "exactly-once"),
        }
    }
}

/// A detected object in normalized frame coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class index in the model's label set (COCO for the default model)
    pub class_id: u32,
    /// Confidence in `[0, 1]`
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32) -> Self {
        Self {
            class_id,
            confidence,
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
        }
    }

    pub fn with_bbox(mut self, x: f32, y: f32, width: f32, height: f32) -> Self {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self
    }
}

/// Why the coordinator asked a source for a full artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    HighMotion,
    ClassOfInterest,
    SceneChange,
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::HighMotion => write!(f, "high_motion"),
            TriggerReason::ClassOfInterest => write!(f, "class_of_interest"),
            TriggerReason::SceneChange => write!(f, "scene_change"),
            TriggerReason::Manual => write!(f, "manual"),
        }
    }
}

/// Request for a full-resolution artifact, routed from the coordinator back to a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRequest {
    pub request_id: String,
    pub source_id: SourceId,
    pub reason: TriggerReason,
    /// Tick that caused the request
    pub tick_id: u64,
    pub requested_at_ms: u64,
}

/// Convert epoch milliseconds into a UTC timestamp
///
/// Out-of-range values clamp to the Unix epoch.
pub fn timestamp_from_ms(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(GuaranteeTier::AtMostOnce < GuaranteeTier::AtLeastOnce);
        assert!(GuaranteeTier::AtLeastOnce < GuaranteeTier::ExactlyOnce);
        assert_eq!(GuaranteeTier::ExactlyOnce.level(), 2);
    }

    #[test]
    fn test_source_id_serializes_as_string() {
        let id = SourceId::new("cam3");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"cam3\"");
    }

    #[test]
    fn test_timestamp_from_ms() {
        let ts = timestamp_from_ms(1_500);
        assert_eq!(ts.timestamp_millis(), 1_500);
    }
}
