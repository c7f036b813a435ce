//! Configuration sections
//!
//! Each table of the configuration file maps to one struct here. Every field
//! has a default so that a partial file, or no file at all, yields a working
//! configuration.
//!
//! # Sections
//!
//! - [`ScheduleSettings`] - Slot geometry and accelerator arbitration
//! - [`PipelineSettings`] - Tick cadence and per-stage budget
//! - [`CaptureSettings`] - Frame geometry of the synthetic capture
//! - [`PublisherSettings`] - Retry, queue and heartbeat behavior
//! - [`SceneSettings`] - Scene memory depth and trigger policy
//! - [`CorrelatorSettings`] - Clock tolerance for cross-source matching
//! - [`CoordinatorSettings`] - Liveness tracking
//! - [`LoggingSettings`] - Log filter and optional log file
//! - [`SourceSettings`] - One entry per source

use crate::types::GuaranteeTier;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{
    DEFAULT_COOLDOWN_SECONDS, DEFAULT_CYCLE_DURATION_MS, DEFAULT_MAX_SOURCES,
    DEFAULT_MOTION_THRESHOLD, DEFAULT_RETRY_QUEUE_DEPTH, DEFAULT_SCENE_MEMORY_DEPTH,
    DEFAULT_SLOT_DURATION_MS, DEFAULT_STAGE_BUDGET_MS,
};

// ==================== Schedule ====================

/// How the shared accelerator is arbitrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationMode {
    /// Sources trust the time-division schedule and never touch the lock
    #[default]
    TimeDivision,
    /// Time-division plus an exclusive lock with stale-holder reclaim
    Locked,
}

/// What a source does when it cannot get the accelerator within one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Run accelerator stages anyway and flag the tick as degraded
    #[default]
    ProceedDegraded,
    /// Report accelerator stages as not ready for this tick
    SkipInference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Width of each source's accelerator window
    pub slot_duration_ms: u64,
    /// Length of one full schedule cycle
    pub cycle_duration_ms: u64,
    /// Maximum number of sources sharing the accelerator
    pub max_sources: usize,
    pub mode: ArbitrationMode,
    /// A lock holder older than this is considered crashed
    pub lock_ttl_ms: u64,
    /// Poll interval while waiting on a held lock
    pub lock_poll_interval_ms: u64,
    pub overrun_policy: OverrunPolicy,
    /// Upper bound on tick period stretching after consecutive missed slots
    pub max_tick_backoff: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            slot_duration_ms: DEFAULT_SLOT_DURATION_MS,
            cycle_duration_ms: DEFAULT_CYCLE_DURATION_MS,
            max_sources: DEFAULT_MAX_SOURCES,
            mode: ArbitrationMode::default(),
            lock_ttl_ms: 2 * DEFAULT_SLOT_DURATION_MS,
            lock_poll_interval_ms: 5,
            overrun_policy: OverrunPolicy::default(),
            max_tick_backoff: 4,
        }
    }
}

impl ScheduleSettings {
    pub fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms)
    }

    pub fn cycle_duration(&self) -> Duration {
        Duration::from_millis(self.cycle_duration_ms)
    }
}

// ==================== Pipeline ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Base tick period of every source loop
    pub tick_period_ms: u64,
    /// Time budget for a single stage call
    pub stage_budget_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_period_ms: DEFAULT_CYCLE_DURATION_MS,
            stage_budget_ms: DEFAULT_STAGE_BUDGET_MS,
        }
    }
}

impl PipelineSettings {
    pub fn stage_budget(&self) -> Duration {
        Duration::from_millis(self.stage_budget_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

// ==================== Capture ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
        }
    }
}

// ==================== Publisher ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    /// Capacity of the local retry ring
    pub retry_queue_depth: usize,
    /// Delay before each local retry; its length is the retry count
    pub retry_backoff_schedule_ms: Vec<u64>,
    /// Timeout of a single publish attempt
    pub publish_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Tier applied to per-tick data messages
    pub data_tier: GuaranteeTier,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            retry_queue_depth: DEFAULT_RETRY_QUEUE_DEPTH,
            retry_backoff_schedule_ms: vec![1000, 2000, 4000],
            publish_timeout_ms: 2000,
            heartbeat_interval_ms: 5000,
            data_tier: GuaranteeTier::AtLeastOnce,
        }
    }
}

impl PublisherSettings {
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.retry_backoff_schedule_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect()
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// ==================== Scene Memory & Triggers ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSettings {
    /// Entries kept per source
    pub scene_memory_depth: usize,
    /// Minimum time between two frame requests for one source
    pub cooldown_seconds: u64,
    pub motion_threshold: f64,
    /// Class ids that request a frame when they newly appear
    pub classes_of_interest: Vec<u32>,
    pub class_confidence_threshold: f32,
    pub scene_change_enabled: bool,
    /// Hamming distance between scene hashes that counts as a change
    pub scene_change_min_distance: u32,
    /// Hashes that already caused a request are remembered to avoid repeats
    pub recent_hash_capacity: usize,
    pub frame_requests_enabled: bool,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            scene_memory_depth: DEFAULT_SCENE_MEMORY_DEPTH,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            // COCO car, bus, truck
            classes_of_interest: vec![2, 5, 7],
            class_confidence_threshold: 0.5,
            scene_change_enabled: true,
            scene_change_min_distance: 1,
            recent_hash_capacity: 16,
            frame_requests_enabled: true,
        }
    }
}

// ==================== Correlator ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    pub clock_tolerance_seconds: f64,
    /// Offsets older than this are still used but reported as stale
    pub offset_stale_after_seconds: u64,
    /// Error bound assumed for an offset when calibration supplies none
    pub default_offset_uncertainty_seconds: f64,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            clock_tolerance_seconds: 1.0,
            offset_stale_after_seconds: 3600,
            default_offset_uncertainty_seconds: 0.5,
        }
    }
}

// ==================== Coordinator ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// A source with no traffic for this long is reported silent
    pub liveness_timeout_ms: u64,
    /// Capacity of the channel between transport and coordinator
    pub ingest_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 15_000,
            ingest_capacity: 1024,
        }
    }
}

// ==================== Logging ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    /// Directory for daily rolling log files
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info,edge_arbiter=debug".to_string(),
            directory: None,
            file_prefix: "edge-arbiter.log".to_string(),
            ansi: true,
        }
    }
}

// ==================== Sources ====================

/// A source sharing the accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub id: String,
    /// Position in the time-division schedule
    pub slot_index: usize,
    /// Overrides `publisher.data_tier` for this source
    #[serde(default)]
    pub tier: Option<GuaranteeTier>,
}

impl SourceSettings {
    pub fn new(id: impl Into<String>, slot_index: usize) -> Self {
        Self {
            id: id.into(),
            slot_index,
            tier: None,
        }
    }
}
