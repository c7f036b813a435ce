//! Configuration module for edge-arbiter
//!
//! A single TOML file describes the slot schedule, the per-tick pipeline, the
//! publisher, the coordinator-side trigger policy and the list of sources.
//! Values are layered:
//!
//! 1. Built-in defaults (every field has one)
//! 2. The TOML file
//! 3. `EDGE_ARBITER_*` environment variables for the common tunables
//!
//! [`ArbiterConfig::validate`] runs once at startup; an invalid file is the
//! only fatal configuration error.
//!
//! # Example
//!
//! ```toml
//! [schedule]
//! slot_duration_ms = 200
//! cycle_duration_ms = 1000
//! max_sources = 5
//! mode = "locked"
//!
//! [scene]
//! cooldown_seconds = 60
//! motion_threshold = 0.7
//!
//! [[sources]]
//! id = "cam1"
//! slot_index = 0
//!
//! [stages.detection]
//! confidence_threshold = 0.4
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{ArbiterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Application identifier for the platform config directory
pub const APP_ID: &str = "edge-arbiter";

/// Config filename looked up in the platform config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "EDGE_ARBITER_CONFIG";

/// Default accelerator window per source
pub const DEFAULT_SLOT_DURATION_MS: u64 = 200;

/// Default schedule cycle
pub const DEFAULT_CYCLE_DURATION_MS: u64 = 1000;

/// Default number of sources sharing one accelerator
pub const DEFAULT_MAX_SOURCES: usize = 5;

/// Default per-stage time budget
pub const DEFAULT_STAGE_BUDGET_MS: u64 = 100;

/// Default retry ring capacity
pub const DEFAULT_RETRY_QUEUE_DEPTH: usize = 1000;

/// Default scene memory depth per source
pub const DEFAULT_SCENE_MEMORY_DEPTH: usize = 30;

/// Default trigger cooldown
pub const DEFAULT_COOLDOWN_SECONDS: u64 = 60;

/// Default motion score that requests a frame
pub const DEFAULT_MOTION_THRESHOLD: f64 = 0.7;

// ==================== Config Path ====================

/// Default config path in the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Resolve which config file to use
///
/// An explicit path wins, then `EDGE_ARBITER_CONFIG`, then the platform
/// default if that file exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    default_config_path().filter(|p| p.exists())
}

// ==================== Arbiter Config ====================

/// Complete configuration of one edge-arbiter process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub schedule: ScheduleSettings,
    pub pipeline: PipelineSettings,
    pub capture: CaptureSettings,
    pub publisher: PublisherSettings,
    pub scene: SceneSettings,
    pub correlator: CorrelatorSettings,
    pub coordinator: CoordinatorSettings,
    pub logging: LoggingSettings,
    pub sources: Vec<SourceSettings>,
    /// Free-form per-stage tables, keyed by stage name
    pub stages: BTreeMap<String, toml::Table>,
}

impl ArbiterConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ArbiterError::ConfigInvalid(format!("Failed to parse config: {}", e)))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArbiterError::ConfigInvalid(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            ArbiterError::ConfigInvalid(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Load a configuration file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ArbiterError::ConfigInvalid(format!(
                        "Failed to create config directory: {}",
                        e
                    ))
                })?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            ArbiterError::ConfigInvalid(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content)
            .map_err(|e| ArbiterError::ConfigInvalid(format!("Failed to write config: {}", e)))
    }

    /// Apply `EDGE_ARBITER_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using an arbitrary lookup
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Option<T> {
            match value.parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring unparseable override {}={:?}", key, value);
                    None
                }
            }
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(value) = lookup($key) {
                    if let Some(parsed) = parse($key, value) {
                        $field = parsed;
                    }
                }
            };
        }

        override_field!(
            "EDGE_ARBITER_SCHEDULE_SLOT_DURATION_MS",
            self.schedule.slot_duration_ms
        );
        override_field!(
            "EDGE_ARBITER_SCHEDULE_CYCLE_DURATION_MS",
            self.schedule.cycle_duration_ms
        );
        override_field!("EDGE_ARBITER_SCHEDULE_MAX_SOURCES", self.schedule.max_sources);
        override_field!(
            "EDGE_ARBITER_PUBLISHER_RETRY_QUEUE_DEPTH",
            self.publisher.retry_queue_depth
        );
        override_field!(
            "EDGE_ARBITER_SCENE_COOLDOWN_SECONDS",
            self.scene.cooldown_seconds
        );
        override_field!(
            "EDGE_ARBITER_SCENE_MEMORY_DEPTH",
            self.scene.scene_memory_depth
        );
        override_field!(
            "EDGE_ARBITER_SCENE_MOTION_THRESHOLD",
            self.scene.motion_threshold
        );
        override_field!(
            "EDGE_ARBITER_CORRELATOR_CLOCK_TOLERANCE_SECONDS",
            self.correlator.clock_tolerance_seconds
        );

        if let Some(value) = lookup("EDGE_ARBITER_PUBLISHER_RETRY_BACKOFF_SCHEDULE_MS") {
            let parsed: std::result::Result<Vec<u64>, _> = value
                .split(',')
                .map(|s| s.trim().parse::<u64>())
                .collect();
            match parsed {
                Ok(schedule) => self.publisher.retry_backoff_schedule_ms = schedule,
                Err(_) => tracing::warn!(
                    "Ignoring unparseable override EDGE_ARBITER_PUBLISHER_RETRY_BACKOFF_SCHEDULE_MS={:?}",
                    value
                ),
            }
        }

        if let Some(level) = lookup("EDGE_ARBITER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Check every cross-field invariant
    pub fn validate(&self) -> Result<()> {
        let s = &self.schedule;
        if s.slot_duration_ms == 0 {
            return invalid("schedule.slot_duration_ms must be greater than 0");
        }
        if s.cycle_duration_ms == 0 {
            return invalid("schedule.cycle_duration_ms must be greater than 0");
        }
        if s.max_sources == 0 {
            return invalid("schedule.max_sources must be greater than 0");
        }
        let needed = (s.max_sources as u64).saturating_mul(s.slot_duration_ms);
        if needed > s.cycle_duration_ms {
            return invalid(format!(
                "schedule: {} sources x {} ms slots = {} ms exceeds the {} ms cycle",
                s.max_sources, s.slot_duration_ms, needed, s.cycle_duration_ms
            ));
        }
        if s.mode == ArbitrationMode::Locked && s.lock_ttl_ms == 0 {
            return invalid("schedule.lock_ttl_ms must be greater than 0 in locked mode");
        }
        if s.lock_poll_interval_ms == 0 {
            return invalid("schedule.lock_poll_interval_ms must be greater than 0");
        }

        if self.pipeline.tick_period_ms == 0 {
            return invalid("pipeline.tick_period_ms must be greater than 0");
        }
        if self.pipeline.stage_budget_ms == 0 {
            return invalid("pipeline.stage_budget_ms must be greater than 0");
        }

        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture.width and capture.height must be greater than 0");
        }

        let p = &self.publisher;
        if p.retry_queue_depth == 0 {
            return invalid("publisher.retry_queue_depth must be greater than 0");
        }
        if p.retry_backoff_schedule_ms.is_empty() {
            return invalid("publisher.retry_backoff_schedule_ms must not be empty");
        }
        if p.publish_timeout_ms == 0 {
            return invalid("publisher.publish_timeout_ms must be greater than 0");
        }
        if p.heartbeat_interval_ms == 0 {
            return invalid("publisher.heartbeat_interval_ms must be greater than 0");
        }

        let sc = &self.scene;
        if sc.scene_memory_depth == 0 {
            return invalid("scene.scene_memory_depth must be greater than 0");
        }
        if !(0.0..=1.0).contains(&sc.motion_threshold) {
            return invalid("scene.motion_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&sc.class_confidence_threshold) {
            return invalid("scene.class_confidence_threshold must be within [0, 1]");
        }

        let c = &self.correlator;
        if !c.clock_tolerance_seconds.is_finite() || c.clock_tolerance_seconds < 0.0 {
            return invalid("correlator.clock_tolerance_seconds must be a non-negative number");
        }
        if !c.default_offset_uncertainty_seconds.is_finite()
            || c.default_offset_uncertainty_seconds < 0.0
        {
            return invalid(
                "correlator.default_offset_uncertainty_seconds must be a non-negative number",
            );
        }

        if self.coordinator.ingest_capacity == 0 {
            return invalid("coordinator.ingest_capacity must be greater than 0");
        }

        let mut ids = HashSet::new();
        let mut indices = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return invalid("sources: id must not be empty");
            }
            if !ids.insert(source.id.as_str()) {
                return invalid(format!("sources: duplicate id '{}'", source.id));
            }
            if source.slot_index >= s.max_sources {
                return invalid(format!(
                    "sources: '{}' has slot_index {} but max_sources is {}",
                    source.id, source.slot_index, s.max_sources
                ));
            }
            if !indices.insert(source.slot_index) {
                return invalid(format!(
                    "sources: slot_index {} assigned twice",
                    source.slot_index
                ));
            }
        }

        Ok(())
    }

    /// Configured sources, or one per slot named `cam0..` when none are listed
    pub fn effective_sources(&self) -> Vec<SourceSettings> {
        if !self.sources.is_empty() {
            return self.sources.clone();
        }
        (0..self.schedule.max_sources)
            .map(|i| SourceSettings::new(format!("cam{}", i), i))
            .collect()
    }

    /// Per-stage table for `stage`, empty if not configured
    pub fn stage_table(&self, stage: &str) -> toml::Table {
        self.stages.get(stage).cloned().unwrap_or_default()
    }
}

fn invalid(message: impl Into<String>) -> Result<()> {
    Err(ArbiterError::ConfigInvalid(message.into()))
}
