//! Stage abstraction for the per-tick pipeline.
//!
//! Two-layer design:
//! - **`StagePlugin` trait**: for stages supplied outside this crate.
//! - **`BuiltinStage` enum**: for the built-in stages, dispatched without a
//!   vtable on the hot path.
//!
//! `AnyStage` wraps either variant so the executor can handle both uniformly.

use crate::capture::FrameView;
use crate::error::Result;
use crate::pipeline::record::PipelineRecord;
use crate::pipeline::stages::{ArtifactStage, DetectionStage, MotionStage, SceneHashStage};
use std::fmt;

/// Result of one stage call on one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// Nothing to do this tick; later stages still run
    Skip,
    /// A dependency is not available yet; later stages still run
    NotReady,
    /// The stage failed; the rest of this tick is abandoned
    Error(String),
}

impl StageOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, StageOutcome::Error(_))
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Success => write!(f, "success"),
            StageOutcome::Skip => write!(f, "skip"),
            StageOutcome::NotReady => write!(f, "not ready"),
            StageOutcome::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Per-stage configuration table from `[stages.<name>]`
#[derive(Debug, Clone, Default)]
pub struct StageConfig {
    table: toml::Table,
}

impl StageConfig {
    pub fn new(table: toml::Table) -> Self {
        Self { table }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.table.get(key) {
            Some(toml::Value::Float(v)) => *v,
            Some(toml::Value::Integer(v)) => *v as f64,
            _ => default,
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.table.get(key) {
            Some(toml::Value::Integer(v)) if *v >= 0 => *v as u64,
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.table.get(key) {
            Some(toml::Value::Boolean(v)) => *v,
            _ => default,
        }
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.table.get(key) {
            Some(toml::Value::String(v)) => v.as_str(),
            _ => default,
        }
    }
}

/// Context passed to a stage for one tick.
pub struct StageContext<'a> {
    /// Borrowed view of the tick's frame; the executor owns the frame.
    pub frame: FrameView<'a>,
    /// Aggregate record; stages write their output here.
    pub record: &'a mut PipelineRecord,
    pub tick_id: u64,
    pub timestamp_ms: u64,
    /// The accelerator grant for this tick was degraded.
    pub degraded: bool,
}

/// Trait for pluggable stages.
pub trait StagePlugin: Send {
    /// Unique name; also the key of this stage's output in the record.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Lower runs first.
    fn priority(&self) -> i32;

    /// Whether `process` needs the shared accelerator.
    fn requires_accelerator(&self) -> bool {
        false
    }

    /// Called once at startup. An error removes the stage from the chain.
    fn init(&mut self, _config: &StageConfig) -> Result<()> {
        Ok(())
    }

    /// Called after all stages are initialized, before the first tick.
    fn on_start(&mut self) {}

    fn process(&mut self, ctx: &mut StageContext) -> StageOutcome;

    /// Called at shutdown in chain order, before any cleanup.
    fn on_stop(&mut self) {}

    /// Called at shutdown in reverse chain order.
    fn cleanup(&mut self) {}
}

/// Enum dispatch for built-in stages.
pub enum BuiltinStage {
    Motion(MotionStage),
    SceneHash(SceneHashStage),
    Detection(DetectionStage),
    Artifact(ArtifactStage),
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $call:expr) => {
        match $self {
            BuiltinStage::Motion($s) => $call,
            BuiltinStage::SceneHash($s) => $call,
            BuiltinStage::Detection($s) => $call,
            BuiltinStage::Artifact($s) => $call,
        }
    };
}

impl BuiltinStage {
    pub fn name(&self) -> &str {
        dispatch!(self, s => s.name())
    }

    pub fn version(&self) -> &str {
        dispatch!(self, s => s.version())
    }

    pub fn priority(&self) -> i32 {
        dispatch!(self, s => s.priority())
    }

    pub fn requires_accelerator(&self) -> bool {
        dispatch!(self, s => s.requires_accelerator())
    }

    pub fn init(&mut self, config: &StageConfig) -> Result<()> {
        dispatch!(self, s => s.init(config))
    }

    pub fn on_start(&mut self) {
        dispatch!(self, s => s.on_start())
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
        dispatch!(self, s => s.process(ctx))
    }

    pub fn on_stop(&mut self) {
        dispatch!(self, s => s.on_stop())
    }

    pub fn cleanup(&mut self) {
        dispatch!(self, s => s.cleanup())
    }
}

/// Wrapper that holds either a built-in stage or a plugin.
pub enum AnyStage {
    Builtin(BuiltinStage),
    Plugin(Box<dyn StagePlugin>),
}

impl AnyStage {
    pub fn name(&self) -> &str {
        match self {
            AnyStage::Builtin(s) => s.name(),
            AnyStage::Plugin(s) => s.name(),
        }
    }

    pub fn version(&self) -> &str {
        match self {
            AnyStage::Builtin(s) => s.version(),
            AnyStage::Plugin(s) => s.version(),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            AnyStage::Builtin(s) => s.priority(),
            AnyStage::Plugin(s) => s.priority(),
        }
    }

    pub fn requires_accelerator(&self) -> bool {
        match self {
            AnyStage::Builtin(s) => s.requires_accelerator(),
            AnyStage::Plugin(s) => s.requires_accelerator(),
        }
    }

    pub fn init(&mut self, config: &StageConfig) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.init(config),
            AnyStage::Plugin(s) => s.init(config),
        }
    }

    pub fn on_start(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.on_start(),
            AnyStage::Plugin(s) => s.on_start(),
        }
    }

    pub fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
        match self {
            AnyStage::Builtin(s) => s.process(ctx),
            AnyStage::Plugin(s) => s.process(ctx),
        }
    }

    pub fn on_stop(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.on_stop(),
            AnyStage::Plugin(s) => s.on_stop(),
        }
    }

    pub fn cleanup(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.cleanup(),
            AnyStage::Plugin(s) => s.cleanup(),
        }
    }
}

impl From<BuiltinStage> for AnyStage {
    fn from(stage: BuiltinStage) -> Self {
        AnyStage::Builtin(stage)
    }
}

impl From<Box<dyn StagePlugin>> for AnyStage {
    fn from(stage: Box<dyn StagePlugin>) -> Self {
        AnyStage::Plugin(stage)
    }
}
