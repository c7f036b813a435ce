//! Cross-source time correlation.
//!
//! Every source stamps events with its own clock. Calibration (an external
//! input) supplies an offset per source; the corrected time of an event is
//! `raw - offset_seconds`. Two events correlate when their corrected times are
//! within the tolerance once both offsets' error bounds are accounted for:
//!
//! ```text
//! |corrected_a - corrected_b| + uncertainty_a + uncertainty_b <= tolerance
//! ```
//!
//! Calibrations older than `offset_stale_after_seconds` are still applied but
//! counted and logged as stale. Uncalibrated sources use offset 0.

use crate::clock::SharedClock;
use crate::config::CorrelatorSettings;
use crate::error::{ArbiterError, Result};
use crate::types::{timestamp_from_ms, SourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockOffset {
    /// Source clock minus reference clock
    pub offset_seconds: f64,
    pub calibrated_at: DateTime<Utc>,
    /// Error bound of `offset_seconds`
    pub uncertainty_seconds: f64,
}

impl ClockOffset {
    pub fn new(offset_seconds: f64, calibrated_at: DateTime<Utc>, uncertainty_seconds: f64) -> Self {
        Self {
            offset_seconds,
            calibrated_at,
            uncertainty_seconds,
        }
    }
}

/// An event stamped by a source's own clock
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    pub source_id: SourceId,
    pub timestamp_seconds: f64,
}

impl TimedEvent {
    pub fn new(source_id: impl Into<SourceId>, timestamp_seconds: f64) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp_seconds,
        }
    }

    pub fn from_ms(source_id: SourceId, timestamp_ms: u64) -> Self {
        Self {
            source_id,
            timestamp_seconds: timestamp_ms as f64 / 1000.0,
        }
    }
}

pub struct TimeCorrelator {
    offsets: RwLock<HashMap<SourceId, ClockOffset>>,
    tolerance_bits: AtomicU64,
    stale_after_seconds: i64,
    default_uncertainty: f64,
    clock: SharedClock,
    stale_uses: AtomicU64,
}

impl TimeCorrelator {
    pub fn new(settings: &CorrelatorSettings, clock: SharedClock) -> Self {
        Self {
            offsets: RwLock::new(HashMap::new()),
            tolerance_bits: AtomicU64::new(settings.clock_tolerance_seconds.to_bits()),
            stale_after_seconds: settings.offset_stale_after_seconds as i64,
            default_uncertainty: settings.default_offset_uncertainty_seconds,
            clock,
            stale_uses: AtomicU64::new(0),
        }
    }

    pub fn tolerance_seconds(&self) -> f64 {
        f64::from_bits(self.tolerance_bits.load(Ordering::Relaxed))
    }

    pub fn set_tolerance(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ArbiterError::ConfigInvalid(format!(
                "clock tolerance must be a non-negative number, got {}",
                seconds
            )));
        }
        self.tolerance_bits
            .store(seconds.to_bits(), Ordering::Relaxed);
        tracing::info!("Correlation tolerance now {:.3} s", seconds);
        Ok(())
    }

    /// Store a calibration with an explicit error bound
    pub fn calibrate(&self, source_id: SourceId, offset: ClockOffset) {
        tracing::info!(
            "Calibrated {}: offset {:+.3} s (±{:.3} s)",
            source_id,
            offset.offset_seconds,
            offset.uncertainty_seconds
        );
        match self.offsets.write() {
            Ok(mut offsets) => {
                offsets.insert(source_id, offset);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(source_id, offset);
            }
        }
    }

    /// Store a calibration taken now with the default error bound
    pub fn calibrate_now(&self, source_id: SourceId, offset_seconds: f64) {
        let offset = ClockOffset::new(
            offset_seconds,
            timestamp_from_ms(self.clock.now_ms()),
            self.default_uncertainty,
        );
        self.calibrate(source_id, offset);
    }

    pub fn offset(&self, source_id: &SourceId) -> Option<ClockOffset> {
        self.offsets.read().ok()?.get(source_id).copied()
    }

    pub fn is_stale(&self, offset: &ClockOffset) -> bool {
        let now = timestamp_from_ms(self.clock.now_ms());
        (now - offset.calibrated_at).num_seconds() > self.stale_after_seconds
    }

    /// Offset and uncertainty to apply for `source_id`
    fn correction(&self, source_id: &SourceId) -> (f64, f64) {
        match self.offset(source_id) {
            Some(offset) => {
                if self.is_stale(&offset) {
                    self.stale_uses.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Clock offset for {} is stale (calibrated {}), correlation degraded",
                        source_id,
                        offset.calibrated_at
                    );
                }
                (offset.offset_seconds, offset.uncertainty_seconds)
            }
            None => {
                tracing::debug!("No calibration for {}, assuming offset 0", source_id);
                (0.0, self.default_uncertainty)
            }
        }
    }

    /// Event time on the reference clock
    pub fn corrected_seconds(&self, event: &TimedEvent) -> f64 {
        event.timestamp_seconds - self.correction(&event.source_id).0
    }

    pub fn correlate(&self, a: &TimedEvent, b: &TimedEvent) -> bool {
        let (offset_a, uncertainty_a) = self.correction(&a.source_id);
        let (offset_b, uncertainty_b) = self.correction(&b.source_id);
        let delta = (a.timestamp_seconds - offset_a) - (b.timestamp_seconds - offset_b);
        delta.abs() + uncertainty_a + uncertainty_b <= self.tolerance_seconds()
    }

    /// Correlations made with a stale offset
    pub fn stale_uses(&self) -> u64 {
        self.stale_uses.load(Ordering::Relaxed)
    }
}
