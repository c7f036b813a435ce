//! Time-division geometry
//!
//! A cycle of `cycle_duration_ms` is split into `max_sources` windows of
//! `slot_duration_ms`. Source `i` owns `[i * slot, (i + 1) * slot)` of every
//! cycle, measured on the shared wall clock.

use crate::config::ScheduleSettings;
use crate::error::{ArbiterError, Result};
use crate::types::SourceId;
use serde::{Deserialize, Serialize};

/// Slot assigned to one source at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSlot {
    pub source_id: SourceId,
    pub slot_index: usize,
    pub slot_offset_ms: u64,
}

impl SourceSlot {
    /// Lock holder id for this slot; never zero
    pub fn holder_id(&self) -> u16 {
        (self.slot_index as u16).wrapping_add(1).max(1)
    }
}

/// Cycle geometry shared by every source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleCycle {
    pub cycle_duration_ms: u64,
    pub slot_duration_ms: u64,
    pub max_sources: usize,
}

impl ScheduleCycle {
    /// Build a cycle, rejecting geometry where windows would not fit
    pub fn new(cycle_duration_ms: u64, slot_duration_ms: u64, max_sources: usize) -> Result<Self> {
        if slot_duration_ms == 0 || cycle_duration_ms == 0 || max_sources == 0 {
            return Err(ArbiterError::ConfigInvalid(
                "slot duration, cycle duration and source count must be non-zero".to_string(),
            ));
        }
        if max_sources > u16::MAX as usize - 1 {
            return Err(ArbiterError::ConfigInvalid(format!(
                "max_sources {} is too large",
                max_sources
            )));
        }
        let needed = (max_sources as u64).saturating_mul(slot_duration_ms);
        if needed > cycle_duration_ms {
            return Err(ArbiterError::ConfigInvalid(format!(
                "{} sources x {} ms slots do not fit in a {} ms cycle",
                max_sources, slot_duration_ms, cycle_duration_ms
            )));
        }
        Ok(Self {
            cycle_duration_ms,
            slot_duration_ms,
            max_sources,
        })
    }

    pub fn from_settings(settings: &ScheduleSettings) -> Result<Self> {
        Self::new(
            settings.cycle_duration_ms,
            settings.slot_duration_ms,
            settings.max_sources,
        )
    }

    pub fn offset_for(&self, slot_index: usize) -> u64 {
        slot_index as u64 * self.slot_duration_ms
    }

    /// Position of `now_ms` inside the current cycle
    pub fn phase(&self, now_ms: u64) -> u64 {
        now_ms % self.cycle_duration_ms
    }

    /// Minimal forward wait until the window starting at `offset_ms` is open
    ///
    /// Returns zero when `now_ms` is already inside the window.
    pub fn wait_ms(&self, offset_ms: u64, now_ms: u64) -> u64 {
        let phase = self.phase(now_ms);
        if phase < offset_ms {
            offset_ms - phase
        } else if phase >= offset_ms + self.slot_duration_ms {
            self.cycle_duration_ms - phase + offset_ms
        } else {
            0
        }
    }

    /// Index of the window containing `now_ms`, if any
    ///
    /// Trailing time after the last window belongs to nobody.
    pub fn active_index(&self, now_ms: u64) -> Option<usize> {
        let index = (self.phase(now_ms) / self.slot_duration_ms) as usize;
        (index < self.max_sources).then_some(index)
    }
}
