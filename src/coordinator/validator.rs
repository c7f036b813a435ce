//! Per-source sequence validation.
//!
//! The expected sequence is `(last + 1) mod 2^32`. Anything else is a gap of
//! `(received - expected) mod 2^32`, reported once, after which the received
//! sequence becomes the new baseline. Gaps are observational only.

use crate::error::ArbiterError;
use crate::types::SourceId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A detected hole in one source's sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceGapEvent {
    pub source_id: SourceId,
    pub expected: u32,
    pub received: u32,
    pub gap: u32,
}

impl From<&SequenceGapEvent> for ArbiterError {
    fn from(gap: &SequenceGapEvent) -> Self {
        ArbiterError::SequenceGap {
            source_id: gap.source_id.clone(),
            expected: gap.expected,
            received: gap.received,
            gap: gap.gap,
        }
    }
}

/// Result of validating one sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First message seen from this source
    First,
    InOrder,
    Gap(SequenceGapEvent),
}

impl SequenceCheck {
    pub fn ok(&self) -> bool {
        !matches!(self, SequenceCheck::Gap(_))
    }

    pub fn gap_size(&self) -> u32 {
        match self {
            SequenceCheck::Gap(event) => event.gap,
            _ => 0,
        }
    }
}

/// Per-source counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceStats {
    pub messages: u64,
    pub gaps: u64,
    /// Sum of all gap sizes
    pub missing: u64,
    pub last_sequence: Option<u32>,
}

#[derive(Debug, Default)]
struct SequenceState {
    last_sequence: Option<u32>,
    stats: SequenceStats,
}

#[derive(Debug, Default)]
pub struct IngestValidator {
    sources: RwLock<HashMap<SourceId, Arc<Mutex<SequenceState>>>>,
    total_gaps: AtomicU64,
}

impl IngestValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, source_id: &SourceId) -> Arc<Mutex<SequenceState>> {
        if let Ok(sources) = self.sources.read() {
            if let Some(state) = sources.get(source_id) {
                return state.clone();
            }
        }
        match self.sources.write() {
            Ok(mut sources) => sources.entry(source_id.clone()).or_default().clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(source_id.clone())
                .or_default()
                .clone(),
        }
    }

    /// Check `sequence` against the source's last one and adopt it
    pub fn validate(&self, source_id: &SourceId, sequence: u32) -> SequenceCheck {
        let state = self.state(source_id);
        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let check = match state.last_sequence {
            None => SequenceCheck::First,
            Some(last) => {
                let expected = last.wrapping_add(1);
                if sequence == expected {
                    SequenceCheck::InOrder
                } else {
                    SequenceCheck::Gap(SequenceGapEvent {
                        source_id: source_id.clone(),
                        expected,
                        received: sequence,
                        gap: sequence.wrapping_sub(expected),
                    })
                }
            }
        };

        state.last_sequence = Some(sequence);
        state.stats.messages += 1;
        state.stats.last_sequence = Some(sequence);
        if let SequenceCheck::Gap(event) = &check {
            state.stats.gaps += 1;
            state.stats.missing += event.gap as u64;
            self.total_gaps.fetch_add(1, Ordering::Relaxed);
        }
        check
    }

    /// Forget the baseline, e.g. after the source restarted
    pub fn reset(&self, source_id: &SourceId) {
        let state = self.state(source_id);
        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.last_sequence = None;
    }

    pub fn stats(&self, source_id: &SourceId) -> Option<SequenceStats> {
        let sources = self.sources.read().ok()?;
        let state = sources.get(source_id)?.lock().ok()?;
        Some(state.stats)
    }

    pub fn all_stats(&self) -> Vec<(SourceId, SequenceStats)> {
        let Ok(sources) = self.sources.read() else {
            return Vec::new();
        };
        let mut out: Vec<_> = sources
            .iter()
            .filter_map(|(id, state)| state.lock().ok().map(|s| (id.clone(), s.stats)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn total_gaps(&self) -> u64 {
        self.total_gaps.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_converts_to_error() {
        let v = IngestValidator::new();
        let cam = SourceId::new("cam1");
        v.validate(&cam, 10);
        let SequenceCheck::Gap(gap) = v.validate(&cam, 14) else {
            panic!("expected a gap");
        };
        let err = ArbiterError::from(&gap);
        assert!(matches!(
            err,
            ArbiterError::SequenceGap { expected: 11, received: 14, gap: 3, .. }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_single_gap_detected_once() {
        let v = IngestValidator::new();
        let cam = SourceId::new("cam1");

        let results: Vec<SequenceCheck> = [10, 11, 12, 14]
            .iter()
            .map(|&s| v.validate(&cam, s))
            .collect();

        assert_eq!(results[0], SequenceCheck::First);
        assert_eq!(results[1], SequenceCheck::InOrder);
        assert_eq!(results[2], SequenceCheck::InOrder);
        assert_eq!(
            results[3],
            SequenceCheck::Gap(SequenceGapEvent {
                source_id: cam.clone(),
                expected: 13,
                received: 14,
                gap: 1,
            })
        );

        let stats = v.stats(&cam).unwrap();
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(v.total_gaps(), 1);

        // Baseline moved to 14
        assert!(v.validate(&cam, 15).ok());
    }

    #[test]
    fn test_wraparound_is_in_order() {
        let v = IngestValidator::new();
        let cam = SourceId::new("cam1");
        v.validate(&cam, u32::MAX - 1);
        assert_eq!(v.validate(&cam, u32::MAX), SequenceCheck::InOrder);
        assert_eq!(v.validate(&cam, 0), SequenceCheck::InOrder);
        assert_eq!(v.validate(&cam, 3).gap_size(), 2);
    }

    #[test]
    fn test_gap_across_wrap() {
        let v = IngestValidator::new();
        let cam = SourceId::new("cam1");
        v.validate(&cam, u32::MAX - 1);
        // expected u32::MAX, got 1: missing u32::MAX and 0
        assert_eq!(v.validate(&cam, 1).gap_size(), 2);
    }

    #[test]
    fn test_sources_are_independent() {
        let v = IngestValidator::new();
        let a = SourceId::new("a");
        let b = SourceId::new("b");
        v.validate(&a, 0);
        v.validate(&b, 100);
        assert!(v.validate(&a, 1).ok());
        assert!(v.validate(&b, 101).ok());
        assert_eq!(v.all_stats().len(), 2);
    }

    #[test]
    fn test_reset_starts_fresh_baseline() {
        let v = IngestValidator::new();
        let cam = SourceId::new("cam1");
        v.validate(&cam, 500);
        v.reset(&cam);
        assert_eq!(v.validate(&cam, 0), SequenceCheck::First);
        assert_eq!(v.total_gaps(), 0);
    }

    #[test]
    fn test_backwards_sequence_is_large_gap() {
        let v = IngestValidator::new();
        let cam = SourceId::new("cam1");
        v.validate(&cam, 10);
        let check = v.validate(&cam, 5);
        assert_eq!(check.gap_size(), 5u32.wrapping_sub(11));
    }
}
