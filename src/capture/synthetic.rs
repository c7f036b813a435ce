//! Synthetic capture for running without camera hardware
//!
//! Generates 8-bit grayscale frames from a configurable pattern so that the
//! motion, scene-hash and trigger paths see realistic input:
//!
//! - [`SyntheticPattern::Static`] - Uniform frame, no motion
//! - [`SyntheticPattern::Noise`] - Static background with sensor noise
//! - [`SyntheticPattern::MovingBar`] - Bright vertical bar sweeping across the frame
//! - [`SyntheticPattern::SceneCut`] - Alternates between two scenes every N ticks
//!
//! # Example
//!
//! ```ignore
//! use edge_arbiter::capture::synthetic::{SyntheticCapture, SyntheticPattern};
//!
//! let mut capture = SyntheticCapture::new("cam0", 320, 240)
//!     .with_pattern(SyntheticPattern::MovingBar { width: 16, speed: 24 });
//! let frame = capture.capture(0, clock.now_ms())?;
//! ```

use super::{CaptureSource, CapturedFrame, FrameMeta, ReleaseCounter};
use crate::error::{ArbiterError, Result};
use serde::{Deserialize, Serialize};

/// Pattern for generating synthetic frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyntheticPattern {
    /// Every pixel has the same value
    Static { level: u8 },
    /// Mid-gray background with uniform noise of +/- `amplitude`
    Noise { amplitude: u8 },
    /// Vertical bar of `width` pixels moving `speed` pixels per tick
    MovingBar { width: u32, speed: u32 },
    /// Switch between a dark and a bright scene every `every_ticks` ticks
    SceneCut { every_ticks: u64 },
}

impl Default for SyntheticPattern {
    fn default() -> Self {
        SyntheticPattern::MovingBar {
            width: 16,
            speed: 24,
        }
    }
}

/// Capture source that renders [`SyntheticPattern`]s
pub struct SyntheticCapture {
    name: String,
    width: u32,
    height: u32,
    pattern: SyntheticPattern,
    /// Fail every Nth capture (0 = never), for exercising error paths
    fail_every: u64,
    rng_state: u64,
    releases: ReleaseCounter,
}

impl SyntheticCapture {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            pattern: SyntheticPattern::default(),
            fail_every: 0,
            rng_state: 0x2545_F491_4F6C_DD1D,
            releases: ReleaseCounter::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: SyntheticPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_state = seed.max(1);
        self
    }

    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    pub fn set_pattern(&mut self, pattern: SyntheticPattern) {
        self.pattern = pattern;
    }

    pub fn releases(&self) -> &ReleaseCounter {
        &self.releases
    }

    // xorshift64
    fn next_random(&mut self) -> u64 {
        let mut s = self.rng_state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng_state = s;
        s
    }

    fn render(&mut self, tick_id: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h];

        match self.pattern {
            SyntheticPattern::Static { level } => data.fill(level),
            SyntheticPattern::Noise { amplitude } => {
                let span = amplitude as u64 * 2 + 1;
                for px in data.iter_mut() {
                    let delta = (self.next_random() % span) as i16 - amplitude as i16;
                    *px = (128 + delta).clamp(0, 255) as u8;
                }
            }
            SyntheticPattern::MovingBar { width, speed } => {
                data.fill(32);
                if w > 0 {
                    let start = ((tick_id * speed as u64) % w as u64) as usize;
                    for row in data.chunks_mut(w) {
                        for i in 0..width as usize {
                            row[(start + i) % w] = 224;
                        }
                    }
                }
            }
            SyntheticPattern::SceneCut { every_ticks } => {
                let scene = tick_id / every_ticks.max(1);
                let (base, stripe) = if scene % 2 == 0 { (40, 90) } else { (200, 150) };
                for (i, px) in data.iter_mut().enumerate() {
                    *px = if (i / w.max(1)) % 8 < 4 { base } else { stripe };
                }
            }
        }
        data
    }
}

impl CaptureSource for SyntheticCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&mut self, tick_id: u64, timestamp_ms: u64) -> Result<CapturedFrame> {
        if self.fail_every > 0 && (tick_id + 1) % self.fail_every == 0 {
            return Err(ArbiterError::Capture(format!(
                "{}: simulated capture failure at tick {}",
                self.name, tick_id
            )));
        }

        let meta = FrameMeta {
            width: self.width,
            height: self.height,
            timestamp_ms,
            tick_id,
        };
        let data = self.render(tick_id);
        Ok(self.releases.track(CapturedFrame::new(meta, data)))
    }

    fn release_counter(&self) -> Option<&ReleaseCounter> {
        Some(&self.releases)
    }
}
