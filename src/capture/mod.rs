//! Capture collaborator boundary
//!
//! A [`CaptureSource`] hands the pipeline one [`CapturedFrame`] per tick. The
//! frame owns its pixel buffer and the release callback of whatever produced
//! it (a camera driver buffer, a shared-memory slot). The callback runs from
//! `Drop`, so it fires exactly once on every path: after the last stage,
//! after an aborted tick, or while unwinding.
//!
//! Stages never see the owner, only a borrowed [`FrameView`].

#[cfg(feature = "synthetic")]
pub mod synthetic;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Descriptive fields of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub tick_id: u64,
}

type ReleaseFn = Box<dyn FnOnce(&FrameMeta) + Send>;

/// Exclusive owner of one captured frame
///
/// Not `Clone`: there is exactly one owner and therefore exactly one release.
pub struct CapturedFrame {
    meta: FrameMeta,
    data: Vec<u8>,
    release: Option<ReleaseFn>,
}

impl CapturedFrame {
    /// Frame whose buffer needs no external release
    pub fn new(meta: FrameMeta, data: Vec<u8>) -> Self {
        Self {
            meta,
            data,
            release: None,
        }
    }

    /// Attach the producer's release callback
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce(&FrameMeta) + Send + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            meta: &self.meta,
            data: &self.data,
        }
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.meta);
        }
    }
}

/// Borrowed, read-only view of a frame for the duration of one stage call
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub meta: &'a FrameMeta,
    pub data: &'a [u8],
}

impl FrameView<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Counts frames handed out and released by a producer
///
/// `outstanding() == 0` between ticks is the buffer lifecycle invariant.
#[derive(Debug, Clone, Default)]
pub struct ReleaseCounter {
    issued: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

impl ReleaseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `frame` so its release is counted
    pub fn track(&self, frame: CapturedFrame) -> CapturedFrame {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        let mut frame = frame;
        let inner = frame.release.take();
        frame.with_release(move |meta| {
            if let Some(inner) = inner {
                inner(meta);
            }
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> u64 {
        self.issued().saturating_sub(self.released())
    }
}

/// Produces one frame per tick
pub trait CaptureSource: Send {
    /// Human-readable name of this capture device
    fn name(&self) -> &str;

    /// Capture the frame for `tick_id`
    fn capture(&mut self, tick_id: u64, timestamp_ms: u64) -> Result<CapturedFrame>;

    /// Release accounting, if the source keeps one
    fn release_counter(&self) -> Option<&ReleaseCounter> {
        None
    }
}
