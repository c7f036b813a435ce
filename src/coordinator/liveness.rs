//! Source liveness from data, heartbeat and status traffic.

use crate::publisher::{HeartbeatInfo, SourceStatus};
use crate::types::SourceId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceLiveness {
    pub last_seen_ms: u64,
    pub status: Option<SourceStatus>,
    pub last_heartbeat: Option<HeartbeatInfo>,
    /// Already reported silent since it was last seen
    pub silent: bool,
}

#[derive(Debug)]
pub struct LivenessTracker {
    timeout_ms: u64,
    sources: Mutex<BTreeMap<SourceId, SourceLiveness>>,
}

impl LivenessTracker {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    fn update(&self, source_id: &SourceId, now_ms: u64, f: impl FnOnce(&mut SourceLiveness)) {
        let mut sources = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = sources
            .entry(source_id.clone())
            .or_insert_with(|| SourceLiveness {
                last_seen_ms: now_ms,
                status: None,
                last_heartbeat: None,
                silent: false,
            });
        entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
        entry.silent = false;
        f(entry);
    }

    pub fn observe(&self, source_id: &SourceId, now_ms: u64) {
        self.update(source_id, now_ms, |_| {});
    }

    pub fn record_heartbeat(&self, source_id: &SourceId, info: HeartbeatInfo, now_ms: u64) {
        self.update(source_id, now_ms, |entry| entry.last_heartbeat = Some(info));
    }

    pub fn record_status(&self, source_id: &SourceId, status: SourceStatus, now_ms: u64) {
        self.update(source_id, now_ms, |entry| entry.status = Some(status));
    }

    /// Sources newly silent for longer than the timeout
    ///
    /// Each silence is reported once; sources that announced `offline` are
    /// never reported.
    pub fn newly_silent(&self, now_ms: u64) -> Vec<SourceId> {
        let mut sources = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources
            .iter_mut()
            .filter(|(_, s)| {
                !s.silent
                    && s.status != Some(SourceStatus::Offline)
                    && now_ms.saturating_sub(s.last_seen_ms) > self.timeout_ms
            })
            .map(|(id, s)| {
                s.silent = true;
                id.clone()
            })
            .collect()
    }

    pub fn get(&self, source_id: &SourceId) -> Option<SourceLiveness> {
        self.sources.lock().ok()?.get(source_id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<SourceId, SourceLiveness> {
        match self.sources.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
