//! Scene memory and trigger engine.
//!
//! Each source owns a bounded ring of recent [`SceneMemoryEntry`] values plus
//! its trigger state, behind its own mutex. The map of sources is only
//! write-locked to add a new source, so two sources never wait on each other.
//!
//! A frame request fires when any of these hold:
//!
//! - motion score above `motion_threshold`
//! - a class of interest appears that the ring has not seen recently
//! - the scene hash moved at least `scene_change_min_distance` bits away from
//!   the previous one, to a scene not requested recently
//!
//! and at least `cooldown_seconds` have passed since the previous request.
//! A request that fires updates `last_request_at` under the same lock.

use crate::clock::SharedClock;
use crate::config::SceneSettings;
use crate::pipeline::{ArtifactPayload, PipelineRecord};
use crate::types::{Detection, SourceId, TriggerReason};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Artifacts attach to the entry within this distance of their timestamp
pub const ARTIFACT_MATCH_WINDOW_MS: u64 = 1000;

/// What the coordinator remembers about one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneMemoryEntry {
    pub source_id: SourceId,
    pub tick_id: u64,
    pub timestamp_ms: u64,
    pub scene_hash: Option<u32>,
    pub motion_score: f64,
    pub detections: Vec<Detection>,
    pub degraded: bool,
    pub artifact: Option<ArtifactPayload>,
}

impl SceneMemoryEntry {
    pub fn new(source_id: SourceId, tick_id: u64, timestamp_ms: u64) -> Self {
        Self {
            source_id,
            tick_id,
            timestamp_ms,
            scene_hash: None,
            motion_score: 0.0,
            detections: Vec::new(),
            degraded: false,
            artifact: None,
        }
    }

    pub fn with_motion(mut self, score: f64) -> Self {
        self.motion_score = score;
        self
    }

    pub fn with_scene_hash(mut self, hash: u32) -> Self {
        self.scene_hash = Some(hash);
        self
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    /// Summary of a record; the artifact is left out and attached separately
    pub fn from_record(record: &PipelineRecord) -> Self {
        Self {
            source_id: record.source_id.clone(),
            tick_id: record.tick_id,
            timestamp_ms: record.timestamp_ms,
            scene_hash: record.scene_hash(),
            motion_score: record.motion_score().unwrap_or(0.0),
            detections: record.detections().to_vec(),
            degraded: record.degraded,
            artifact: None,
        }
    }
}

/// Why a qualifying frame did not fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    Cooldown,
    Disabled,
    /// The scene changed, but to one that was requested recently
    DuplicateScene,
    NoTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Fire(TriggerReason),
    Suppressed(SuppressReason),
}

impl TriggerDecision {
    pub fn fired(&self) -> bool {
        matches!(self, TriggerDecision::Fire(_))
    }
}

/// Runtime-tunable trigger rules
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPolicy {
    pub enabled: bool,
    pub cooldown_ms: u64,
    pub motion_threshold: f64,
    pub classes_of_interest: Vec<u32>,
    pub class_confidence_threshold: f32,
    pub scene_change_enabled: bool,
    pub scene_change_min_distance: u32,
    pub recent_hash_capacity: usize,
}

impl From<&SceneSettings> for TriggerPolicy {
    fn from(settings: &SceneSettings) -> Self {
        Self {
            enabled: settings.frame_requests_enabled,
            cooldown_ms: settings.cooldown_seconds.saturating_mul(1000),
            motion_threshold: settings.motion_threshold,
            classes_of_interest: settings.classes_of_interest.clone(),
            class_confidence_threshold: settings.class_confidence_threshold,
            scene_change_enabled: settings.scene_change_enabled,
            scene_change_min_distance: settings.scene_change_min_distance,
            recent_hash_capacity: settings.recent_hash_capacity,
        }
    }
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::from(&SceneSettings::default())
    }
}

/// Decision counters across all sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerStats {
    pub high_motion: u64,
    pub class_of_interest: u64,
    pub scene_change: u64,
    pub manual: u64,
    pub cooldown: u64,
    pub disabled: u64,
    pub duplicate_scene: u64,
    pub no_trigger: u64,
}

impl TriggerStats {
    pub fn fired(&self) -> u64 {
        self.high_motion + self.class_of_interest + self.scene_change + self.manual
    }
}

#[derive(Debug, Default)]
struct TriggerCounters([AtomicU64; 8]);

impl TriggerCounters {
    fn slot(decision: TriggerDecision) -> usize {
        match decision {
            TriggerDecision::Fire(TriggerReason::HighMotion) => 0,
            TriggerDecision::Fire(TriggerReason::ClassOfInterest) => 1,
            TriggerDecision::Fire(TriggerReason::SceneChange) => 2,
            TriggerDecision::Fire(TriggerReason::Manual) => 3,
            TriggerDecision::Suppressed(SuppressReason::Cooldown) => 4,
            TriggerDecision::Suppressed(SuppressReason::Disabled) => 5,
            TriggerDecision::Suppressed(SuppressReason::DuplicateScene) => 6,
            TriggerDecision::Suppressed(SuppressReason::NoTrigger) => 7,
        }
    }

    fn count(&self, decision: TriggerDecision) {
        self.0[Self::slot(decision)].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TriggerStats {
        let v = |i: usize| self.0[i].load(Ordering::Relaxed);
        TriggerStats {
            high_motion: v(0),
            class_of_interest: v(1),
            scene_change: v(2),
            manual: v(3),
            cooldown: v(4),
            disabled: v(5),
            duplicate_scene: v(6),
            no_trigger: v(7),
        }
    }
}

/// Per-source summary handed to downstream analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneContext {
    pub source_id: SourceId,
    pub frames: usize,
    pub time_span_ms: u64,
    pub average_motion: f64,
    pub total_objects: usize,
    pub unique_classes: Vec<u32>,
    pub latest_timestamp_ms: u64,
    pub artifacts: usize,
}

#[derive(Debug, Default)]
struct SourceMemory {
    ring: VecDeque<SceneMemoryEntry>,
    last_request_at_ms: Option<u64>,
    /// Hashes of scenes that already caused a request
    recent_hashes: VecDeque<u32>,
    fired: u64,
}

impl SourceMemory {
    fn push(&mut self, entry: SceneMemoryEntry, depth: usize) {
        while self.ring.len() >= depth.max(1) {
            self.ring.pop_front();
        }
        self.ring.push_back(entry);
    }

    /// Ring entries other than the one under evaluation
    fn history<'a>(
        &'a self,
        tick_id: u64,
    ) -> impl DoubleEndedIterator<Item = &'a SceneMemoryEntry> + 'a {
        self.ring.iter().filter(move |e| e.tick_id != tick_id)
    }

    fn decide(&self, entry: &SceneMemoryEntry, policy: &TriggerPolicy, now_ms: u64) -> TriggerDecision {
        if !policy.enabled {
            return TriggerDecision::Suppressed(SuppressReason::Disabled);
        }
        if let Some(last) = self.last_request_at_ms {
            if now_ms.saturating_sub(last) < policy.cooldown_ms {
                return TriggerDecision::Suppressed(SuppressReason::Cooldown);
            }
        }

        if entry.motion_score > policy.motion_threshold {
            return TriggerDecision::Fire(TriggerReason::HighMotion);
        }

        let seen: BTreeSet<u32> = self
            .history(entry.tick_id)
            .flat_map(|e| e.detections.iter().map(|d| d.class_id))
            .collect();
        let new_class = entry.detections.iter().any(|d| {
            d.confidence > policy.class_confidence_threshold
                && policy.classes_of_interest.contains(&d.class_id)
                && !seen.contains(&d.class_id)
        });
        if new_class {
            return TriggerDecision::Fire(TriggerReason::ClassOfInterest);
        }

        if policy.scene_change_enabled {
            let previous = self
                .history(entry.tick_id)
                .rev()
                .find_map(|e| e.scene_hash);
            if let (Some(hash), Some(previous)) = (entry.scene_hash, previous) {
                if (hash ^ previous).count_ones() >= policy.scene_change_min_distance.max(1) {
                    if self.recent_hashes.contains(&hash) {
                        return TriggerDecision::Suppressed(SuppressReason::DuplicateScene);
                    }
                    return TriggerDecision::Fire(TriggerReason::SceneChange);
                }
            }
        }

        TriggerDecision::Suppressed(SuppressReason::NoTrigger)
    }

    fn commit(&mut self, entry: &SceneMemoryEntry, reason: TriggerReason, policy: &TriggerPolicy, now_ms: u64) {
        self.last_request_at_ms = Some(now_ms);
        self.fired += 1;
        if reason == TriggerReason::SceneChange {
            if let Some(hash) = entry.scene_hash {
                while self.recent_hashes.len() >= policy.recent_hash_capacity.max(1) {
                    self.recent_hashes.pop_front();
                }
                self.recent_hashes.push_back(hash);
            }
        }
    }
}

pub struct SceneMemory {
    depth: usize,
    clock: SharedClock,
    policy: RwLock<TriggerPolicy>,
    sources: RwLock<HashMap<SourceId, Arc<Mutex<SourceMemory>>>>,
    counters: TriggerCounters,
}

fn lock(memory: &Mutex<SourceMemory>) -> MutexGuard<'_, SourceMemory> {
    match memory.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SceneMemory {
    pub fn new(settings: &SceneSettings, clock: SharedClock) -> Self {
        Self {
            depth: settings.scene_memory_depth,
            clock,
            policy: RwLock::new(TriggerPolicy::from(settings)),
            sources: RwLock::new(HashMap::new()),
            counters: TriggerCounters::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn source(&self, source_id: &SourceId) -> Arc<Mutex<SourceMemory>> {
        if let Ok(sources) = self.sources.read() {
            if let Some(memory) = sources.get(source_id) {
                return memory.clone();
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

    fn existing(&self, source_id: &SourceId) -> Option<Arc<Mutex<SourceMemory>>> {
        self.sources.read().ok()?.get(source_id).cloned()
    }

    pub fn policy(&self) -> TriggerPolicy {
        match self.policy.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the trigger rules; applies from the next decision on
    pub fn set_policy(&self, policy: TriggerPolicy) {
        tracing::info!(
            "Trigger policy: enabled={} motion>{} cooldown={}s classes={:?}",
            policy.enabled,
            policy.motion_threshold,
            policy.cooldown_ms / 1000,
            policy.classes_of_interest
        );
        match self.policy.write() {
            Ok(mut p) => *p = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }

    /// Append to the source's ring, dropping the oldest past `depth`
    pub fn ingest(&self, entry: SceneMemoryEntry) {
        let memory = self.source(&entry.source_id);
        lock(&memory).push(entry, self.depth);
    }

    /// Decide whether `entry` warrants a frame request
    ///
    /// A positive answer starts the cooldown immediately.
    pub fn should_trigger(&self, entry: &SceneMemoryEntry) -> TriggerDecision {
        let policy = self.policy();
        let memory = self.source(&entry.source_id);
        let mut memory = lock(&memory);
        self.decide_locked(&mut memory, entry, &policy)
    }

    /// Decide and ingest under one lock acquisition
    pub fn observe(&self, entry: SceneMemoryEntry) -> TriggerDecision {
        let policy = self.policy();
        let memory = self.source(&entry.source_id);
        let mut memory = lock(&memory);
        let decision = self.decide_locked(&mut memory, &entry, &policy);
        memory.push(entry, self.depth);
        decision
    }

    fn decide_locked(
        &self,
        memory: &mut SourceMemory,
        entry: &SceneMemoryEntry,
        policy: &TriggerPolicy,
    ) -> TriggerDecision {
        let now = self.clock.now_ms();
        let decision = memory.decide(entry, policy, now);
        if let TriggerDecision::Fire(reason) = decision {
            memory.commit(entry, reason, policy, now);
            tracing::info!(
                "Trigger {} for {} tick {} (motion {:.2})",
                reason,
                entry.source_id,
                entry.tick_id,
                entry.motion_score
            );
        }
        self.counters.count(decision);
        decision
    }

    /// Start the cooldown for an externally requested frame
    pub fn record_manual_request(&self, source_id: &SourceId) {
        let memory = self.source(source_id);
        lock(&memory).last_request_at_ms = Some(self.clock.now_ms());
        self.counters.count(TriggerDecision::Fire(TriggerReason::Manual));
    }

    /// Attach an artifact to the entry closest to `timestamp_ms`
    ///
    /// Returns `false` when no entry lies within one second; the artifact is
    /// then stored as an entry of its own.
    pub fn attach_artifact(
        &self,
        source_id: &SourceId,
        tick_id: u64,
        timestamp_ms: u64,
        artifact: ArtifactPayload,
    ) -> bool {
        let memory = self.source(source_id);
        let mut memory = lock(&memory);
        let closest = memory
            .ring
            .iter_mut()
            .map(|e| (e.timestamp_ms.abs_diff(timestamp_ms), e))
            .filter(|(distance, _)| *distance <= ARTIFACT_MATCH_WINDOW_MS)
            .min_by_key(|(distance, _)| *distance);

        if let Some((_, entry)) = closest {
            entry.artifact = Some(artifact);
            return true;
        }

        let mut entry = SceneMemoryEntry::new(source_id.clone(), tick_id, timestamp_ms);
        entry.artifact = Some(artifact);
        memory.push(entry, self.depth);
        false
    }

    pub fn entries(&self, source_id: &SourceId) -> Vec<SceneMemoryEntry> {
        let Some(memory) = self.existing(source_id) else {
            return Vec::new();
        };
        let memory = lock(&memory);
        memory.ring.iter().cloned().collect()
    }

    pub fn len(&self, source_id: &SourceId) -> usize {
        let Some(memory) = self.existing(source_id) else {
            return 0;
        };
        let len = lock(&memory).ring.len();
        len
    }

    pub fn last_request_at_ms(&self, source_id: &SourceId) -> Option<u64> {
        let memory = self.existing(source_id)?;
        let last = lock(&memory).last_request_at_ms;
        last
    }

    /// Summary of the source's ring, `None` for an unknown or empty source
    pub fn context(&self, source_id: &SourceId) -> Option<SceneContext> {
        let memory = self.existing(source_id)?;
        let memory = lock(&memory);
        let first = memory.ring.front()?;
        let last = memory.ring.back()?;

        let frames = memory.ring.len();
        let average_motion =
            memory.ring.iter().map(|e| e.motion_score).sum::<f64>() / frames as f64;
        let unique_classes: BTreeSet<u32> = memory
            .ring
            .iter()
            .flat_map(|e| e.detections.iter().map(|d| d.class_id))
            .collect();

        Some(SceneContext {
            source_id: source_id.clone(),
            frames,
            time_span_ms: last.timestamp_ms.saturating_sub(first.timestamp_ms),
            average_motion,
            total_objects: memory.ring.iter().map(|e| e.detections.len()).sum(),
            unique_classes: unique_classes.into_iter().collect(),
            latest_timestamp_ms: last.timestamp_ms,
            artifacts: memory.ring.iter().filter(|e| e.artifact.is_some()).count(),
        })
    }

    /// Frame requests fired for one source
    pub fn triggers_for(&self, source_id: &SourceId) -> u64 {
        let Some(memory) = self.existing(source_id) else {
            return 0;
        };
        let fired = lock(&memory).fired;
        fired
    }

    pub fn stats(&self) -> TriggerStats {
        self.counters.snapshot()
    }
}
