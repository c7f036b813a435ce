//! Coordinator side of the link
//!
//! Receives the encoded message stream from all sources and fans it out:
//!
//! ```text
//!                       ┌──► IngestValidator   (sequence gaps)
//! transport ──► decode ─┼──► LivenessTracker   (data, heartbeat, status)
//!                       └──► SceneMemory ──► trigger ──► FrameRequest ──► source
//!                                              └──► TimeCorrelator (cross-source)
//! ```
//!
//! All per-source state is partitioned by source, so a slow or noisy source
//! never holds up another.

mod correlator;
mod liveness;
mod memory;
mod validator;

pub use correlator::{ClockOffset, TimeCorrelator, TimedEvent};
pub use liveness::{LivenessTracker, SourceLiveness};
pub use memory::{
    SceneContext, SceneMemory, SceneMemoryEntry, SuppressReason, TriggerDecision, TriggerPolicy,
    TriggerStats, ARTIFACT_MATCH_WINDOW_MS,
};
pub use validator::{IngestValidator, SequenceCheck, SequenceGapEvent, SequenceStats};

use crate::clock::SharedClock;
use crate::config::ArbiterConfig;
use crate::error::{ArbiterError, Result};
use crate::publisher::{MessageBody, OutboundMessage, SourceStatus};
use crate::types::{FrameRequest, SourceId, TriggerReason};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Things the coordinator observed, for whoever is listening
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    SequenceGap(SequenceGapEvent),
    FrameRequested(FrameRequest),
    /// Two sources fired within the correlation tolerance
    CorrelatedTrigger {
        first: SourceId,
        second: SourceId,
    },
    ArtifactReceived {
        source_id: SourceId,
        request_id: String,
        attached: bool,
    },
    StatusChanged {
        source_id: SourceId,
        status: SourceStatus,
    },
    SourceSilent(SourceId),
}

/// Per-source coordinator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounters {
    pub messages: u64,
    pub gaps: u64,
    pub missing: u64,
    pub triggers: u64,
    pub memory_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub messages: u64,
    pub decode_errors: u64,
    pub requests_sent: u64,
    pub requests_dropped: u64,
    pub events_dropped: u64,
    pub sequence_gaps: u64,
    pub stale_offset_uses: u64,
    pub triggers: TriggerStats,
    pub sources: BTreeMap<SourceId, SourceCounters>,
}

pub struct Coordinator {
    validator: IngestValidator,
    memory: SceneMemory,
    correlator: TimeCorrelator,
    liveness: LivenessTracker,
    clock: SharedClock,
    routes: RwLock<HashMap<SourceId, Sender<FrameRequest>>>,
    events: Option<Sender<CoordinatorEvent>>,
    /// Source timestamp (ms) of each source's latest trigger
    last_triggers: Mutex<HashMap<SourceId, u64>>,
    messages: AtomicU64,
    decode_errors: AtomicU64,
    requests_sent: AtomicU64,
    requests_dropped: AtomicU64,
    events_dropped: AtomicU64,
    next_request: AtomicU64,
}

impl Coordinator {
    pub fn new(config: &ArbiterConfig, clock: SharedClock) -> Self {
        Self {
            validator: IngestValidator::new(),
            memory: SceneMemory::new(&config.scene, clock.clone()),
            correlator: TimeCorrelator::new(&config.correlator, clock.clone()),
            liveness: LivenessTracker::new(config.coordinator.liveness_timeout_ms),
            clock,
            routes: RwLock::new(HashMap::new()),
            events: None,
            last_triggers: Mutex::new(HashMap::new()),
            messages: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
        }
    }

    /// Publish [`CoordinatorEvent`]s to `events`
    pub fn with_events(mut self, events: Sender<CoordinatorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Deliver frame requests for `source_id` to `requests`
    pub fn route_requests(&self, source_id: SourceId, requests: Sender<FrameRequest>) {
        match self.routes.write() {
            Ok(mut routes) => {
                routes.insert(source_id, requests);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(source_id, requests);
            }
        }
    }

    pub fn validator(&self) -> &IngestValidator {
        &self.validator
    }

    pub fn memory(&self) -> &SceneMemory {
        &self.memory
    }

    pub fn correlator(&self) -> &TimeCorrelator {
        &self.correlator
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(events) = &self.events {
            // Observers are optional; a full or closed channel only loses events
            if events.try_send(event).is_err() {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Decode and handle one message from the transport
    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<()> {
        match OutboundMessage::decode(bytes) {
            Ok(message) => {
                self.handle_message(message);
                Ok(())
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.with_context("decoding inbound message"))
            }
        }
    }

    pub fn handle_message(&self, message: OutboundMessage) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();
        let source_id = message.source_id().clone();
        let sequence = message.sequence();

        match message.into_body() {
            MessageBody::Data { record } => {
                self.liveness.observe(&source_id, now);
                if let SequenceCheck::Gap(gap) = self.validator.validate(&source_id, sequence) {
                    tracing::warn!("{}", ArbiterError::from(&gap));
                    self.emit(CoordinatorEvent::SequenceGap(gap));
                }

                let entry = SceneMemoryEntry::from_record(&record);
                let decision = self.memory.observe(entry);
                if let TriggerDecision::Fire(reason) = decision {
                    self.request_frame(&source_id, reason, record.tick_id, record.timestamp_ms);
                }

                if let Some(artifact) = record.artifact() {
                    let request_id = artifact.request_id.clone();
                    let attached = self.memory.attach_artifact(
                        &source_id,
                        record.tick_id,
                        record.timestamp_ms,
                        artifact.clone(),
                    );
                    tracing::info!(
                        "Artifact {} from {} ({} bytes encoded)",
                        request_id,
                        source_id,
                        artifact.data.len()
                    );
                    self.emit(CoordinatorEvent::ArtifactReceived {
                        source_id: source_id.clone(),
                        request_id,
                        attached,
                    });
                }
            }
            MessageBody::Heartbeat(info) => {
                tracing::trace!("Heartbeat from {}: {:?}", source_id, info);
                self.liveness.record_heartbeat(&source_id, info, now);
            }
            MessageBody::Status { status } => {
                tracing::info!("Source {} is {}", source_id, status);
                if status == SourceStatus::Online {
                    // A restarted source counts from 0 again
                    self.validator.reset(&source_id);
                }
                self.liveness.record_status(&source_id, status, now);
                self.emit(CoordinatorEvent::StatusChanged { source_id, status });
            }
        }
    }

    /// Ask a source for a full frame and start its cooldown
    pub fn request_manual(&self, source_id: &SourceId) -> Result<()> {
        self.memory.record_manual_request(source_id);
        if self.send_request(source_id, TriggerReason::Manual, 0) {
            Ok(())
        } else {
            Err(ArbiterError::Channel(format!(
                "no request route to {}",
                source_id
            )))
        }
    }

    fn request_frame(&self, source_id: &SourceId, reason: TriggerReason, tick_id: u64, timestamp_ms: u64) {
        self.send_request(source_id, reason, tick_id);
        self.correlate_trigger(source_id, timestamp_ms);
    }

    fn send_request(&self, source_id: &SourceId, reason: TriggerReason, tick_id: u64) -> bool {
        let request = FrameRequest {
            request_id: format!(
                "{}-{}",
                source_id,
                self.next_request.fetch_add(1, Ordering::Relaxed)
            ),
            source_id: source_id.clone(),
            reason,
            tick_id,
            requested_at_ms: self.clock.now_ms(),
        };

        let route = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(source_id).cloned());
        let Some(route) = route else {
            tracing::debug!("No request route for {}, dropping {}", source_id, request.request_id);
            self.requests_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match route.try_send(request.clone()) {
            Ok(()) => {
                self.requests_sent.fetch_add(1, Ordering::Relaxed);
                self.emit(CoordinatorEvent::FrameRequested(request));
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("Frame request {} for {} not delivered", request.request_id, source_id);
                self.requests_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Report other sources whose latest trigger lines up with this one
    fn correlate_trigger(&self, source_id: &SourceId, timestamp_ms: u64) {
        let event = TimedEvent::from_ms(source_id.clone(), timestamp_ms);
        let mut last = match self.last_triggers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let matches: Vec<SourceId> = last
            .iter()
            .filter(|(other, _)| *other != source_id)
            .filter(|(other, ts)| {
                self.correlator
                    .correlate(&event, &TimedEvent::from_ms((*other).clone(), **ts))
            })
            .map(|(other, _)| other.clone())
            .collect();
        last.insert(source_id.clone(), timestamp_ms);
        drop(last);

        for other in matches {
            tracing::info!("Correlated triggers: {} and {}", other, source_id);
            self.emit(CoordinatorEvent::CorrelatedTrigger {
                first: other,
                second: source_id.clone(),
            });
        }
    }

    /// Report sources that went quiet
    pub fn check_liveness(&self) -> Vec<SourceId> {
        let silent = self.liveness.newly_silent(self.clock.now_ms());
        for source_id in &silent {
            tracing::warn!("Source {} silent for over the liveness timeout", source_id);
            self.emit(CoordinatorEvent::SourceSilent(source_id.clone()));
        }
        silent
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut sources = BTreeMap::new();
        for (source_id, seq) in self.validator.all_stats() {
            sources.insert(
                source_id.clone(),
                SourceCounters {
                    messages: seq.messages,
                    gaps: seq.gaps,
                    missing: seq.missing,
                    triggers: self.memory.triggers_for(&source_id),
                    memory_entries: self.memory.len(&source_id),
                },
            );
        }
        CoordinatorStats {
            messages: self.messages.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            sequence_gaps: self.validator.total_gaps(),
            stale_offset_uses: self.correlator.stale_uses(),
            triggers: self.memory.stats(),
            sources,
        }
    }

    /// Consume the link until `running` clears or every sender is gone
    pub fn run(&self, inbound: Receiver<Vec<u8>>, running: Arc<AtomicBool>) {
        tracing::info!("Coordinator started");
        let mut last_liveness_check = Instant::now();

        while running.load(Ordering::Relaxed) {
            match inbound.recv_timeout(RECV_TIMEOUT) {
                Ok(bytes) => {
                    if let Err(e) = self.handle_bytes(&bytes) {
                        tracing::warn!("{}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("All sources disconnected");
                    break;
                }
            }

            if last_liveness_check.elapsed() >= LIVENESS_CHECK_INTERVAL {
                self.check_liveness();
                last_liveness_check = Instant::now();
            }
        }

        // Whatever already arrived still counts
        for bytes in inbound.try_iter() {
            if let Err(e) = self.handle_bytes(&bytes) {
                tracing::warn!("{}", e);
            }
        }

        let stats = self.stats();
        tracing::info!(
            "Coordinator stopped: {} messages, {} gaps, {} frame requests",
            stats.messages,
            stats.sequence_gaps,
            stats.requests_sent
        );
    }

    /// Run on a dedicated thread
    pub fn spawn(
        self: Arc<Self>,
        inbound: Receiver<Vec<u8>>,
        running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || self.run(inbound, running))?;
        Ok(handle)
    }
}
