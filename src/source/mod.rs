//! Per-source runtime: capture, pipeline, publish, repeat.
//!
//! A [`SourceRunner`] owns everything one camera needs and runs on its own
//! thread:
//!
//! ```text
//! ┌─────────┐   ┌──────────────────┐   ┌───────────────────┐
//! │ Capture │──►│ PipelineExecutor │──►│ ReliablePublisher │──► transport
//! └─────────┘   └────────┬─────────┘   └───────────────────┘
//!                        │ accelerator stages
//!                        ▼
//!                  SlotScheduler
//! ```
//!
//! The loop runs until the shared `running` flag clears or a
//! [`SourceCommand::Stop`] arrives. The in-flight tick always completes before
//! shutdown; shutdown then stops the stages, flushes the retry backlog and
//! announces `offline`.

use crate::capture::CaptureSource;
use crate::clock::SharedClock;
use crate::config::{ArbiterConfig, SourceSettings};
use crate::error::{ArbiterError, Result};
use crate::pipeline::{
    AnyStage, BuiltinStage, GrantSummary, PipelineExecutor, StageRegistry, StageRun, TickReport,
};
use crate::pipeline::stages::{
    ArtifactStage, DetectionStage, InferenceBackend, MotionStage, SceneHashStage,
};
use crate::publisher::{
    Heartbeat, PublishOutcome, PublisherStats, ReliablePublisher, SourceStatus, Transport,
};
use crate::scheduler::{AcceleratorGate, GrantOutcome, SlotHandle, SlotScheduler};
use crate::types::{FrameRequest, GuaranteeTier, SourceId};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often a running source logs its counters
pub const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Runtime control of a live source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceCommand {
    SetTickPeriod(Duration),
    SetBackoffSchedule(Vec<Duration>),
    Stop,
}

/// Counters kept by one source
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub ticks: u64,
    pub capture_errors: u64,
    pub aborted_ticks: u64,
    pub degraded_ticks: u64,
    pub delivered: u64,
    pub queued: u64,
    pub publish_errors: u64,
    /// Tick period currently in force, including backoff
    pub effective_period_ms: u64,
    pub publisher: PublisherStats,
}

/// What one tick did, after its record went to the publisher
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick_id: u64,
    pub runs: Vec<StageRun>,
    pub aborted_at: Option<String>,
    pub grant: Option<GrantSummary>,
    /// `None` when the record was lost
    pub published: Option<PublishOutcome>,
}

// ==================== Builder ====================

/// Assembles a [`SourceRunner`] from configuration and collaborators
pub struct SourceBuilder {
    source_id: SourceId,
    slot_index: usize,
    tier: GuaranteeTier,
    config: ArbiterConfig,
    clock: SharedClock,
    registry: StageRegistry,
    capture: Option<Box<dyn CaptureSource>>,
    transport: Option<Arc<dyn Transport>>,
    scheduler: Option<Arc<SlotScheduler>>,
    running: Option<Arc<AtomicBool>>,
}

impl SourceBuilder {
    pub fn new(config: &ArbiterConfig, settings: &SourceSettings, clock: SharedClock) -> Self {
        Self {
            source_id: SourceId::new(settings.id.clone()),
            slot_index: settings.slot_index,
            tier: settings.tier.unwrap_or(config.publisher.data_tier),
            config: config.clone(),
            clock,
            registry: StageRegistry::new(),
            capture: None,
            transport: None,
            scheduler: None,
            running: None,
        }
    }

    pub fn capture(mut self, capture: Box<dyn CaptureSource>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register with `scheduler` so accelerator stages wait for this slot
    ///
    /// Without a scheduler accelerator stages run ungated.
    pub fn scheduler(mut self, scheduler: Arc<SlotScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn stage(mut self, stage: impl Into<AnyStage>) -> Result<Self> {
        self.registry.register(stage)?;
        Ok(self)
    }

    /// Motion, scene hash, detection and artifact stages
    pub fn default_stages(
        self,
        backend: Option<Box<dyn InferenceBackend>>,
        requests: Receiver<FrameRequest>,
    ) -> Result<Self> {
        self.stage(BuiltinStage::Motion(MotionStage::new()))?
            .stage(BuiltinStage::SceneHash(SceneHashStage::new()))?
            .stage(BuiltinStage::Detection(DetectionStage::new(backend)))?
            .stage(BuiltinStage::Artifact(ArtifactStage::new(requests)))
    }

    pub fn build(self) -> Result<(SourceRunner, Sender<SourceCommand>)> {
        let capture = self.capture.ok_or_else(|| {
            ArbiterError::ConfigInvalid(format!("source {} has no capture", self.source_id))
        })?;
        let transport = self.transport.ok_or_else(|| {
            ArbiterError::ConfigInvalid(format!("source {} has no transport", self.source_id))
        })?;

        let gate = match self.scheduler {
            Some(scheduler) => {
                let slot = scheduler.register(self.slot_index, self.source_id.clone())?;
                Some(SlotHandle::new(scheduler, slot))
            }
            None => None,
        };

        let executor = self.registry.build(
            self.source_id.clone(),
            self.config.pipeline.stage_budget(),
            &self.config.stages,
        );
        let publisher = ReliablePublisher::new(
            self.source_id.clone(),
            &self.config.publisher,
            transport,
            self.clock.clone(),
        );

        let (cmd_tx, cmd_rx) = unbounded();
        let base_period = self.config.pipeline.tick_period();

        let runner = SourceRunner {
            source_id: self.source_id,
            tier: self.tier,
            capture,
            executor,
            gate,
            publisher,
            heartbeat: None,
            heartbeat_interval: self.config.publisher.heartbeat_interval(),
            send_timeout: self.config.publisher.publish_timeout(),
            clock: self.clock,
            running: self
                .running
                .unwrap_or_else(|| Arc::new(AtomicBool::new(true))),
            cmd_rx,
            stopped: false,
            started: false,
            base_period,
            backoff_multiplier: 1,
            max_tick_backoff: self.config.schedule.max_tick_backoff.max(1),
            next_tick_id: 0,
            stats: SourceStats {
                effective_period_ms: base_period.as_millis() as u64,
                ..SourceStats::default()
            },
            last_stats_time: Instant::now(),
        };
        Ok((runner, cmd_tx))
    }
}

// ==================== Runner ====================

pub struct SourceRunner {
    source_id: SourceId,
    tier: GuaranteeTier,
    capture: Box<dyn CaptureSource>,
    executor: PipelineExecutor,
    gate: Option<SlotHandle>,
    publisher: ReliablePublisher,
    heartbeat: Option<Heartbeat>,
    heartbeat_interval: Duration,
    send_timeout: Duration,
    clock: SharedClock,
    running: Arc<AtomicBool>,
    cmd_rx: Receiver<SourceCommand>,
    stopped: bool,
    started: bool,

    // Tick pacing
    base_period: Duration,
    backoff_multiplier: u32,
    max_tick_backoff: u32,
    next_tick_id: u64,

    stats: SourceStats,
    last_stats_time: Instant,
}

impl SourceRunner {
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn tier(&self) -> GuaranteeTier {
        self.tier
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    pub fn publisher(&self) -> &ReliablePublisher {
        &self.publisher
    }

    /// Base period times the current degraded backoff
    pub fn effective_period(&self) -> Duration {
        self.base_period * self.backoff_multiplier
    }

    pub fn stats(&self) -> SourceStats {
        let mut stats = self.stats.clone();
        stats.effective_period_ms = self.effective_period().as_millis() as u64;
        stats.publisher = self.publisher.stats();
        stats
    }

    pub fn set_tick_period(&mut self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(ArbiterError::ConfigInvalid(
                "tick period must be greater than 0".into(),
            ));
        }
        tracing::info!(
            "[{}] Tick period {} ms -> {} ms",
            self.source_id,
            self.base_period.as_millis(),
            period.as_millis()
        );
        self.base_period = period;
        Ok(())
    }

    /// Run on the current thread until stopped, then shut down
    pub fn run(&mut self) {
        self.start();

        while self.running.load(Ordering::Relaxed) && !self.stopped {
            let tick_started = self.clock.now_ms();

            self.process_commands();
            if self.stopped {
                break;
            }

            self.tick();

            if self.last_stats_time.elapsed() >= STATS_LOG_INTERVAL {
                self.log_stats();
                self.last_stats_time = Instant::now();
            }

            self.rate_limit(tick_started);
        }

        self.shutdown();
        tracing::info!("[{}] Source thread exiting", self.source_id);
    }

    /// Run on a named thread; the handle yields the final counters
    pub fn spawn(mut self) -> Result<JoinHandle<SourceStats>> {
        let handle = std::thread::Builder::new()
            .name(format!("source-{}", self.source_id))
            .spawn(move || {
                self.run();
                self.stats()
            })?;
        Ok(handle)
    }

    /// Announce `online` and start the heartbeat
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        tracing::info!(
            "[{}] Source started: {} stages, tier {}, tick every {} ms",
            self.source_id,
            self.executor.stage_names().len(),
            self.tier,
            self.base_period.as_millis()
        );

        if let Err(e) = self.publisher.publish_status(SourceStatus::Online) {
            tracing::warn!("[{}] Could not announce online: {}", self.source_id, e);
        }

        match Heartbeat::spawn(
            self.source_id.clone(),
            self.publisher.transport(),
            self.publisher.shared(),
            self.clock.clone(),
            self.heartbeat_interval,
            self.send_timeout,
        ) {
            Ok(heartbeat) => self.heartbeat = Some(heartbeat),
            Err(e) => tracing::error!("[{}] Heartbeat not started: {}", self.source_id, e),
        }
    }

    fn process_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(SourceCommand::SetTickPeriod(period)) => {
                    if let Err(e) = self.set_tick_period(period) {
                        tracing::warn!("[{}] {}", self.source_id, e);
                    }
                }
                Ok(SourceCommand::SetBackoffSchedule(schedule)) => {
                    if let Err(e) = self.publisher.set_backoff_schedule(schedule) {
                        tracing::warn!("[{}] {}", self.source_id, e);
                    }
                }
                Ok(SourceCommand::Stop) => {
                    tracing::info!("[{}] Stop requested", self.source_id);
                    self.stopped = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Capture one frame, run the chain over it and publish the record
    pub fn tick(&mut self) -> Option<TickSummary> {
        let tick_id = self.next_tick_id;
        self.next_tick_id += 1;

        let frame = match self.capture.capture(tick_id, self.clock.now_ms()) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.capture_errors += 1;
                tracing::warn!("[{}] Capture failed on tick {}: {}", self.source_id, tick_id, e);
                return None;
            }
        };

        let gate = self.gate.as_ref().map(|g| g as &dyn AcceleratorGate);
        let report = self.executor.run_tick(frame, gate);
        self.stats.ticks += 1;
        if report.is_aborted() {
            self.stats.aborted_ticks += 1;
        }
        self.adjust_backoff(&report);

        let TickReport {
            record,
            runs,
            aborted_at,
            grant,
        } = report;
        let published = match self.publisher.publish(record, self.tier) {
            Ok(outcome) => {
                match outcome {
                    PublishOutcome::Delivered { .. } => self.stats.delivered += 1,
                    PublishOutcome::Queued => self.stats.queued += 1,
                }
                Some(outcome)
            }
            Err(e) => {
                self.stats.publish_errors += 1;
                tracing::error!("[{}] Record for tick {} lost: {}", self.source_id, tick_id, e);
                None
            }
        };

        Some(TickSummary {
            tick_id,
            runs,
            aborted_at,
            grant,
            published,
        })
    }

    fn adjust_backoff(&mut self, report: &TickReport) {
        let Some(grant) = report.grant.as_ref() else {
            return;
        };
        if grant.outcome == GrantOutcome::Degraded {
            self.stats.degraded_ticks += 1;
            if self.backoff_multiplier < self.max_tick_backoff {
                self.backoff_multiplier += 1;
                tracing::warn!(
                    "[{}] Slot missed, stretching tick period to {} ms",
                    self.source_id,
                    self.effective_period().as_millis()
                );
            }
        } else if self.backoff_multiplier > 1 {
            self.backoff_multiplier = 1;
            tracing::info!(
                "[{}] Slot regained, tick period back to {} ms",
                self.source_id,
                self.base_period.as_millis()
            );
        }
    }

    // ── Rate limiting ──

    fn rate_limit(&self, tick_started_ms: u64) {
        let target = self.effective_period();
        let elapsed = Duration::from_millis(self.clock.now_ms().saturating_sub(tick_started_ms));
        if elapsed < target {
            self.clock.sleep(target - elapsed);
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        let outstanding = self
            .capture
            .release_counter()
            .map(|c| c.outstanding())
            .unwrap_or(0);
        tracing::debug!(
            "[{}] ticks={} aborted={} degraded={} delivered={} queued={} backlog={} outstanding_frames={}",
            self.source_id,
            stats.ticks,
            stats.aborted_ticks,
            stats.degraded_ticks,
            stats.delivered,
            stats.queued,
            stats.publisher.backlog,
            outstanding
        );
    }

    /// Stop the stages, flush the backlog and announce `offline`
    ///
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.scheduler().unregister(gate.slot());
        }
        if !self.started {
            return;
        }
        self.started = false;
        tracing::info!("[{}] Shutting down", self.source_id);

        self.executor.shutdown();

        let remaining = self.publisher.flush();
        if remaining > 0 {
            tracing::warn!(
                "[{}] {} messages still queued at shutdown",
                self.source_id,
                remaining
            );
        }

        if let Err(e) = self.publisher.publish_status(SourceStatus::Offline) {
            tracing::warn!("[{}] Could not announce offline: {}", self.source_id, e);
        }

        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
    }
}

impl Drop for SourceRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CapturedFrame, FrameMeta};
    use crate::clock::{Clock, ManualClock};
    use crate::config::{ArbitrationMode, SourceSettings};
    use crate::publisher::{ChannelTransport, MessageBody, OutboundMessage};
    use crate::scheduler::SlotScheduler;

    struct StillCapture {
        fail_on: Option<u64>,
    }

    impl CaptureSource for StillCapture {
        fn name(&self) -> &str {
            "still"
        }

        fn capture(&mut self, tick_id: u64, timestamp_ms: u64) -> Result<CapturedFrame> {
            if self.fail_on == Some(tick_id) {
                return Err(ArbiterError::Capture("lens cap".into()));
            }
            let meta = FrameMeta {
                width: 8,
                height: 8,
                timestamp_ms,
                tick_id,
            };
            Ok(CapturedFrame::new(meta, vec![128; 64]))
        }
    }

    fn config() -> ArbiterConfig {
        let mut config = ArbiterConfig::default();
        config.pipeline.tick_period_ms = 1000;
        config.publisher.heartbeat_interval_ms = 60_000;
        config.schedule.max_tick_backoff = 3;
        config
    }

    fn runner(
        clock: &ManualClock,
        fail_on: Option<u64>,
    ) -> (SourceRunner, Sender<SourceCommand>, Receiver<Vec<u8>>) {
        let config = config();
        let (transport, rx) = ChannelTransport::new(64);
        let (_req_tx, req_rx) = unbounded();
        let (runner, cmd_tx) = SourceBuilder::new(
            &config,
            &SourceSettings::new("cam0", 0),
            Arc::new(clock.clone()),
        )
        .capture(Box::new(StillCapture { fail_on }))
        .transport(Arc::new(transport))
        .default_stages(None, req_rx)
        .unwrap()
        .build()
        .unwrap();
        (runner, cmd_tx, rx)
    }

    fn drain(rx: &Receiver<Vec<u8>>) -> Vec<OutboundMessage> {
        rx.try_iter()
            .map(|bytes| OutboundMessage::decode(&bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_lifecycle_announces_status_around_data() {
        let clock = ManualClock::new(10_000);
        let (mut runner, _cmd, rx) = runner(&clock, None);

        runner.start();
        runner.tick().unwrap();
        runner.tick().unwrap();
        runner.shutdown();

        let messages = drain(&rx);
        assert!(matches!(
            messages.first().unwrap().body(),
            MessageBody::Status {
                status: SourceStatus::Online
            }
        ));
        assert!(matches!(
            messages.last().unwrap().body(),
            MessageBody::Status {
                status: SourceStatus::Offline
            }
        ));
        let sequences: Vec<u32> = messages
            .iter()
            .filter(|m| m.is_data())
            .map(|m| m.sequence())
            .collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[test]
    fn test_capture_failure_skips_tick() {
        let clock = ManualClock::new(0);
        let (mut runner, _cmd, _rx) = runner(&clock, Some(1));

        assert!(runner.tick().is_some());
        assert!(runner.tick().is_none());
        assert!(runner.tick().is_some());

        let stats = runner.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.capture_errors, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[test]
    fn test_stop_command_ends_run() {
        let clock = ManualClock::new(0);
        let (mut runner, cmd, rx) = runner(&clock, None);

        cmd.send(SourceCommand::SetTickPeriod(Duration::from_millis(500)))
            .unwrap();
        cmd.send(SourceCommand::Stop).unwrap();
        runner.run();

        assert_eq!(runner.effective_period(), Duration::from_millis(500));
        assert_eq!(runner.stats().ticks, 0);
        // online then offline, no data
        assert_eq!(drain(&rx).len(), 2);
    }

    #[test]
    fn test_run_paces_ticks_on_the_clock() {
        let clock = ManualClock::new(0);
        let running = Arc::new(AtomicBool::new(true));
        let config = config();
        let (transport, _rx) = ChannelTransport::new(64);
        let (mut runner, cmd) = SourceBuilder::new(
            &config,
            &SourceSettings::new("cam0", 0),
            Arc::new(clock.clone()),
        )
        .capture(Box::new(StillCapture { fail_on: None }))
        .transport(Arc::new(transport))
        .running(running)
        .stage(BuiltinStage::Motion(MotionStage::new()))
        .unwrap()
        .build()
        .unwrap();

        runner.start();
        for _ in 0..3 {
            let started = clock.now_ms();
            runner.tick();
            runner.rate_limit(started);
        }
        cmd.send(SourceCommand::Stop).unwrap();
        runner.run();

        assert_eq!(clock.now_ms(), 3000);
        assert_eq!(runner.stats().ticks, 3);
    }

    #[test]
    fn test_degraded_grants_stretch_period() {
        let clock = ManualClock::new(0);
        let mut config = config();
        config.schedule.mode = ArbitrationMode::Locked;
        config.schedule.max_sources = 2;
        config.schedule.slot_duration_ms = 500;
        config.schedule.lock_ttl_ms = 60_000;
        let scheduler =
            Arc::new(SlotScheduler::new(&config.schedule, Arc::new(clock.clone())).unwrap());

        // Another holder keeps the lock for longer than a cycle
        scheduler.lock().try_acquire(4, 0);

        let (transport, _rx) = ChannelTransport::new(64);
        let (_req_tx, req_rx) = unbounded();
        let (mut runner, _cmd) = SourceBuilder::new(
            &config,
            &SourceSettings::new("cam0", 0),
            Arc::new(clock.clone()),
        )
        .capture(Box::new(StillCapture { fail_on: None }))
        .transport(Arc::new(transport))
        .scheduler(scheduler.clone())
        .default_stages(None, req_rx)
        .unwrap()
        .build()
        .unwrap();

        for _ in 0..5 {
            runner.tick();
        }
        let stats = runner.stats();
        assert_eq!(stats.degraded_ticks, 5);
        assert_eq!(runner.effective_period(), Duration::from_millis(3000));
    }

    #[test]
    fn test_shutdown_frees_slot() {
        let clock = ManualClock::new(0);
        let config = config();
        let scheduler =
            Arc::new(SlotScheduler::new(&config.schedule, Arc::new(clock.clone())).unwrap());
        let (transport, _rx) = ChannelTransport::new(64);
        let (mut runner, _cmd) = SourceBuilder::new(
            &config,
            &SourceSettings::new("cam0", 1),
            Arc::new(clock.clone()),
        )
        .capture(Box::new(StillCapture { fail_on: None }))
        .transport(Arc::new(transport))
        .scheduler(scheduler.clone())
        .build()
        .unwrap();

        assert!(scheduler.register(1, "cam9").is_err());
        runner.start();
        runner.shutdown();
        assert!(scheduler.register(1, "cam9").is_ok());
    }
}
