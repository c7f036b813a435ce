//! Pipeline executor: runs the stage chain once per tick.
//!
//! Each tick:
//! 1. Take ownership of the captured frame.
//! 2. Run stages in ascending priority, each against a borrowed view.
//! 3. Acquire the accelerator just before the first stage that needs it and
//!    give it back right after the last one.
//! 4. Stop at the first `Error` (including a budget overrun).
//! 5. Drop the frame, releasing it to its producer, and return the record.
//!
//! The frame and the accelerator grant are plain owned values inside
//! `run_tick`, so every exit path releases both exactly once.

use crate::capture::CapturedFrame;
use crate::error::{ArbiterError, Result};
use crate::pipeline::record::PipelineRecord;
use crate::pipeline::stage::{AnyStage, StageConfig, StageContext, StageOutcome};
use crate::scheduler::{AcceleratorGate, GrantOutcome, SlotGrant};
use crate::types::SourceId;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

/// Per-stage call statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub calls: u64,
    pub successes: u64,
    pub skips: u64,
    pub not_ready: u64,
    pub errors: u64,
    /// Calls that exceeded the stage budget
    pub overruns: u64,
    pub total_us: u64,
    pub max_us: u64,
}

impl StageStats {
    fn record(&mut self, outcome: &StageOutcome, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.calls += 1;
        self.total_us += us;
        self.max_us = self.max_us.max(us);
        match outcome {
            StageOutcome::Success => self.successes += 1,
            StageOutcome::Skip => self.skips += 1,
            StageOutcome::NotReady => self.not_ready += 1,
            StageOutcome::Error(_) => self.errors += 1,
        }
    }

    pub fn avg_us(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_us as f64 / self.calls as f64
        }
    }
}

/// One stage in the chain with its statistics
struct StageSlot {
    stage: AnyStage,
    stats: StageStats,
}

/// Ordered set of stages collected at startup
#[derive(Default)]
pub struct StageRegistry {
    stages: Vec<AnyStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage; names must be unique because they key the record
    pub fn register(&mut self, stage: impl Into<AnyStage>) -> Result<()> {
        let stage = stage.into();
        if self.stages.iter().any(|s| s.name() == stage.name()) {
            return Err(ArbiterError::ConfigInvalid(format!(
                "stage '{}' registered twice",
                stage.name()
            )));
        }
        self.stages.push(stage);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sort by priority, initialize every stage once and build the executor
    ///
    /// A stage whose `init` fails is logged and left out; the rest still run.
    pub fn build(
        self,
        source_id: SourceId,
        stage_budget: Duration,
        tables: &BTreeMap<String, toml::Table>,
    ) -> PipelineExecutor {
        let mut stages = self.stages;
        // Stable: equal priorities keep registration order.
        stages.sort_by_key(|s| s.priority());

        let mut slots = Vec::with_capacity(stages.len());
        for mut stage in stages {
            let config = StageConfig::new(tables.get(stage.name()).cloned().unwrap_or_default());
            match stage.init(&config) {
                Ok(()) => {
                    tracing::info!(
                        "[{}] Loaded stage: {} v{} (priority {})",
                        source_id,
                        stage.name(),
                        stage.version(),
                        stage.priority()
                    );
                    slots.push(StageSlot {
                        stage,
                        stats: StageStats::default(),
                    });
                }
                Err(e) => {
                    tracing::error!(
                        "[{}] Stage '{}' failed to initialize, disabled: {}",
                        source_id,
                        stage.name(),
                        e
                    );
                }
            }
        }

        for slot in &mut slots {
            slot.stage.on_start();
        }

        PipelineExecutor::from_slots(source_id, slots, stage_budget)
    }
}

/// Result of running one stage on one tick
#[derive(Debug, Clone, PartialEq)]
pub struct StageRun {
    pub stage: String,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

/// How the accelerator was obtained for a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantSummary {
    pub outcome: GrantOutcome,
    pub waited: Duration,
}

/// Everything one tick produced
#[derive(Debug)]
pub struct TickReport {
    pub record: PipelineRecord,
    pub runs: Vec<StageRun>,
    /// Name of the stage whose error ended the tick early
    pub aborted_at: Option<String>,
    pub grant: Option<GrantSummary>,
}

impl TickReport {
    pub fn is_aborted(&self) -> bool {
        self.aborted_at.is_some()
    }

    pub fn outcome_of(&self, stage: &str) -> Option<&StageOutcome> {
        self.runs
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }
}

/// Aggregate executor statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorStats {
    pub ticks: u64,
    pub aborted_ticks: u64,
    pub degraded_ticks: u64,
    pub stages: Vec<(String, StageStats)>,
}

/// Priority-ordered chain of initialized stages for one source
pub struct PipelineExecutor {
    source_id: SourceId,
    slots: Vec<StageSlot>,
    /// Index of the last stage that needs the accelerator
    last_accelerator_stage: Option<usize>,
    stage_budget: Duration,
    ticks: u64,
    aborted_ticks: u64,
    degraded_ticks: u64,
    shut_down: bool,
}

impl PipelineExecutor {
    fn from_slots(source_id: SourceId, slots: Vec<StageSlot>, stage_budget: Duration) -> Self {
        let last_accelerator_stage = slots
            .iter()
            .rposition(|s| s.stage.requires_accelerator());
        Self {
            source_id,
            slots,
            last_accelerator_stage,
            stage_budget,
            ticks: 0,
            aborted_ticks: 0,
            degraded_ticks: 0,
            shut_down: false,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.stage.name()).collect()
    }

    pub fn stage_budget(&self) -> Duration {
        self.stage_budget
    }

    /// Run every stage against `frame`
    ///
    /// Without a gate, accelerator stages run ungated.
    ///
    /// The stage budget is checked after `process` returns: an overrun turns
    /// that stage's outcome into `Error` and aborts the tick, but a stage is
    /// never interrupted. A stage that does not return stalls its source.
    pub fn run_tick(
        &mut self,
        frame: CapturedFrame,
        gate: Option<&dyn AcceleratorGate>,
    ) -> TickReport {
        let meta = *frame.meta();
        let mut record = PipelineRecord::new(self.source_id.clone(), meta.tick_id, meta.timestamp_ms);
        let mut runs = Vec::with_capacity(self.slots.len());
        let mut aborted_at = None;
        let mut grant: Option<SlotGrant<'_>> = None;
        let mut grant_summary = None;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let name = slot.stage.name().to_string();
            let mut degraded = false;

            if slot.stage.requires_accelerator() {
                if grant.is_none() {
                    if let Some(gate) = gate {
                        let acquired = gate.acquire();
                        grant_summary = Some(GrantSummary {
                            outcome: acquired.outcome(),
                            waited: acquired.waited(),
                        });
                        grant = Some(acquired);
                    }
                }
                if let Some(g) = &grant {
                    if !g.permits_inference() {
                        slot.stats.record(&StageOutcome::NotReady, Duration::ZERO);
                        runs.push(StageRun {
                            stage: name,
                            outcome: StageOutcome::NotReady,
                            elapsed: Duration::ZERO,
                        });
                        record.degraded = true;
                        if Some(index) == self.last_accelerator_stage {
                            grant = None;
                        }
                        continue;
                    }
                    degraded = g.is_degraded();
                    record.degraded |= degraded;
                }
            }

            let started = Instant::now();
            let mut outcome = {
                let mut ctx = StageContext {
                    frame: frame.view(),
                    record: &mut record,
                    tick_id: meta.tick_id,
                    timestamp_ms: meta.timestamp_ms,
                    degraded,
                };
                slot.stage.process(&mut ctx)
            };
            let elapsed = started.elapsed();

            if elapsed > self.stage_budget && !outcome.is_error() {
                slot.stats.overruns += 1;
                record.remove(&name);
                outcome = StageOutcome::Error(format!(
                    "exceeded {} ms budget ({} ms)",
                    self.stage_budget.as_millis(),
                    elapsed.as_millis()
                ));
            }
            slot.stats.record(&outcome, elapsed);

            if Some(index) == self.last_accelerator_stage {
                // Release the accelerator as soon as nobody else needs it.
                grant = None;
            }

            if let StageOutcome::Error(message) = &outcome {
                tracing::error!(
                    "[{}] Stage '{}' failed on tick {}: {}",
                    self.source_id,
                    name,
                    meta.tick_id,
                    message
                );
                aborted_at = Some(name.clone());
                runs.push(StageRun {
                    stage: name,
                    outcome,
                    elapsed,
                });
                break;
            }

            runs.push(StageRun {
                stage: name,
                outcome,
                elapsed,
            });
        }

        drop(grant);
        drop(frame);

        self.ticks += 1;
        if aborted_at.is_some() {
            self.aborted_ticks += 1;
        }
        if record.degraded {
            self.degraded_ticks += 1;
        }

        TickReport {
            record,
            runs,
            aborted_at,
            grant: grant_summary,
        }
    }

    /// Stop and clean up every stage
    ///
    /// `on_stop` runs in chain order, then `cleanup` in reverse. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for slot in &mut self.slots {
            slot.stage.on_stop();
        }
        for slot in self.slots.iter_mut().rev() {
            tracing::debug!("[{}] Cleaning up stage: {}", self.source_id, slot.stage.name());
            slot.stage.cleanup();
        }
        tracing::info!("[{}] Pipeline shut down after {} ticks", self.source_id, self.ticks);
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            ticks: self.ticks,
            aborted_ticks: self.aborted_ticks,
            degraded_ticks: self.degraded_ticks,
            stages: self
                .slots
                .iter()
                .map(|s| (s.stage.name().to_string(), s.stats))
                .collect(),
        }
    }
}

impl Drop for PipelineExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Names of stages present in `executor` that need the accelerator
pub fn accelerator_stages(executor: &PipelineExecutor) -> HashSet<String> {
    executor
        .slots
        .iter()
        .filter(|s| s.stage.requires_accelerator())
        .map(|s| s.stage.name().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMeta, ReleaseCounter};
    use crate::pipeline::record::StageOutput;
    use crate::pipeline::stage::StagePlugin;
    use crate::scheduler::SlotGrant;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Test stage with a scripted outcome that journals its lifecycle
    struct Probe {
        name: &'static str,
        priority: i32,
        accelerator: bool,
        outcome: StageOutcome,
        fail_init: bool,
        sleep: Duration,
        journal: Journal,
    }

    impl Probe {
        fn new(name: &'static str, priority: i32, journal: &Journal) -> Self {
            Self {
                name,
                priority,
                accelerator: false,
                outcome: StageOutcome::Success,
                fail_init: false,
                sleep: Duration::ZERO,
                journal: journal.clone(),
            }
        }

        fn log(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", event, self.name));
        }
    }

    impl StagePlugin for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn requires_accelerator(&self) -> bool {
            self.accelerator
        }

        fn init(&mut self, _config: &StageConfig) -> Result<()> {
            self.log("init");
            if self.fail_init {
                return Err(ArbiterError::stage(self.name, "no model"));
            }
            Ok(())
        }

        fn process(&mut self, ctx: &mut StageContext) -> StageOutcome {
            self.log("process");
            if !self.sleep.is_zero() {
                std::thread::sleep(self.sleep);
            }
            ctx.record.insert(
                self.name,
                StageOutput::Custom {
                    value: serde_json::json!({ "degraded": ctx.degraded }),
                },
            );
            self.outcome.clone()
        }

        fn cleanup(&mut self) {
            self.log("cleanup");
        }
    }

    fn plugin(p: Probe) -> AnyStage {
        AnyStage::Plugin(Box::new(p))
    }

    fn frame(counter: &ReleaseCounter, tick_id: u64) -> CapturedFrame {
        counter.track(CapturedFrame::new(
            FrameMeta {
                width: 2,
                height: 2,
                timestamp_ms: 1_000 + tick_id,
                tick_id,
            },
            vec![0; 4],
        ))
    }

    fn build(stages: Vec<AnyStage>) -> PipelineExecutor {
        let mut registry = StageRegistry::new();
        for s in stages {
            registry.register(s).unwrap();
        }
        registry.build(
            SourceId::new("cam1"),
            Duration::from_millis(100),
            &BTreeMap::new(),
        )
    }

    fn processed(journal: &Journal) -> Vec<String> {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("process:"))
            .cloned()
            .collect()
    }

    /// Gate that counts acquisitions and returns a fixed outcome
    struct FlagGate {
        acquisitions: AtomicU32,
        outcome: GrantOutcome,
    }

    impl AcceleratorGate for FlagGate {
        fn acquire(&self) -> SlotGrant<'_> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            SlotGrant::unlocked(0, Duration::from_millis(5), self.outcome)
        }
    }

    #[test]
    fn test_runs_in_priority_order() {
        let journal = Journal::default();
        let mut executor = build(vec![
            plugin(Probe::new("c", 30, &journal)),
            plugin(Probe::new("a", 10, &journal)),
            plugin(Probe::new("b", 20, &journal)),
        ]);
        assert_eq!(executor.stage_names(), vec!["a", "b", "c"]);

        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), None);
        assert_eq!(
            processed(&journal),
            vec!["process:a", "process:b", "process:c"]
        );
        assert_eq!(report.record.outputs.len(), 3);
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn test_skip_and_not_ready_continue() {
        let journal = Journal::default();
        let mut skip = Probe::new("skip", 1, &journal);
        skip.outcome = StageOutcome::Skip;
        let mut wait = Probe::new("wait", 2, &journal);
        wait.outcome = StageOutcome::NotReady;
        let mut executor = build(vec![
            plugin(skip),
            plugin(wait),
            plugin(Probe::new("last", 3, &journal)),
        ]);

        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), None);
        assert!(!report.is_aborted());
        assert_eq!(report.runs.len(), 3);
        assert_eq!(report.outcome_of("last"), Some(&StageOutcome::Success));
    }

    #[test]
    fn test_error_aborts_rest_of_tick_only() {
        let journal = Journal::default();
        let mut bad = Probe::new("bad", 2, &journal);
        bad.outcome = StageOutcome::Error("corrupt frame".into());
        let mut executor = build(vec![
            plugin(Probe::new("first", 1, &journal)),
            plugin(bad),
            plugin(Probe::new("never", 3, &journal)),
        ]);

        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), None);
        assert_eq!(report.aborted_at.as_deref(), Some("bad"));
        assert_eq!(processed(&journal), vec!["process:first", "process:bad"]);
        assert_eq!(counter.outstanding(), 0);

        // The next tick runs the whole chain again
        executor.run_tick(frame(&counter, 1), None);
        assert_eq!(processed(&journal).len(), 4);
        assert_eq!(executor.stats().aborted_ticks, 2);
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn test_budget_overrun_is_error() {
        let journal = Journal::default();
        let mut slow = Probe::new("slow", 1, &journal);
        slow.sleep = Duration::from_millis(30);
        let mut registry = StageRegistry::new();
        registry.register(plugin(slow)).unwrap();
        registry
            .register(plugin(Probe::new("after", 2, &journal)))
            .unwrap();
        let mut executor = registry.build(
            SourceId::new("cam1"),
            Duration::from_millis(10),
            &BTreeMap::new(),
        );

        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), None);
        assert_eq!(report.aborted_at.as_deref(), Some("slow"));
        assert!(report.record.get("slow").is_none());
        let stats = executor.stats();
        assert_eq!(stats.stages[0].1.overruns, 1);
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn test_failed_init_drops_stage() {
        let journal = Journal::default();
        let mut broken = Probe::new("broken", 1, &journal);
        broken.fail_init = true;
        let executor = build(vec![plugin(broken), plugin(Probe::new("ok", 2, &journal))]);
        assert_eq!(executor.stage_names(), vec!["ok"]);
    }

    #[test]
    fn test_duplicate_stage_name_rejected() {
        let journal = Journal::default();
        let mut registry = StageRegistry::new();
        registry.register(plugin(Probe::new("x", 1, &journal))).unwrap();
        assert!(registry.register(plugin(Probe::new("x", 2, &journal))).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cleanup_in_reverse_order_once() {
        let journal = Journal::default();
        let mut executor = build(vec![
            plugin(Probe::new("a", 1, &journal)),
            plugin(Probe::new("b", 2, &journal)),
        ]);
        executor.shutdown();
        executor.shutdown();
        drop(executor);

        let cleanups: Vec<String> = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("cleanup:"))
            .cloned()
            .collect();
        assert_eq!(cleanups, vec!["cleanup:b", "cleanup:a"]);
    }

    #[test]
    fn test_accelerator_acquired_lazily_once() {
        let journal = Journal::default();
        let mut npu1 = Probe::new("npu1", 2, &journal);
        npu1.accelerator = true;
        let mut npu2 = Probe::new("npu2", 3, &journal);
        npu2.accelerator = true;
        let mut executor = build(vec![
            plugin(Probe::new("pre", 1, &journal)),
            plugin(npu1),
            plugin(npu2),
        ]);
        assert_eq!(accelerator_stages(&executor).len(), 2);

        let gate = FlagGate {
            acquisitions: AtomicU32::new(0),
            outcome: GrantOutcome::OnTime,
        };
        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), Some(&gate));
        assert_eq!(gate.acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.grant,
            Some(GrantSummary {
                outcome: GrantOutcome::OnTime,
                waited: Duration::from_millis(5)
            })
        );
        assert!(!report.record.degraded);
    }

    #[test]
    fn test_no_accelerator_stage_never_acquires() {
        let journal = Journal::default();
        let mut executor = build(vec![plugin(Probe::new("cpu", 1, &journal))]);
        let gate = FlagGate {
            acquisitions: AtomicU32::new(0),
            outcome: GrantOutcome::OnTime,
        };
        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), Some(&gate));
        assert_eq!(gate.acquisitions.load(Ordering::SeqCst), 0);
        assert!(report.grant.is_none());
    }

    #[test]
    fn test_degraded_grant_marks_record() {
        let journal = Journal::default();
        let mut npu = Probe::new("npu", 1, &journal);
        npu.accelerator = true;
        let mut executor = build(vec![plugin(npu)]);
        let gate = FlagGate {
            acquisitions: AtomicU32::new(0),
            outcome: GrantOutcome::Degraded,
        };
        let counter = ReleaseCounter::new();
        let report = executor.run_tick(frame(&counter, 0), Some(&gate));
        assert!(report.record.degraded);
        assert_eq!(
            report.record.get("npu"),
            Some(&StageOutput::Custom {
                value: serde_json::json!({ "degraded": true })
            })
        );
        assert_eq!(executor.stats().degraded_ticks, 1);
    }
}
