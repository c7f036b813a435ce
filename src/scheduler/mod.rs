//! Slot scheduler for the shared accelerator
//!
//! Up to `max_sources` sources share one serialized accelerator. Each source
//! registers once and receives a fixed window inside a repeating cycle:
//!
//! ```text
//! |  slot 0  |  slot 1  |  slot 2  |  slot 3  |  slot 4  |  slot 0  | ...
//! 0         200        400        600        800       1000
//! ```
//!
//! `wait_for_slot` sleeps until the caller's window opens. In
//! [`ArbitrationMode::Locked`] the caller then takes an exclusive lock whose
//! holder is evicted once it overruns `lock_ttl_ms`, so a crashed source can
//! never wedge the accelerator. Waits are bounded by one cycle; after that
//! the caller gets a degraded grant and the configured [`OverrunPolicy`]
//! decides whether inference still runs.

mod cycle;
mod lock;
mod stats;

pub use cycle::{ScheduleCycle, SourceSlot};
pub use lock::{AcceleratorLock, AcquireAttempt, LockGuard, LockHolder};
pub use stats::{SchedulerStats, SchedulerStatsSnapshot};

use crate::clock::SharedClock;
use crate::config::{ArbitrationMode, OverrunPolicy, ScheduleSettings};
use crate::error::{ArbiterError, Result};
use crate::types::SourceId;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a grant was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Window reached and, in locked mode, lock free
    OnTime,
    /// A stale holder was evicted to obtain the lock
    Reclaimed,
    /// No exclusive access within one cycle
    Degraded,
}

/// Permission to use the accelerator for the rest of the current tick
///
/// In locked mode the grant owns the lock; dropping it releases the lock.
#[derive(Debug)]
pub struct SlotGrant<'a> {
    slot_index: usize,
    waited: Duration,
    outcome: GrantOutcome,
    permits_inference: bool,
    guard: Option<LockGuard<'a>>,
}

impl<'a> SlotGrant<'a> {
    /// Grant that does not hold the lock
    pub fn unlocked(slot_index: usize, waited: Duration, outcome: GrantOutcome) -> Self {
        Self {
            slot_index,
            waited,
            outcome,
            permits_inference: true,
            guard: None,
        }
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn outcome(&self) -> GrantOutcome {
        self.outcome
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome == GrantOutcome::Degraded
    }

    /// Whether accelerator stages may run under this grant
    pub fn permits_inference(&self) -> bool {
        self.permits_inference
    }

    pub fn holds_lock(&self) -> bool {
        self.guard.as_ref().is_some_and(|g| g.is_held())
    }
}

/// Anything that can hand out accelerator grants to a pipeline
pub trait AcceleratorGate: Send + Sync {
    /// Block until the accelerator may be used (bounded by one cycle)
    fn acquire(&self) -> SlotGrant<'_>;
}

/// Time-division scheduler with optional crash-safe lock
pub struct SlotScheduler {
    cycle: ScheduleCycle,
    mode: ArbitrationMode,
    overrun_policy: OverrunPolicy,
    poll_interval_ms: u64,
    clock: SharedClock,
    lock: AcceleratorLock,
    registry: Mutex<Vec<Option<SourceId>>>,
    stats: SchedulerStats,
}

impl SlotScheduler {
    pub fn new(settings: &ScheduleSettings, clock: SharedClock) -> Result<Self> {
        let cycle = ScheduleCycle::from_settings(settings)?;
        if settings.mode == ArbitrationMode::Locked && settings.lock_ttl_ms == 0 {
            return Err(ArbiterError::ConfigInvalid(
                "lock_ttl_ms must be greater than 0 in locked mode".to_string(),
            ));
        }

        tracing::info!(
            "Slot scheduler: {} sources x {} ms in a {} ms cycle ({:?})",
            cycle.max_sources,
            cycle.slot_duration_ms,
            cycle.cycle_duration_ms,
            settings.mode
        );

        Ok(Self {
            cycle,
            mode: settings.mode,
            overrun_policy: settings.overrun_policy,
            poll_interval_ms: settings.lock_poll_interval_ms.max(1),
            clock,
            lock: AcceleratorLock::new(settings.lock_ttl_ms),
            registry: Mutex::new(vec![None; cycle.max_sources]),
            stats: SchedulerStats::new(),
        })
    }

    pub fn cycle(&self) -> ScheduleCycle {
        self.cycle
    }

    pub fn mode(&self) -> ArbitrationMode {
        self.mode
    }

    pub fn lock(&self) -> &AcceleratorLock {
        &self.lock
    }

    /// Assign `source_index` to `source_id`
    ///
    /// Registering the same source at the same index again returns the same
    /// slot; any other clash is a configuration error.
    pub fn register(&self, source_index: usize, source_id: impl Into<SourceId>) -> Result<SourceSlot> {
        let source_id = source_id.into();
        if source_index >= self.cycle.max_sources {
            return Err(ArbiterError::ConfigInvalid(format!(
                "slot index {} out of range (max_sources = {})",
                source_index, self.cycle.max_sources
            )));
        }

        let mut registry = self
            .registry
            .lock()
            .map_err(|_| ArbiterError::Channel("slot registry poisoned".to_string()))?;

        match &registry[source_index] {
            Some(owner) if *owner != source_id => {
                return Err(ArbiterError::ConfigInvalid(format!(
                    "slot {} already registered to {}",
                    source_index, owner
                )));
            }
            _ => {}
        }
        if let Some(other) = registry
            .iter()
            .position(|o| o.as_ref() == Some(&source_id))
            .filter(|&i| i != source_index)
        {
            return Err(ArbiterError::ConfigInvalid(format!(
                "source {} already registered at slot {}",
                source_id, other
            )));
        }
        registry[source_index] = Some(source_id.clone());

        let slot = SourceSlot {
            source_id,
            slot_index: source_index,
            slot_offset_ms: self.cycle.offset_for(source_index),
        };
        tracing::info!(
            "Registered source {} at slot {} (offset {} ms)",
            slot.source_id,
            slot.slot_index,
            slot.slot_offset_ms
        );
        Ok(slot)
    }

    /// Free a slot so another source can register there
    pub fn unregister(&self, slot: &SourceSlot) {
        if let Ok(mut registry) = self.registry.lock() {
            if registry.get(slot.slot_index).and_then(|o| o.as_ref()) == Some(&slot.source_id) {
                registry[slot.slot_index] = None;
            }
        }
    }

    /// Index of the window open at `now_ms`
    pub fn active_slot_at(&self, now_ms: u64) -> Option<usize> {
        self.cycle.active_index(now_ms)
    }

    /// Block until `slot`'s window is open and return a grant
    ///
    /// Never blocks longer than one cycle plus one lock poll interval.
    pub fn wait_for_slot(&self, slot: &SourceSlot) -> SlotGrant<'_> {
        let start = self.clock.now_ms();
        let window_wait = self.cycle.wait_ms(slot.slot_offset_ms, start);
        if window_wait > 0 {
            tracing::trace!(
                "Source {} waiting {} ms for slot {}",
                slot.source_id,
                window_wait,
                slot.slot_index
            );
            self.clock.sleep(Duration::from_millis(window_wait));
        }

        match self.mode {
            ArbitrationMode::TimeDivision => self.grant(slot, start, GrantOutcome::OnTime, None),
            ArbitrationMode::Locked => self.acquire_lock(slot, start),
        }
    }

    /// Give the accelerator back
    ///
    /// A no-op under pure time-division; releases the lock otherwise.
    pub fn release(&self, grant: SlotGrant<'_>) {
        drop(grant);
    }

    fn acquire_lock(&self, slot: &SourceSlot, start: u64) -> SlotGrant<'_> {
        let deadline = start + self.cycle.cycle_duration_ms;
        let mut saw_busy = false;

        loop {
            let now = self.clock.now_ms();
            match self.lock.try_acquire(slot.holder_id(), now) {
                AcquireAttempt::Acquired { token } => {
                    let guard = LockGuard::new(&self.lock, token);
                    return self.grant(slot, start, GrantOutcome::OnTime, Some(guard));
                }
                AcquireAttempt::Reclaimed { token, previous } => {
                    self.stats.record_reclaim();
                    tracing::warn!(
                        "{}",
                        ArbiterError::ResourceContention {
                            source_id: slot.source_id.clone(),
                            message: format!(
                                "reclaimed lock from stale holder {} (held {} ms, ttl {} ms)",
                                previous.holder_id,
                                previous.held_for_ms(now),
                                self.lock.ttl_ms()
                            ),
                        }
                    );
                    let guard = LockGuard::new(&self.lock, token);
                    return self.grant(slot, start, GrantOutcome::Reclaimed, Some(guard));
                }
                AcquireAttempt::Busy { holder } => {
                    if !saw_busy {
                        self.stats.record_busy();
                        saw_busy = true;
                    }
                    if now >= deadline {
                        self.stats.record_degraded();
                        tracing::warn!(
                            "{}",
                            ArbiterError::ResourceContention {
                                source_id: slot.source_id.clone(),
                                message: format!(
                                    "no lock within one cycle (held by {}), proceeding degraded",
                                    holder.holder_id
                                ),
                            }
                        );
                        return self.grant(slot, start, GrantOutcome::Degraded, None);
                    }
                    let pause = self.poll_interval_ms.min(deadline - now);
                    self.clock.sleep(Duration::from_millis(pause));
                }
            }
        }
    }

    fn grant<'a>(
        &'a self,
        slot: &SourceSlot,
        start: u64,
        outcome: GrantOutcome,
        guard: Option<LockGuard<'a>>,
    ) -> SlotGrant<'a> {
        let waited_ms = self.clock.now_ms().saturating_sub(start);
        self.stats.record_wait(waited_ms);

        let permits_inference = outcome != GrantOutcome::Degraded
            || self.overrun_policy == OverrunPolicy::ProceedDegraded;

        SlotGrant {
            slot_index: slot.slot_index,
            waited: Duration::from_millis(waited_ms),
            outcome,
            permits_inference,
            guard,
        }
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn contention_count(&self) -> u64 {
        self.stats.contention_count()
    }
}

/// A registered slot bound to its scheduler
///
/// This is what a source's pipeline holds to reach the accelerator.
#[derive(Clone)]
pub struct SlotHandle {
    scheduler: Arc<SlotScheduler>,
    slot: SourceSlot,
}

impl SlotHandle {
    pub fn new(scheduler: Arc<SlotScheduler>, slot: SourceSlot) -> Self {
        Self { scheduler, slot }
    }

    pub fn slot(&self) -> &SourceSlot {
        &self.slot
    }

    pub fn scheduler(&self) -> &Arc<SlotScheduler> {
        &self.scheduler
    }
}

impl AcceleratorGate for SlotHandle {
    fn acquire(&self) -> SlotGrant<'_> {
        self.scheduler.wait_for_slot(&self.slot)
    }
}
