//! Integration tests for the source-to-coordinator path
//!
//! These tests validate the complete per-tick workflow:
//! - Synthetic capture through the default stage chain
//! - Sequenced delivery and gap-free ingest at the coordinator
//! - Trigger, frame request and artifact round trip
//! - Frames released on every tick

#![cfg(feature = "synthetic")]

mod common;

use common::builders::ConfigBuilder;
use common::mock_helpers::{data_sequences, drain_link};
use crossbeam_channel::{bounded, unbounded};
use edge_arbiter::capture::synthetic::{SyntheticCapture, SyntheticPattern};
use edge_arbiter::capture::ReleaseCounter;
use edge_arbiter::clock::{Clock, ManualClock};
use edge_arbiter::coordinator::{Coordinator, CoordinatorEvent};
use edge_arbiter::pipeline::stages::SyntheticDetector;
use edge_arbiter::publisher::ChannelTransport;
use edge_arbiter::scheduler::SlotScheduler;
use edge_arbiter::source::{SourceBuilder, SourceRunner};
use edge_arbiter::types::{SourceId, TriggerReason};
use edge_arbiter::ArbiterConfig;
use std::sync::Arc;

struct Rig {
    clock: ManualClock,
    cycle_ms: u64,
    coordinator: Coordinator,
    runners: Vec<SourceRunner>,
    releases: Vec<ReleaseCounter>,
    link: crossbeam_channel::Receiver<Vec<u8>>,
    events: crossbeam_channel::Receiver<CoordinatorEvent>,
}

impl Rig {
    fn new(config: &ArbiterConfig, patterns: &[SyntheticPattern]) -> Self {
        let clock = ManualClock::new(1_700_000_000_000);
        let scheduler =
            Arc::new(SlotScheduler::new(&config.schedule, Arc::new(clock.clone())).unwrap());
        let (transport, link) = ChannelTransport::new(1024);
        let transport = Arc::new(transport);
        let (events_tx, events) = unbounded();
        let coordinator =
            Coordinator::new(config, Arc::new(clock.clone())).with_events(events_tx);

        let mut runners = Vec::new();
        let mut releases = Vec::new();
        for (settings, pattern) in config.effective_sources().iter().zip(patterns) {
            let (requests_tx, requests_rx) = bounded(8);
            coordinator.route_requests(SourceId::new(settings.id.clone()), requests_tx);

            let capture = SyntheticCapture::new(settings.id.clone(), 64, 48).with_pattern(*pattern);
            releases.push(capture.releases().clone());

            let (mut runner, _commands) =
                SourceBuilder::new(config, settings, Arc::new(clock.clone()))
                    .capture(Box::new(capture))
                    .transport(transport.clone())
                    .scheduler(scheduler.clone())
                    .default_stages(Some(Box::new(SyntheticDetector::new(2))), requests_rx)
                    .unwrap()
                    .build()
                    .unwrap();
            runner.start();
            runners.push(runner);
        }

        Self {
            clock,
            cycle_ms: config.schedule.cycle_duration_ms,
            coordinator,
            runners,
            releases,
            link,
            events,
        }
    }

    /// One tick per source, then let the coordinator catch up
    ///
    /// Each round ends on the next cycle boundary.
    fn round(&mut self) {
        for runner in &mut self.runners {
            runner.tick();
        }
        for bytes in self.link.try_iter() {
            self.coordinator.handle_bytes(&bytes).unwrap();
        }
        let now = self.clock.now_ms();
        self.clock.set((now / self.cycle_ms + 1) * self.cycle_ms);
    }
}

#[test]
fn test_records_arrive_in_order_without_gaps() {
    let config = ConfigBuilder::new().sources(2, 200).build();
    let mut rig = Rig::new(
        &config,
        &[
            SyntheticPattern::Static { level: 50 },
            SyntheticPattern::Noise { amplitude: 4 },
        ],
    );

    for _ in 0..10 {
        rig.round();
    }

    let stats = rig.coordinator.stats();
    assert_eq!(stats.sequence_gaps, 0);
    for id in ["cam0", "cam1"] {
        let counters = stats.sources[&SourceId::new(id)];
        assert_eq!(counters.messages, 10);
        assert_eq!(counters.gaps, 0);
        assert_eq!(counters.memory_entries, 10);
        assert_eq!(
            rig.coordinator.validator().stats(&SourceId::new(id)).unwrap().last_sequence,
            Some(9)
        );
    }

    for releases in &rig.releases {
        assert_eq!(releases.issued(), 10);
        assert_eq!(releases.outstanding(), 0);
    }
}

#[test]
fn test_scene_cut_requests_and_receives_artifact() {
    let config = ConfigBuilder::new().sources(1, 500).build();
    let mut rig = Rig::new(&config, &[SyntheticPattern::SceneCut { every_ticks: 3 }]);

    // Ticks 0-2 dark, 3 bright: the cut fires a high-motion trigger
    for _ in 0..4 {
        rig.round();
    }
    let requested: Vec<_> = rig
        .events
        .try_iter()
        .filter_map(|e| match e {
            CoordinatorEvent::FrameRequested(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].reason, TriggerReason::HighMotion);
    assert_eq!(requested[0].tick_id, 3);

    // The next tick answers with the full frame
    rig.round();
    let received: Vec<_> = rig
        .events
        .try_iter()
        .filter_map(|e| match e {
            CoordinatorEvent::ArtifactReceived {
                request_id,
                attached,
                ..
            } => Some((request_id, attached)),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![(requested[0].request_id.clone(), true)]);

    let context = rig.coordinator.memory().context(&SourceId::new("cam0")).unwrap();
    assert_eq!(context.frames, 5);
    assert_eq!(context.artifacts, 1);
}

#[test]
fn test_cooldown_holds_back_repeat_triggers() {
    let config = ConfigBuilder::new().sources(1, 500).build();
    let mut rig = Rig::new(&config, &[SyntheticPattern::SceneCut { every_ticks: 2 }]);

    // A cut every other tick, all within one cooldown window
    for _ in 0..12 {
        rig.round();
    }

    let triggers = rig.coordinator.memory().stats();
    assert_eq!(triggers.fired(), 1);
    assert!(triggers.cooldown >= 4);
}

#[test]
fn test_shutdown_announces_offline_and_flushes() {
    let config = ConfigBuilder::new().sources(1, 200).build();
    let mut rig = Rig::new(&config, &[SyntheticPattern::Static { level: 10 }]);

    rig.round();
    rig.round();
    for runner in &mut rig.runners {
        runner.shutdown();
    }

    let messages = drain_link(&rig.link);
    assert!(data_sequences(&messages).is_empty());
    for bytes in messages.iter().map(|m| m.encode().unwrap()) {
        rig.coordinator.handle_bytes(&bytes).unwrap();
    }

    let liveness = rig.coordinator.liveness().get(&SourceId::new("cam0")).unwrap();
    assert_eq!(liveness.status.map(|s| s.to_string()), Some("offline".to_string()));
    assert!(rig.coordinator.check_liveness().is_empty());
}
