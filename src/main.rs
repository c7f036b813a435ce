//! edge-arbiter - Main Entry Point
//!
//! Runs every configured source against one coordinator in a single process,
//! using synthetic capture and inference. Stops on Ctrl-C.
//!
//! ```text
//! edge-arbiter [CONFIG_PATH]
//! ```

use anyhow::{Context, Result};
use edge_arbiter::{
    capture::synthetic::{SyntheticCapture, SyntheticPattern},
    clock::system_clock,
    config::{resolve_config_path, ArbiterConfig},
    coordinator::{Coordinator, CoordinatorEvent},
    pipeline::stages::SyntheticDetector,
    publisher::ChannelTransport,
    scheduler::SlotScheduler,
    source::SourceBuilder,
    telemetry,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// COCO "car"
const SYNTHETIC_CLASS: u32 = 2;

fn load_config() -> Result<ArbiterConfig> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let mut config = match resolve_config_path(explicit.as_deref()) {
        Some(path) => ArbiterConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ArbiterConfig::default(),
    };
    config.apply_env_overrides();
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn pattern_for(index: usize) -> SyntheticPattern {
    match index % 3 {
        0 => SyntheticPattern::MovingBar {
            width: 16,
            speed: 24,
        },
        1 => SyntheticPattern::SceneCut { every_ticks: 20 },
        _ => SyntheticPattern::Noise { amplitude: 6 },
    }
}

fn main() -> Result<()> {
    let config = load_config()?;
    let _telemetry = telemetry::init_tracing(&config.logging)?;

    tracing::info!(
        "Starting edge-arbiter: {} sources, {} ms slots over a {} ms cycle ({:?})",
        config.effective_sources().len(),
        config.schedule.slot_duration_ms,
        config.schedule.cycle_duration_ms,
        config.schedule.mode
    );

    let clock = system_clock();
    let running = Arc::new(AtomicBool::new(true));
    let scheduler = Arc::new(SlotScheduler::new(&config.schedule, clock.clone())?);
    let (transport, link) = ChannelTransport::new(config.coordinator.ingest_capacity);
    let transport = Arc::new(transport);

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let coordinator =
        Arc::new(Coordinator::new(&config, clock.clone()).with_events(events_tx));

    // Sources
    let mut source_handles = Vec::new();
    for (index, settings) in config.effective_sources().iter().enumerate() {
        let (requests_tx, requests_rx) = crossbeam_channel::bounded(16);
        coordinator.route_requests(settings.id.clone().into(), requests_tx);

        let capture = SyntheticCapture::new(
            settings.id.clone(),
            config.capture.width,
            config.capture.height,
        )
        .with_pattern(pattern_for(index))
        .with_seed(index as u64 + 1);
        let detector =
            SyntheticDetector::new(SYNTHETIC_CLASS).with_latency(Duration::from_millis(40));

        let (runner, _commands) = SourceBuilder::new(&config, settings, clock.clone())
            .capture(Box::new(capture))
            .transport(transport.clone())
            .scheduler(scheduler.clone())
            .running(running.clone())
            .default_stages(Some(Box::new(detector)), requests_rx)?
            .build()
            .with_context(|| format!("building source {}", settings.id))?;
        source_handles.push(runner.spawn()?);
    }

    // Stopped after the sources so their final messages are still consumed
    let coordinator_running = Arc::new(AtomicBool::new(true));
    let coordinator_handle = coordinator.clone().spawn(link, coordinator_running.clone())?;

    let event_logger = std::thread::Builder::new()
        .name("events".to_string())
        .spawn(move || {
            for event in events_rx {
                match event {
                    CoordinatorEvent::FrameRequested(request) => tracing::info!(
                        "Frame requested from {} ({})",
                        request.source_id,
                        request.reason
                    ),
                    other => tracing::debug!("{:?}", other),
                }
            }
        })?;

    // Wait for Ctrl-C
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting signal runtime")?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    tracing::info!("Shutting down...");
    running.store(false, Ordering::Relaxed);

    for handle in source_handles {
        match handle.join() {
            Ok(stats) => tracing::info!(
                "Source finished: {} ticks, {} degraded, {} delivered, {} dropped",
                stats.ticks,
                stats.degraded_ticks,
                stats.publisher.delivered,
                stats.publisher.dropped
            ),
            Err(_) => tracing::error!("Source thread panicked"),
        }
    }
    coordinator_running.store(false, Ordering::Relaxed);
    if coordinator_handle.join().is_err() {
        tracing::error!("Coordinator thread panicked");
    }

    let stats = coordinator.stats();
    tracing::info!(
        "Coordinator: {} messages, {} gaps, {} frame requests",
        stats.messages,
        stats.sequence_gaps,
        stats.requests_sent
    );

    // The coordinator held the last event sender
    drop(coordinator);
    let _ = event_logger.join();

    Ok(())
}
