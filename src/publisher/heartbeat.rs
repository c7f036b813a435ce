//! Periodic heartbeat thread, decoupled from the tick loop.
//!
//! A source stuck in a long slot wait or a publish backoff keeps sending
//! heartbeats, so the coordinator can tell "slow" from "dead".

use crate::clock::SharedClock;
use crate::error::Result;
use crate::publisher::message::{HeartbeatInfo, OutboundMessage};
use crate::publisher::transport::Transport;
use crate::publisher::PublisherShared;
use crate::types::SourceId;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Handle to a running heartbeat thread; stops it on drop
pub struct Heartbeat {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    beats: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn spawn(
        source_id: SourceId,
        transport: Arc<dyn Transport>,
        shared: Arc<PublisherShared>,
        clock: SharedClock,
        interval: Duration,
        send_timeout: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let beats = Arc::new(AtomicU64::new(0));
        let thread_beats = beats.clone();
        let started_ms = clock.now_ms();

        let handle = std::thread::Builder::new()
            .name(format!("heartbeat-{}", source_id))
            .spawn(move || {
                tracing::debug!("[{}] Heartbeat every {} ms", source_id, interval.as_millis());
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let now = clock.now_ms();
                    let info = HeartbeatInfo {
                        uptime_ms: now.saturating_sub(started_ms),
                        last_sequence: shared.last_sequence(),
                        backlog: shared.backlog(),
                    };
                    let message =
                        OutboundMessage::heartbeat(source_id.clone(), shared.next_sequence(), info, now);
                    match transport.send(&message, send_timeout) {
                        Ok(()) => {
                            thread_beats.fetch_add(1, Ordering::Relaxed);
                        }
                        // At-most-once: a lost heartbeat is replaced by the next one
                        Err(e) => tracing::debug!("[{}] Heartbeat not delivered: {}", source_id, e),
                    }
                }
                tracing::debug!("[{}] Heartbeat stopped", source_id);
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            beats,
        })
    }

    /// Heartbeats delivered so far
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
