//! Reliable publisher
//!
//! One publisher per source turns each tick's [`PipelineRecord`] into a
//! sequenced [`OutboundMessage`] and pushes it through a [`Transport`].
//!
//! # Delivery
//!
//! 1. Try to drain the retry backlog, oldest first.
//! 2. If anything is still queued, append the new message behind it so the
//!    stream stays in order.
//! 3. Otherwise send it, retrying transient failures along the backoff
//!    schedule (1 s, 2 s, 4 s by default).
//! 4. When retries run out, park it in the bounded [`RetryQueue`].
//!
//! `AtMostOnce` messages get a single attempt and no local backoff. Sequence
//! numbers exist for loss detection downstream; nothing is retransmitted on
//! request.

mod heartbeat;
mod message;
mod queue;
mod transport;

pub use heartbeat::Heartbeat;
pub use message::{HeartbeatInfo, MessageBody, OutboundMessage, SourceStatus};
pub use queue::{RetryEntry, RetryQueue};
pub use transport::{ChannelTransport, LinkSwitch, Transport, DEFAULT_LINK_CAPACITY};

use crate::clock::SharedClock;
use crate::config::PublisherSettings;
use crate::error::{ArbiterError, Result};
use crate::pipeline::PipelineRecord;
use crate::types::{GuaranteeTier, SourceId};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NO_SEQUENCE: u64 = u64::MAX;

/// Publisher state readable from the heartbeat thread
#[derive(Debug)]
pub struct PublisherShared {
    last_sequence: AtomicU64,
    next_sequence: AtomicU32,
    backlog: AtomicUsize,
}

impl Default for PublisherShared {
    fn default() -> Self {
        Self {
            last_sequence: AtomicU64::new(NO_SEQUENCE),
            next_sequence: AtomicU32::new(0),
            backlog: AtomicUsize::new(0),
        }
    }
}

impl PublisherShared {
    pub fn last_sequence(&self) -> Option<u32> {
        match self.last_sequence.load(Ordering::Relaxed) {
            NO_SEQUENCE => None,
            seq => Some(seq as u32),
        }
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence.load(Ordering::Relaxed)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sequence(&self, sequence: u32) {
        self.last_sequence.store(sequence as u64, Ordering::Relaxed);
        self.next_sequence
            .store(sequence.wrapping_add(1), Ordering::Relaxed);
    }

    pub(crate) fn set_backlog(&self, depth: usize) {
        self.backlog.store(depth, Ordering::Relaxed);
    }
}

/// What happened to one published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered after `attempts` sends
    Delivered { attempts: u32 },
    /// Parked in the retry queue
    Queued,
}

/// Publisher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub delivered: u64,
    /// Sends beyond the first attempt
    pub retried: u64,
    pub queued: u64,
    /// Evictions per tier, weakest first
    pub evicted: [u64; 3],
    /// Messages that failed permanently
    pub dropped: u64,
    pub backlog: usize,
}

pub struct ReliablePublisher {
    source_id: SourceId,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
    backoff: Vec<Duration>,
    timeout: Duration,
    next_sequence: u32,
    queue: RetryQueue,
    shared: Arc<PublisherShared>,
    stats: PublisherStats,
}

impl ReliablePublisher {
    pub fn new(
        source_id: SourceId,
        settings: &PublisherSettings,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            source_id,
            transport,
            clock,
            backoff: settings.backoff_schedule(),
            timeout: settings.publish_timeout(),
            next_sequence: 0,
            queue: RetryQueue::new(settings.retry_queue_depth),
            shared: Arc::new(PublisherShared::default()),
            stats: PublisherStats::default(),
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Sequence the next data message will carry
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn shared(&self) -> Arc<PublisherShared> {
        self.shared.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            evicted: self.queue.evicted_by_tier(),
            backlog: self.queue.len(),
            ..self.stats
        }
    }

    /// Replace the retry backoff schedule at runtime
    pub fn set_backoff_schedule(&mut self, schedule: Vec<Duration>) -> Result<()> {
        if schedule.is_empty() {
            return Err(ArbiterError::ConfigInvalid(
                "retry backoff schedule must not be empty".to_string(),
            ));
        }
        tracing::info!("[{}] Retry backoff schedule now {:?}", self.source_id, schedule);
        self.backoff = schedule;
        Ok(())
    }

    /// Publish one tick's record
    ///
    /// Transient failures never surface here: the message ends up delivered
    /// or queued. An error means the message could not be sent at all.
    pub fn publish(&mut self, record: PipelineRecord, tier: GuaranteeTier) -> Result<PublishOutcome> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        self.shared.record_sequence(sequence);

        let message = OutboundMessage::data(
            self.source_id.clone(),
            sequence,
            tier,
            record,
            self.clock.now_ms(),
        );
        self.stats.published += 1;

        self.drain();
        if !self.queue.is_empty() {
            self.enqueue(message, 0, self.clock.now_ms());
            return Ok(PublishOutcome::Queued);
        }

        let outcome = self.deliver_with_retry(&message);
        match outcome {
            Ok(attempts) => {
                self.stats.delivered += 1;
                Ok(PublishOutcome::Delivered { attempts })
            }
            Err((attempts, e)) if e.is_transient() => {
                tracing::warn!(
                    "[{}] Message {} undelivered after {} attempts, queueing: {}",
                    self.source_id,
                    sequence,
                    attempts,
                    e
                );
                let retry_at = self.clock.now_ms() + self.backoff_ms(attempts);
                self.enqueue(message, attempts, retry_at);
                Ok(PublishOutcome::Queued)
            }
            Err((_, e)) => {
                self.stats.dropped += 1;
                tracing::error!("[{}] Dropping message {}: {}", self.source_id, sequence, e);
                Err(e)
            }
        }
    }

    /// Send an online/offline announcement with a single attempt
    pub fn publish_status(&mut self, status: SourceStatus) -> Result<()> {
        let message = OutboundMessage::status(
            self.source_id.clone(),
            self.next_sequence,
            status,
            self.clock.now_ms(),
        );
        self.transport.send(&message, self.timeout)?;
        tracing::info!("[{}] Announced {}", self.source_id, status);
        Ok(())
    }

    /// Deliver queued messages whose retry time has come
    ///
    /// Stops at the first failure so the stream stays in order.
    pub fn drain(&mut self) -> usize {
        self.drain_inner(false)
    }

    /// Try every queued message once, ignoring retry times
    ///
    /// Returns how many are still queued.
    pub fn flush(&mut self) -> usize {
        let delivered = self.drain_inner(true);
        tracing::info!(
            "[{}] Flushed {} queued messages, {} remaining",
            self.source_id,
            delivered,
            self.queue.len()
        );
        self.queue.len()
    }

    fn drain_inner(&mut self, ignore_schedule: bool) -> usize {
        if self.queue.is_empty() || !self.transport.is_connected() {
            return 0;
        }

        let now = self.clock.now_ms();
        let mut delivered = 0;
        while let Some(front) = self.queue.front_mut() {
            if !ignore_schedule && front.next_attempt_at_ms > now {
                break;
            }
            match self.transport.send(&front.message, self.timeout) {
                Ok(()) => {
                    self.queue.pop_front();
                    delivered += 1;
                }
                Err(e) if e.is_transient() => {
                    front.attempt_count += 1;
                    front.next_attempt_at_ms = now + backoff_ms(&self.backoff, front.attempt_count);
                    tracing::debug!(
                        "[{}] Backlog still blocked at message {}: {}",
                        self.source_id,
                        front.message.sequence(),
                        e
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        "[{}] Dropping queued message {}: {}",
                        self.source_id,
                        front.message.sequence(),
                        e
                    );
                    self.queue.pop_front();
                    self.stats.dropped += 1;
                }
            }
        }

        if delivered > 0 {
            self.stats.delivered += delivered as u64;
            tracing::info!(
                "[{}] Drained {} queued messages, {} remaining",
                self.source_id,
                delivered,
                self.queue.len()
            );
        }
        self.shared.set_backlog(self.queue.len());
        delivered
    }

    /// Send with local retries; returns attempts made
    fn deliver_with_retry(
        &mut self,
        message: &OutboundMessage,
    ) -> std::result::Result<u32, (u32, ArbiterError)> {
        let retries = match message.tier() {
            GuaranteeTier::AtMostOnce => 0,
            _ => self.backoff.len(),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.transport.send(message, self.timeout) {
                Ok(()) => return Ok(attempts),
                Err(e) => e,
            };
            let retry = attempts as usize - 1;
            if !err.is_transient() || retry >= retries {
                return Err((attempts, err));
            }

            let delay = self.backoff[retry];
            tracing::warn!(
                "[{}] Send of message {} failed (attempt {}), retrying in {} ms: {}",
                self.source_id,
                message.sequence(),
                attempts,
                delay.as_millis(),
                err
            );
            self.stats.retried += 1;
            self.clock.sleep(delay);
        }
    }

    fn enqueue(&mut self, message: OutboundMessage, attempts: u32, retry_at_ms: u64) {
        let admitted = self.queue.would_admit(message.tier());
        if admitted {
            self.stats.queued += 1;
        }
        if let Some(victim) = self.queue.push(RetryEntry::new(message, attempts, retry_at_ms)) {
            tracing::warn!(
                "[{}] Retry queue full ({}), {} {} message {}",
                self.source_id,
                self.queue.capacity(),
                if admitted { "evicted" } else { "dropped new" },
                victim.tier(),
                victim.message.sequence()
            );
        }
        self.shared.set_backlog(self.queue.len());
    }

    fn backoff_ms(&self, attempts: u32) -> u64 {
        backoff_ms(&self.backoff, attempts)
    }
}

/// Delay before attempt `attempts + 1`, holding at the last step
fn backoff_ms(schedule: &[Duration], attempts: u32) -> u64 {
    let index = (attempts as usize).saturating_sub(1);
    schedule
        .get(index)
        .or(schedule.last())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
