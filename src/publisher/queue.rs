//! Bounded retry ring for undelivered messages.
//!
//! Entries drain oldest first. When the ring is full the oldest entry of the
//! weakest tier present is evicted; a stronger tier is only touched once no
//! weaker entry is left. An incoming message weaker than everything queued is
//! dropped itself instead of displacing a stronger one.

use crate::config::DEFAULT_RETRY_QUEUE_DEPTH;
use crate::publisher::message::OutboundMessage;
use crate::types::GuaranteeTier;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct RetryEntry {
    pub message: OutboundMessage,
    /// Delivery attempts made so far
    pub attempt_count: u32,
    /// Earliest time (epoch ms) the next attempt may run
    pub next_attempt_at_ms: u64,
}

impl RetryEntry {
    pub fn new(message: OutboundMessage, attempt_count: u32, next_attempt_at_ms: u64) -> Self {
        Self {
            message,
            attempt_count,
            next_attempt_at_ms,
        }
    }

    pub fn tier(&self) -> GuaranteeTier {
        self.message.tier()
    }
}

#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<RetryEntry>,
    capacity: usize,
    evicted: [u64; 3],
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_RETRY_QUEUE_DEPTH)),
            capacity,
            evicted: [0; 3],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a new entry of `tier` would be kept rather than dropped
    pub fn would_admit(&self, tier: GuaranteeTier) -> bool {
        self.entries.len() < self.capacity
            || self.entries.iter().map(RetryEntry::tier).min().is_some_and(|w| w <= tier)
    }

    /// Append `entry`, evicting if full
    ///
    /// Returns the entry that was dropped, which may be `entry` itself.
    pub fn push(&mut self, entry: RetryEntry) -> Option<RetryEntry> {
        if self.entries.len() < self.capacity {
            self.entries.push_back(entry);
            return None;
        }
        if !self.would_admit(entry.tier()) {
            self.evicted[entry.tier().index()] += 1;
            return Some(entry);
        }

        let weakest = self.entries.iter().map(RetryEntry::tier).min();
        let index = weakest.and_then(|tier| self.entries.iter().position(|e| e.tier() == tier));
        let victim = index.and_then(|i| self.entries.remove(i));
        self.entries.push_back(entry);

        if let Some(v) = &victim {
            self.evicted[v.tier().index()] += 1;
        }
        victim
    }

    pub fn front(&self) -> Option<&RetryEntry> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut RetryEntry> {
        self.entries.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<RetryEntry> {
        self.entries.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetryEntry> {
        self.entries.iter()
    }

    /// Entries evicted so far for `tier`
    pub fn evicted(&self, tier: GuaranteeTier) -> u64 {
        self.evicted[tier.index()]
    }

    pub fn evicted_by_tier(&self) -> [u64; 3] {
        self.evicted
    }

    pub fn total_evicted(&self) -> u64 {
        self.evicted.iter().sum()
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_QUEUE_DEPTH)
    }
}
