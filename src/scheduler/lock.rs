//! Crash-safe exclusive lock on the shared accelerator
//!
//! The whole lock state lives in one `AtomicU64` so that acquire, release and
//! steal-if-stale are each a single compare-and-swap:
//!
//! ```text
//!  63            48 47                                  0
//! +----------------+-------------------------------------+
//! |   holder id    |   acquired_at (ms since epoch)      |
//! +----------------+-------------------------------------+
//! ```
//!
//! A word of zero means free. Holder ids are never zero.

use std::sync::atomic::{AtomicU64, Ordering};

const HOLDER_SHIFT: u32 = 48;
const TIMESTAMP_MASK: u64 = (1 << HOLDER_SHIFT) - 1;

fn pack(holder_id: u16, acquired_at_ms: u64) -> u64 {
    ((holder_id as u64) << HOLDER_SHIFT) | (acquired_at_ms & TIMESTAMP_MASK)
}

fn unpack(word: u64) -> Option<LockHolder> {
    if word == 0 {
        return None;
    }
    Some(LockHolder {
        holder_id: (word >> HOLDER_SHIFT) as u16,
        acquired_at_ms: word & TIMESTAMP_MASK,
    })
}

/// Current owner of the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHolder {
    pub holder_id: u16,
    pub acquired_at_ms: u64,
}

impl LockHolder {
    pub fn held_for_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.acquired_at_ms)
    }
}

/// Result of one acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAttempt {
    /// The lock was free
    Acquired { token: u64 },
    /// The previous holder exceeded its TTL and was evicted
    Reclaimed { token: u64, previous: LockHolder },
    /// A live holder owns the lock
    Busy { holder: LockHolder },
}

/// Exclusive accelerator lock with a hold TTL
#[derive(Debug)]
pub struct AcceleratorLock {
    word: AtomicU64,
    ttl_ms: u64,
}

impl AcceleratorLock {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            word: AtomicU64::new(0),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn holder(&self) -> Option<LockHolder> {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// A holder is stale once `acquired_at + ttl < now`
    pub fn is_stale(&self, holder: &LockHolder, now_ms: u64) -> bool {
        holder.acquired_at_ms.saturating_add(self.ttl_ms) < now_ms
    }

    /// Try once to take the lock for `holder_id`
    ///
    /// A stale holder is replaced in the same CAS, so concurrent waiters
    /// racing to reclaim it cannot both succeed.
    pub fn try_acquire(&self, holder_id: u16, now_ms: u64) -> AcquireAttempt {
        debug_assert!(holder_id != 0);
        let token = pack(holder_id, now_ms);
        let current = self.word.load(Ordering::Acquire);

        match unpack(current) {
            None => match self
                .word
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => AcquireAttempt::Acquired { token },
                Err(observed) => self.busy_or_retry(observed, holder_id, now_ms),
            },
            Some(holder) if self.is_stale(&holder, now_ms) => {
                match self
                    .word
                    .compare_exchange(current, token, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => AcquireAttempt::Reclaimed {
                        token,
                        previous: holder,
                    },
                    Err(observed) => self.busy_or_retry(observed, holder_id, now_ms),
                }
            }
            Some(holder) => AcquireAttempt::Busy { holder },
        }
    }

    // Lost a CAS race: report whoever won, or try again if the lock was
    // released in between.
    fn busy_or_retry(&self, observed: u64, holder_id: u16, now_ms: u64) -> AcquireAttempt {
        match unpack(observed) {
            Some(holder) => AcquireAttempt::Busy { holder },
            None => self.try_acquire(holder_id, now_ms),
        }
    }

    /// Release the lock if `token` still owns it
    ///
    /// Returns false when the hold was already reclaimed by another waiter.
    pub fn release(&self, token: u64) -> bool {
        self.word
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// RAII hold on the accelerator lock
///
/// Dropping the guard releases the lock exactly once.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a AcceleratorLock,
    token: u64,
}

impl<'a> LockGuard<'a> {
    pub(crate) fn new(lock: &'a AcceleratorLock, token: u64) -> Self {
        Self { lock, token }
    }

    pub fn holder(&self) -> LockHolder {
        // Tokens are never zero, so unpack always succeeds here.
        unpack(self.token).unwrap_or(LockHolder {
            holder_id: 0,
            acquired_at_ms: 0,
        })
    }

    /// Whether this guard still owns the lock
    pub fn is_held(&self) -> bool {
        self.lock.word.load(Ordering::Acquire) == self.token
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.lock.release(self.token) {
            let holder = self.holder();
            tracing::debug!(
                "Accelerator lock held by {} was reclaimed before release",
                holder.holder_id
            );
        }
    }
}
