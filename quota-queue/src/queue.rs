use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use quanta::Instant;

use crate::Grant;
use crate::Pairing;
use crate::Priority;
use crate::ScopeRegistry;
use crate::Waiter;

/// Retry hint used when a full queue has no head to derive one from.
const FALLBACK_RETRY: Duration = Duration::from_secs(1);

/// A refused enqueue. The waiter is handed back untouched.
#[derive(Debug)]
pub struct QueueFull<W> {
    pub waiter: W,
    pub retry_at: Instant,
}

/// Bounded FIFO of callers waiting on one endpoint in one priority class.
///
/// Expired entries are purged lazily, before every decision, and never count towards
/// occupancy. The capacity is fixed for the lifetime of a queue; a resize builds a new queue.
#[derive(Debug)]
pub struct AdmissionQueue<W> {
    entries: VecDeque<W>,
    capacity: usize,
    priority: Priority,
    last_activity: Instant,
}

impl<W: Waiter> AdmissionQueue<W> {
    pub fn new(capacity: usize, priority: Priority, now: Instant) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            priority,
            last_activity: now,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Appends `waiter` unless the queue is still full after a purge.
    ///
    /// A refusal carries the expiry of the current head, the earliest instant at which
    /// room is guaranteed to appear.
    pub fn enqueue(&mut self, waiter: W, now: Instant) -> Result<(), QueueFull<W>> {
        self.purge(now);

        if self.entries.len() >= self.capacity {
            let retry_at = self
                .entries
                .front()
                .map(Waiter::expires_at)
                .unwrap_or(now + FALLBACK_RETRY);
            return Err(QueueFull { waiter, retry_at });
        }

        self.entries.push_back(waiter);
        self.last_activity = now;
        Ok(())
    }

    /// Drops expired entries from the head. Returns how many were dropped.
    pub fn purge(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while self
            .entries
            .front()
            .is_some_and(|waiter| waiter.expires_at() <= now)
        {
            self.entries.pop_front();
            purged += 1;
        }
        purged
    }

    /// Grants up to `max` callers, in order, while some pairing still has room.
    ///
    /// Pairings are tried in credential order on every grant, so the lowest credential with
    /// room always wins. Returns the number of grants handed out.
    pub fn process(
        &mut self,
        max: usize,
        pairings: &mut [Pairing],
        scopes: &mut ScopeRegistry,
        refresh_grace: Duration,
        now: Instant,
    ) -> usize {
        let priority = self.priority;
        let mut granted = 0;

        while granted < max {
            self.purge(now);
            if self.entries.is_empty() {
                break;
            }

            let Some(pairing) = pairings
                .iter_mut()
                .find(|pairing| pairing.try_admit(scopes, now, priority).is_continue())
            else {
                break;
            };

            let Some(waiter) = self.entries.pop_front() else {
                break;
            };

            let refresh = pairing.needs_refresh(now, refresh_grace);
            if refresh {
                tracing::debug!(credential = pairing.credential(), "granting refresh probe");
            }
            waiter.grant(Grant {
                credential: pairing.credential(),
                refresh,
            });
            granted += 1;
        }

        if granted > 0 {
            self.last_activity = now;
        }
        granted
    }

    /// Swaps in a queue of `capacity`, migrating pending entries in order.
    ///
    /// Entries that do not fit are rejected without a retry hint. Returns how many were.
    pub fn resize(&mut self, capacity: usize) -> usize {
        let fresh = Self {
            entries: VecDeque::new(),
            capacity,
            priority: self.priority,
            last_activity: self.last_activity,
        };
        let mut old = mem::replace(self, fresh);

        let mut stragglers = 0;
        for waiter in old.entries.drain(..) {
            if self.entries.len() < self.capacity {
                self.entries.push_back(waiter);
            } else {
                waiter.reject(None);
                stragglers += 1;
            }
        }
        stragglers
    }

    /// True once the queue is empty and has seen no activity for longer than `inactivity`.
    pub fn is_idle(&self, now: Instant, inactivity: Duration) -> bool {
        self.entries.is_empty() && now.saturating_duration_since(self.last_activity) > inactivity
    }

    /// Rejects every pending caller without a retry hint.
    pub fn drain(&mut self) -> usize {
        let drained = self.entries.len();
        self.entries.drain(..).for_each(|waiter| waiter.reject(None));
        drained
    }
}
