use std::ops::ControlFlow;
use std::time::Duration;

use quanta::Instant;

use crate::Priority;
use crate::Reason;

/// Shortest window we track. Keeps pacing and capacity math away from a zero divisor.
const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Longest window we track. Anything an upstream reports beyond this is clamped.
pub const MAX_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A single upstream rate limit: at most `limit` calls per `length`.
///
/// The window is anchored at `last_refill`. It is refilled wholesale once `length` has
/// passed since the anchor, and re-anchored by the first call after an empty period.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWindow {
    pub(crate) limit: u64,
    pub(crate) current: u64,
    pub(crate) length: Duration,
    pub(crate) last_refill: Instant,
}

impl QuotaWindow {
    /// Creates an empty window anchored at `now`.
    pub fn new(limit: u64, length: Duration, now: Instant) -> Self {
        Self {
            limit,
            current: 0,
            length: length.clamp(MIN_WINDOW, MAX_WINDOW),
            last_refill: now,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Calls counted against this window since the last refill.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Instant at which the refill sweep will zero this window.
    pub fn refill_at(&self) -> Instant {
        self.last_refill
            .checked_add(self.length)
            .unwrap_or(self.last_refill)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.limit
    }

    /// Calls an evenly paced client would have made by `now`, plus one, capped at `limit`.
    pub fn ideal_allowance(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let share = elapsed.as_secs_f64() / self.length.as_secs_f64() * self.limit as f64;
        (share.floor() as u64).saturating_add(1).min(self.limit)
    }

    /// Calls per `horizon` this window sustains.
    pub fn sustainable(&self, horizon: Duration) -> f64 {
        self.limit as f64 / self.length.as_secs_f64() * horizon.as_secs_f64()
    }

    pub(crate) fn check(&self, now: Instant, priority: Priority) -> ControlFlow<Reason> {
        if self.is_exhausted() {
            return ControlFlow::Break(Reason::Exhausted {
                refill_at: self.refill_at(),
            });
        }

        if priority == Priority::Normal && self.current > self.ideal_allowance(now) {
            return ControlFlow::Break(Reason::Paced {
                next_at: self.next_paced_slot(),
            });
        }

        ControlFlow::Continue(())
    }

    /// First instant at which `ideal_allowance` catches up with `current`.
    fn next_paced_slot(&self) -> Instant {
        let share = self.current.saturating_sub(1) as f64 / self.limit.max(1) as f64;
        self.last_refill + self.length.mul_f64(share.min(1.0))
    }

    pub(crate) fn consume(&mut self, now: Instant) {
        if self.current == 0 {
            self.last_refill = now;
        }
        self.current = self.current.saturating_add(1);
    }

    pub(crate) fn refund(&mut self) {
        self.current = self.current.saturating_sub(1);
    }

    /// Zeroes a used window whose refill deadline has passed.
    pub(crate) fn refill_if_due(&mut self, now: Instant) -> bool {
        if self.current > 0 && self.refill_at() < now {
            self.current = 0;
            self.last_refill = now;
            true
        } else {
            false
        }
    }

    /// Applies one positional entry of an upstream report.
    ///
    /// Upstream's count wins over ours whenever the two disagree. If the report carries a
    /// retry delay for this scope and the window is full, the anchor is back-dated so the
    /// window itself refills exactly when the blackout ends.
    pub(crate) fn reconcile(
        &mut self,
        limit: u64,
        count: u64,
        length: Duration,
        retry_after: Option<Instant>,
        now: Instant,
    ) {
        if self.limit != limit || self.current != count {
            tracing::debug!(
                from = self.current,
                to = count,
                limit,
                "adopting upstream window count"
            );
            self.current = count;
        }
        self.limit = limit;
        self.length = length.clamp(MIN_WINDOW, MAX_WINDOW);

        if let Some(until) = retry_after
            && count >= limit
        {
            self.last_refill = until.checked_sub(self.length).unwrap_or(now);
            self.current = 0;
        }
    }
}
