use std::ops::ControlFlow;
use std::time::Duration;

use quanta::Instant;

use crate::Priority;
use crate::Reason;
use crate::ScopeReport;
use crate::window::QuotaWindow;

/// A named limit surface: a platform shared by all of its endpoints, or a single method.
///
/// Windows are positional and mirror the order in which the upstream lists them.
#[derive(Debug, Clone, Default)]
pub struct QuotaScope {
    blackout_until: Option<Instant>,
    windows: Vec<QuotaWindow>,
}

impl QuotaScope {
    pub fn new(windows: Vec<QuotaWindow>) -> Self {
        Self {
            blackout_until: None,
            windows,
        }
    }

    /// A scope holding one placeholder window, used until real limits are reported.
    pub fn seeded(limit: u64, length: Duration, now: Instant) -> Self {
        Self::new(vec![QuotaWindow::new(limit, length, now)])
    }

    pub fn windows(&self) -> &[QuotaWindow] {
        &self.windows
    }

    pub fn blackout_until(&self) -> Option<Instant> {
        self.blackout_until
    }

    /// The blackout deadline, if it is still ahead of `now`.
    pub fn active_blackout(&self, now: Instant) -> Option<Instant> {
        self.blackout_until.filter(|until| *until > now)
    }

    pub(crate) fn check_windows(&self, now: Instant, priority: Priority) -> ControlFlow<Reason> {
        for window in &self.windows {
            if let ControlFlow::Break(reason) = window.check(now, priority) {
                return ControlFlow::Break(reason);
            }
        }
        ControlFlow::Continue(())
    }

    pub(crate) fn consume(&mut self, now: Instant) {
        self.windows.iter_mut().for_each(|window| window.consume(now));
    }

    pub(crate) fn refund(&mut self) {
        self.windows.iter_mut().for_each(QuotaWindow::refund);
    }

    /// Zeroes every window whose refill deadline passed. Returns how many were refilled.
    pub(crate) fn refill(&mut self, now: Instant) -> usize {
        self.windows
            .iter_mut()
            .map(|window| window.refill_if_due(now))
            .filter(|refilled| *refilled)
            .count()
    }

    /// Sustainable calls per `horizon` under the tightest window.
    pub fn sustainable_capacity(&self, horizon: Duration) -> Option<f64> {
        self.windows
            .iter()
            .map(|window| window.sustainable(horizon))
            .reduce(f64::min)
    }

    /// Folds an upstream report into the cached windows.
    ///
    /// `retry_after` is only honoured when `applies` is set, i.e. when the upstream named
    /// this scope as the one that ran out. Returns the scope's sustainable capacity over
    /// `horizon`, or `None` when the report carried no limits for this scope.
    pub fn apply_report(
        &mut self,
        report: &ScopeReport,
        retry_after: Option<Instant>,
        applies: bool,
        margin: Duration,
        horizon: Duration,
        now: Instant,
    ) -> Option<f64> {
        if report.is_empty() {
            return None;
        }

        let retry_after = retry_after.filter(|_| applies);

        for (index, &(limit, window)) in report.limits.iter().enumerate() {
            let count = report.count_at(index);
            let length = window.saturating_add(margin);

            match self.windows.get_mut(index) {
                Some(cached) => cached.reconcile(limit, count, length, retry_after, now),
                None => {
                    let mut fresh = QuotaWindow::new(limit, length, now);
                    fresh.reconcile(limit, count, length, retry_after, now);
                    self.windows.push(fresh);
                }
            }
        }

        if report.limits.len() < self.windows.len() {
            tracing::debug!(
                reported = report.limits.len(),
                cached = self.windows.len(),
                "dropping windows the upstream no longer reports"
            );
            self.windows.truncate(report.limits.len());
        }

        if let Some(until) = retry_after {
            tracing::info!(
                blackout_secs = until.saturating_duration_since(now).as_secs_f64(),
                "applying upstream retry-after"
            );
            self.blackout_until = Some(until);
        }

        self.sustainable_capacity(horizon)
    }
}
