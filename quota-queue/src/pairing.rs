use std::ops::ControlFlow;
use std::time::Duration;

use quanta::Instant;

use crate::Priority;
use crate::Reason;
use crate::ScopeId;
use crate::ScopeRegistry;
use crate::ScopeReport;

/// Headroom applied on top of a freshly discovered sustainable capacity.
pub const CAPACITY_HEADROOM: f64 = 1.05;

/// The scope an upstream retry delay was attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitScope {
    #[default]
    Platform,
    Method,
}

impl LimitScope {
    /// Maps an `X-Rate-Limit-Type` value. Unknown or missing values fall back to the platform.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("method") => LimitScope::Method,
            _ => LimitScope::Platform,
        }
    }
}

/// Everything an upstream response told us about one credential's quota.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamReport {
    pub platform: ScopeReport,
    pub method: ScopeReport,
    /// Absolute instant until which the upstream asked us to back off.
    pub retry_after: Option<Instant>,
    /// Which scope the retry delay applies to.
    pub scope: LimitScope,
}

/// One credential applied to one endpoint.
#[derive(Debug, Clone)]
pub struct Pairing {
    credential: usize,
    platform: ScopeId,
    method: ScopeId,
    refresh_due: Instant,
    capacity: f64,
}

impl Pairing {
    /// `refresh_due` at or before `now` makes the first grant probe for real limits.
    pub fn new(
        credential: usize,
        platform: ScopeId,
        method: ScopeId,
        refresh_due: Instant,
        capacity: f64,
    ) -> Self {
        Self {
            credential,
            platform,
            method,
            refresh_due,
            capacity,
        }
    }

    pub fn credential(&self) -> usize {
        self.credential
    }

    pub fn platform(&self) -> ScopeId {
        self.platform
    }

    pub fn method(&self) -> ScopeId {
        self.method
    }

    pub fn refresh_due(&self) -> Instant {
        self.refresh_due
    }

    /// Estimated sustainable calls over one request timeout.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Capacity estimate derived from the tightest window of both scopes.
    pub fn estimate(scopes: &ScopeRegistry, platform: ScopeId, method: ScopeId, horizon: Duration) -> f64 {
        let platform = scopes.get(platform).sustainable_capacity(horizon);
        let method = scopes.get(method).sustainable_capacity(horizon);
        let peak = match (platform, method) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => 0.0,
        };
        (peak + 1.0) * CAPACITY_HEADROOM
    }

    /// Admits one call if neither scope is blacked out and every window has room.
    ///
    /// On success every window of both scopes is charged.
    pub fn try_admit(
        &self,
        scopes: &mut ScopeRegistry,
        now: Instant,
        priority: Priority,
    ) -> ControlFlow<Reason> {
        let ids = [self.platform, self.method];

        for id in ids {
            if let Some(until) = scopes.get(id).active_blackout(now) {
                return ControlFlow::Break(Reason::Blackout { until });
            }
        }

        for id in ids {
            if let ControlFlow::Break(reason) = scopes.get(id).check_windows(now, priority) {
                return ControlFlow::Break(reason);
            }
        }

        for id in ids {
            scopes.get_mut(id).consume(now);
        }

        ControlFlow::Continue(())
    }

    /// Returns one call to every window of both scopes.
    pub fn refund(&self, scopes: &mut ScopeRegistry) {
        scopes.get_mut(self.platform).refund();
        scopes.get_mut(self.method).refund();
    }

    /// True when this pairing's limits are due for a probe.
    ///
    /// Triggering pushes the deadline back by `grace` so that consecutive grants do not all
    /// probe while the first probe is still in flight.
    pub fn needs_refresh(&mut self, now: Instant, grace: Duration) -> bool {
        if now >= self.refresh_due {
            self.refresh_due += grace;
            true
        } else {
            false
        }
    }

    /// Folds an upstream report into both scopes and re-estimates capacity.
    ///
    /// Returns the new capacity if the report carried limits.
    pub fn apply_report(
        &mut self,
        scopes: &mut ScopeRegistry,
        report: &UpstreamReport,
        margin: Duration,
        horizon: Duration,
        refresh_interval: Duration,
        now: Instant,
    ) -> Option<f64> {
        let platform = scopes.get_mut(self.platform).apply_report(
            &report.platform,
            report.retry_after,
            report.scope == LimitScope::Platform,
            margin,
            horizon,
            now,
        );
        let method = scopes.get_mut(self.method).apply_report(
            &report.method,
            report.retry_after,
            report.scope == LimitScope::Method,
            margin,
            horizon,
            now,
        );

        let peak = match (platform, method) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };

        if peak > 0.0 {
            self.capacity = (peak + 1.0) * CAPACITY_HEADROOM;
            self.refresh_due = now + refresh_interval;
            Some(self.capacity)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuotaScope;
    use crate::ScopeKey;
    use crate::testing::clock;

    const HORIZON: Duration = Duration::from_secs(10);
    const MARGIN: Duration = Duration::from_millis(125);

    fn setup(now: Instant, limit: u64, window: Duration) -> (ScopeRegistry, Pairing) {
        let mut scopes = ScopeRegistry::new();
        let platform = scopes.get_or_insert_with(0, ScopeKey::Platform("na1".into()), || {
            QuotaScope::seeded(limit, window, now)
        });
        let method = scopes.get_or_insert_with(0, ScopeKey::Method("na1:m".into()), || {
            QuotaScope::seeded(limit, window, now)
        });
        let capacity = Pairing::estimate(&scopes, platform, method, HORIZON);
        (scopes, Pairing::new(0, platform, method, now, capacity))
    }

    fn snapshot(scopes: &ScopeRegistry, pairing: &Pairing) -> Vec<u64> {
        [pairing.platform(), pairing.method()]
            .into_iter()
            .flat_map(|id| scopes.get(id).windows().iter().map(|w| w.current()))
            .collect()
    }

    #[test]
    fn test_hard_cap_and_retry_hint() {
        let (clock, mock) = clock();
        let start = clock.now();
        let (mut scopes, pairing) = setup(start, 5, Duration::from_secs(5));

        for _ in 0..5 {
            assert!(pairing.try_admit(&mut scopes, start, Priority::High).is_continue());
        }

        mock.increment(Duration::from_secs(1));
        let now = clock.now();
        let ControlFlow::Break(reason) = pairing.try_admit(&mut scopes, now, Priority::High) else {
            panic!("sixth call must be refused");
        };
        assert_eq!(reason.retry_after(now), Duration::from_secs(4));

        // Every window stays at its limit.
        for window in snapshot(&scopes, &pairing) {
            assert_eq!(window, 5);
        }
    }

    #[test]
    fn test_refund_is_the_inverse_of_admit() {
        let (clock, _mock) = clock();
        let now = clock.now();
        let (mut scopes, pairing) = setup(now, 5, Duration::from_secs(5));
        assert!(pairing.try_admit(&mut scopes, now, Priority::High).is_continue());

        let before = snapshot(&scopes, &pairing);
        assert!(pairing.try_admit(&mut scopes, now, Priority::High).is_continue());
        pairing.refund(&mut scopes);

        assert_eq!(snapshot(&scopes, &pairing), before);
    }

    #[test]
    fn test_blackout_refuses_regardless_of_windows() {
        let (clock, mock) = clock();
        let now = clock.now();
        let (mut scopes, mut pairing) = setup(now, 5, Duration::from_secs(5));
        let until = now + Duration::from_secs(30);

        let report = UpstreamReport {
            platform: ScopeReport::parse(Some("10:60"), Some("10:60")).unwrap(),
            method: ScopeReport::parse(Some("100:60"), Some("1:60")).unwrap(),
            retry_after: Some(until),
            scope: LimitScope::Platform,
        };
        pairing.apply_report(&mut scopes, &report, MARGIN, HORIZON, Duration::from_secs(60), now);

        mock.increment(Duration::from_secs(29));
        assert_eq!(
            pairing.try_admit(&mut scopes, clock.now(), Priority::High),
            ControlFlow::Break(Reason::Blackout { until })
        );

        mock.increment(Duration::from_secs(2));
        assert!(pairing.try_admit(&mut scopes, clock.now(), Priority::High).is_continue());
    }

    #[test]
    fn test_refused_call_charges_nothing() {
        let (clock, _mock) = clock();
        let now = clock.now();
        let (mut scopes, pairing) = setup(now, 5, Duration::from_secs(5));

        // The method scope alone is exhausted.
        let method = pairing.method();
        for _ in 0..5 {
            scopes.get_mut(method).consume(now);
        }
        assert!(pairing.try_admit(&mut scopes, now, Priority::High).is_break());
        assert_eq!(scopes.get(pairing.platform()).windows()[0].current(), 0);
    }

    #[test]
    fn test_needs_refresh_with_grace() {
        let (clock, mock) = clock();
        let now = clock.now();
        let (_scopes, mut pairing) = setup(now, 5, Duration::from_secs(5));
        let grace = Duration::from_millis(200);

        assert!(pairing.needs_refresh(now, grace));
        assert!(!pairing.needs_refresh(now, grace));

        mock.increment(Duration::from_millis(200));
        assert!(pairing.needs_refresh(clock.now(), grace));
    }

    #[test]
    fn test_report_updates_capacity_and_refresh() {
        let (clock, _mock) = clock();
        let now = clock.now();
        let (mut scopes, mut pairing) = setup(now, 5, Duration::from_secs(5));

        let report = UpstreamReport {
            platform: ScopeReport::parse(Some("20:1,100:120"), Some("1:1,1:120")).unwrap(),
            method: ScopeReport::parse(Some("2000:10"), Some("1:10")).unwrap(),
            retry_after: None,
            scope: LimitScope::Platform,
        };
        let capacity = pairing
            .apply_report(&mut scopes, &report, MARGIN, HORIZON, Duration::from_secs(60), now)
            .unwrap();

        let peak = 100.0 / 120.125 * 10.0;
        assert!((capacity - (peak + 1.0) * CAPACITY_HEADROOM).abs() < 1e-9);
        assert_eq!(pairing.refresh_due(), now + Duration::from_secs(60));
    }

    #[test]
    fn test_report_without_limits_keeps_capacity() {
        let (clock, _mock) = clock();
        let now = clock.now();
        let (mut scopes, mut pairing) = setup(now, 5, Duration::from_secs(5));
        let before = pairing.capacity();

        let changed = pairing.apply_report(
            &mut scopes,
            &UpstreamReport::default(),
            MARGIN,
            HORIZON,
            Duration::from_secs(60),
            now,
        );
        assert_eq!(changed, None);
        assert_eq!(pairing.capacity(), before);
    }

    #[test]
    fn test_limit_scope_from_header() {
        assert_eq!(LimitScope::from_header(Some("method")), LimitScope::Method);
        assert_eq!(LimitScope::from_header(Some("application")), LimitScope::Platform);
        assert_eq!(LimitScope::from_header(None), LimitScope::Platform);
    }
}
