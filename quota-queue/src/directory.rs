use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use quanta::Instant;

use crate::AdmissionQueue;
use crate::Endpoint;
use crate::Pairing;
use crate::Priority;
use crate::QueueFull;
use crate::QuotaScope;
use crate::ScopeKey;
use crate::ScopeRegistry;
use crate::UpstreamReport;
use crate::Waiter;

/// The knobs a [`QueueDirectory`] needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorySettings {
    /// Number of interchangeable credentials. Each endpoint gets one pairing per credential.
    pub credentials: usize,
    /// Horizon over which sustainable capacity is estimated.
    pub request_timeout: Duration,
    /// Share of the derived capacity given to the priority queue, `0.0..=1.0`.
    pub priority_fraction: f64,
    /// Added to every window the upstream reports.
    pub window_margin: Duration,
    /// Empty queues idle for longer than this are retired.
    pub queue_inactivity: Duration,
    /// Upper bound on any queue's derived capacity.
    pub max_queue_size: usize,
    pub refresh_interval: Duration,
    pub refresh_grace: Duration,
    /// Placeholder limit used until the upstream reports real ones.
    pub seed_limit: u64,
    pub seed_window: Duration,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            credentials: 1,
            request_timeout: Duration::from_secs(10),
            priority_fraction: 0.5,
            window_margin: Duration::from_millis(125),
            queue_inactivity: Duration::from_secs(600),
            max_queue_size: 10_000,
            refresh_interval: Duration::from_secs(60),
            refresh_grace: Duration::from_millis(200),
            seed_limit: 5,
            seed_window: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot<'a> {
    pub endpoint: &'a Endpoint,
    pub priority: Priority,
    pub len: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct EndpointQuota {
    endpoint: Endpoint,
    pairings: Vec<Pairing>,
}

/// Owns every queue, pairing and scope.
///
/// Queues come and go with traffic. Pairings and scopes, once created, live for the
/// lifetime of the directory and keep whatever limits were learned.
#[derive(Debug)]
pub struct QueueDirectory<W> {
    settings: DirectorySettings,
    normal: HashMap<String, AdmissionQueue<W>>,
    priority: HashMap<String, AdmissionQueue<W>>,
    quotas: HashMap<String, EndpointQuota>,
    scopes: ScopeRegistry,
}

/// Capacity a queue of `priority` should have given its pairings, at most `max`.
fn derived_capacity(pairings: &[Pairing], priority: Priority, fraction: f64, max: usize) -> usize {
    let total: f64 = pairings.iter().map(Pairing::capacity).sum();
    let ideal = match priority {
        Priority::Normal => total.ceil(),
        Priority::High => (total * fraction).ceil(),
    };
    // Float to int casts saturate.
    (ideal as usize).min(max)
}

impl<W: Waiter> QueueDirectory<W> {
    pub fn new(settings: DirectorySettings) -> Self {
        Self {
            settings,
            normal: HashMap::new(),
            priority: HashMap::new(),
            quotas: HashMap::new(),
            scopes: ScopeRegistry::new(),
        }
    }

    pub fn settings(&self) -> &DirectorySettings {
        &self.settings
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn queue(&self, id: &str, priority: Priority) -> Option<&AdmissionQueue<W>> {
        self.queues(priority).get(id)
    }

    pub fn pairings(&self, id: &str) -> Option<&[Pairing]> {
        self.quotas.get(id).map(|quota| quota.pairings.as_slice())
    }

    pub fn has_pairing(&self, id: &str, credential: usize) -> bool {
        self.quotas
            .get(id)
            .is_some_and(|quota| credential < quota.pairings.len())
    }

    pub fn queue_count(&self, priority: Priority) -> usize {
        self.queues(priority).len()
    }

    fn queues(&self, priority: Priority) -> &HashMap<String, AdmissionQueue<W>> {
        match priority {
            Priority::Normal => &self.normal,
            Priority::High => &self.priority,
        }
    }

    /// Queues `waiter` for `endpoint`, creating pairings and the queue on first use.
    pub fn enqueue(
        &mut self,
        endpoint: &Endpoint,
        priority: Priority,
        waiter: W,
        now: Instant,
    ) -> Result<(), QueueFull<W>> {
        self.ensure_pairings(endpoint, now);

        let capacity = self
            .pairings(&endpoint.id)
            .map(|pairings| {
                derived_capacity(
                    pairings,
                    priority,
                    self.settings.priority_fraction,
                    self.settings.max_queue_size,
                )
            })
            .unwrap_or_default();

        let queues = match priority {
            Priority::Normal => &mut self.normal,
            Priority::High => &mut self.priority,
        };
        let queue = match queues.entry(endpoint.id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::info!(
                    endpoint = %endpoint.id,
                    %priority,
                    size = capacity,
                    "creating queue"
                );
                entry.insert(AdmissionQueue::new(capacity, priority, now))
            }
        };

        queue.enqueue(waiter, now)
    }

    fn ensure_pairings(&mut self, endpoint: &Endpoint, now: Instant) {
        if self.quotas.contains_key(&endpoint.id) {
            return;
        }

        let settings = &self.settings;
        let scopes = &mut self.scopes;
        let seed = || QuotaScope::seeded(settings.seed_limit, settings.seed_window, now);

        let pairings = (0..settings.credentials)
            .map(|credential| {
                let platform = scopes.get_or_insert_with(
                    credential,
                    ScopeKey::Platform(endpoint.platform.clone()),
                    seed,
                );
                let method =
                    scopes.get_or_insert_with(credential, ScopeKey::Method(endpoint.id.clone()), seed);
                let capacity =
                    Pairing::estimate(scopes, platform, method, settings.request_timeout);
                // Due immediately, so the first grant probes for the real limits.
                Pairing::new(credential, platform, method, now, capacity)
            })
            .collect();

        self.quotas.insert(
            endpoint.id.clone(),
            EndpointQuota {
                endpoint: endpoint.clone(),
                pairings,
            },
        );
    }

    /// Resizes every queue whose derived capacity changed and whose contents still fit.
    ///
    /// Returns the number of queues replaced.
    pub fn adjust_capacity(&mut self) -> usize {
        let fraction = self.settings.priority_fraction;
        let max = self.settings.max_queue_size;
        let mut resized = 0;

        for (id, queue) in self.normal.iter_mut().chain(self.priority.iter_mut()) {
            let Some(quota) = self.quotas.get(id) else {
                continue;
            };
            let ideal = derived_capacity(&quota.pairings, queue.priority(), fraction, max);
            if ideal == queue.capacity() || queue.len() > ideal {
                continue;
            }

            tracing::info!(
                endpoint = %id,
                priority = %queue.priority(),
                from = queue.capacity(),
                to = ideal,
                "resizing queue"
            );
            let stragglers = queue.resize(ideal);
            if stragglers > 0 {
                tracing::warn!(endpoint = %id, stragglers, "queue resize rejected callers");
            }
            resized += 1;
        }

        resized
    }

    /// Retires empty queues that have been idle for longer than the inactivity window.
    ///
    /// Pairings are kept. Returns the number of queues removed.
    pub fn clean_up(&mut self, now: Instant) -> usize {
        let inactivity = self.settings.queue_inactivity;
        let before = self.normal.len() + self.priority.len();

        for queues in [&mut self.normal, &mut self.priority] {
            queues.retain(|id, queue| {
                queue.purge(now);
                let idle = queue.is_idle(now, inactivity);
                if idle {
                    tracing::info!(endpoint = %id, priority = %queue.priority(), "retiring idle queue");
                }
                !idle
            });
        }

        before - (self.normal.len() + self.priority.len())
    }

    /// Rejects every queued caller. Returns how many were rejected.
    pub fn drain_all(&mut self) -> usize {
        self.normal
            .values_mut()
            .chain(self.priority.values_mut())
            .map(AdmissionQueue::drain)
            .sum()
    }

    /// Refill sweep over every window of every scope.
    pub fn refill(&mut self, now: Instant) -> usize {
        self.scopes.refill(now)
    }

    /// Grants up to `batch` callers per queue of `priority`.
    pub fn process(&mut self, priority: Priority, batch: usize, now: Instant) -> usize {
        let grace = self.settings.refresh_grace;
        let queues = match priority {
            Priority::Normal => &mut self.normal,
            Priority::High => &mut self.priority,
        };

        let mut granted = 0;
        for (id, queue) in queues.iter_mut() {
            if let Some(quota) = self.quotas.get_mut(id) {
                granted += queue.process(batch, &mut quota.pairings, &mut self.scopes, grace, now);
            }
        }
        granted
    }

    /// Folds an upstream report into the pairing of `credential` on endpoint `id`.
    ///
    /// Returns the pairing's new capacity estimate when the report carried limits.
    pub fn apply_report(
        &mut self,
        id: &str,
        credential: usize,
        report: &UpstreamReport,
        now: Instant,
    ) -> Option<f64> {
        let pairing = self.quotas.get_mut(id)?.pairings.get_mut(credential)?;
        pairing.apply_report(
            &mut self.scopes,
            report,
            self.settings.window_margin,
            self.settings.request_timeout,
            self.settings.refresh_interval,
            now,
        )
    }

    /// Returns one call to the pairing of `credential` on endpoint `id`, if it exists.
    pub fn refund(&mut self, id: &str, credential: usize) -> bool {
        let Some(pairing) = self
            .quotas
            .get(id)
            .and_then(|quota| quota.pairings.get(credential))
        else {
            return false;
        };
        pairing.refund(&mut self.scopes);
        true
    }

    /// Snapshot of every live queue.
    pub fn snapshots(&self) -> impl Iterator<Item = QueueSnapshot<'_>> + '_ {
        self.normal
            .iter()
            .chain(self.priority.iter())
            .filter_map(|(id, queue)| {
                let quota = self.quotas.get(id)?;
                Some(QueueSnapshot {
                    endpoint: &quota.endpoint,
                    priority: queue.priority(),
                    len: queue.len(),
                    capacity: queue.capacity(),
                })
            })
    }
}
