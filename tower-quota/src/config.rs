use std::fmt;
use std::time::Duration;

use quota_queue::DirectorySettings;

use crate::ConfigError;

/// Settings of the admission controller.
///
/// Every value has a default except the credentials. [`Config::validate`] is called when the
/// controller starts; an invalid configuration never reaches the event loop.
#[derive(Clone)]
pub struct Config {
    pub(crate) credentials: Vec<String>,
    pub(crate) request_timeout: Duration,
    pub(crate) caller_margin: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) cleanup_interval: Duration,
    pub(crate) metrics_interval: Option<Duration>,
    pub(crate) priority_fraction: f64,
    pub(crate) window_margin: Duration,
    pub(crate) queue_inactivity: Duration,
    pub(crate) max_queue_size: usize,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_grace: Duration,
    pub(crate) priority_batch: usize,
    pub(crate) normal_batch: usize,
    pub(crate) seed_limit: u64,
    pub(crate) seed_window: Duration,
    pub(crate) event_buffer: usize,
    pub(crate) refund_on_failure: bool,
    pub(crate) shutdown_grace: Duration,
    pub(crate) clock: quanta::Clock,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            request_timeout: Duration::from_secs(10),
            caller_margin: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            cleanup_interval: Duration::from_secs(30),
            metrics_interval: None,
            priority_fraction: 0.5,
            window_margin: Duration::from_millis(125),
            queue_inactivity: Duration::from_secs(600),
            max_queue_size: 10_000,
            refresh_interval: Duration::from_secs(60),
            refresh_grace: Duration::from_millis(200),
            priority_batch: 50,
            normal_batch: 10,
            seed_limit: 5,
            seed_window: Duration::from_secs(5),
            event_buffer: 1024,
            refund_on_failure: false,
            shutdown_grace: Duration::from_secs(30),
            clock: quanta::Clock::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("credentials", &format_args!("[{} redacted]", self.credentials.len()))
            .field("request_timeout", &self.request_timeout)
            .field("caller_margin", &self.caller_margin)
            .field("poll_interval", &self.poll_interval)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("metrics_interval", &self.metrics_interval)
            .field("priority_fraction", &self.priority_fraction)
            .field("window_margin", &self.window_margin)
            .field("queue_inactivity", &self.queue_inactivity)
            .field("max_queue_size", &self.max_queue_size)
            .field("refresh_interval", &self.refresh_interval)
            .field("refresh_grace", &self.refresh_grace)
            .field("priority_batch", &self.priority_batch)
            .field("normal_batch", &self.normal_batch)
            .field("seed_limit", &self.seed_limit)
            .field("seed_window", &self.seed_window)
            .field("event_buffer", &self.event_buffer)
            .field("refund_on_failure", &self.refund_on_failure)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// A default configuration using `credentials`, in order. Credential ids are indices into
    /// this list.
    pub fn new<I, S>(credentials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            credentials: credentials.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// The secret of credential `id`.
    pub fn credential(&self, id: usize) -> Option<&str> {
        self.credentials.get(id).map(String::as_str)
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn refund_on_failure(&self) -> bool {
        self.refund_on_failure
    }

    /// How long a request may wait in its queue. Also the horizon of capacity estimates.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Extra time a caller waits on its result slot on top of the request timeout.
    pub fn with_caller_margin(mut self, margin: Duration) -> Self {
        self.caller_margin = margin;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Record queue gauges every `interval`. Disabled by default.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Share of each endpoint's capacity reserved for priority traffic, `0.0..=1.0`.
    pub fn with_priority_fraction(mut self, fraction: f64) -> Self {
        self.priority_fraction = fraction;
        self
    }

    /// Added to every window the upstream reports, to absorb network latency.
    pub fn with_window_margin(mut self, margin: Duration) -> Self {
        self.window_margin = margin;
        self
    }

    pub fn with_queue_inactivity(mut self, inactivity: Duration) -> Self {
        self.queue_inactivity = inactivity;
        self
    }

    /// Upper bound on any queue's capacity, however generous the upstream's limits.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// How often each credential re-probes an endpoint's limits, and the back-off between
    /// probes while one is in flight.
    pub fn with_refresh(mut self, interval: Duration, grace: Duration) -> Self {
        self.refresh_interval = interval;
        self.refresh_grace = grace;
        self
    }

    /// Per queue, per poll tick grant limits.
    pub fn with_batches(mut self, priority: usize, normal: usize) -> Self {
        self.priority_batch = priority;
        self.normal_batch = normal;
        self
    }

    /// Placeholder limit used until the upstream reports real ones.
    pub fn with_seed(mut self, limit: u64, window: Duration) -> Self {
        self.seed_limit = limit;
        self.seed_window = window;
        self
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer;
        self
    }

    /// Return quota to the pairing when the upstream call fails or answers with a 5xx.
    pub fn with_refund_on_failure(mut self, refund: bool) -> Self {
        self.refund_on_failure = refund;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Clock used for every quota decision. Tests pass [`quanta::Clock::mock`].
    pub fn with_clock(mut self, clock: quanta::Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }

        let durations = [
            ("request timeout", self.request_timeout),
            ("poll interval", self.poll_interval),
            ("cleanup interval", self.cleanup_interval),
            ("refresh interval", self.refresh_interval),
            ("seed window", self.seed_window),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::NotPositive(*name));
        }
        if self.metrics_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::NotPositive("metrics interval"));
        }

        if !(0.0..=1.0).contains(&self.priority_fraction) {
            return Err(ConfigError::PriorityFraction(self.priority_fraction));
        }

        let counts = [
            ("priority batch", self.priority_batch as u64),
            ("normal batch", self.normal_batch as u64),
            ("seed limit", self.seed_limit),
            ("event buffer", self.event_buffer as u64),
            ("max queue size", self.max_queue_size as u64),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NotPositive(*name));
        }

        Ok(())
    }

    /// The subset of this configuration the queue directory needs.
    pub fn directory_settings(&self) -> DirectorySettings {
        DirectorySettings {
            credentials: self.credentials.len(),
            request_timeout: self.request_timeout,
            priority_fraction: self.priority_fraction,
            window_margin: self.window_margin,
            queue_inactivity: self.queue_inactivity,
            max_queue_size: self.max_queue_size,
            refresh_interval: self.refresh_interval,
            refresh_grace: self.refresh_grace,
            seed_limit: self.seed_limit,
            seed_window: self.seed_window,
        }
    }
}
