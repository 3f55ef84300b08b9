//! # quota-queue
//!
//! `quota-queue` is the admission core for callers sharing several interchangeable
//! credentials against an upstream whose rate limits are only learned from its responses.
//!
//! ## Core Philosophy
//!
//! Nothing in this crate locks or spawns. Every type is owned by a single coordinating
//! actor which passes the current [`Instant`] into each operation. That keeps every
//! decision deterministic and lets tests drive time with [`quanta::Clock::mock`].
//!
//! ## Key Concepts
//!
//! * **Window**: one `limit` per `length` pair advertised by the upstream ([`QuotaWindow`]).
//! * **Scope**: a named set of windows plus a blackout deadline ([`QuotaScope`]), shared by
//!   every endpoint of a platform or owned by one method.
//! * **Pairing**: one credential applied to one endpoint ([`Pairing`]).
//! * **Admission Queue**: a bounded FIFO of callers for one endpoint and priority class
//!   ([`AdmissionQueue`]).
//! * **Directory**: owns queues, pairings and scopes ([`QueueDirectory`]).
//!
//! ## Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use quanta::Instant;
//! use quota_queue::DirectorySettings;
//! use quota_queue::Endpoint;
//! use quota_queue::Grant;
//! use quota_queue::Priority;
//! use quota_queue::QueueDirectory;
//! use quota_queue::Waiter;
//!
//! struct Caller {
//!     expires: Instant,
//!     slot: mpsc::Sender<Option<Grant>>,
//! }
//!
//! impl Waiter for Caller {
//!     fn expires_at(&self) -> Instant {
//!         self.expires
//!     }
//!
//!     fn grant(self, grant: Grant) {
//!         let _ = self.slot.send(Some(grant));
//!     }
//!
//!     fn reject(self, _retry_at: Option<Instant>) {
//!         let _ = self.slot.send(None);
//!     }
//! }
//!
//! let clock = quanta::Clock::new();
//! let now = clock.now();
//! let mut directory = QueueDirectory::new(DirectorySettings::default());
//! let endpoint = Endpoint::new("euw1", "lol/status/v4/platform-data");
//!
//! let (tx, rx) = mpsc::channel();
//! let caller = Caller { expires: now + Duration::from_secs(10), slot: tx };
//! assert!(directory.enqueue(&endpoint, Priority::Normal, caller, now).is_ok());
//!
//! directory.refill(now);
//! directory.process(Priority::Normal, 10, now);
//! let grant = rx.recv().unwrap().unwrap();
//! assert_eq!(grant.credential, 0);
//! ```

use std::fmt;
use std::time::Duration;

use quanta::Instant;

mod directory;
mod header;
mod pairing;
mod queue;
mod registry;
mod scope;
mod window;

pub use directory::DirectorySettings;
pub use directory::QueueDirectory;
pub use directory::QueueSnapshot;
pub use header::HeaderError;
pub use header::ScopeReport;
pub use header::parse_rate_pairs;
pub use pairing::CAPACITY_HEADROOM;
pub use pairing::LimitScope;
pub use pairing::Pairing;
pub use pairing::UpstreamReport;
pub use queue::AdmissionQueue;
pub use queue::QueueFull;
pub use registry::ScopeId;
pub use registry::ScopeKey;
pub use registry::ScopeRegistry;
pub use scope::QuotaScope;
pub use window::MAX_WINDOW;
pub use window::QuotaWindow;

/// Traffic class of a queued request.
///
/// High priority traffic skips pacing and may burst up to the hard cap of every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    /// Maps an `X-Priority` style header value onto a class. Anything but `high` is normal.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("high") => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical upstream endpoint, the unit of queueing and quota tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Stable identifier, `"{platform}:{pattern}"`.
    pub id: String,
    /// Platform (region) whose shared limits apply.
    pub platform: String,
    /// The method pattern, e.g. `lol/summoner/v4/summoners/{encryptedPUUID}`.
    pub pattern: String,
}

impl Endpoint {
    pub fn new(platform: impl Into<String>, pattern: impl Into<String>) -> Self {
        let platform = platform.into();
        let pattern = pattern.into();
        Self {
            id: format!("{platform}:{pattern}"),
            platform,
            pattern,
        }
    }
}

/// Permission handed to a queued caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Zero-based index of the credential whose quota was consumed.
    pub credential: usize,
    /// Whether the caller should report the upstream's quota headers back.
    pub refresh: bool,
}

/// Reasons why a pairing refused one more call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// A scope is blacked out by an upstream retry delay.
    Blackout { until: Instant },
    /// A window reached its hard cap.
    Exhausted { refill_at: Instant },
    /// Normal traffic is ahead of an even spread across the window.
    Paced { next_at: Instant },
}

impl Reason {
    /// Earliest instant at which this particular refusal may clear.
    pub fn retry_at(&self) -> Instant {
        match *self {
            Reason::Blackout { until } => until,
            Reason::Exhausted { refill_at } => refill_at,
            Reason::Paced { next_at } => next_at,
        }
    }

    /// Time left until [`Reason::retry_at`], zero if already past.
    pub fn retry_after(&self, now: Instant) -> Duration {
        self.retry_at().saturating_duration_since(now)
    }
}

/// A caller parked in an [`AdmissionQueue`].
///
/// Implementations own a single-slot result channel. Both delivery methods consume the
/// waiter, so a caller is answered at most once. A waiter that expires while queued is
/// dropped without an answer.
pub trait Waiter {
    /// Instant from which the caller no longer wants a grant.
    fn expires_at(&self) -> Instant;

    /// Delivers the credential the caller may use.
    fn grant(self, grant: Grant);

    /// Fails the caller, optionally hinting when a retry could succeed.
    fn reject(self, retry_at: Option<Instant>);
}
