//! # Tower Quota
//!
//! `tower-quota` puts a single admission controller in front of an upstream API whose
//! rate limits are shared between several credentials and only learned from responses.
//!
//! ## The Admission Loop
//! One tokio task owns every queue and every quota; callers talk to it over channels
//! through a cloneable [`AdmissionHandle`]:
//!
//! 1. **Queueing**: each endpoint gets a bounded FIFO per [`quota_queue::Priority`]. A full
//!    queue fails fast with `AdmitError::RateLimited`, carrying a retry hint.
//! 2. **Granting**: on every poll tick the queue heads are offered to each credential in
//!    turn. Normal traffic is paced evenly across every window, high priority traffic
//!    may burst to the hard cap.
//! 3. **Learning**: responses are reported back ([`report`]), re-estimating windows,
//!    applying `Retry-After` blackouts and resizing queues.
//!
//! ## The Tower Stack
//! [`AdmissionLayer`] wraps an upstream executor taking a [`Dispatch`]. Inbound requests
//! are mapped onto endpoints with a [`Catalog`] and wrapped in a [`Routed`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`AdmitError`], allowing automatic conversion
//!   to HTTP status codes (429, 408, 503, 502).
//! - `cli`: Builds the `stress_test` simulation binary.

mod catalog;
mod config;
mod controller;
mod error;
mod handle;
mod layer;
mod metrics;
pub mod report;
mod request;
mod service;

#[cfg(test)]
mod tests;

pub use catalog::Catalog;
pub use catalog::RequestMode;
pub use catalog::Resolved;
pub use config::Config;
pub use controller::LoopState;
pub use error::AdmitError;
pub use error::ConfigError;
pub use error::ReportError;
pub use error::ResolveError;
pub use handle::AdmissionHandle;
pub use layer::AdmissionLayer;
pub use request::Acquire;
pub use service::AdmissionService;
pub use service::Dispatch;
pub use service::Routed;
