//! Turning an upstream response into an [`UpstreamReport`].
//!
//! The upstream describes its own limits on every response. A report is only worth sending
//! when the response was a `429`, or when the grant asked for a refresh probe.

use std::time::Duration;
use std::time::SystemTime;

use http::HeaderMap;
use http::HeaderValue;
use http::StatusCode;
use quanta::Instant;

use quota_queue::LimitScope;
use quota_queue::ScopeReport;
use quota_queue::UpstreamReport;

use crate::ReportError;

pub const PLATFORM_LIMIT: &str = "x-app-rate-limit";
pub const PLATFORM_COUNT: &str = "x-app-rate-limit-count";
pub const METHOD_LIMIT: &str = "x-method-rate-limit";
pub const METHOD_COUNT: &str = "x-method-rate-limit-count";
pub const LIMIT_TYPE: &str = "x-rate-limit-type";
/// Added to every proxied response, holding the 1-based id of the credential used.
pub const KEY: &str = "x-key";
/// Inbound header selecting the priority class.
pub const PRIORITY: &str = "x-priority";

/// Whether a response with `status` should be reported back to the controller.
pub fn should_report(status: StatusCode, refresh: bool) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || (refresh && status == StatusCode::OK)
}

/// Parse the "Retry-After" header as specified per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3)
pub fn parse_retry_after(value: &HeaderValue) -> Result<Duration, ReportError> {
    let value = value.to_str().map_err(|_| ReportError::HeaderValue)?;
    let value = value.trim();

    // RFC 7231: Retry-After = HTTP-date / delay-seconds
    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|at| {
                at.duration_since(SystemTime::now())
                    // if date is in the past, we can use ZERO
                    .unwrap_or(Duration::ZERO)
            })
            .map_err(|_| ReportError::RetryAfter(value.into()))
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ReportError> {
    headers
        .get(name)
        .map(|value| value.to_str().map_err(|_| ReportError::HeaderValue))
        .transpose()
}

/// Reads both scopes' quota headers and, on a `429`, the retry delay.
///
/// `now` anchors the retry delay on the controller's clock. Any malformed header fails the
/// whole report, so that cached state is never updated from a partial view.
pub fn upstream_report(
    status: StatusCode,
    headers: &HeaderMap,
    now: Instant,
) -> Result<UpstreamReport, ReportError> {
    let platform = ScopeReport::parse(
        header(headers, PLATFORM_LIMIT)?,
        header(headers, PLATFORM_COUNT)?,
    )?;
    let method = ScopeReport::parse(header(headers, METHOD_LIMIT)?, header(headers, METHOD_COUNT)?)?;

    let mut retry_after = None;
    let mut scope = LimitScope::Platform;
    if status == StatusCode::TOO_MANY_REQUESTS
        && let Some(value) = headers.get(http::header::RETRY_AFTER)
    {
        let delay = parse_retry_after(value)?;
        let until = now
            .checked_add(delay)
            .ok_or_else(|| ReportError::RetryAfter(delay.as_secs().to_string()))?;
        retry_after = Some(until);
        scope = LimitScope::from_header(header(headers, LIMIT_TYPE)?);
    }

    Ok(UpstreamReport {
        platform,
        method,
        retry_after,
        scope,
    })
}
