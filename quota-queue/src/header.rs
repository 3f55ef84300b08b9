//! Parsing of the upstream's self-describing rate limit headers.
//!
//! Limits arrive as `value:seconds` pairs separated by commas, for example
//! `X-App-Rate-Limit: 20:1,100:120` with the matching `X-App-Rate-Limit-Count: 3:1,47:120`.
//! Entries are positional: the n-th count belongs to the n-th limit.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Rate limit entry '{0}' is not of the form value:seconds")]
    Entry(String),

    #[error("Unable to parse number in rate limit entry '{0}'")]
    Value(String),
}

/// Parses `value:seconds` pairs, in order.
///
/// An empty (or whitespace only) header yields no pairs. Any malformed entry fails the
/// whole header, since positions would no longer line up.
pub fn parse_rate_pairs(header: &str) -> Result<Vec<(u64, Duration)>, HeaderError> {
    if header.trim().is_empty() {
        return Ok(Vec::new());
    }

    header
        .split(',')
        .map(|entry| -> Result<(u64, Duration), HeaderError> {
            let entry = entry.trim();
            let (value, window) = entry
                .split_once(':')
                .ok_or_else(|| HeaderError::Entry(entry.into()))?;
            let value = value
                .trim()
                .parse::<u64>()
                .map_err(|_| HeaderError::Value(entry.into()))?;
            let window = window
                .trim()
                .parse::<u64>()
                .map_err(|_| HeaderError::Value(entry.into()))?;
            Ok((value, Duration::from_secs(window)))
        })
        .collect()
}

/// One scope's worth of an upstream report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeReport {
    /// `(limit, window)` per position.
    pub limits: Vec<(u64, Duration)>,
    /// Upstream's usage per position.
    pub counts: Vec<u64>,
}

impl ScopeReport {
    /// Parses a limit header and its count header.
    ///
    /// If either header is absent the report is empty and leaves the scope untouched.
    pub fn parse(limit: Option<&str>, count: Option<&str>) -> Result<Self, HeaderError> {
        let (Some(limit), Some(count)) = (limit, count) else {
            return Ok(Self::default());
        };
        if limit.trim().is_empty() || count.trim().is_empty() {
            return Ok(Self::default());
        }

        let limits = parse_rate_pairs(limit)?;
        let counts = parse_rate_pairs(count)?
            .into_iter()
            .map(|(count, _)| count)
            .collect();
        Ok(Self { limits, counts })
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Upstream's count for position `index`, zero when it reported none.
    pub fn count_at(&self, index: usize) -> u64 {
        self.counts.get(index).copied().unwrap_or(0)
    }
}
