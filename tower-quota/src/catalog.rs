//! Mapping inbound requests onto the upstream's known endpoints.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;

use quota_queue::Endpoint;

use crate::ResolveError;

/// How an inbound request names its platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// `/{platform}/{method...}`
    #[default]
    Path,
    /// The platform is the first label of the host, the whole path is the method.
    Proxy,
}

/// An inbound request mapped onto its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub endpoint: Endpoint,
    /// The concrete method path, without a leading slash.
    pub method: String,
}

#[derive(Debug, Deserialize)]
struct OpenApiSummary {
    paths: BTreeMap<String, PathItem>,
}

#[derive(Debug, Deserialize)]
struct PathItem {
    #[serde(rename = "x-platforms-available", default)]
    platforms: Vec<String>,
}

/// Read-only table of every endpoint, grouped by platform.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    platforms: HashMap<String, Vec<Endpoint>>,
}

impl Catalog {
    /// Builds the catalog from an OpenAPI summary listing `x-platforms-available` per path.
    pub fn from_openapi(document: &str) -> Result<Self, ResolveError> {
        let summary: OpenApiSummary = serde_json::from_str(document)?;
        Ok(Self::from_patterns(summary.paths.iter().flat_map(|(path, item)| {
            item.platforms
                .iter()
                .map(move |platform| (platform.as_str(), path.as_str()))
        })))
    }

    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut platforms: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for (platform, pattern) in patterns {
            platforms
                .entry(platform.to_string())
                .or_default()
                .push(Endpoint::new(platform, pattern.trim_start_matches('/')));
        }
        for endpoints in platforms.values_mut() {
            endpoints.sort_by(|a, b| a.pattern.cmp(&b.pattern));
            endpoints.dedup();
        }
        Self { platforms }
    }

    /// Number of endpoints across all platforms.
    pub fn len(&self) -> usize {
        self.platforms.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    /// Finds the endpoint serving `path`.
    ///
    /// When several patterns fit, the one with the most literal segments wins.
    pub fn resolve(
        &self,
        mode: RequestMode,
        host: Option<&str>,
        path: &str,
    ) -> Result<Resolved, ResolveError> {
        let path = path.trim_start_matches('/');
        let (platform, method) = match mode {
            RequestMode::Path => path
                .split_once('/')
                .ok_or_else(|| ResolveError::Syntax(path.to_string()))?,
            RequestMode::Proxy => {
                let host = host.ok_or_else(|| ResolveError::Syntax(path.to_string()))?;
                let platform = host.split('.').next().unwrap_or(host);
                (platform, path)
            }
        };

        let endpoints = self
            .platforms
            .get(platform)
            .ok_or_else(|| ResolveError::UnknownPlatform(platform.to_string()))?;

        let endpoint = endpoints
            .iter()
            .filter_map(|endpoint| literal_matches(&endpoint.pattern, method).map(|n| (n, endpoint)))
            .fold(None, |best: Option<(usize, &Endpoint)>, (n, endpoint)| match best {
                Some((most, _)) if most >= n => best,
                _ => Some((n, endpoint)),
            })
            .map(|(_, endpoint)| endpoint.clone())
            .ok_or_else(|| ResolveError::NoMatch {
                platform: platform.to_string(),
                method: method.to_string(),
            })?;

        Ok(Resolved {
            endpoint,
            method: method.to_string(),
        })
    }
}

/// Number of literal segments matched, or `None` when `method` does not fit `pattern`.
fn literal_matches(pattern: &str, method: &str) -> Option<usize> {
    let mut literals = 0;
    let mut pattern = pattern.split('/');
    let mut method = method.split('/');
    loop {
        match (pattern.next(), method.next()) {
            (None, None) => return Some(literals),
            (Some(expected), Some(segment)) => {
                if expected.starts_with('{') && expected.ends_with('}') {
                    continue;
                }
                if expected != segment {
                    return None;
                }
                literals += 1;
            }
            _ => return None,
        }
    }
}
