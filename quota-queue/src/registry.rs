use std::collections::HashMap;

use quanta::Instant;

use crate::QuotaScope;

/// Handle to a [`QuotaScope`] stored in a [`ScopeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// Name of a scope within one credential's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// Limits shared by every endpoint of a platform.
    Platform(String),
    /// Limits of one endpoint, keyed by endpoint id.
    Method(String),
}

/// Arena of every scope, per credential.
///
/// Pairings refer to scopes by [`ScopeId`] so that all pairings touching the same platform
/// observe one set of windows. Scopes are never removed; they cache discovered limits for
/// the life of the process.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    scopes: Vec<QuotaScope>,
    index: HashMap<(usize, ScopeKey), ScopeId>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the scope for `credential` and `key`, creating it with `make` if needed.
    pub fn get_or_insert_with(
        &mut self,
        credential: usize,
        key: ScopeKey,
        make: impl FnOnce() -> QuotaScope,
    ) -> ScopeId {
        let scopes = &mut self.scopes;
        *self.index.entry((credential, key)).or_insert_with(|| {
            scopes.push(make());
            ScopeId(scopes.len() - 1)
        })
    }

    pub fn lookup(&self, credential: usize, key: &ScopeKey) -> Option<ScopeId> {
        self.index.get(&(credential, key.clone())).copied()
    }

    pub fn get(&self, id: ScopeId) -> &QuotaScope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut QuotaScope {
        &mut self.scopes[id.0]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Refill sweep over every stored window.
    pub fn refill(&mut self, now: Instant) -> usize {
        self.scopes.iter_mut().map(|scope| scope.refill(now)).sum()
    }
}
