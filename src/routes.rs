//! Runtime-mutable route table mapping path prefixes to live backends
//!
//! Entries are replaced whole, never edited in place, so a reader holding an
//! `Arc<Backend>` always sees a fully constructed backend. Removing a route
//! leaves a tombstone: the prefix stays bound to the dispatcher and requests to
//! it get the fallback response.

use crate::backend::Backend;
use crate::error::{ProxyError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// State of a registered prefix
#[derive(Debug, Clone)]
pub enum RouteEntry {
    Live(Arc<Backend>),
    /// Registered once, since removed
    Removed,
}

/// Concurrent path prefix -> backend mapping
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: RwLock<HashMap<String, RouteEntry>>,
    bindings: RwLock<HashSet<String>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the backend for its prefix
    ///
    /// The first registration of a prefix also binds it for dispatch; the
    /// binding outlives later removals.
    pub fn register(&self, backend: Backend) -> Result<()> {
        let prefix = backend.path_prefix().to_string();
        if prefix.is_empty() {
            return Err(ProxyError::InvalidPathPrefix(prefix));
        }

        let backend = Arc::new(backend);
        let replaced = {
            let mut entries = self.entries.write();
            let previous = entries.insert(prefix.clone(), RouteEntry::Live(backend.clone()));
            // Bound while the entry lock is held so a lookup through a fresh
            // binding always finds the entry.
            self.bindings.write().insert(prefix.clone());
            matches!(previous, Some(RouteEntry::Live(_)))
        };

        info!(
            name = backend.name(),
            path = %prefix,
            url = backend.url(),
            replaced,
            "route registered"
        );
        Ok(())
    }

    /// Build a backend from admin input and register it
    pub fn add(&self, name: &str, path: &str, url: &str) -> Result<()> {
        self.register(Backend::new(name, path, url)?)
    }

    /// Tombstone the entry for `prefix`
    ///
    /// Returns false if the prefix was never registered, in which case nothing
    /// changes.
    pub fn deregister(&self, prefix: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(prefix) {
            Some(entry) => {
                if matches!(entry, RouteEntry::Live(_)) {
                    *entry = RouteEntry::Removed;
                    info!(path = %prefix, "route removed");
                }
                true
            }
            None => false,
        }
    }

    /// Current live backend for `prefix`, if any
    pub fn lookup(&self, prefix: &str) -> Option<Arc<Backend>> {
        match self.entries.read().get(prefix) {
            Some(RouteEntry::Live(backend)) => Some(backend.clone()),
            _ => None,
        }
    }

    /// Raw entry for `prefix`, distinguishing removed from never registered
    pub fn entry(&self, prefix: &str) -> Option<RouteEntry> {
        self.entries.read().get(prefix).cloned()
    }

    /// Snapshot of all live backends, in no particular order
    pub fn list(&self) -> Vec<Arc<Backend>> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| match entry {
                RouteEntry::Live(backend) => Some(backend.clone()),
                RouteEntry::Removed => None,
            })
            .collect()
    }

    /// Prefixes bound for dispatch
    pub fn bindings(&self) -> Vec<String> {
        self.bindings.read().iter().cloned().collect()
    }

    /// Whether `prefix` is bound for dispatch
    pub fn is_bound(&self, prefix: &str) -> bool {
        self.bindings.read().contains(prefix)
    }

    /// Longest bound prefix matching `path`
    ///
    /// A prefix ending in `/` matches every path below it; any other prefix
    /// only matches itself.
    pub fn match_binding(&self, path: &str) -> Option<String> {
        self.bindings
            .read()
            .iter()
            .filter(|prefix| prefix_matches(prefix, path))
            .max_by_key(|prefix| prefix.len())
            .cloned()
    }

    /// Number of live routes
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| matches!(entry, RouteEntry::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.ends_with('/') {
        path.starts_with(prefix)
    } else {
        path == prefix
    }
}
