//! In-memory URL map model
//!
//! A two-level association `hostname -> path pattern -> backend`. The default
//! (catch-all) backend lives under a reserved key used both as the host and
//! the path, and is consumed by [`UrlMap::get_default_backend`]: each sync
//! cycle builds a fresh map and extracts the default exactly once.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved key carrying the default backend. Not a valid subdomain, and a
/// catch-all path.
pub const DEFAULT_BACKEND_KEY: &str = "DefaultBackend";

/// Host pattern used when a rule names no host
pub const ANY_HOST: &str = "*";

/// Path pattern used when a rule names no path
pub const ANY_PATH: &str = "/*";

/// Nested host -> path -> backend map.
///
/// `B` is whatever identifies a backend at the current stage of a cycle: a
/// service port before resolution, a [`crate::cloud::BackendRef`] after.
/// Ordered maps keep iteration (and therefore the URL map resource built from
/// it) deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMap<B> {
    hosts: BTreeMap<String, BTreeMap<String, Option<B>>>,
}

impl<B> Default for UrlMap<B> {
    fn default() -> Self {
        Self {
            hosts: BTreeMap::new(),
        }
    }
}

impl<B> UrlMap<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `host` + `path` to `backend`. Empty host/path mean "any".
    pub fn put_path(&mut self, host: &str, path: &str, backend: B) {
        self.put(host, path, Some(backend));
    }

    /// Record a path whose backend could not be determined.
    pub fn put_missing(&mut self, host: &str, path: &str) {
        self.put(host, path, None);
    }

    fn put(&mut self, host: &str, path: &str, backend: Option<B>) {
        let host = if host.is_empty() { ANY_HOST } else { host };
        let path = if path.is_empty() { ANY_PATH } else { path };
        self.hosts
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string(), backend);
    }

    /// Destructive write: replaces any existing default backend.
    pub fn put_default_backend(&mut self, backend: B) {
        let mut paths = BTreeMap::new();
        paths.insert(DEFAULT_BACKEND_KEY.to_string(), Some(backend));
        self.hosts.insert(DEFAULT_BACKEND_KEY.to_string(), paths);
    }

    /// Destructive read: removes and returns the default backend.
    ///
    /// A second call without an intervening [`UrlMap::put_default_backend`]
    /// returns `None`.
    pub fn get_default_backend(&mut self) -> Option<B> {
        self.hosts
            .remove(DEFAULT_BACKEND_KEY)
            .and_then(|mut paths| paths.remove(DEFAULT_BACKEND_KEY))
            .flatten()
    }

    /// Host entries in order, excluding the default backend entry.
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, Option<B>>)> {
        self.hosts
            .iter()
            .filter(|(host, _)| host.as_str() != DEFAULT_BACKEND_KEY)
            .map(|(host, paths)| (host.as_str(), paths))
    }

    /// Every backend referenced by a path rule, in host/path order.
    pub fn backends(&self) -> impl Iterator<Item = &B> {
        self.hosts.values().flat_map(|paths| paths.values().flatten())
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Convert every backend with `f`, keeping the map shape (including any
    /// default entry). Stops at the first error.
    pub fn try_map<C, E>(&self, mut f: impl FnMut(&B) -> Result<C, E>) -> Result<UrlMap<C>, E> {
        let mut hosts = BTreeMap::new();
        for (host, paths) in &self.hosts {
            let mut converted = BTreeMap::new();
            for (path, backend) in paths {
                let backend = match backend {
                    Some(b) => Some(f(b)?),
                    None => None,
                };
                converted.insert(path.clone(), backend);
            }
            hosts.insert(host.clone(), converted);
        }
        Ok(UrlMap { hosts })
    }
}

impl<B: fmt::Display> fmt::Display for UrlMap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (host, paths) in &self.hosts {
            writeln!(f, "{}", host)?;
            for (path, backend) in paths {
                match backend {
                    Some(b) => writeln!(f, "\t{}: {}", path, b)?,
                    None => writeln!(f, "\t{}: No backend", path)?,
                }
            }
        }
        Ok(())
    }
}
