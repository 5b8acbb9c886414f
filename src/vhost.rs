//! Explicitly managed host → router table
//!
//! Entries here take precedence over file-backed routers and are never
//! touched by the sync sweep. Host names are stored lowercase without a
//! port.

use crate::cache::ResourceCache;
use crate::router::Router;
use std::sync::Arc;

pub struct VirtualHostTable {
    hosts: ResourceCache<Router>,
}

impl Default for VirtualHostTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

impl VirtualHostTable {
    pub fn new() -> Self {
        Self {
            hosts: ResourceCache::new("vhost"),
        }
    }

    /// Add or replace the router serving `host`; a replaced router is closed
    pub fn insert(&self, host: &str, router: Arc<Router>) {
        self.hosts.insert(&normalize(host), router);
    }

    pub fn lookup(&self, host: &str) -> Option<Arc<Router>> {
        self.hosts.lookup(&normalize(host))
    }

    pub fn remove(&self, host: &str) -> bool {
        self.hosts.remove(&normalize(host))
    }

    /// Remove every host starting with `prefix`
    pub fn evict_prefix(&self, prefix: &str) -> usize {
        self.hosts.evict_prefix(&prefix.to_ascii_lowercase())
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.keys()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
