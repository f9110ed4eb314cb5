//! Path routing
//!
//! Maps request paths to service names through a prefix table. Matching is
//! longest-prefix; equal-length ties go to the lexicographically smallest
//! prefix so reloads behave deterministically. The table can be amended or
//! swapped atomically at runtime.

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct PrefixEntry {
    prefix: String,
    service: String,
}

/// Router over a prefix table.
pub struct ServiceRouter {
    /// Sorted longest-first, lexicographic within a length, so the first
    /// match wins.
    table: RwLock<Vec<PrefixEntry>>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Vec::new()),
        }
    }

    fn sort(table: &mut [PrefixEntry]) {
        table.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
    }

    /// Add one prefix. No two entries may share a prefix.
    pub fn add_prefix(&self, prefix: impl Into<String>, service: impl Into<String>) -> Result<()> {
        let prefix = prefix.into();
        let mut table = self.table.write();
        if table.iter().any(|e| e.prefix == prefix) {
            return Err(GatewayError::AlreadyRegistered(prefix));
        }
        table.push(PrefixEntry {
            prefix,
            service: service.into(),
        });
        Self::sort(&mut table);
        Ok(())
    }

    /// Remove one prefix; true if it was present.
    pub fn remove_prefix(&self, prefix: &str) -> bool {
        let mut table = self.table.write();
        let before = table.len();
        table.retain(|e| e.prefix != prefix);
        table.len() != before
    }

    /// Replace the whole table atomically.
    pub fn replace_table(&self, entries: Vec<(String, String)>) -> Result<()> {
        let mut fresh: Vec<PrefixEntry> = Vec::with_capacity(entries.len());
        for (prefix, service) in entries {
            if fresh.iter().any(|e| e.prefix == prefix) {
                return Err(GatewayError::AlreadyRegistered(prefix));
            }
            fresh.push(PrefixEntry { prefix, service });
        }
        Self::sort(&mut fresh);
        *self.table.write() = fresh;
        Ok(())
    }

    /// Resolve a path to a service name by longest-prefix match.
    pub fn route(&self, path: &str) -> Option<String> {
        let table = self.table.read();
        table
            .iter()
            .find(|e| path.starts_with(e.prefix.as_str()))
            .map(|e| e.service.clone())
    }

    /// Current table as (prefix, service) pairs in match order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.table
            .read()
            .iter()
            .map(|e| (e.prefix.clone(), e.service.clone()))
            .collect()
    }
}

impl Default for ServiceRouter {
    fn default() -> Self {
        Self::new()
    }
}
