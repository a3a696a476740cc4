//! Per-worker cache file index and cross-worker invalidation (C4,
//! spec.md §5), grounded on `ds_invalidate_cached_file_internal` in
//! `ds_manager.c`.

use std::collections::HashMap;

use shared::utils::Timestamp;

use crate::worker::WorkerTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryState {
    Pending,
    Present,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub state: CacheEntryState,
    pub size: u64,
    pub mtime: Timestamp,
    /// Tasks currently depending on this cached name; an entry can only
    /// be dropped once this is empty (spec.md §5, "a cache entry with
    /// pending dependents is never evicted").
    pub dependents: u32,
}

/// One worker's view of its cache directory, keyed by the cached name
/// chosen at submission time (the content hash for `DS_CACHE` files).
#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
}

impl CacheIndex {
    pub fn mark_pending(&mut self, name: &str) {
        self.entries
            .entry(name.to_string())
            .or_insert(CacheEntry {
                state: CacheEntryState::Pending,
                size: 0,
                mtime: 0,
                dependents: 0,
            });
    }

    pub fn mark_present(&mut self, name: &str, size: u64, mtime: Timestamp) {
        let entry = self.entries.entry(name.to_string()).or_insert(CacheEntry {
            state: CacheEntryState::Present,
            size,
            mtime,
            dependents: 0,
        });
        entry.state = CacheEntryState::Present;
        entry.size = size;
        entry.mtime = mtime;
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(
            self.entries.get(name),
            Some(CacheEntry {
                state: CacheEntryState::Present,
                ..
            })
        )
    }

    pub fn invalidate(&mut self, name: &str) -> Option<CacheEntry> {
        self.entries.remove(name)
    }

    pub fn retain_dependent(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.dependents += 1;
        }
    }

    pub fn release_dependent(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.dependents = entry.dependents.saturating_sub(1);
        }
    }
}

/// Invalidate a cached file across every worker that has it, sending each
/// one a `cache-invalid` line (spec.md §5, "invalidation is manager-wide,
/// not scoped to the worker that reported the failure"). Returns the
/// workers that had the entry so the caller can write wire messages.
pub fn invalidate_everywhere(
    workers: &mut WorkerTable,
    cached_name: &str,
) -> Vec<crate::worker::WorkerId> {
    let mut touched = Vec::new();
    for (id, worker) in workers.iter_mut() {
        if worker.cache.invalidate(cached_name).is_some() {
            touched.push(*id);
        }
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_entry_is_not_present() {
        let mut idx = CacheIndex::default();
        idx.mark_pending("deadbeef");
        assert!(!idx.contains("deadbeef"));
        idx.mark_present("deadbeef", 128, 1);
        assert!(idx.contains("deadbeef"));
    }

    #[test]
    fn invalidate_removes_entry() {
        let mut idx = CacheIndex::default();
        idx.mark_present("abc", 1, 1);
        assert!(idx.invalidate("abc").is_some());
        assert!(!idx.contains("abc"));
    }
}
