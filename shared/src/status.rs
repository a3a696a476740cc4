//! JSON shapes emitted by the status & catalog publisher (C10), matching
//! the two forms the original builds in `queue_to_jx`/`queue_lean_to_jx`:
//! a full dump for direct status queries and a small "lean" form for
//! catalog gossip when the full one would be too large.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::stats::Stats;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerResourceReport {
    pub hostname: String,
    pub addr: String,
    pub cores_total: f64,
    pub cores_inuse: f64,
    pub memory_total: f64,
    pub memory_inuse: f64,
    pub disk_total: f64,
    pub disk_inuse: f64,
    pub gpus_total: f64,
    pub gpus_inuse: f64,
    pub tasks_running: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub name: String,
    pub tasks_waiting: u64,
    pub tasks_running: u64,
    pub tasks_done: u64,
    pub average_task_time_usec: f64,
    pub max_cores_seen: f64,
    pub max_memory_seen: f64,
    pub max_disk_seen: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub taskid: u64,
    pub state: String,
    pub category: String,
    pub worker: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusFull {
    pub project: Option<String>,
    pub port: u16,
    pub stats: Stats,
    pub workers: Vec<WorkerResourceReport>,
    pub categories: Vec<CategoryReport>,
    pub tasks: Vec<TaskReport>,
    pub blocked_hosts: Vec<String>,
    pub total_cores_needed: f64,
    pub total_memory_needed: f64,
    pub total_disk_needed: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusLean {
    pub project: Option<String>,
    pub port: u16,
    pub tasks_waiting: u64,
    pub tasks_running: u64,
    pub tasks_done: u64,
    pub workers: u64,
    pub manager_load: f64,
}

impl QueueStatusFull {
    /// The size (in serialized bytes) past which the publisher should
    /// fall back to the lean form (spec.md §4.11).
    pub const MAX_CATALOG_PAYLOAD_BYTES: usize = 64 * 1024;

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn fits_catalog_payload(&self) -> bool {
        self.to_json()
            .map(|s| s.len() <= Self::MAX_CATALOG_PAYLOAD_BYTES)
            .unwrap_or(false)
    }
}

impl QueueStatusLean {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// `resources_status`: per-resource worker capacity totals, keyed by
/// resource name.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ResourcesStatus {
    pub totals: BTreeMap<String, f64>,
}
