//! Status & catalog publisher (C10, spec.md §4.11): builds the full and
//! lean JSON summaries from the manager's live tables, serves the HTTP
//! `GET` surface on the worker port, and pushes the lean summary to the
//! catalog server by UDP (the catalog gossip protocol itself is out of
//! scope, spec.md §1 — this only emits the datagram it expects).

use std::net::SocketAddr;

use shared::stats::Stats;
use shared::status::{
    CategoryReport, QueueStatusFull, QueueStatusLean, ResourcesStatus, TaskReport,
    WorkerResourceReport,
};

use crate::category::CategoryTable;
use crate::task::{Task, TaskState};
use crate::worker::WorkerTable;

fn state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Unknown => "UNKNOWN",
        TaskState::Ready => "READY",
        TaskState::Running => "RUNNING",
        TaskState::WaitingRetrieval => "WAITING_RETRIEVAL",
        TaskState::Retrieved => "RETRIEVED",
        TaskState::Done => "DONE",
        TaskState::Canceled => "CANCELED",
    }
}

/// Build the full `queue_status` JSON body (spec.md §4.1, §4.11).
pub fn build_full(
    project: Option<&str>,
    port: u16,
    stats: &Stats,
    workers: &WorkerTable,
    categories: &CategoryTable,
    tasks: &std::collections::HashMap<crate::task::TaskId, Task>,
    blocked_hosts: Vec<String>,
) -> QueueStatusFull {
    let worker_reports = workers
        .iter()
        .map(|(_, w)| WorkerResourceReport {
            hostname: w.hostname.clone(),
            addr: w.addr.to_string(),
            cores_total: w.resources.standard.cores,
            cores_inuse: w.resources.inuse.cores,
            memory_total: w.resources.standard.memory,
            memory_inuse: w.resources.inuse.memory,
            disk_total: w.resources.standard.disk,
            disk_inuse: w.resources.inuse.disk,
            gpus_total: w.resources.standard.gpus,
            gpus_inuse: w.resources.inuse.gpus,
            tasks_running: w.task_count(),
        })
        .collect();

    let category_reports = categories
        .iter()
        .map(|c| CategoryReport {
            name: c.name.clone(),
            tasks_waiting: c.tasks_waiting,
            tasks_running: c.tasks_running,
            tasks_done: c.tasks_done,
            average_task_time_usec: c.average_runtime_usecs(),
            max_cores_seen: c.usage.max_cores,
            max_memory_seen: c.usage.max_memory,
            max_disk_seen: c.usage.max_disk,
        })
        .collect();

    let task_reports = tasks
        .values()
        .map(|t| TaskReport {
            taskid: t.taskid,
            state: state_label(t.state).to_string(),
            category: t.category.clone(),
            worker: t.worker.map(|w| format!("{w:?}")),
            tag: t.tag.clone(),
        })
        .collect();

    let (mut cores_needed, mut memory_needed, mut disk_needed) = (0.0, 0.0, 0.0);
    for t in tasks.values() {
        if t.state == TaskState::Ready {
            cores_needed += t.request.cores.unwrap_or(0.0);
            memory_needed += t.request.memory.unwrap_or(0.0);
            disk_needed += t.request.disk.unwrap_or(0.0);
        }
    }

    QueueStatusFull {
        project: project.map(str::to_string),
        port,
        stats: stats.clone(),
        workers: worker_reports,
        categories: category_reports,
        tasks: task_reports,
        blocked_hosts,
        total_cores_needed: cores_needed,
        total_memory_needed: memory_needed,
        total_disk_needed: disk_needed,
    }
}

/// Build the small `lean` summary used for catalog gossip when the full
/// payload would be too large (spec.md §4.11).
pub fn build_lean(
    project: Option<&str>,
    port: u16,
    tasks_waiting: u64,
    tasks_running: u64,
    tasks_done: u64,
    workers: u64,
    manager_load: f64,
) -> QueueStatusLean {
    QueueStatusLean {
        project: project.map(str::to_string),
        port,
        tasks_waiting,
        tasks_running,
        tasks_done,
        workers,
        manager_load,
    }
}

pub fn build_resources_status(workers: &WorkerTable) -> ResourcesStatus {
    let mut totals = std::collections::BTreeMap::new();
    let mut cores = 0.0;
    let mut memory = 0.0;
    let mut disk = 0.0;
    let mut gpus = 0.0;
    for (_, w) in workers.iter() {
        cores += w.resources.standard.cores;
        memory += w.resources.standard.memory;
        disk += w.resources.standard.disk;
        gpus += w.resources.standard.gpus;
    }
    totals.insert("cores".to_string(), cores);
    totals.insert("memory".to_string(), memory);
    totals.insert("disk".to_string(), disk);
    totals.insert("gpus".to_string(), gpus);
    ResourcesStatus { totals }
}

/// Choose which of the two JSON shapes to push to the catalog this round
/// (spec.md §4.11: "full summary is attempted first ... if too large,
/// the lean one is sent").
pub fn catalog_payload(full: &QueueStatusFull, lean: &QueueStatusLean) -> Option<String> {
    if full.fits_catalog_payload() {
        full.to_json().ok()
    } else {
        lean.to_json().ok()
    }
}

/// Best-effort UDP push to the catalog server (spec.md §1, §6:
/// `CATALOG_HOST`/`CATALOG_PORT`). The catalog's own gossip/HTTP protocol
/// is out of scope; this only fires the datagram it expects and never
/// blocks the event loop waiting for an acknowledgement.
pub async fn publish_to_catalog(catalog_addr: SocketAddr, payload: &str) -> std::io::Result<()> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(payload.as_bytes(), catalog_addr).await?;
    Ok(())
}

/// Minimal HTML index for a bare `GET /` (spec.md §4.1, §6).
pub fn html_index(project: Option<&str>, stats: &Stats) -> String {
    format!(
        "<html><head><title>{}</title></head><body><h1>{}</h1>\
         <p>tasks done: {}</p><p>workers connected: {}</p></body></html>",
        project.unwrap_or("cluster manager"),
        project.unwrap_or("cluster manager"),
        stats.tasks_done,
        stats.workers_connected,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lean_chosen_when_full_too_large() {
        let mut full = build_full(None, 0, &Stats::default(), &WorkerTable::new(), &CategoryTable::default(), &std::collections::HashMap::new(), Vec::new());
        for i in 0..5000 {
            full.tasks.push(TaskReport {
                taskid: i,
                state: "RUNNING".into(),
                category: "default".into(),
                worker: None,
                tag: None,
            });
        }
        let lean = build_lean(None, 0, 0, 0, 0, 0, 0.0);
        let payload = catalog_payload(&full, &lean).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert!(parsed.get("workers").is_none() || parsed["tasks_waiting"].is_number());
    }

    #[test]
    fn html_index_contains_project_name() {
        let html = html_index(Some("demo"), &Stats::default());
        assert!(html.contains("demo"));
    }
}
