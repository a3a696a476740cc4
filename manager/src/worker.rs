//! Worker record (C1, spec.md §2, Design Note "per-worker hash key").

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use shared::utils::Timestamp;

use crate::cache::CacheIndex;
use crate::resources::{ResourceBox, ResourceReport};
use crate::task::TaskId;

/// Identifies a worker connection for its whole lifetime: the listener
/// never reuses a serial number even if the underlying socket fd is
/// recycled by the OS, so stale references from in-flight tasks can never
/// alias onto a different worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    serial: u64,
    fd_hint: i32,
}

impl WorkerId {
    pub fn new(serial: u64, fd_hint: i32) -> Self {
        WorkerId { serial, fd_hint }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepted but hasn't sent its `dataswarm <proto>` greeting yet.
    AwaitingGreeting,
    /// Greeted, authenticated, resources known; eligible for dispatch.
    Ready,
    /// Sent `worker_status`/`queue_status` and is waiting on a reply only;
    /// not eligible for new task dispatch until it returns to `Ready`.
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Worker,
    Status,
    Http,
}

/// One connected worker. Owns everything keyed by this connection: its
/// resource report, its task table, its cache index, and its health
/// bookkeeping. The manager never reaches into a worker's tasks except
/// through these tables.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub addr: SocketAddr,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub factory_name: Option<String>,

    pub state: WorkerState,
    pub connection_kind: ConnectionKind,
    pub protocol_version: Option<u32>,

    pub resources: ResourceReport,
    pub cache: CacheIndex,

    /// Tasks currently committed to this worker, each paired with the
    /// resource box it was dispatched with (spec.md §3, "table of
    /// per-task resource boxes"). `resources.inuse` is derived from this
    /// map's values and must be recounted (`Worker::recount_inuse`)
    /// immediately after any insert/remove (spec.md §5, §8 invariant 1).
    pub current_tasks_boxes: HashMap<TaskId, ResourceBox>,

    pub time_connected: Timestamp,
    /// Stamped once, at admission, before any greeting arrives. Used only
    /// to time out a worker that never sends its `dataswarm` line, since
    /// `time_connected` itself stays zero until the greeting is seen.
    pub accepted_at: Timestamp,
    pub last_msg_recv_time: Timestamp,
    pub last_update_msg_time: Timestamp,

    pub draining: bool,

    /// Set when a task running on this worker has been fast-abort
    /// cancelled at least once (spec.md §4.9). A worker that earns a
    /// second strike while this alarm is already set is blocked and
    /// removed; one strike alone just sets the alarm. Cleared whenever
    /// the worker's task table fully drains, so a worker that's been
    /// running clean tasks since its one strike isn't penalized forever.
    pub fast_abort_alarm: bool,

    pub bytes_sent: u64,
    pub bytes_received: u64,

    pub end_time: Option<Timestamp>,

    /// Feature names advertised via `feature` lines (spec.md §4.1).
    pub features: HashSet<String>,
    /// Opaque worker identifier from an `info worker-id` line, if sent.
    pub external_id: Option<String>,
    /// Address/port the worker listens on for third-party transfers, from
    /// a `tlq`/`transfer-address` line.
    pub transfer_addr: Option<(String, u16)>,
}

impl Worker {
    pub fn new(id: WorkerId, addr: SocketAddr, now: Timestamp) -> Self {
        Worker {
            id,
            addr,
            hostname: String::new(),
            os: String::new(),
            arch: String::new(),
            factory_name: None,
            state: WorkerState::AwaitingGreeting,
            connection_kind: ConnectionKind::Worker,
            protocol_version: None,
            resources: ResourceReport::default(),
            cache: CacheIndex::default(),
            current_tasks_boxes: HashMap::new(),
            time_connected: 0,
            accepted_at: now,
            last_msg_recv_time: 0,
            last_update_msg_time: 0,
            draining: false,
            fast_abort_alarm: false,
            bytes_sent: 0,
            bytes_received: 0,
            end_time: None,
            features: HashSet::new(),
            external_id: None,
            transfer_addr: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready && !self.draining
    }

    pub fn task_count(&self) -> usize {
        self.current_tasks_boxes.len()
    }

    /// Charge a task's resource box to this worker and recount `inuse`
    /// (spec.md §4.6, "add resource box").
    pub fn commit_task(&mut self, taskid: TaskId, allocation: ResourceBox) {
        self.current_tasks_boxes.insert(taskid, allocation);
        self.recount_inuse();
    }

    /// Release a task's resource box (spec.md §4.7/§4.8, "deleted from
    /// that accounting exactly when the task is reaped"). Returns the box
    /// that was released, if the task was in fact charged to this
    /// worker.
    pub fn release_task(&mut self, taskid: TaskId) -> Option<ResourceBox> {
        let released = self.current_tasks_boxes.remove(&taskid);
        self.recount_inuse();
        if self.current_tasks_boxes.is_empty() {
            self.fast_abort_alarm = false;
        }
        released
    }

    pub fn recount_inuse(&mut self) {
        let boxes: Vec<ResourceBox> = self.current_tasks_boxes.values().copied().collect();
        self.resources.recount(boxes.iter());
    }
}

/// The manager's worker table, plus the monotonic serial generator that
/// mints fresh `WorkerId`s as connections are accepted.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: HashMap<WorkerId, Worker>,
    next_serial: u64,
}

impl WorkerTable {
    pub fn new() -> Self {
        WorkerTable {
            workers: HashMap::new(),
            next_serial: 1,
        }
    }

    pub fn insert_new(&mut self, addr: SocketAddr, fd_hint: i32, now: Timestamp) -> WorkerId {
        let id = WorkerId::new(self.next_serial, fd_hint);
        self.next_serial += 1;
        self.workers.insert(id, Worker::new(id, addr, now));
        id
    }

    pub fn get(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    pub fn remove(&mut self, id: &WorkerId) -> Option<Worker> {
        self.workers.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkerId, &Worker)> {
        self.workers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&WorkerId, &mut Worker)> {
        self.workers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn ready_ids(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, w)| w.is_ready())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000)
    }

    #[test]
    fn worker_ids_are_never_reused() {
        let mut table = WorkerTable::new();
        let a = table.insert_new(addr(), 4, 0);
        table.remove(&a);
        let b = table.insert_new(addr(), 4, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn draining_worker_is_not_ready() {
        let mut table = WorkerTable::new();
        let id = table.insert_new(addr(), 4, 0);
        let w = table.get_mut(&id).unwrap();
        w.state = WorkerState::Ready;
        w.draining = true;
        assert!(!table.get(&id).unwrap().is_ready());
    }
}
