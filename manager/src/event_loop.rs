//! The manager core (C9, spec.md §4.10): owns every live table, drives
//! one cooperative event-loop iteration per call, and exposes the
//! submit/wait/cancel surface that stands in for the out-of-scope
//! client-embedding API's contract (spec.md §1).
//!
//! Single-threaded and cooperative by construction: every socket is
//! polled non-blockingly (`crate::connection`, `crate::admission`) and
//! the loop never awaits anything that isn't bounded by a short
//! timeout. This mirrors `ds_manager_wait_internal`'s single iteration
//! per `work_queue_wait` call, adapted from a `select()` over raw fds
//! to tokio's non-blocking polling (see the admission/connection module
//! docs for why `now_or_never` replaces a true reactor here).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use ds_protocol::{check, exit, kill, send_results, unlink, FileSpec, InboundMessage, TaskStartHeader};

use shared::config::ManagerConfig;
use shared::defaults;
use shared::stats::Stats;
use shared::utils::{now_micros, now_secs, Timestamp};

use crate::admission;
use crate::blocklist::Blocklist;
use crate::cache;
use crate::category::{self, AllocationOutcome, CategoryTable};
use crate::connection::Connection;
use crate::factory::FactoryRegistry;
use crate::health;
use crate::perflog::{PerfLog, TxnEvent, TxnLog};
use crate::resources::ResourceBox;
use crate::scheduler;
use crate::status;
use crate::task::{RequestLabel, ResourceRequest, ResultCode, Task, TaskFile, TaskId, TaskState};
use crate::transfer::{NullTransferBackend, TransferBackend, TransferOutcome};
use crate::worker::{WorkerId, WorkerState, WorkerTable};

/// Everything the caller needs to describe before `Manager::submit`
/// assigns it an identity (spec.md §3). Mirrors the fields the
/// out-of-scope client-embedding API would collect on its own task
/// object before handing it to the manager.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub command_line: String,
    pub category: String,
    pub input_files: Vec<TaskFile>,
    pub output_files: Vec<TaskFile>,
    pub env: Vec<String>,
    pub coprocess: Option<String>,
    pub request: ResourceRequest,
    pub tag: Option<String>,
    pub priority: i64,
    pub max_retries: u32,
}

impl NewTask {
    pub fn new(command_line: impl Into<String>, category: impl Into<String>) -> Self {
        NewTask {
            command_line: command_line.into(),
            category: category.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    ProtocolMismatch,
    WorkerFailure,
    KeepaliveTimeout,
    FastAbort,
    Draining,
    IdleRequested,
    ConnectionClosed,
    Graceful,
}

/// The cluster manager: worker table, task table, scheduler, health
/// monitor, and logs, all driven by repeated calls to
/// [`Manager::run_once`] (directly, for a standalone server loop) or
/// indirectly through [`Manager::wait`].
pub struct Manager {
    config: ManagerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,

    workers: WorkerTable,
    connections: HashMap<WorkerId, Connection>,

    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    retrieved: VecDeque<TaskId>,
    next_taskid: TaskId,

    categories: CategoryTable,
    blocklist: Blocklist,
    factories: FactoryRegistry,
    stats: Stats,

    transfer: Box<dyn TransferBackend>,

    perf_log: Option<PerfLog>,
    txn_log: Option<TxnLog>,

    last_catalog_publish: Timestamp,
    last_perf_log: Timestamp,
    last_large_task_check: Timestamp,
}

impl Manager {
    /// Bind the listen socket, build the TLS acceptor (if configured)
    /// and open the perf/txn logs (if configured). Everything else
    /// starts empty.
    pub async fn new(config: ManagerConfig) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .context("building bind address from configured port")?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .context("binding manager listen socket")?;
        let local_addr = listener.local_addr().context("reading bound local address")?;

        let tls_acceptor = match (&config.tls_key_path, &config.tls_cert_path) {
            (Some(key), Some(cert)) => Some(
                admission::build_tls_acceptor(key, cert)
                    .context("building TLS acceptor from configured key/cert")?,
            ),
            _ => None,
        };

        let perf_log = config
            .perf_log_path
            .as_ref()
            .map(|p| PerfLog::open(Path::new(p)))
            .transpose()
            .context("opening perf log")?;
        let txn_log = config
            .txn_log_path
            .as_ref()
            .map(|p| TxnLog::open(Path::new(p)))
            .transpose()
            .context("opening transaction log")?;

        let next_taskid = config.min_taskid.max(1);

        Ok(Manager {
            config,
            listener,
            local_addr,
            tls_acceptor,
            workers: WorkerTable::new(),
            connections: HashMap::new(),
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            retrieved: VecDeque::new(),
            next_taskid,
            categories: CategoryTable::default(),
            blocklist: Blocklist::default(),
            factories: FactoryRegistry::default(),
            stats: Stats::default(),
            transfer: Box::new(NullTransferBackend),
            perf_log,
            txn_log,
            last_catalog_publish: 0,
            last_perf_log: 0,
            last_large_task_check: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Peek a still-owned task's state and try count without removing it
    /// from the manager's index. Used by callers (and tests) that need to
    /// observe an in-flight task between `wait()` calls.
    pub fn task_snapshot(&self, taskid: TaskId) -> Option<(TaskState, u32)> {
        self.tasks.get(&taskid).map(|t| (t.state, t.try_count))
    }

    /// Tasks still waiting to dispatch or still out on a worker. Used by
    /// a standalone runner to know when there's nothing left to wait for
    /// (spec.md §1, client-embedding contract: submit/wait/cancel).
    pub fn pending_task_count(&self) -> usize {
        self.ready.len()
            + self
                .tasks
                .values()
                .filter(|t| matches!(t.state, TaskState::Running | TaskState::WaitingRetrieval))
                .count()
    }

    // ---- client-facing API (the contract the out-of-scope embedding
    // API wraps, spec.md §1) ----

    pub fn submit(&mut self, spec: NewTask) -> TaskId {
        let taskid = self.next_taskid;
        self.next_taskid += 1;

        let mut task = Task::new(taskid, spec.command_line, spec.category.clone());
        task.input_files = spec.input_files;
        task.output_files = spec.output_files;
        task.env = spec.env;
        task.coprocess = spec.coprocess;
        task.request = spec.request;
        task.tag = spec.tag;
        task.priority = spec.priority;
        task.max_retries = spec.max_retries;
        task.state = TaskState::Ready;
        task.time_when_submitted = now_micros();

        self.categories.get_or_create(&spec.category).tasks_waiting += 1;
        self.stats.tasks_submitted += 1;
        self.log_txn(
            TxnEvent::TaskSubmitted,
            &taskid.to_string(),
            &format!("category={}", spec.category),
        );

        self.tasks.insert(taskid, task);
        self.insert_ready(taskid);
        taskid
    }

    /// Cancel one task by id. Returns `false` if it's unknown or already
    /// terminal. A running task's worker is sent `kill` but the task
    /// flips to `CANCELED` immediately rather than waiting for the
    /// worker's acknowledgement (spec.md §4.2, immediate-cancel
    /// semantics).
    pub fn cancel_by_taskid(&mut self, taskid: TaskId) -> bool {
        let Some(task) = self.tasks.get(&taskid) else {
            return false;
        };
        if task.state.is_terminal() {
            return false;
        }
        let state = task.state;
        let category = task.category.clone();
        let worker = task.worker;

        match state {
            TaskState::Ready => {
                self.ready.retain(|id| *id != taskid);
                let cat = self.categories.get_or_create(&category);
                cat.tasks_waiting = cat.tasks_waiting.saturating_sub(1);
            }
            TaskState::Running | TaskState::WaitingRetrieval | TaskState::Retrieved => {
                if let Some(worker_id) = worker {
                    if let Some(conn) = self.connections.get_mut(&worker_id) {
                        conn.enqueue_write(kill(taskid).as_bytes());
                    }
                    if let Some(w) = self.workers.get_mut(&worker_id) {
                        w.release_task(taskid);
                    }
                    let cat = self.categories.get_or_create(&category);
                    cat.tasks_running = cat.tasks_running.saturating_sub(1);
                }
            }
            TaskState::Unknown | TaskState::Done | TaskState::Canceled => {}
        }

        let task = self.tasks.get_mut(&taskid).unwrap();
        task.state = TaskState::Canceled;
        task.time_when_done = now_micros();
        self.stats.tasks_cancelled += 1;
        self.retrieved.push_back(taskid);
        self.log_txn(TxnEvent::TaskCanceled, &taskid.to_string(), "");
        true
    }

    /// Cancel every non-terminal task carrying `tag`. Returns how many
    /// were actually canceled.
    pub fn cancel_by_tag(&mut self, tag: &str) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.tag.as_deref() == Some(tag) && !t.state.is_terminal())
            .map(|t| t.taskid)
            .collect();
        ids.into_iter().filter(|id| self.cancel_by_taskid(*id)).count()
    }

    /// Block until a task finishes (successfully, canceled, or failed)
    /// or `timeout` elapses. Runs as many event-loop iterations as it
    /// takes, never more than `timeout` total (spec.md §1, `work_queue_wait`
    /// contract).
    ///
    /// By default returns the instant a task is available, the same as
    /// the original's `wait_retrieve_many == 0` path (`ds_manager.c`'s
    /// `ds_wait_internal`, the `if(!q->wait_retrieve_many) break;` right
    /// after a retrieved task is found). With
    /// `shared::config::ManagerConfig::wait_retrieve_many` set, a task
    /// becoming available no longer ends the call immediately: the loop
    /// keeps running further iterations — dispatching other ready tasks,
    /// polling workers, doing the periodic bookkeeping — for as long as
    /// they're doing something, and only then returns the first task
    /// that became available. Either way exactly one task comes back
    /// per call; the difference is how much unrelated housekeeping a
    /// single `wait` piggy-backs before returning it.
    pub async fn wait(&mut self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut have_one = false;
        loop {
            if !have_one && !self.retrieved.is_empty() {
                have_one = true;
                if !self.config.wait_retrieve_many {
                    return self.pop_retrieved();
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return self.pop_retrieved();
            }
            let slice = (deadline - now).min(Duration::from_millis(1000));
            let had_activity = self.run_once(slice).await;
            if have_one && !had_activity {
                // Nothing left for this call to usefully do; hand back
                // the task we already have rather than keep spinning.
                return self.pop_retrieved();
            }
        }
    }

    fn pop_retrieved(&mut self) -> Option<Task> {
        let taskid = self.retrieved.pop_front()?;
        let mut task = self.tasks.remove(&taskid)?;
        if task.state == TaskState::Retrieved {
            task.state = TaskState::Done;
            task.time_when_done = now_micros();
            self.stats.tasks_done += 1;
            self.log_txn(TxnEvent::TaskDone, &taskid.to_string(), "");
        }
        Some(task)
    }

    /// Politely tell every connected worker to exit and flush the
    /// write. Does not wait for them to actually disconnect.
    pub async fn shutdown(&mut self) {
        let ids: Vec<WorkerId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.enqueue_write(exit().as_bytes());
                let _ = conn.pump_write();
            }
        }
        self.log_txn(TxnEvent::WorkerRemoved, "MANAGER", "END");
    }

    // ---- one cooperative iteration (spec.md §4.10) ----

    /// Run exactly one iteration: accept new workers, drain every
    /// connection's pending messages, run the health sweeps, dispatch
    /// whatever's ready, flush writes, and do the periodic bookkeeping
    /// (perf log, catalog push, large-task check). Sleeps up to
    /// `poll_timeout` only if nothing happened this iteration. Returns
    /// whether anything actually happened, so callers (namely
    /// `wait`'s `wait_retrieve_many` rung) can tell a productive
    /// iteration from a quiet one.
    pub async fn run_once(&mut self, poll_timeout: Duration) -> bool {
        let mut had_activity = false;

        let admitted = admission::accept_new_workers(
            &self.listener,
            &mut self.workers,
            self.tls_acceptor.as_ref(),
            self.config.password.as_deref(),
            Duration::from_secs(self.config.short_timeout_secs),
            self.config.bandwidth_limit_bps,
        )
        .await;
        for a in admitted {
            had_activity = true;
            self.connections.insert(a.worker_id, a.connection);
        }

        if self.recv_and_dispatch() {
            had_activity = true;
        }

        self.run_health_sweeps();

        if self.expire_stale_ready_tasks() {
            had_activity = true;
        }

        if self.dispatch_ready_tasks() {
            had_activity = true;
        }

        self.flush_writes();
        self.maybe_write_perf_log();
        self.maybe_publish_catalog().await;
        self.maybe_check_large_tasks();

        let sample = if had_activity { 1.0 } else { 0.0 };
        self.stats.manager_load =
            self.stats.manager_load * (1.0 - defaults::MANAGER_LOAD_ALPHA) + sample * defaults::MANAGER_LOAD_ALPHA;

        if !had_activity {
            let sleep_for = poll_timeout.min(Duration::from_secs(1));
            if !sleep_for.is_zero() {
                tokio::time::sleep(sleep_for).await;
            }
        }

        had_activity
    }

    // ---- step 2: receive + dispatch ----

    fn recv_and_dispatch(&mut self) -> bool {
        let mut had_activity = false;
        let ids: Vec<WorkerId> = self.connections.keys().copied().collect();
        let mut to_remove: Vec<(WorkerId, DisconnectReason)> = Vec::new();

        for id in ids {
            loop {
                let outcome = {
                    let Some(conn) = self.connections.get_mut(&id) else {
                        break;
                    };
                    conn.try_read_message()
                };
                match outcome {
                    Ok(Some(message)) => {
                        had_activity = true;
                        if let Some(w) = self.workers.get_mut(&id) {
                            w.last_msg_recv_time = now_micros();
                        }
                        match self.handle_inbound(id, message) {
                            ds_protocol::DispatchOutcome::Processed
                            | ds_protocol::DispatchOutcome::NotProcessed => continue,
                            ds_protocol::DispatchOutcome::ProcessedDisconnect => {
                                to_remove.push((id, DisconnectReason::Graceful));
                                break;
                            }
                            ds_protocol::DispatchOutcome::Failure => {
                                to_remove.push((id, DisconnectReason::WorkerFailure));
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(crate::connection::ConnectionError::Closed) => {
                        to_remove.push((id, DisconnectReason::ConnectionClosed));
                        break;
                    }
                    Err(e) => {
                        warn!(?id, error = %e, "connection error, dropping worker");
                        to_remove.push((id, DisconnectReason::WorkerFailure));
                        break;
                    }
                }
            }
        }

        for (id, reason) in to_remove {
            self.remove_worker(id, reason);
        }
        had_activity
    }

    fn handle_inbound(&mut self, id: WorkerId, msg: InboundMessage) -> ds_protocol::DispatchOutcome {
        use ds_protocol::DispatchOutcome as D;
        match msg {
            InboundMessage::Greeting {
                version,
                host,
                os,
                arch,
                software_version: _,
            } => {
                if version != ds_protocol::PROTOCOL_VERSION {
                    warn!(
                        %host,
                        worker_version = version,
                        expected = ds_protocol::PROTOCOL_VERSION,
                        "protocol version mismatch, rejecting worker"
                    );
                    self.remove_worker(id, DisconnectReason::ProtocolMismatch);
                    return D::ProcessedDisconnect;
                }
                if let Some(w) = self.workers.get_mut(&id) {
                    w.hostname = host;
                    w.os = os;
                    w.arch = arch;
                    w.protocol_version = Some(version);
                    w.state = WorkerState::Ready;
                    w.time_connected = now_micros();
                }
                self.stats.workers_joined += 1;
                self.stats.workers_connected += 1;
                self.log_txn(TxnEvent::WorkerConnected, &format!("{id:?}"), "");
                D::Processed
            }
            InboundMessage::Alive => D::Processed,
            InboundMessage::Info { key, value } => {
                self.handle_info(id, &key, &value);
                D::Processed
            }
            InboundMessage::Resource {
                name,
                total,
                smallest: _,
                largest: _,
            } => {
                if let Some(w) = self.workers.get_mut(&id) {
                    match name.as_str() {
                        "cores" => w.resources.standard.cores = total,
                        "memory" => w.resources.standard.memory = total,
                        "disk" => w.resources.standard.disk = total,
                        "gpus" => w.resources.standard.gpus = total,
                        other => {
                            w.resources.tags.insert(other.to_string(), total);
                        }
                    }
                }
                D::Processed
            }
            InboundMessage::ResourceTag { tag } => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.resources.tags.entry(tag).or_insert(0.0);
                }
                D::Processed
            }
            InboundMessage::Feature { name } => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.features.insert(name);
                }
                D::Processed
            }
            InboundMessage::CacheUpdate {
                name,
                size,
                transfer_time_usec: _,
            } => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.cache.mark_present(&name, size, now_micros());
                }
                D::Processed
            }
            InboundMessage::CacheInvalid { name, reason } => {
                self.handle_cache_invalid(id, &name, &reason);
                D::Processed
            }
            InboundMessage::TransferAddress { host, port } => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.transfer_addr = Some((host, port));
                }
                D::Processed
            }
            InboundMessage::AvailableResults => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.enqueue_write(send_results(-1).as_bytes());
                }
                D::Processed
            }
            InboundMessage::Result {
                status,
                exit_code,
                output_len: _,
                exec_usec,
                taskid,
                stdout,
            } => {
                self.handle_result(id, status, exit_code, exec_usec, taskid, stdout);
                D::Processed
            }
            InboundMessage::Update {
                taskid,
                path: _,
                offset: _,
                len: _,
                data,
            } => {
                self.handle_update(taskid, data);
                D::Processed
            }
            InboundMessage::End => D::Processed,
            InboundMessage::QueueStatus | InboundMessage::TaskStatus => {
                self.reply_full_status(id);
                D::ProcessedDisconnect
            }
            InboundMessage::WorkerStatus => {
                self.reply_full_status(id);
                D::ProcessedDisconnect
            }
            InboundMessage::WableStatus => {
                self.reply_lean_status(id);
                D::ProcessedDisconnect
            }
            InboundMessage::ResourcesStatus => {
                self.reply_resources_status(id);
                D::ProcessedDisconnect
            }
            InboundMessage::Name => {
                let name = self.config.name.clone().unwrap_or_default();
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.enqueue_write(format!("{name}\n").as_bytes());
                }
                D::Processed
            }
            InboundMessage::Auth => {
                warn!(?id, "auth line received after admission, rejecting");
                D::Failure
            }
            InboundMessage::Http { method, path, version: _ } => {
                self.reply_http(id, &method, &path);
                D::ProcessedDisconnect
            }
        }
    }

    fn handle_info(&mut self, id: WorkerId, key: &str, value: &str) {
        match key {
            "from-factory" => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.factory_name = Some(value.to_string());
                }
                self.factories.note_connected(value);
            }
            "worker-id" => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.external_id = Some(value.to_string());
                }
            }
            "end_of_resource_update" => {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.recount_inuse();
                }
            }
            "idle-disconnecting" => {
                self.remove_worker(id, DisconnectReason::IdleRequested);
            }
            _ => {
                debug!(%key, %value, ?id, "unrecognized info line, ignoring");
            }
        }
    }

    fn handle_update(&mut self, taskid: TaskId, data: Vec<u8>) {
        if let Some(task) = self.tasks.get_mut(&taskid) {
            if task.output.len() as u64 + data.len() as u64 <= ds_protocol::MAX_TASK_STDOUT_STORAGE {
                task.output.extend_from_slice(&data);
            }
        }
    }

    /// Propagate a `cache-invalid` to every worker holding the same
    /// cached name and requeue any task that still depends on it as an
    /// input (spec.md §5, "invalidation is manager-wide").
    fn handle_cache_invalid(&mut self, id: WorkerId, name: &str, reason: &str) {
        if let Some(w) = self.workers.get_mut(&id) {
            w.cache.invalidate(name);
        }
        warn!(%name, %reason, ?id, "cache file invalidated, propagating everywhere");

        let touched = cache::invalidate_everywhere(&mut self.workers, name);
        for wid in touched {
            if let Some(conn) = self.connections.get_mut(&wid) {
                conn.enqueue_write(unlink(name).as_bytes());
            }
        }

        let affected: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Running | TaskState::WaitingRetrieval))
            .filter(|t| t.input_files.iter().any(|f| f.cached_name == name))
            .map(|t| t.taskid)
            .collect();
        for taskid in affected {
            self.requeue_task(taskid, "cache file invalidated");
        }
    }

    // ---- status / http replies ----

    fn reply_full_status(&mut self, id: WorkerId) {
        let full = status::build_full(
            self.config.name.as_deref(),
            self.local_addr.port(),
            &self.stats,
            &self.workers,
            &self.categories,
            &self.tasks,
            self.blocklist.blocked_hosts(),
        );
        if let Ok(json) = full.to_json() {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.enqueue_write(json.as_bytes());
                conn.enqueue_write(b"\n");
            }
        }
    }

    fn reply_lean_status(&mut self, id: WorkerId) {
        let running = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count() as u64;
        let lean = status::build_lean(
            self.config.name.as_deref(),
            self.local_addr.port(),
            self.ready.len() as u64,
            running,
            self.stats.tasks_done,
            self.workers.len() as u64,
            self.stats.manager_load,
        );
        if let Ok(json) = lean.to_json() {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.enqueue_write(json.as_bytes());
                conn.enqueue_write(b"\n");
            }
        }
    }

    fn reply_resources_status(&mut self, id: WorkerId) {
        let rs = status::build_resources_status(&self.workers);
        if let Ok(json) = serde_json::to_string(&rs) {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.enqueue_write(json.as_bytes());
                conn.enqueue_write(b"\n");
            }
        }
    }

    fn reply_http(&mut self, id: WorkerId, _method: &str, path: &str) {
        let body = if path.starts_with("/resources_status") {
            serde_json::to_string(&status::build_resources_status(&self.workers)).unwrap_or_default()
        } else if path.starts_with("/queue_status") || path.starts_with("/task_status") {
            status::build_full(
                self.config.name.as_deref(),
                self.local_addr.port(),
                &self.stats,
                &self.workers,
                &self.categories,
                &self.tasks,
                self.blocklist.blocked_hosts(),
            )
            .to_json()
            .unwrap_or_default()
        } else {
            status::html_index(self.config.name.as_deref(), &self.stats)
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.enqueue_write(response.as_bytes());
        }
    }

    // ---- step 4: dispatch (spec.md §4.6) ----

    fn dispatch_ready_tasks(&mut self) -> bool {
        if self.config.wait_for_workers > 0 && self.workers.len() < self.config.wait_for_workers {
            return false;
        }
        let mut dispatched_any = false;
        let mut still_ready = VecDeque::new();

        while let Some(taskid) = self.ready.pop_front() {
            if self.try_dispatch_one(taskid) {
                dispatched_any = true;
            } else {
                still_ready.push_back(taskid);
            }
        }
        self.ready = still_ready;
        dispatched_any
    }

    fn try_dispatch_one(&mut self, taskid: TaskId) -> bool {
        let Some((category_name, label, request, input_files)) = self.tasks.get(&taskid).map(|t| {
            (
                t.category.clone(),
                t.resource_request,
                t.request,
                t.input_files.clone(),
            )
        }) else {
            return false;
        };

        // spec.md §4.4: the task's declared start time is "not earlier"
        // than when it may be dispatched; a task still waiting for its
        // window simply isn't eligible yet this pass.
        if let Some(start) = request.start {
            if now_secs() < start {
                return false;
            }
        }

        let category = self.categories.get_or_create(&category_name).clone();
        let candidates = scheduler::eligible_candidates(
            self.workers.iter(),
            &category,
            &request,
            label,
            &input_files,
            self.config.force_proportional_resources,
        );
        let Some(idx) = scheduler::choose_worker(self.config.scheduler, &candidates) else {
            return false;
        };
        let worker_id = candidates[idx].worker_id;
        let allocation = candidates[idx].allocation;

        self.commit_task_to_worker(taskid, worker_id, allocation);
        true
    }

    fn commit_task_to_worker(&mut self, taskid: TaskId, worker_id: WorkerId, allocation: ResourceBox) {
        let now = now_micros();
        let category_name = {
            let Some(task) = self.tasks.get_mut(&taskid) else { return };
            task.worker = Some(worker_id);
            task.resources_allocated = Some(allocation);
            task.time_when_commit_start = now;
            task.state = TaskState::Running;
            task.category.clone()
        };

        if let Some(w) = self.workers.get_mut(&worker_id) {
            w.commit_task(taskid, allocation);
        }
        {
            let cat = self.categories.get_or_create(&category_name);
            cat.tasks_waiting = cat.tasks_waiting.saturating_sub(1);
            cat.tasks_running += 1;
        }
        self.stats.tasks_dispatched += 1;

        let outcome = match (self.workers.get(&worker_id), self.tasks.get(&taskid)) {
            (Some(worker), Some(task)) => self.transfer.put_input_files(worker, task),
            _ => TransferOutcome::Success,
        };
        if outcome != TransferOutcome::Success {
            self.requeue_task(taskid, "input transfer failed");
            return;
        }

        let Some(task) = self.tasks.get_mut(&taskid) else { return };
        task.time_when_commit_end = now_micros();

        let command_line = task.command_line.clone();
        let coprocess = task.coprocess.clone();
        let env = task.env.clone();
        let input_files = task.input_files.clone();
        let output_files = task.output_files.clone();
        let request = task.request;

        // Headers that carry a following payload (`cmd`, `coprocess`,
        // `env`) must have their payload bytes written immediately after
        // the header line, not batched at the end (format.rs's
        // documented convention: header line, then caller writes the
        // payload right behind it).
        let Some(conn) = self.connections.get_mut(&worker_id) else {
            return;
        };
        conn.enqueue_write(TaskStartHeader::task_line(taskid).as_bytes());
        conn.enqueue_write(TaskStartHeader::category_line(&category_name).as_bytes());
        conn.enqueue_write(TaskStartHeader::cores_line(allocation.cores as i64).as_bytes());
        conn.enqueue_write(TaskStartHeader::memory_line(allocation.memory as i64).as_bytes());
        conn.enqueue_write(TaskStartHeader::disk_line(allocation.disk as i64).as_bytes());
        conn.enqueue_write(TaskStartHeader::gpus_line(allocation.gpus as i64).as_bytes());
        if let Some(end) = request.end {
            conn.enqueue_write(TaskStartHeader::end_time_line(end).as_bytes());
        }
        if let Some(wall) = request.wall_time {
            conn.enqueue_write(TaskStartHeader::wall_time_line(wall).as_bytes());
        }
        for f in &input_files {
            conn.enqueue_write(
                TaskStartHeader::infile_line(&FileSpec {
                    cached_name: f.cached_name.clone(),
                    remote_name: f.remote_name.clone(),
                    flags: f.flags,
                    is_directory: f.is_directory,
                })
                .as_bytes(),
            );
        }
        for f in &output_files {
            conn.enqueue_write(
                TaskStartHeader::outfile_line(&FileSpec {
                    cached_name: f.cached_name.clone(),
                    remote_name: f.remote_name.clone(),
                    flags: f.flags,
                    is_directory: f.is_directory,
                })
                .as_bytes(),
            );
        }
        if let Some(coprocess) = &coprocess {
            conn.enqueue_write(TaskStartHeader::coprocess_header(coprocess).as_bytes());
            conn.enqueue_write(coprocess.as_bytes());
        }
        conn.enqueue_write(TaskStartHeader::cmd_header(&command_line).as_bytes());
        conn.enqueue_write(command_line.as_bytes());
        for var in &env {
            conn.enqueue_write(TaskStartHeader::env_header(var).as_bytes());
            conn.enqueue_write(var.as_bytes());
        }
        conn.enqueue_write(TaskStartHeader::end().as_bytes());

        debug!(%taskid, ?worker_id, "task dispatched");
    }

    /// Put a task back in front of the ready queue after its worker
    /// failed, its cache dependency was invalidated, or its transfer
    /// failed on the worker's end (spec.md §4.7/§4.8). Head-of-queue, not
    /// back-of-queue, so a retried task gets first crack at the next
    /// dispatch pass.
    fn requeue_task(&mut self, taskid: TaskId, reason: &str) {
        let Some(task) = self.tasks.get_mut(&taskid) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }
        let category_name = task.category.clone();
        if let Some(worker_id) = task.worker.take() {
            if let Some(w) = self.workers.get_mut(&worker_id) {
                w.release_task(taskid);
            }
            if let Some(conn) = self.connections.get_mut(&worker_id) {
                conn.enqueue_write(kill(taskid).as_bytes());
            }
        }
        task.try_count += 1;
        task.reset_for_retry();

        let cat = self.categories.get_or_create(&category_name);
        cat.tasks_running = cat.tasks_running.saturating_sub(1);

        // spec.md §4.8, "retry bounds": a task whose max_retries is
        // exceeded stops retrying and surfaces MAX_RETRIES instead of
        // re-entering the ready list. `max_retries == 0` means
        // unbounded, matching the client default of "no limit declared".
        if task.max_retries > 0 && task.try_count > task.max_retries {
            task.state = TaskState::Retrieved;
            task.result = Some(ResultCode::MaxRetries);
            task.time_when_retrieval = now_micros();
            self.stats.tasks_failed += 1;
            self.retrieved.push_back(taskid);
            debug!(%taskid, %reason, try_count = task.try_count, "max retries exceeded, surfacing failure");
            return;
        }

        cat.tasks_waiting += 1;
        task.state = TaskState::Ready;

        debug!(%taskid, %reason, "task requeued");
        self.ready.push_front(taskid);
    }

    /// Step 5 of the run_once sequence (spec.md §4.10): a READY task whose
    /// declared `end` wall-clock deadline has passed never got a chance to
    /// run and is not a worker's fault, so it surfaces as TASK_TIMEOUT
    /// rather than sitting in the ready queue forever (spec.md §4.8).
    fn expire_stale_ready_tasks(&mut self) -> bool {
        let now = now_secs() as i64;
        let expired: Vec<TaskId> = self
            .ready
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .and_then(|t| t.request.end)
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();
        if expired.is_empty() {
            return false;
        }
        self.ready.retain(|id| !expired.contains(id));
        for taskid in expired {
            let Some(task) = self.tasks.get_mut(&taskid) else {
                continue;
            };
            let category_name = task.category.clone();
            task.state = TaskState::Retrieved;
            task.result = Some(ResultCode::TaskTimeout);
            task.time_when_retrieval = now_micros();
            let cat = self.categories.get_or_create(&category_name);
            cat.tasks_waiting = cat.tasks_waiting.saturating_sub(1);
            self.stats.tasks_failed += 1;
            self.retrieved.push_back(taskid);
            debug!(%taskid, "task expired while ready, declared end deadline passed");
        }
        true
    }

    fn insert_ready(&mut self, taskid: TaskId) {
        let priority = self.tasks.get(&taskid).map(|t| t.priority).unwrap_or(0);
        let pos = self
            .ready
            .iter()
            .position(|id| self.tasks.get(id).map(|t| t.priority).unwrap_or(i64::MIN) < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, taskid);
    }

    // ---- step 2 continued: result/reap handling (spec.md §4.7) ----

    fn handle_result(
        &mut self,
        sender: WorkerId,
        status: i32,
        exit_code: i32,
        exec_usec: u64,
        taskid: TaskId,
        stdout: Vec<u8>,
    ) {
        let Some(task) = self.tasks.get(&taskid) else {
            warn!(%taskid, ?sender, "result for unknown task, dropping");
            return;
        };
        if task.worker != Some(sender) {
            // The original implementation has a similar worker-mismatch
            // anomaly in `reap_task_from_worker`; it is preserved here
            // rather than silently fixed. We keep processing using the
            // worker that actually sent the message.
            warn!(
                %taskid,
                expected = ?task.worker,
                actual = ?sender,
                "result arrived from a worker other than the one the task was committed to"
            );
        }
        let category_name = task.category.clone();
        let measured = task.resources_allocated.unwrap_or_default();
        let result_code = ResultCode::from(ds_protocol::ResultStatus::from_wire(status));

        if let Some(w) = self.workers.get_mut(&sender) {
            w.release_task(taskid);
        }
        {
            let cat = self.categories.get_or_create(&category_name);
            cat.tasks_running = cat.tasks_running.saturating_sub(1);
        }

        // spec.md §4.7/Glossary: FORSAKEN means the worker refused to run
        // the task at all, so it goes back to READY without charging the
        // try (no `try_count` bump, no execute-time stats charge) and
        // without attempting to fetch any outputs.
        if result_code == ResultCode::Forsaken {
            if let Some(task) = self.tasks.get_mut(&taskid) {
                task.reset_for_retry();
                task.state = TaskState::Ready;
            }
            let cat = self.categories.get_or_create(&category_name);
            cat.tasks_waiting += 1;
            self.insert_ready(taskid);
            debug!(%taskid, "worker forsook the task, requeuing without charging a try");
            return;
        }

        if result_code == ResultCode::ResourceExhaustion {
            if let Some(task) = self.tasks.get_mut(&taskid) {
                if let Some(next_label) = task.resource_request.advance() {
                    task.resource_request = next_label;
                    task.try_count += 1;
                    task.reset_for_retry();
                    task.state = TaskState::Ready;
                    let cat = self.categories.get_or_create(&category_name);
                    cat.tasks_waiting += 1;
                    self.ready.push_front(taskid);
                    debug!(%taskid, ?next_label, "resource exhaustion, resubmitting at next label");
                    return;
                }
            }
            // Ladder exhausted: fall through and report the exhaustion as
            // a terminal result like any other failure.
        }

        let Some(task) = self.tasks.get_mut(&taskid) else { return };
        task.exit_code = Some(exit_code);
        task.result = Some(result_code);
        task.output = stdout;
        task.time_workers_execute_last = exec_usec as i64;
        task.time_workers_execute_all += exec_usec as i64;
        task.time_when_retrieval = now_micros();
        task.state = TaskState::WaitingRetrieval;

        self.stats.time_workers_execute += exec_usec as i64;
        if result_code == ResultCode::Success {
            self.stats.time_workers_execute_good += exec_usec as i64;
        } else {
            self.stats.time_workers_execute_failure += exec_usec as i64;
            self.stats.tasks_failed += 1;
        }

        self.complete_retrieval(taskid, sender, &category_name, &measured);
    }

    /// Pull the task's declared output files off the worker (spec.md
    /// §1, black-box transfer) and promote it to `RETRIEVED` on success,
    /// or requeue it if the transfer itself failed on the worker's end.
    fn complete_retrieval(&mut self, taskid: TaskId, worker_id: WorkerId, category_name: &str, measured: &ResourceBox) {
        let outcome = match (self.workers.get(&worker_id), self.tasks.get(&taskid)) {
            (Some(worker), Some(task)) => self.transfer.get_output_files(worker, task, false),
            _ => TransferOutcome::Success,
        };

        match outcome {
            TransferOutcome::Success => {
                let runtime = self
                    .tasks
                    .get(&taskid)
                    .map(|t| t.time_when_retrieval.saturating_sub(t.time_when_commit_end) as i64)
                    .unwrap_or(0);
                if let Some(task) = self.tasks.get_mut(&taskid) {
                    task.state = TaskState::Retrieved;
                }
                self.stats.time_send_good += runtime;
                self.categories.get_or_create(category_name).record_completion(runtime, measured);
                self.retrieved.push_back(taskid);
            }
            TransferOutcome::AppFailure => {
                if let Some(task) = self.tasks.get_mut(&taskid) {
                    task.result = Some(ResultCode::OutputMissing);
                    task.state = TaskState::Retrieved;
                }
                self.stats.tasks_failed += 1;
                self.retrieved.push_back(taskid);
            }
            TransferOutcome::WorkerFailure => {
                self.requeue_task(taskid, "output transfer failed");
            }
        }
    }

    // ---- step 3: health sweeps (spec.md §4.9) ----

    fn run_health_sweeps(&mut self) {
        let now = now_micros();

        let keepalive_sweep = health::sweep_keepalives(
            &self.workers,
            now,
            now,
            self.config.keepalive_interval_secs,
            self.config.keepalive_timeout_secs,
        );
        for id in keepalive_sweep.to_check {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.enqueue_write(check().as_bytes());
            }
            if let Some(w) = self.workers.get_mut(&id) {
                w.last_update_msg_time = now;
            }
        }
        for decision in keepalive_sweep.to_remove {
            self.remove_worker(decision.worker_id, DisconnectReason::KeepaliveTimeout);
        }

        let default_multiplier = self.config.fast_abort_multiplier;
        let running: Vec<(TaskId, WorkerId, u64, f64, f64, u32)> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .filter_map(|t| {
                let worker_id = t.worker?;
                let category = self.categories.get(&t.category)?;
                let multiplier = category.effective_fast_abort_multiplier(default_multiplier);
                if multiplier <= 0.0 {
                    return None;
                }
                let started = t.time_when_commit_end.max(t.time_when_commit_start);
                let running_usecs = now.saturating_sub(started);
                Some((
                    t.taskid,
                    worker_id,
                    running_usecs,
                    category.average_runtime_usecs(),
                    multiplier,
                    t.fast_abort_count,
                ))
            })
            .collect();
        let decisions = health::sweep_fast_abort(&mut self.workers, running.into_iter());
        for decision in decisions {
            // spec.md §4.8: strikes only advance for a task's first two
            // trips; past that the threshold stops climbing.
            if let Some(task) = self.tasks.get_mut(&decision.taskid) {
                if task.fast_abort_count < 2 {
                    task.fast_abort_count += 1;
                }
            }
            self.requeue_task(decision.taskid, "fast abort");
            if decision.block_and_remove_worker {
                self.blocklist.block(
                    &self
                        .workers
                        .get(&decision.worker_id)
                        .map(|w| w.addr.ip().to_string())
                        .unwrap_or_default(),
                    now_micros(),
                    Some(self.config.blocklist_slow_workers_timeout_secs),
                );
                self.remove_worker(decision.worker_id, DisconnectReason::FastAbort);
            }
        }

        for decision in health::sweep_drained(&self.workers) {
            self.remove_worker(decision.worker_id, DisconnectReason::Draining);
        }

        for (name, excess) in self.factories.factories_needing_trim() {
            debug!(%name, excess, "factory over cap, marking excess workers as draining");
            let victims: Vec<WorkerId> = self
                .workers
                .iter()
                .filter(|(_, w)| w.factory_name.as_deref() == Some(name.as_str()) && !w.draining)
                .take(excess as usize)
                .map(|(id, _)| *id)
                .collect();
            for id in victims {
                if let Some(w) = self.workers.get_mut(&id) {
                    w.draining = true;
                }
            }
        }

        for host in self.blocklist.sweep_expired(now) {
            debug!(%host, "blocklist entry expired");
        }
    }

    fn remove_worker(&mut self, id: WorkerId, reason: DisconnectReason) {
        let Some(worker) = self.workers.remove(&id) else {
            return;
        };
        let (bytes_sent, bytes_received) = self
            .connections
            .get(&id)
            .map(|c| (c.bytes_sent, c.bytes_received))
            .unwrap_or((0, 0));
        self.connections.remove(&id);

        let had_joined = worker.protocol_version.is_some();
        if had_joined {
            self.stats.workers_removed += 1;
            self.stats.workers_connected = self.stats.workers_connected.saturating_sub(1);
        }
        self.stats.accumulate_worker_totals(bytes_sent, bytes_received);

        match reason {
            DisconnectReason::FastAbort => self.stats.workers_fast_aborted += 1,
            DisconnectReason::IdleRequested => self.stats.workers_idled_out += 1,
            DisconnectReason::ProtocolMismatch => self.stats.workers_blocked += 1,
            _ => {}
        }

        if let Some(name) = &worker.factory_name {
            self.factories.note_disconnected(name);
        }

        if reason == DisconnectReason::ProtocolMismatch {
            self.blocklist.block(
                &worker.addr.ip().to_string(),
                now_micros(),
                Some(self.config.blocklist_slow_workers_timeout_secs),
            );
        }

        // spec.md §4.8, "worker failure": every task still charged to this
        // worker's table is reaped back to READY with its commit-time cost
        // charged to `time_workers_execute_failure`, whether or not the
        // task itself ever produced a result.
        let now = now_micros();
        let task_ids: Vec<TaskId> = worker.current_tasks_boxes.keys().copied().collect();
        for taskid in task_ids {
            if let Some(task) = self.tasks.get(&taskid) {
                let start = task.time_when_commit_start;
                if start > 0 {
                    self.stats.time_workers_execute_failure += now.saturating_sub(start) as i64;
                }
            }
            self.requeue_task(taskid, "worker disconnected");
        }

        info!(?id, ?reason, "worker removed");
        self.log_txn(TxnEvent::WorkerRemoved, &format!("{id:?}"), &format!("{reason:?}"));
    }

    // ---- writes, logs, catalog, large-task check ----

    fn flush_writes(&mut self) {
        let ids: Vec<WorkerId> = self.connections.keys().copied().collect();
        let mut failed = Vec::new();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                if conn.pump_write().is_err() {
                    failed.push(id);
                }
            }
        }
        for id in failed {
            self.remove_worker(id, DisconnectReason::WorkerFailure);
        }
    }

    fn maybe_write_perf_log(&mut self) {
        let now = now_micros();
        if now.saturating_sub(self.last_perf_log) < defaults::RESOURCE_MEASUREMENT_INTERVAL_SECS * 1_000_000 {
            return;
        }
        self.last_perf_log = now;
        let tasks_running = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count() as u64;
        let workers_connected = self.workers.len() as u64;
        let ready = self.ready.len() as u64;
        let tasks_done = self.stats.tasks_done;
        let bytes_sent = self.stats.bytes_sent;
        let bytes_received = self.stats.bytes_received;
        let manager_load = self.stats.manager_load;
        if let Some(log) = &mut self.perf_log {
            if let Err(e) = log.record(
                now,
                workers_connected,
                ready,
                tasks_running,
                tasks_done,
                bytes_sent,
                bytes_received,
                manager_load,
            ) {
                warn!(error = %e, "failed to write perf log");
            }
        }
    }

    async fn maybe_publish_catalog(&mut self) {
        let Some(name) = self.config.name.clone() else { return };
        let Some(host) = self.config.catalog_host.clone() else { return };
        let port = self.config.catalog_port.unwrap_or(9097);

        let now = now_micros();
        if now.saturating_sub(self.last_catalog_publish) < defaults::UPDATE_INTERVAL_SECS * 1_000_000 {
            return;
        }
        self.last_catalog_publish = now;

        let full = status::build_full(
            Some(&name),
            self.local_addr.port(),
            &self.stats,
            &self.workers,
            &self.categories,
            &self.tasks,
            self.blocklist.blocked_hosts(),
        );
        let running = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count() as u64;
        let lean = status::build_lean(
            Some(&name),
            self.local_addr.port(),
            self.ready.len() as u64,
            running,
            self.stats.tasks_done,
            self.workers.len() as u64,
            self.stats.manager_load,
        );

        let Some(payload) = status::catalog_payload(&full, &lean) else { return };
        let addr_str = format!("{host}:{port}");
        match tokio::net::lookup_host(&addr_str).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    if let Err(e) = status::publish_to_catalog(addr, &payload).await {
                        warn!(error = %e, %addr_str, "failed to publish to catalog");
                    }
                }
            }
            Err(e) => warn!(error = %e, %addr_str, "failed to resolve catalog host"),
        }
    }

    /// Warn about any ready task whose resource request can never fit
    /// even the largest connected worker (spec.md §4.10 step 11).
    fn maybe_check_large_tasks(&mut self) {
        let now = now_micros();
        if now.saturating_sub(self.last_large_task_check) < defaults::LARGE_TASK_CHECK_INTERVAL_USECS {
            return;
        }
        self.last_large_task_check = now;

        if self.workers.is_empty() {
            return;
        }
        let max_worker = self.workers.iter().map(|(_, w)| w.resources.whole_worker()).fold(
            ResourceBox::zero(),
            |acc, b| ResourceBox::new(acc.cores.max(b.cores), acc.memory.max(b.memory), acc.disk.max(b.disk), acc.gpus.max(b.gpus)),
        );

        for &taskid in &self.ready {
            let Some((category_name, request, label)) = self
                .tasks
                .get(&taskid)
                .map(|t| (t.category.clone(), t.request, t.resource_request))
            else {
                continue;
            };
            let category = self.categories.get_or_create(&category_name).clone();
            let outcome = category::choose_resources(
                &category,
                &request,
                label,
                &max_worker,
                &max_worker,
                self.config.force_proportional_resources,
            );
            if matches!(outcome, AllocationOutcome::ExceedsWorker) {
                warn!(%taskid, category = %category_name, "task's resource request exceeds every connected worker's capacity");
            }
        }
    }

    fn log_txn(&mut self, event: TxnEvent, subject: &str, detail: &str) {
        if let Some(log) = &mut self.txn_log {
            if let Err(e) = log.record(now_micros(), event, subject, detail) {
                warn!(error = %e, "failed to write transaction log");
            }
        }
    }
}
