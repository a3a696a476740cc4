//! Input/output file transfer orchestration (C7, spec.md §5). The actual
//! byte pump rides on the same worker connection as the control
//! protocol, so this module only classifies outcomes and tracks the
//! running transfer-rate estimate; `connection.rs` does the I/O.

use shared::utils::Timestamp;

use crate::task::Task;
use crate::worker::Worker;

/// The three black-box operations the real worker-side file-transfer
/// engine performs (spec.md §1, "Deliberately OUT of scope"). The
/// manager core only needs their outcome to decide how to classify a
/// dispatch/reap failure; actually moving bytes over the sandboxed
/// channel is the worker's problem.
pub trait TransferBackend: Send {
    fn put_input_files(&mut self, worker: &Worker, task: &Task) -> TransferOutcome;
    fn get_output_files(&mut self, worker: &Worker, task: &Task, monitor_summary_only: bool) -> TransferOutcome;
    fn get_monitor_output_file(&mut self, worker: &Worker, task: &Task) -> TransferOutcome;
}

/// The default stand-in used when no real transfer engine is wired in:
/// every transfer "succeeds" immediately. Exercises the manager's
/// dispatch/reap bookkeeping without requiring an actual sandboxed
/// worker on the other end of the connection.
#[derive(Debug, Default)]
pub struct NullTransferBackend;

impl TransferBackend for NullTransferBackend {
    fn put_input_files(&mut self, _worker: &Worker, _task: &Task) -> TransferOutcome {
        TransferOutcome::Success
    }

    fn get_output_files(&mut self, _worker: &Worker, _task: &Task, _monitor_summary_only: bool) -> TransferOutcome {
        TransferOutcome::Success
    }

    fn get_monitor_output_file(&mut self, _worker: &Worker, _task: &Task) -> TransferOutcome {
        TransferOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    /// The task's own command is at fault (e.g. it never produced a
    /// declared output file) — counts against the task, not the worker.
    AppFailure,
    /// The worker or the network is at fault (connection reset, timeout)
    /// — counts against the worker, and the task gets a free retry.
    WorkerFailure,
}

/// Running estimate of a worker's effective transfer rate, in
/// bytes/sec, used to size the next transfer's timeout and to flag
/// outlier-slow transfers (spec.md §5, "transfer outlier rejection").
#[derive(Debug, Clone, Copy)]
pub struct TransferRateEstimate {
    pub bytes_total: u64,
    pub usecs_total: u64,
    fallback_bps: f64,
}

impl TransferRateEstimate {
    pub fn new(fallback_bps: f64) -> Self {
        TransferRateEstimate {
            bytes_total: 0,
            usecs_total: 0,
            fallback_bps,
        }
    }

    pub fn record(&mut self, bytes: u64, usecs: u64) {
        self.bytes_total += bytes;
        self.usecs_total += usecs;
    }

    pub fn current_bps(&self) -> f64 {
        if self.usecs_total == 0 {
            self.fallback_bps
        } else {
            self.bytes_total as f64 / (self.usecs_total as f64 / 1_000_000.0)
        }
    }

    /// A transfer is an outlier if it ran slower than `1/factor` of the
    /// running mean rate, once enough history exists to trust the mean.
    pub fn is_outlier(&self, bytes: u64, usecs: u64, factor: f64) -> bool {
        if self.usecs_total == 0 || usecs == 0 {
            return false;
        }
        let observed_bps = bytes as f64 / (usecs as f64 / 1_000_000.0);
        observed_bps * factor < self.current_bps()
    }

    /// Timeout in seconds for a transfer of `bytes`, never under the
    /// configured floor.
    pub fn timeout_secs(&self, bytes: u64, min_transfer_timeout_secs: u64) -> u64 {
        let bps = self.current_bps().max(1.0);
        let estimated = (bytes as f64 / bps).ceil() as u64;
        estimated.max(min_transfer_timeout_secs)
    }
}

/// A single put/get attempt's bookkeeping, recorded for the perf log.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub taskid: u64,
    pub cached_name: String,
    pub bytes: u64,
    pub start: Timestamp,
    pub end: Timestamp,
    pub outcome: TransferOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_rate_used_before_any_measurement() {
        let est = TransferRateEstimate::new(1_000_000.0);
        assert_eq!(est.current_bps(), 1_000_000.0);
    }

    #[test]
    fn outlier_detection_flags_much_slower_transfer() {
        let mut est = TransferRateEstimate::new(1_000_000.0);
        est.record(10_000_000, 1_000_000);
        assert!(est.is_outlier(100_000, 10_000_000, 10.0));
        assert!(!est.is_outlier(10_000_000, 1_000_000, 10.0));
    }

    #[test]
    fn timeout_never_drops_below_configured_floor() {
        let est = TransferRateEstimate::new(1_000_000_000.0);
        assert_eq!(est.timeout_secs(10, 60), 60);
    }

    #[test]
    fn null_backend_always_succeeds() {
        use crate::task::Task;
        use crate::worker::{Worker, WorkerId};
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};

        let mut backend = NullTransferBackend;
        let worker = Worker::new(
            WorkerId::new(1, 0),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000),
            0,
        );
        let task = Task::new(1, "/bin/true".into(), "default".into());
        assert_eq!(backend.put_input_files(&worker, &task), TransferOutcome::Success);
        assert_eq!(
            backend.get_output_files(&worker, &task, false),
            TransferOutcome::Success
        );
        assert_eq!(
            backend.get_monitor_output_file(&worker, &task),
            TransferOutcome::Success
        );
    }
}
