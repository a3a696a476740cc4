//! Append-only performance and transaction log writers (C12, spec.md
//! §4.12), matching the teacher's log-rotation convention in
//! `examples/macwilam-linksense/shared/src/logging.rs` but append-only
//! rather than rolling, since these feed offline analysis tools that
//! expect one growing file per run.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use shared::utils::Timestamp;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write log file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// A single append-only, line-oriented log file with a header written
/// once at open time.
pub struct AppendLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl AppendLog {
    pub fn open(path: &Path, header: &str) -> Result<Self, LogError> {
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{header}").map_err(|source| LogError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(AppendLog {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), LogError> {
        writeln!(self.writer, "{line}").map_err(|source| LogError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        self.writer.flush().map_err(|source| LogError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Perf log: one sample per interval of aggregate manager/worker/task
/// counters, in the `# timestamp field1 field2 ...` format the original
/// emits for `work_queue_graph_log`-style offline plotting.
pub struct PerfLog {
    log: AppendLog,
}

impl PerfLog {
    const HEADER: &'static str = "# timestamp workers_connected tasks_waiting tasks_running tasks_done bytes_sent bytes_received manager_load";

    pub fn open(path: &Path) -> Result<Self, LogError> {
        Ok(PerfLog {
            log: AppendLog::open(path, Self::HEADER)?,
        })
    }

    pub fn record(
        &mut self,
        now: Timestamp,
        workers_connected: u64,
        tasks_waiting: u64,
        tasks_running: u64,
        tasks_done: u64,
        bytes_sent: u64,
        bytes_received: u64,
        manager_load: f64,
    ) -> Result<(), LogError> {
        self.log.write_line(&format!(
            "{now} {workers_connected} {tasks_waiting} {tasks_running} {tasks_done} {bytes_sent} {bytes_received} {manager_load:.4}"
        ))
    }
}

/// Transaction log: one line per task/worker lifecycle event, for audit
/// and replay tooling.
pub struct TxnLog {
    log: AppendLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEvent {
    TaskSubmitted,
    TaskRunning,
    TaskDone,
    TaskCanceled,
    WorkerConnected,
    WorkerRemoved,
}

impl TxnEvent {
    fn as_str(self) -> &'static str {
        match self {
            TxnEvent::TaskSubmitted => "TASK SUBMITTED",
            TxnEvent::TaskRunning => "TASK RUNNING",
            TxnEvent::TaskDone => "TASK DONE",
            TxnEvent::TaskCanceled => "TASK CANCELED",
            TxnEvent::WorkerConnected => "WORKER CONNECTED",
            TxnEvent::WorkerRemoved => "WORKER REMOVED",
        }
    }
}

impl TxnLog {
    const HEADER: &'static str = "# timestamp event subject detail";

    pub fn open(path: &Path) -> Result<Self, LogError> {
        Ok(TxnLog {
            log: AppendLog::open(path, Self::HEADER)?,
        })
    }

    pub fn record(
        &mut self,
        now: Timestamp,
        event: TxnEvent,
        subject: &str,
        detail: &str,
    ) -> Result<(), LogError> {
        self.log
            .write_line(&format!("{now} {} {subject} {detail}", event.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_log_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.log");
        {
            let mut log = PerfLog::open(&path).unwrap();
            log.record(1, 2, 3, 4, 5, 6, 7, 0.1).unwrap();
        }
        {
            let mut log = PerfLog::open(&path).unwrap();
            log.record(2, 2, 3, 4, 5, 6, 7, 0.2).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().filter(|l| l.starts_with('#')).count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn txn_log_records_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let mut log = TxnLog::open(&path).unwrap();
        log.record(1, TxnEvent::TaskSubmitted, "17", "category=default").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("TASK SUBMITTED 17 category=default"));
    }
}
