//! Task record and lifecycle (C2, spec.md §3, §4.2).

use serde::{Deserialize, Serialize};
use shared::utils::Timestamp;

use crate::resources::ResourceBox;
use crate::worker::WorkerId;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Unknown,
    Ready,
    Running,
    WaitingRetrieval,
    Retrieved,
    Done,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Canceled)
    }
}

/// Which allocation the task is currently requesting from its category
/// (spec.md §4.4, the `FIRST -> MAX -> ERROR` resubmission ladder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestLabel {
    #[default]
    First,
    Max,
    Error,
}

impl RequestLabel {
    /// Advance to the next label after a RESOURCE_EXHAUSTION resubmit.
    /// `None` means the ladder is exhausted (`ERROR` already reached).
    pub fn advance(self) -> Option<RequestLabel> {
        match self {
            RequestLabel::First => Some(RequestLabel::Max),
            RequestLabel::Max => Some(RequestLabel::Error),
            RequestLabel::Error => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    InputMissing,
    OutputMissing,
    StdoutMissing,
    Signal,
    ResourceExhaustion,
    TaskTimeout,
    Forsaken,
    MaxRetries,
    TaskMaxRunTime,
    DiskAllocFull,
    RMonitorError,
    OutputTransferError,
    Unknown,
}

impl From<ds_protocol::ResultStatus> for ResultCode {
    fn from(s: ds_protocol::ResultStatus) -> Self {
        use ds_protocol::ResultStatus as R;
        match s {
            R::Success => ResultCode::Success,
            R::InputMissing => ResultCode::InputMissing,
            R::OutputMissing => ResultCode::OutputMissing,
            R::StdoutMissing => ResultCode::StdoutMissing,
            R::Signal => ResultCode::Signal,
            R::ResourceExhaustion => ResultCode::ResourceExhaustion,
            R::TaskTimeout => ResultCode::TaskTimeout,
            R::Forsaken => ResultCode::Forsaken,
            R::MaxRetries => ResultCode::MaxRetries,
            R::TaskMaxRunTime => ResultCode::TaskMaxRunTime,
            R::DiskAllocFull => ResultCode::DiskAllocFull,
            R::RMonitorError => ResultCode::RMonitorError,
            R::OutputTransferError => ResultCode::OutputTransferError,
            R::Unknown => ResultCode::Unknown,
        }
    }
}

/// An input or output file reference declared on a task.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub local_name: String,
    pub remote_name: String,
    pub cached_name: String,
    pub is_directory: bool,
    /// Whether the worker should keep this file cached across tasks
    /// (`DS_CACHE` flag, spec.md §5).
    pub cacheable: bool,
    pub flags: u32,
}

/// The declared resource request on a task, before category resolution.
/// `None` fields mean "unspecified" (spec.md §4.4 step 1-4 treats a
/// negative/absent value as "not specified").
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceRequest {
    pub cores: Option<f64>,
    pub memory: Option<f64>,
    pub disk: Option<f64>,
    pub gpus: Option<f64>,
    pub start: Option<Timestamp>,
    pub end: Option<i64>,
    pub wall_time: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub taskid: TaskId,
    pub command_line: String,
    pub category: String,
    pub input_files: Vec<TaskFile>,
    pub output_files: Vec<TaskFile>,
    pub env: Vec<String>,
    pub coprocess: Option<String>,
    pub request: ResourceRequest,
    pub tag: Option<String>,
    pub priority: i64,

    pub try_count: u32,
    pub max_retries: u32,
    pub fast_abort_count: u32,
    pub resource_request: RequestLabel,

    pub state: TaskState,
    pub result: Option<ResultCode>,
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,

    pub time_when_submitted: Timestamp,
    pub time_when_commit_start: Timestamp,
    pub time_when_commit_end: Timestamp,
    pub time_when_retrieval: Timestamp,
    pub time_when_done: Timestamp,

    pub time_workers_execute_last: i64,
    pub time_workers_execute_all: i64,

    pub resources_measured: Option<ResourceBox>,
    pub resources_allocated: Option<ResourceBox>,

    /// Non-owning back-reference, resolved against the manager's worker
    /// table (Design Note "Back-references").
    pub worker: Option<WorkerId>,
}

impl Task {
    pub fn new(taskid: TaskId, command_line: String, category: String) -> Self {
        Task {
            taskid,
            command_line,
            category,
            input_files: Vec::new(),
            output_files: Vec::new(),
            env: Vec::new(),
            coprocess: None,
            request: ResourceRequest::default(),
            tag: None,
            priority: 0,
            try_count: 0,
            max_retries: 0,
            fast_abort_count: 0,
            resource_request: RequestLabel::First,
            state: TaskState::Unknown,
            result: None,
            exit_code: None,
            output: Vec::new(),
            time_when_submitted: 0,
            time_when_commit_start: 0,
            time_when_commit_end: 0,
            time_when_retrieval: 0,
            time_when_done: 0,
            time_workers_execute_last: 0,
            time_workers_execute_all: 0,
            resources_measured: None,
            resources_allocated: None,
            worker: None,
        }
    }

    /// Clear accumulated per-try result metadata (spec.md §4.2, "Entering
    /// READY always clears accumulated per-try result metadata").
    pub fn reset_for_retry(&mut self) {
        self.result = None;
        self.exit_code = None;
        self.output.clear();
        self.time_when_commit_start = 0;
        self.time_when_commit_end = 0;
        self.resources_measured = None;
        self.worker = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_label_ladder_terminates_at_error() {
        assert_eq!(RequestLabel::First.advance(), Some(RequestLabel::Max));
        assert_eq!(RequestLabel::Max.advance(), Some(RequestLabel::Error));
        assert_eq!(RequestLabel::Error.advance(), None);
    }

    #[test]
    fn reset_for_retry_clears_per_try_state_but_not_identity() {
        let mut t = Task::new(1, "/bin/echo hi".into(), "default".into());
        t.output = b"stale".to_vec();
        t.result = Some(ResultCode::ResourceExhaustion);
        t.worker = Some(WorkerId::new(3, 1));
        t.reset_for_retry();
        assert!(t.output.is_empty());
        assert!(t.result.is_none());
        assert!(t.worker.is_none());
        assert_eq!(t.taskid, 1);
    }
}
