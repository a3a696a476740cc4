//! Constants drawn directly from the original manager's `#define`s
//! (spec.md §4.10, §6). Kept as a dedicated module, the way the teacher
//! keeps its tunable defaults in `shared::defaults`, so `config.rs` has a
//! single place to pull fallback values from.

/// How often the catalog publisher (C10) pushes a status update, in
/// seconds, absent an explicit request.
pub const UPDATE_INTERVAL_SECS: u64 = 60;

/// How often the manager samples its own resource usage, in seconds.
pub const RESOURCE_MEASUREMENT_INTERVAL_SECS: u64 = 30;

/// Keepalive check interval when none is configured, in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 120;

/// Keepalive timeout when none is configured, in seconds.
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 900;

/// Cap on the number of retained stdout bytes per task (1 GiB).
pub const MAX_TASK_STDOUT_STORAGE: u64 = 1 << 30;

/// Maximum number of new worker connections accepted in one event-loop
/// iteration.
pub const MAX_NEW_WORKERS: usize = 10;

/// How often (in microseconds) the event loop checks for tasks that fit
/// no connected worker (spec.md §4.10 step 11): three minutes.
pub const LARGE_TASK_CHECK_INTERVAL_USECS: u64 = 180_000_000;

/// Floor under any rate-derived transfer timeout (spec.md §5).
pub const MINIMUM_TRANSFER_TIMEOUT_SECS: u64 = 60;

/// Default bound on a single header exchange (greeting, status query, …).
pub const DEFAULT_SHORT_TIMEOUT_SECS: u64 = 5;

/// Default bound on a bulk payload read.
pub const DEFAULT_LONG_TIMEOUT_SECS: u64 = 3600;

/// Transfer rate assumed before any measurement exists, in bytes/sec.
pub const DEFAULT_TRANSFER_RATE_BPS: f64 = 1_000_000.0;

/// Load EMA smoothing factor (spec.md §4.10).
pub const MANAGER_LOAD_ALPHA: f64 = 0.05;

/// Number of completed tasks a category needs before fast-abort and
/// steady-state sampling trust its average (spec.md §4.9).
pub const MIN_COMPLETIONS_FOR_AVERAGE: u64 = 10;
