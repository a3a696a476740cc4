//! The manager-wide and per-category statistics table (`ds_stats`
//! equivalent). Every field here is accumulated somewhere in the event
//! loop or a handler; nothing here computes anything on its own.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    // Task counters
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,

    // Worker counters
    pub workers_connected: u64,
    pub workers_joined: u64,
    pub workers_removed: u64,
    pub workers_released: u64,
    pub workers_idled_out: u64,
    pub workers_fast_aborted: u64,
    pub workers_blocked: u64,

    // Timing accumulators, all in microseconds.
    pub time_send_good: i64,
    pub time_receive_good: i64,
    pub time_workers_execute: i64,
    pub time_workers_execute_good: i64,
    pub time_workers_execute_failure: i64,
    pub time_application: i64,

    /// Exponential moving average of "had activity this iteration"
    /// (spec.md §4.10).
    pub manager_load: f64,

    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Stats {
    /// Fold another category/worker's removal-time stats into this
    /// accumulator (`record_removed_worker_stats` / `accumulate_stat` in
    /// the original).
    pub fn accumulate_worker_totals(&mut self, bytes_sent: u64, bytes_received: u64) {
        self.bytes_sent += bytes_sent;
        self.bytes_received += bytes_received;
    }
}
