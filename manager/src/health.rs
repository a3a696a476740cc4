//! Keepalives, fast-abort, draining, and factory trim sweeps (C8,
//! spec.md §4.9), grounded on `abort_slow_workers`/`shut_down_worker`/
//! `abort_drained_workers` in `ds_manager.c` (lines 2825-2960).

use shared::utils::Timestamp;

use crate::worker::{WorkerId, WorkerState, WorkerTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    KeepaliveTimeout,
    FastAbort,
    Draining,
    FactoryTrim,
}

/// A worker the health sweep wants disconnected. The caller (the event
/// loop) performs the actual socket teardown and task requeue; this
/// module only decides who and why.
#[derive(Debug, Clone, Copy)]
pub struct RemovalDecision {
    pub worker_id: WorkerId,
    pub reason: RemovalReason,
}

/// Outcome of one keepalive sweep: workers to send a fresh `check` to (and
/// stamp `last_update_msg_time` for), and workers to disconnect outright.
#[derive(Debug, Default)]
pub struct KeepaliveSweep {
    pub to_check: Vec<WorkerId>,
    pub to_remove: Vec<RemovalDecision>,
}

/// Bidirectional keepalive sweep (spec.md §4.9, grounded on
/// `ask_for_workers_updates` in `ds_manager.c` lines 2771-2813). A
/// `timeout_secs` of zero disables the whole mechanism, both the `check`
/// sends and the culling (spec.md, "Keepalive timeout of 0 disables both
/// the check and the culling").
///
/// For a worker whose identity is still unknown (no greeting yet), the
/// only question is whether it's been sitting there since `accepted_at`
/// longer than the timeout. For a greeted worker: if it answered since
/// the last check was sent (`last_msg_recv_time > last_update_msg_time`)
/// and the interval has elapsed, send a new `check` and let the caller
/// stamp `last_update_msg_time`. Otherwise, if the last check sent has
/// gone unanswered for the whole timeout window (measured against
/// `poll_end`, the timestamp of this very sweep), remove it.
pub fn sweep_keepalives(
    workers: &WorkerTable,
    now: Timestamp,
    poll_end: Timestamp,
    interval_secs: u64,
    timeout_secs: u64,
) -> KeepaliveSweep {
    let mut sweep = KeepaliveSweep::default();
    if timeout_secs == 0 {
        return sweep;
    }
    let timeout_usecs = timeout_secs.saturating_mul(1_000_000);
    let interval_usecs = interval_secs.saturating_mul(1_000_000);

    for (id, w) in workers.iter() {
        if w.state == WorkerState::AwaitingGreeting {
            if now.saturating_sub(w.accepted_at) >= timeout_usecs {
                sweep.to_remove.push(RemovalDecision {
                    worker_id: *id,
                    reason: RemovalReason::KeepaliveTimeout,
                });
            }
            continue;
        }

        if w.last_msg_recv_time > w.last_update_msg_time {
            if now.saturating_sub(w.last_update_msg_time) >= interval_usecs {
                sweep.to_check.push(*id);
            }
        } else if poll_end > w.last_update_msg_time && poll_end.saturating_sub(w.last_update_msg_time) >= timeout_usecs
        {
            sweep.to_remove.push(RemovalDecision {
                worker_id: *id,
                reason: RemovalReason::KeepaliveTimeout,
            });
        }
    }
    sweep
}

/// One task the fast-abort sweep wants cancelled, and whether its worker
/// has earned a second strike and must be blocked and removed outright
/// (spec.md §4.9, §8 scenario 5).
#[derive(Debug, Clone, Copy)]
pub struct FastAbortDecision {
    pub taskid: crate::task::TaskId,
    pub worker_id: WorkerId,
    pub block_and_remove_worker: bool,
}

/// Fast-abort sweep (spec.md §4.9, worked through in §8 scenario 5): for
/// every running task whose category has a positive multiplier `M`, the
/// threshold scales with *that task's own* strike count —
/// `A * (M + strikes(t))` — so a task that's already been fast-aborted
/// once must run proportionally longer before it trips again. `running`
/// yields, for every task currently executing, its id, the worker it's
/// on, how long it's been running in microseconds, its category's
/// average completed runtime in microseconds (`0` if the category
/// hasn't completed enough tasks to trust an average yet), that
/// category's own effective multiplier (already resolved against the
/// manager default; callers have already excluded tasks whose category
/// disables fast-abort), and the task's current strike count.
///
/// On a trip: the task is always cancelled (caller requeues it READY).
/// Whether the *worker* also gets blocked and removed depends on the
/// worker, not the task — if this worker already carries a fast-abort
/// alarm from some earlier strike (possibly on a different task), this
/// second trip blocks and removes it; otherwise the alarm is set on this
/// worker and the task merely retries elsewhere. A task's strikes only
/// advance for its first two trips (spec.md §4.8, "stops incrementing
/// strikes" past that) — the threshold stays flat after that, matching
/// "only the first two count".
pub fn sweep_fast_abort(
    workers: &mut WorkerTable,
    running: impl Iterator<Item = (crate::task::TaskId, WorkerId, u64, f64, f64, u32)>,
) -> Vec<FastAbortDecision> {
    let mut decisions = Vec::new();
    for (taskid, worker_id, running_usecs, avg_usecs, multiplier, strikes) in running {
        if avg_usecs <= 0.0 || multiplier <= 0.0 {
            continue;
        }
        let threshold = avg_usecs * (multiplier + strikes as f64);
        if (running_usecs as f64) < threshold {
            continue;
        }

        let had_alarm = workers.get(&worker_id).map(|w| w.fast_abort_alarm).unwrap_or(false);
        let block_and_remove_worker = strikes > 0 && had_alarm;
        if block_and_remove_worker {
            decisions.push(FastAbortDecision {
                taskid,
                worker_id,
                block_and_remove_worker: true,
            });
        } else {
            if let Some(w) = workers.get_mut(&worker_id) {
                w.fast_abort_alarm = true;
            }
            decisions.push(FastAbortDecision {
                taskid,
                worker_id,
                block_and_remove_worker: false,
            });
        }
    }
    decisions
}

/// Workers marked draining whose task tables have fully drained:
/// eligible for final disconnect (`abort_drained_workers`).
pub fn sweep_drained(workers: &WorkerTable) -> Vec<RemovalDecision> {
    workers
        .iter()
        .filter(|(_, w)| w.draining && w.current_tasks_boxes.is_empty())
        .map(|(id, _)| RemovalDecision {
            worker_id: *id,
            reason: RemovalReason::Draining,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000)
    }

    #[test]
    fn keepalive_sweep_sends_check_once_interval_elapses_after_a_response() {
        let mut table = WorkerTable::new();
        let id = table.insert_new(addr(), 3, 0);
        let w = table.get_mut(&id).unwrap();
        w.state = WorkerState::Ready;
        // Worker has answered since the last check was sent, and the
        // interval has long since elapsed.
        w.last_update_msg_time = 0;
        w.last_msg_recv_time = 1_000;
        let sweep = sweep_keepalives(&table, 200_000_000, 200_000_000, 120, 900);
        assert_eq!(sweep.to_check, vec![id]);
        assert!(sweep.to_remove.is_empty());
    }

    #[test]
    fn keepalive_sweep_removes_worker_that_never_answered_its_check() {
        let mut table = WorkerTable::new();
        let id = table.insert_new(addr(), 3, 0);
        let w = table.get_mut(&id).unwrap();
        w.state = WorkerState::Ready;
        // A check was sent at t=0 and nothing has come back since.
        w.last_update_msg_time = 0;
        w.last_msg_recv_time = 0;
        let sweep = sweep_keepalives(&table, 1_000_000_000, 1_000_000_000, 120, 900);
        assert!(sweep.to_check.is_empty());
        assert_eq!(sweep.to_remove.len(), 1);
        assert_eq!(sweep.to_remove[0].worker_id, id);
        assert_eq!(sweep.to_remove[0].reason, RemovalReason::KeepaliveTimeout);
    }

    #[test]
    fn keepalive_sweep_removes_ungreeted_worker_after_timeout_since_acceptance() {
        let mut table = WorkerTable::new();
        let id = table.insert_new(addr(), 3, 1_000_000_000);
        // Still AwaitingGreeting: never sent its dataswarm line.
        let sweep = sweep_keepalives(&table, 1_901_000_000, 1_901_000_000, 120, 900);
        assert_eq!(sweep.to_remove.len(), 1);
        assert_eq!(sweep.to_remove[0].worker_id, id);
    }

    #[test]
    fn keepalive_timeout_of_zero_disables_both_check_and_culling() {
        let mut table = WorkerTable::new();
        let id = table.insert_new(addr(), 3, 0);
        let w = table.get_mut(&id).unwrap();
        w.state = WorkerState::Ready;
        w.last_update_msg_time = 0;
        w.last_msg_recv_time = 0;
        let sweep = sweep_keepalives(&table, 10_000_000_000, 10_000_000_000, 120, 0);
        assert!(sweep.to_check.is_empty());
        assert!(sweep.to_remove.is_empty());
    }

    #[test]
    fn fast_abort_sets_alarm_on_first_strike_and_blocks_worker_on_second() {
        // spec.md §8 scenario 5: multiplier 3, average 1s (1_000_000 usec).
        let mut table = WorkerTable::new();
        let worker_a = table.insert_new(addr(), 3, 0);
        table.get_mut(&worker_a).unwrap().state = WorkerState::Ready;

        // First strike on A at 0 prior strikes: threshold = 1s * (3+0) = 3s;
        // task ran 5s, trips. No prior alarm on A, so it's just set.
        let first = sweep_fast_abort(&mut table, std::iter::once((1, worker_a, 5_000_000, 1_000_000.0, 3.0, 0)));
        assert_eq!(first.len(), 1);
        assert!(!first[0].block_and_remove_worker);
        assert!(table.get(&worker_a).unwrap().fast_abort_alarm);

        // Second strike, now on A again, with strikes=2 (two prior trips
        // already counted elsewhere per the scenario): threshold = 1s *
        // (3+2) = 5s; task ran 5s, trips again. A still carries its alarm
        // from the first strike, so this one blocks and removes it.
        let second = sweep_fast_abort(&mut table, std::iter::once((1, worker_a, 5_000_000, 1_000_000.0, 3.0, 2)));
        assert_eq!(second.len(), 1);
        assert!(second[0].block_and_remove_worker);
    }

    #[test]
    fn fast_abort_on_a_different_worker_does_not_inherit_the_first_workers_alarm() {
        let mut table = WorkerTable::new();
        let worker_a = table.insert_new(addr(), 3, 0);
        let worker_b = table.insert_new(addr(), 4, 0);
        table.get_mut(&worker_a).unwrap().fast_abort_alarm = true;

        // Worker B has never had an alarm, so even a strictly-positive
        // strike count on the task doesn't block B on its own first trip.
        let decisions = sweep_fast_abort(&mut table, std::iter::once((1, worker_b, 10_000_000, 1_000_000.0, 3.0, 1)));
        assert_eq!(decisions.len(), 1);
        assert!(!decisions[0].block_and_remove_worker);
        assert!(table.get(&worker_b).unwrap().fast_abort_alarm);
    }

    #[test]
    fn drained_sweep_only_flags_empty_draining_workers() {
        let mut table = WorkerTable::new();
        let id = table.insert_new(addr(), 3, 0);
        let w = table.get_mut(&id).unwrap();
        w.draining = true;
        let decisions = sweep_drained(&table);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].worker_id, id);
    }
}
