//! Worker selection policies (C6, spec.md §4.5), matching
//! `shared::config::ScheduleAlgorithm`: first-come-first-served, fewest
//! cached files to transfer, least time connected, or uniform random.

use rand::seq::SliceRandom;
use rand::thread_rng;

use shared::config::ScheduleAlgorithm;

use crate::category::{choose_resources, AllocationOutcome, Category};
use crate::task::{RequestLabel, ResourceRequest, TaskFile};
use crate::worker::{Worker, WorkerId};

/// A worker eligible for dispatch, along with the allocation it would
/// receive if chosen.
pub struct Candidate {
    pub worker_id: WorkerId,
    pub allocation: crate::resources::ResourceBox,
    pub files_missing: usize,
    pub time_connected: shared::utils::Timestamp,
}

/// Build the candidate list for one task: every ready, non-draining
/// worker that the category's current `RequestLabel` rung fits into.
pub fn eligible_candidates<'a>(
    workers: impl Iterator<Item = (&'a WorkerId, &'a Worker)>,
    category: &Category,
    request: &ResourceRequest,
    label: RequestLabel,
    input_files: &[TaskFile],
    force_proportional_resources: bool,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for (id, worker) in workers {
        if !worker.is_ready() {
            continue;
        }
        let total = worker.resources.whole_worker();
        let free = worker.resources.free();
        match choose_resources(category, request, label, &total, &free, force_proportional_resources) {
            AllocationOutcome::Fits(allocation) => {
                let files_missing = input_files
                    .iter()
                    .filter(|f| !worker.cache.contains(&f.cached_name))
                    .count();
                candidates.push(Candidate {
                    worker_id: *id,
                    allocation,
                    files_missing,
                    time_connected: worker.time_connected,
                });
            }
            AllocationOutcome::ExceedsWorker | AllocationOutcome::InsufficientFree => continue,
        }
    }
    candidates
}

/// Pick one candidate according to the configured policy. Returns
/// `None` only when `candidates` is empty.
pub fn choose_worker(
    algorithm: ScheduleAlgorithm,
    candidates: &[Candidate],
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    match algorithm {
        ScheduleAlgorithm::Fcfs => Some(0),
        ScheduleAlgorithm::Files => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.files_missing)
            .map(|(i, _)| i),
        ScheduleAlgorithm::Time => candidates
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.time_connected)
            .map(|(i, _)| i),
        ScheduleAlgorithm::Random => {
            let mut rng = thread_rng();
            (0..candidates.len()).collect::<Vec<_>>().choose(&mut rng).copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceBox;

    fn candidate(id: u64, files_missing: usize, time_connected: u64) -> Candidate {
        Candidate {
            worker_id: WorkerId::new(id, 0),
            allocation: ResourceBox::zero(),
            files_missing,
            time_connected,
        }
    }

    #[test]
    fn fcfs_always_picks_first() {
        let candidates = vec![candidate(1, 5, 10), candidate(2, 0, 20)];
        assert_eq!(choose_worker(ScheduleAlgorithm::Fcfs, &candidates), Some(0));
    }

    #[test]
    fn files_policy_picks_fewest_missing() {
        let candidates = vec![candidate(1, 5, 10), candidate(2, 0, 20)];
        assert_eq!(choose_worker(ScheduleAlgorithm::Files, &candidates), Some(1));
    }

    #[test]
    fn time_policy_picks_longest_connected() {
        let candidates = vec![candidate(1, 5, 10), candidate(2, 0, 20)];
        assert_eq!(choose_worker(ScheduleAlgorithm::Time, &candidates), Some(1));
    }

    #[test]
    fn empty_candidates_yields_none() {
        assert_eq!(choose_worker(ScheduleAlgorithm::Fcfs, &[]), None);
    }
}
