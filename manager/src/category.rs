//! Category table and the per-task resource allocator (C3, spec.md §4.4),
//! grounded on `ds_manager_choose_resources_for_task` in `ds_manager.c`
//! (lines 2329-2439 of the original).

use std::collections::HashMap;

use crate::resources::ResourceBox;
use crate::task::{RequestLabel, ResourceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Use exactly the category's configured `max` box; tasks that ask
    /// for less still get the whole allocation.
    Fixed,
    /// Never exceed `max`; below that, satisfy each task's own request.
    Max,
    /// Size each task's allocation to minimize wasted capacity, learning
    /// from the running average of measured usage once enough samples
    /// exist (`MIN_COMPLETIONS_FOR_AVERAGE`, spec.md §4.4).
    MinWaste,
    /// Pack the smallest allocation that still lets the category's
    /// average task finish, favoring worker throughput over per-task
    /// headroom.
    MaxThroughput,
}

impl Default for AllocationMode {
    fn default() -> Self {
        AllocationMode::Max
    }
}

/// Running statistics used by `MinWaste`/`MaxThroughput` to refine their
/// guess once a category has completed enough tasks to trust the
/// average (supplemented from the original's category steady-state
/// sampling, spec.md SPEC_FULL addendum).
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSample {
    pub count: u64,
    pub sum_cores: f64,
    pub sum_memory: f64,
    pub sum_disk: f64,
    pub max_cores: f64,
    pub max_memory: f64,
    pub max_disk: f64,
}

impl UsageSample {
    pub fn record(&mut self, measured: &ResourceBox) {
        self.count += 1;
        self.sum_cores += measured.cores;
        self.sum_memory += measured.memory;
        self.sum_disk += measured.disk;
        self.max_cores = self.max_cores.max(measured.cores);
        self.max_memory = self.max_memory.max(measured.memory);
        self.max_disk = self.max_disk.max(measured.disk);
    }

    pub fn average(&self) -> ResourceBox {
        if self.count == 0 {
            return ResourceBox::zero();
        }
        let n = self.count as f64;
        ResourceBox::new(self.sum_cores / n, self.sum_memory / n, self.sum_disk / n, 0.0)
    }

    pub fn has_enough_samples(&self) -> bool {
        self.count >= shared::defaults::MIN_COMPLETIONS_FOR_AVERAGE
    }
}

#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub mode: AllocationMode,
    /// Per-worker whole-box cap this category may never exceed, `None`
    /// meaning "scale to whatever the worker has" (whole-worker tasks).
    pub max: Option<ResourceBox>,
    /// Floor below which an allocation guess is never shrunk.
    pub min: ResourceBox,
    pub usage: UsageSample,

    /// `fast-abort-multiplier` for this category specifically: `0.0`
    /// disables fast-abort even if the manager default is set, negative
    /// means "use the manager default", positive overrides it
    /// (spec.md §3, category attribute table).
    pub fast_abort_multiplier: f64,

    pub tasks_waiting: u64,
    pub tasks_running: u64,
    pub tasks_done: u64,

    /// Sum of (exec + send + recv) time in microseconds across every
    /// completed task in this category, used to compute the average
    /// fast-abort compares against (spec.md §4.9).
    pub total_runtime_usecs: i64,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Category {
            name: name.into(),
            mode: AllocationMode::default(),
            max: None,
            min: ResourceBox::zero(),
            usage: UsageSample::default(),
            fast_abort_multiplier: -1.0,
            tasks_waiting: 0,
            tasks_running: 0,
            tasks_done: 0,
            total_runtime_usecs: 0,
        }
    }

    /// Resolve this category's effective fast-abort multiplier against
    /// the manager-wide default (spec.md §4.9: "0=disabled, <0=use
    /// default, >0=value").
    pub fn effective_fast_abort_multiplier(&self, manager_default: f64) -> f64 {
        if self.fast_abort_multiplier < 0.0 {
            manager_default
        } else {
            self.fast_abort_multiplier
        }
    }

    /// Fold one task's completion into the running runtime average that
    /// feeds fast-abort and steady-state resource sampling.
    pub fn record_completion(&mut self, runtime_usecs: i64, measured: &ResourceBox) {
        self.tasks_done += 1;
        self.total_runtime_usecs += runtime_usecs;
        self.usage.record(measured);
    }

    /// Average completed-task runtime in microseconds, `0.0` until at
    /// least one task has completed.
    pub fn average_runtime_usecs(&self) -> f64 {
        if self.tasks_done == 0 {
            0.0
        } else {
            self.total_runtime_usecs as f64 / self.tasks_done as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct CategoryTable {
    categories: HashMap<String, Category>,
}

impl CategoryTable {
    pub fn get_or_create(&mut self, name: &str) -> &mut Category {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }
}

/// Outcome of attempting to fit a task's request against a worker's
/// available capacity, for a specific `RequestLabel` rung on the ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AllocationOutcome {
    Fits(ResourceBox),
    /// The category's current rung cannot fit even an idle worker's
    /// total capacity; the caller should advance the ladder.
    ExceedsWorker,
    /// Fits in principle but the worker doesn't have this much free
    /// right now.
    InsufficientFree,
}

/// Resolve a task's resource request against its category and a
/// candidate worker's resources, faithfully porting
/// `ds_manager_choose_resources_for_task` (`ds_manager.c:2329-2439`):
///
/// 1. Start from the category-resolved max (the `RequestLabel` rung's
///    guess), then let any per-task explicit value override it field by
///    field.
/// 2. If the category's mode is `FIXED`, or the manager runs with
///    `force_proportional_resources`, compute the largest
///    `specified / worker.largest` ratio across every field that has a
///    value. A ratio over 1 can't fit this worker at all for that field,
///    so fall through to the whole-worker fallback below; otherwise
///    shrink every still-unspecified field to that same proportion of
///    the worker's capacity (an integral ratio when
///    `force_proportional_resources` is set, so a whole number of such
///    tasks fit on one worker), with `force_proportional_resources`
///    additionally overriding fields the task *did* specify.
/// 3. If no field ended up specified at all, or any specified field
///    equals/exceeds the worker's capacity for it, fall back to the
///    whole worker for every field still unspecified.
/// 4. Finally raise each field to at least the category's configured
///    minimum.
pub fn choose_resources(
    category: &Category,
    request: &ResourceRequest,
    label: RequestLabel,
    worker_total: &ResourceBox,
    worker_free: &ResourceBox,
    force_proportional_resources: bool,
) -> AllocationOutcome {
    let base = base_box(category, label);
    let mut cores = request.cores.or(base.map(|b| b.cores));
    let mut memory = request.memory.or(base.map(|b| b.memory));
    let mut disk = request.disk.or(base.map(|b| b.disk));
    let mut gpus = request.gpus.or(base.map(|b| b.gpus));

    let mut use_whole_worker = true;

    if force_proportional_resources || category.mode == AllocationMode::Fixed {
        let mut max_proportion: f64 = -1.0;
        for (value, largest) in [
            (cores, worker_total.cores),
            (memory, worker_total.memory),
            (disk, worker_total.disk),
            (gpus, worker_total.gpus),
        ] {
            if let Some(v) = value {
                if largest > 0.0 {
                    max_proportion = max_proportion.max(v / largest);
                }
            }
        }

        if max_proportion > 1.0 {
            // Doesn't fit this worker for the resources it does specify;
            // leave the unspecified ones to the whole-worker fallback
            // below rather than warn about an unrunnable task here.
            use_whole_worker = true;
        } else if max_proportion > 0.0 {
            use_whole_worker = false;

            if force_proportional_resources {
                // Shrink to an integral number of these tasks per worker.
                max_proportion = 1.0 / (1.0 / max_proportion).floor();
            }

            let wants_gpus = gpus.is_some_and(|g| g > 0.0);
            if force_proportional_resources || cores.is_none() {
                cores = Some(if wants_gpus {
                    0.0
                } else {
                    (worker_total.cores * max_proportion).floor().max(1.0)
                });
            }
            if gpus.is_none() {
                gpus = Some(0.0);
            }
            if force_proportional_resources || memory.is_none() {
                memory = Some((worker_total.memory * max_proportion).floor().max(1.0));
            }
            if force_proportional_resources || disk.is_none() {
                disk = Some((worker_total.disk * max_proportion).floor().max(1.0));
            }
        }
        // max_proportion <= 0: nothing with a positive worker capacity
        // was specified; use_whole_worker stays true.
    }

    let all_unspecified = [cores, memory, disk, gpus]
        .iter()
        .all(|v| v.unwrap_or(-1.0) < 1.0);
    if all_unspecified {
        use_whole_worker = true;
    }
    let any_saturates = [
        (cores, worker_total.cores),
        (gpus, worker_total.gpus),
        (memory, worker_total.memory),
        (disk, worker_total.disk),
    ]
    .into_iter()
    .any(|(v, largest)| v.is_some_and(|v| v > 0.0 && v >= largest));
    if any_saturates {
        use_whole_worker = true;
    }

    if use_whole_worker {
        if cores.unwrap_or(0.0) <= 0.0 {
            cores = Some(if gpus.is_some_and(|g| g > 0.0) { 0.0 } else { worker_total.cores });
        }
        if gpus.unwrap_or(0.0) <= 0.0 {
            gpus = Some(0.0);
        }
        if memory.unwrap_or(0.0) <= 0.0 {
            memory = Some(worker_total.memory);
        }
        if disk.unwrap_or(0.0) <= 0.0 {
            disk = Some(worker_total.disk);
        }
    }

    let mut wanted = ResourceBox::new(
        cores.unwrap_or(0.0),
        memory.unwrap_or(0.0),
        disk.unwrap_or(0.0),
        gpus.unwrap_or(0.0),
    );

    wanted.cores = wanted.cores.max(category.min.cores);
    wanted.memory = wanted.memory.max(category.min.memory);
    wanted.disk = wanted.disk.max(category.min.disk);
    wanted.gpus = wanted.gpus.max(category.min.gpus);

    if !worker_total.fits(&wanted) {
        return AllocationOutcome::ExceedsWorker;
    }
    if !worker_free.fits(&wanted) {
        return AllocationOutcome::InsufficientFree;
    }
    AllocationOutcome::Fits(wanted)
}

/// The category-resolved starting box for a `RequestLabel` rung, before
/// any per-task override. `None` means the category has no opinion and
/// every field falls through to the whole-worker fallback untouched.
fn base_box(category: &Category, label: RequestLabel) -> Option<ResourceBox> {
    match label {
        RequestLabel::Max | RequestLabel::Error => category.max,
        RequestLabel::First => match category.mode {
            AllocationMode::Fixed | AllocationMode::Max => category.max,
            AllocationMode::MinWaste | AllocationMode::MaxThroughput => {
                if category.usage.has_enough_samples() {
                    let avg = category.usage.average();
                    // Pad the learned average by a quarter to absorb
                    // measurement noise before trusting it as a guess.
                    Some(ResourceBox::new(
                        avg.cores * 1.25,
                        avg.memory * 1.25,
                        avg.disk * 1.25,
                        avg.gpus,
                    ))
                } else {
                    category.max
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_request_overrides_category_guess() {
        let mut cat = Category::new("default");
        cat.mode = AllocationMode::Max;
        cat.max = Some(ResourceBox::new(4.0, 8000.0, 10000.0, 0.0));
        let mut req = ResourceRequest::default();
        req.cores = Some(1.0);
        let total = ResourceBox::new(8.0, 16000.0, 40000.0, 0.0);
        let free = total;
        let outcome = choose_resources(&cat, &req, RequestLabel::First, &total, &free, false);
        match outcome {
            AllocationOutcome::Fits(r) => assert_eq!(r.cores, 1.0),
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn request_exceeding_worker_total_reports_exceeds_worker() {
        let cat = Category::new("default");
        let req = ResourceRequest::default();
        let total = ResourceBox::new(2.0, 2000.0, 2000.0, 0.0);
        let free = total;
        let mut huge_cat = cat.clone();
        huge_cat.max = Some(ResourceBox::new(100.0, 1.0, 1.0, 0.0));
        let outcome = choose_resources(&huge_cat, &req, RequestLabel::Max, &total, &free, false);
        assert_eq!(outcome, AllocationOutcome::ExceedsWorker);
    }

    #[test]
    fn fixed_mode_scales_unspecified_fields_proportionally() {
        // Task asks for half the worker's memory; cores/disk/gpus are
        // unspecified and a FIXED category should scale them to the same
        // proportion rather than handing over the whole worker.
        let mut cat = Category::new("fixed");
        cat.mode = AllocationMode::Fixed;
        let mut req = ResourceRequest::default();
        req.memory = Some(4000.0);
        let total = ResourceBox::new(8.0, 8000.0, 40000.0, 0.0);
        let free = total;
        let outcome = choose_resources(&cat, &req, RequestLabel::First, &total, &free, false);
        match outcome {
            AllocationOutcome::Fits(r) => {
                assert_eq!(r.memory, 4000.0);
                assert_eq!(r.cores, 4.0);
                assert_eq!(r.disk, 20000.0);
            }
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn force_proportional_resources_overrides_explicit_cores_too() {
        // Outside FIXED mode, force_proportional_resources still kicks
        // in and rescales even a field the task explicitly requested.
        let mut cat = Category::new("max-mode");
        cat.mode = AllocationMode::Max;
        let mut req = ResourceRequest::default();
        req.cores = Some(1.0);
        req.memory = Some(4000.0);
        let total = ResourceBox::new(8.0, 8000.0, 40000.0, 0.0);
        let free = total;
        let outcome = choose_resources(&cat, &req, RequestLabel::First, &total, &free, true);
        match outcome {
            AllocationOutcome::Fits(r) => assert_eq!(r.cores, 4.0),
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn nothing_specified_falls_back_to_whole_worker() {
        // gpus default to 0 even under the whole-worker fallback: a task
        // that never asked for a gpu shouldn't get one just because the
        // worker happens to have some (mirrors `ds_manager.c`'s
        // `limits->gpus <= 0 -> 0` rule, distinct from cores/memory/disk).
        let cat = Category::new("default");
        let req = ResourceRequest::default();
        let total = ResourceBox::new(8.0, 8000.0, 40000.0, 0.0);
        let free = total;
        let outcome = choose_resources(&cat, &req, RequestLabel::First, &total, &free, false);
        assert_eq!(outcome, AllocationOutcome::Fits(total));
    }

    #[test]
    fn specified_resource_at_worker_capacity_also_falls_back_to_whole_worker() {
        // Only cores is specified, but at the worker's exact capacity:
        // the remaining fields should also get the whole worker rather
        // than staying at zero.
        let mut cat = Category::new("default");
        cat.mode = AllocationMode::Max;
        let mut req = ResourceRequest::default();
        req.cores = Some(8.0);
        let total = ResourceBox::new(8.0, 8000.0, 40000.0, 0.0);
        let free = total;
        let outcome = choose_resources(&cat, &req, RequestLabel::First, &total, &free, false);
        assert_eq!(outcome, AllocationOutcome::Fits(total));
    }

    #[test]
    fn allocation_never_goes_below_category_minimum() {
        let mut cat = Category::new("floored");
        cat.min = ResourceBox::new(2.0, 1000.0, 0.0, 0.0);
        let mut req = ResourceRequest::default();
        req.cores = Some(1.0);
        req.memory = Some(500.0);
        let total = ResourceBox::new(8.0, 8000.0, 40000.0, 0.0);
        let free = total;
        let outcome = choose_resources(&cat, &req, RequestLabel::First, &total, &free, false);
        match outcome {
            AllocationOutcome::Fits(r) => {
                assert_eq!(r.cores, 2.0);
                assert_eq!(r.memory, 1000.0);
            }
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn effective_fast_abort_multiplier_falls_back_to_manager_default() {
        let mut cat = Category::new("default");
        assert_eq!(cat.effective_fast_abort_multiplier(2.5), 2.5);
        cat.fast_abort_multiplier = 0.0;
        assert_eq!(cat.effective_fast_abort_multiplier(2.5), 0.0);
        cat.fast_abort_multiplier = 4.0;
        assert_eq!(cat.effective_fast_abort_multiplier(2.5), 4.0);
    }

    #[test]
    fn average_runtime_tracks_completions() {
        let mut cat = Category::new("default");
        assert_eq!(cat.average_runtime_usecs(), 0.0);
        cat.record_completion(1000, &ResourceBox::zero());
        cat.record_completion(2000, &ResourceBox::zero());
        assert_eq!(cat.average_runtime_usecs(), 1500.0);
    }

    #[test]
    fn min_waste_falls_back_to_max_until_enough_samples() {
        let mut cat = Category::new("learning");
        cat.mode = AllocationMode::MinWaste;
        cat.max = Some(ResourceBox::new(4.0, 4000.0, 4000.0, 0.0));
        let guess = base_box(&cat, RequestLabel::First);
        assert_eq!(guess, cat.max);
    }

    #[test]
    fn min_waste_uses_learned_average_once_enough_samples_recorded() {
        let mut cat = Category::new("learning");
        cat.mode = AllocationMode::MinWaste;
        cat.max = Some(ResourceBox::new(4.0, 4000.0, 4000.0, 0.0));
        while !cat.usage.has_enough_samples() {
            cat.usage.record(&ResourceBox::new(2.0, 2000.0, 2000.0, 0.0));
        }
        let guess = base_box(&cat, RequestLabel::First).expect("learned guess");
        assert_eq!(guess.cores, 2.5);
        assert_eq!(guess.memory, 2500.0);
        assert_eq!(guess.disk, 2500.0);
    }
}
