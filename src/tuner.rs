//! Picking how much of a target to steal per batch.
//!
//! Stealing more per batch needs more RAM per batch, so fewer batches fit.
//! The tuner hill-climbs over hack threads for the largest steal at which the
//! full paced round of batches still packs into free RAM.

use log::debug;

use crate::{
    allocator::pack_into,
    batch::batch_jobs,
    target::Target,
    utils::{
        ceil_threads,
        floor_threads,
    },
};

const MAX_ITERATIONS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TuneOutcome {
    pub hack_threads: usize,
    pub fraction: f64,
    /// Batches that pack into RAM at this steal, up to the paced cycle count.
    pub cycles: usize,
    pub iterations: usize,
}

/// How many whole batches fit into `free`, up to `max_cycles`.
///
/// `free` holds per-node free RAM in hundredths of a GB.
pub fn schedulable_cycles(
    target: &Target,
    hack_threads: usize,
    harvest_only: bool,
    free: &[u64],
    max_cycles: usize,
) -> usize {
    let mut jobs = batch_jobs(target, hack_threads, harvest_only)
        .into_iter()
        .filter(|(_, threads)| 0 < *threads)
        .collect::<Vec<_>>();
    if jobs.is_empty() {
        return 0;
    }

    // biggest unsplittable blocks claim their space first
    jobs.sort_by_key(|(tool, threads)| {
        (
            tool.can_split(),
            std::cmp::Reverse(*threads as u64 * tool.ram_hundredths()),
        )
    });

    let mut free = free.to_vec();
    free.sort_unstable_by(|a, b| b.cmp(a));

    for cycle in 0 .. max_cycles {
        for (tool, threads) in jobs.iter() {
            if !pack_into(&mut free, tool.ram_hundredths(), *threads, tool.can_split()) {
                return cycle;
            }
        }
    }

    max_cycles
}

/// Finds the largest hack thread count whose paced round still fits.
///
/// Starts from the target's current steal fraction, so calling this again
/// with unchanged inputs returns the same answer.
pub fn optimize_steal_fraction(
    target: &Target,
    free: &[u64],
    optimal_cycles: usize,
    max_fraction: f64,
    harvest_only: bool,
) -> TuneOutcome {
    let per_thread = target.fraction_per_thread();
    let none = TuneOutcome {
        hack_threads: 0,
        fraction: 0.,
        cycles: 0,
        iterations: 0,
    };
    if per_thread <= 0. {
        return none;
    }

    let cap = floor_threads(max_fraction / per_thread).max(1);
    let optimal_cycles = optimal_cycles.max(1);
    let cycles_at =
        |h: usize| schedulable_cycles(target, h, harvest_only, free, optimal_cycles);
    let feasible = |h: usize| optimal_cycles <= cycles_at(h);

    // one thread already takes everything, nothing to tune
    if 1. <= per_thread {
        return TuneOutcome {
            hack_threads: 1,
            fraction: 1.,
            cycles: cycles_at(1),
            iterations: 0,
        };
    }

    let mut h = target.hack_threads_needed().clamp(1, cap);
    let mut step = ceil_threads(0.01 / per_thread).max(1);
    let mut iterations = 0;

    // walk down until feasible, then up while it stays so
    let mut direction_up = feasible(h);
    let mut best = match direction_up {
        true => Some(h),
        false => None,
    };

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        let next = match direction_up {
            true => (h + step).min(cap),
            false => h.saturating_sub(step).max(1),
        };

        if next == h {
            if direction_up || step == 1 {
                break;
            }
            step = (step / 2).max(1);
            continue;
        }

        if feasible(next) {
            best = Some(best.map_or(next, |b| b.max(next)));
            h = next;
            if !direction_up {
                // overshot on the way down, come back up more carefully
                direction_up = true;
                step = (step / 2).max(1);
            }
        }
        else if direction_up {
            if step == 1 {
                break;
            }
            step = (step / 2).max(1);
        }
        else {
            h = next;
        }
    }

    let hack_threads = best.unwrap_or(1);
    let outcome = TuneOutcome {
        hack_threads,
        fraction: target.stolen_fraction(hack_threads),
        cycles: cycles_at(hack_threads),
        iterations,
    };

    debug!(
        "{}: tuned to {} hack threads ({:.1}%), {}/{} cycles in {} steps",
        target.get_name(),
        outcome.hack_threads,
        outcome.fraction * 100.,
        outcome.cycles,
        optimal_cycles,
        outcome.iterations
    );

    outcome
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::target::tests::prepped_target;

    #[test]
    fn more_ram_allows_a_bigger_steal() {
        let target = prepped_target("t", 1e9, 5., 0.002);
        let small = optimize_steal_fraction(&target, &[20_000], 4, 0.9, false);
        let large = optimize_steal_fraction(&target, &[200_000], 4, 0.9, false);

        assert!(0 < small.hack_threads);
        assert!(small.hack_threads < large.hack_threads);
        assert_eq!(small.cycles, 4);
        assert_eq!(large.cycles, 4);
    }

    #[test]
    fn steal_is_capped() {
        let target = prepped_target("t", 1e9, 5., 0.002);
        let outcome = optimize_steal_fraction(&target, &[100_000_000], 2, 0.5, false);

        assert_eq!(outcome.hack_threads, 250);
        assert!(outcome.fraction <= 0.5 + 1e-9);
    }

    #[test]
    fn starved_targets_still_get_one_thread() {
        let target = prepped_target("t", 1e9, 5., 0.002);
        let outcome = optimize_steal_fraction(&target, &[500], 3, 0.9, false);

        assert_eq!(outcome.hack_threads, 1);
        assert!(outcome.cycles < 3);
    }

    #[test]
    fn cycles_count_whole_batches() {
        let target = prepped_target("t", 1e9, 5., 0.002);
        let per_batch = target.batch_threads(10).ram_hundredths();

        let free = [per_batch * 3 + per_batch / 2];
        assert_eq!(schedulable_cycles(&target, 10, false, &free, 10), 3);
        assert_eq!(schedulable_cycles(&target, 10, false, &free, 2), 2);
    }

    proptest! {
        #[test]
        fn tuning_is_idempotent(
            ram in 1_000u64..1_000_000,
            percent in 0.0005f64..0.01,
            cycles in 1usize..20,
        ) {
            let mut target = prepped_target("t", 1e9, 5., percent);
            let first = optimize_steal_fraction(&target, &[ram], cycles, 0.9, false);

            target.set_steal_fraction(first.fraction);
            let second = optimize_steal_fraction(&target, &[ram], cycles, 0.9, false);

            prop_assert_eq!(first.hack_threads, second.hack_threads);
        }

        #[test]
        fn tuned_steal_respects_cap_and_ram(
            ram in 1_000u64..1_000_000,
            percent in 0.0005f64..0.01,
            cycles in 1usize..20,
        ) {
            let target = prepped_target("t", 1e9, 5., percent);
            let outcome = optimize_steal_fraction(&target, &[ram], cycles, 0.9, false);

            prop_assert!(outcome.fraction <= 0.9 + 1e-9);
            prop_assert!(outcome.iterations <= MAX_ITERATIONS);
            if 1 < outcome.hack_threads {
                prop_assert_eq!(outcome.cycles, cycles);
            }
        }
    }
}
