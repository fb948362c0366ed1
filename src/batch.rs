//! Timing of hack/weaken/grow/weaken batches.
//!
//! Phases of one batch resolve a phase delay apart, in the order hack,
//! weaken, grow, weaken. Each phase is fired at its resolve instant minus its
//! duration, so the phase with the longest duration fires first.

use compact_str::{
    format_compact,
    CompactString,
};
use smallvec::{
    smallvec,
    SmallVec,
};

use crate::{
    config::DaemonConfig,
    target::Target,
    tools::ToolKind,
    utils::ceil_threads,
};

/// One worker launch inside a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleItem {
    pub tool: ToolKind,
    /// Fire instant.
    pub start: f64,
    /// Resolve instant.
    pub end: f64,
    pub threads: usize,
    pub description: CompactString,
}

impl ScheduleItem {
    fn new(
        tool: ToolKind,
        end: f64,
        duration: f64,
        threads: usize,
        description: CompactString,
    ) -> ScheduleItem {
        ScheduleItem {
            tool,
            start: end - duration,
            end,
            threads,
            description,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Worker arguments: target, fire instant, expected duration and a
    /// discriminator that keeps otherwise equal launches apart.
    pub fn args(
        &self,
        target: &str,
    ) -> Vec<String> {
        vec![
            target.to_owned(),
            format!("{}", self.start.round()),
            format!("{}", self.duration().round()),
            self.description.to_string(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub target: CompactString,
    pub items: SmallVec<[ScheduleItem; 4]>,
    /// Latest fire instant of any phase.
    pub last_fire: f64,
    /// Earliest resolve instant of any phase.
    pub first_resolve: f64,
    pub last_resolve: f64,
}

impl Batch {
    fn from_items(
        target: &str,
        items: SmallVec<[ScheduleItem; 4]>,
    ) -> Batch {
        let last_fire = items.iter().map(|i| i.start).fold(f64::MIN, f64::max);
        let first_resolve = items.iter().map(|i| i.end).fold(f64::MAX, f64::min);
        let last_resolve = items.iter().map(|i| i.end).fold(f64::MIN, f64::max);

        Batch {
            target: CompactString::from(target),
            items,
            last_fire,
            first_resolve,
            last_resolve,
        }
    }

    /// Items in the order they should be allocated: unsplittable ones first so
    /// they get the large contiguous blocks.
    pub fn allocation_order(&self) -> Vec<&ScheduleItem> {
        let mut items = self.items.iter().collect::<Vec<_>>();
        items.sort_by_key(|i| (i.tool.can_split(), std::cmp::Reverse(i.threads)));
        items
    }
}

/// Resolve instants of the four phases of a batch starting at `from`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseTimes {
    pub hack: f64,
    pub weaken_after_hack: f64,
    pub grow: f64,
    pub weaken_after_grow: f64,
}

pub fn phase_times(
    target: &Target,
    from: f64,
    phase_delay: f64,
    harvest_only: bool,
) -> PhaseTimes {
    let timings = target.get_timings();
    let weaken_after_grow = from + timings.longest() + 3. * phase_delay;
    let grow = weaken_after_grow - phase_delay;
    let weaken_after_hack = grow - phase_delay;

    let hack = match harvest_only {
        true => from + timings.hack,
        false => weaken_after_hack - phase_delay,
    };

    PhaseTimes {
        hack,
        weaken_after_hack,
        grow,
        weaken_after_grow,
    }
}

/// Grow threads for a target drained to zero, split into two grows.
///
/// Growing from nothing first adds a flat amount per thread, so a small first
/// grow followed by a second one can need far fewer threads than a single one.
/// Returns (first, second).
pub fn grow_from_zero(target: &Target) -> (usize, usize) {
    let max_money = target.get_max_money();
    let threads_to_max_from = |money: f64| {
        ceil_threads(target.cycles_for_growth_coefficient(max_money / money.max(1.)))
    };
    let total = |first: usize| {
        first + threads_to_max_from(target.money_after_grow(0., first))
    };

    let mut best = 1;
    let mut best_total = total(best);
    let mut step = (threads_to_max_from(0.) / 2).max(1);

    for _ in 0 .. 1000 {
        let up = best + step;
        let down = best.saturating_sub(step).max(1);

        let (candidate, candidate_total) = [up, down]
            .into_iter()
            .map(|c| (c, total(c)))
            .min_by_key(|(_, t)| *t)
            .unwrap_or((best, best_total));

        if candidate_total < best_total {
            best = candidate;
            best_total = candidate_total;
        }
        else if step == 1 {
            break;
        }
        else {
            step /= 2;
        }
    }

    (best, best_total - best)
}

/// Worker launches for one batch, without timing.
pub fn batch_jobs(
    target: &Target,
    hack_threads: usize,
    harvest_only: bool,
) -> SmallVec<[(ToolKind, usize); 5]> {
    if harvest_only {
        return smallvec![(ToolKind::Hack, hack_threads)];
    }

    // a single thread takes everything
    if 1. <= target.fraction_per_thread() {
        let (first, second) = grow_from_zero(target);
        return smallvec![
            (ToolKind::Hack, 1),
            (ToolKind::Weaken, target.weaken_threads_needed_after_theft(1)),
            (ToolKind::Grow, first),
            (ToolKind::Grow, second),
            (
                ToolKind::Weaken,
                target.weaken_threads_needed_after_growth(first + second)
            ),
        ];
    }

    let threads = target.batch_threads(hack_threads);
    smallvec![
        (ToolKind::Hack, threads.hack),
        (ToolKind::Weaken, threads.weaken_after_hack),
        (ToolKind::Grow, threads.grow),
        (ToolKind::Weaken, threads.weaken_after_grow),
    ]
}

/// Builds one batch starting at `from`.
pub fn build_batch(
    target: &Target,
    hack_threads: usize,
    from: f64,
    config: &DaemonConfig,
    batch_id: usize,
) -> Batch {
    let delta = config.phase_delay();
    let times = phase_times(target, from, delta, config.harvest_only);
    let timings = target.get_timings();
    let tag = |phase: &str| format_compact!("{}-{}", phase, batch_id);

    let mut items: SmallVec<[ScheduleItem; 4]> = SmallVec::new();

    if config.harvest_only {
        items.push(ScheduleItem::new(
            ToolKind::Hack,
            times.hack,
            timings.hack,
            hack_threads,
            tag("hack"),
        ));
        return Batch::from_items(target.get_name(), items);
    }

    let jobs = batch_jobs(target, hack_threads, false);
    let grows = jobs.iter().filter(|(tool, _)| *tool == ToolKind::Grow).count();
    let mut weakens = 0;
    let mut grows_seen = 0;

    for (tool, threads) in jobs {
        let (end, duration, name) = match tool {
            ToolKind::Hack => (times.hack, timings.hack, "hack"),
            ToolKind::Weaken => {
                weakens += 1;
                match weakens {
                    1 => (times.weaken_after_hack, timings.weaken, "weaken1"),
                    _ => (times.weaken_after_grow, timings.weaken, "weaken2"),
                }
            },
            _ => {
                grows_seen += 1;
                match grows_seen < grows {
                    // the first of two grows lands between the weakens
                    true => (times.grow - delta / 2., timings.grow, "grow1"),
                    false => (times.grow, timings.grow, "grow"),
                }
            },
        };

        if threads == 0 {
            continue;
        }

        items.push(ScheduleItem::new(tool, end, duration, threads, tag(name)));
    }

    Batch::from_items(target.get_name(), items)
}

/// Batches one launch round may hold before the later ones would fire after
/// the first one starts resolving.
pub fn paced_cycles(
    target: &Target,
    config: &DaemonConfig,
) -> usize {
    let by_weaken = (target.time_to_weaken() / config.cycle_timing_delay).floor();
    let by_weaken = match by_weaken.is_finite() && 1. <= by_weaken {
        true => by_weaken as usize,
        false => 1,
    };
    let cap = config.max_batches.min(by_weaken).max(1);

    let first = build_batch(target, 1, 0., config, 0);
    let span = first.first_resolve - first.last_fire;
    if span <= 0. {
        return 1;
    }

    let by_timing = (span / config.cycle_timing_delay).ceil() as usize;
    by_timing.clamp(1, cap)
}

/// Lays out up to `count` consecutive batches, stopping before one whose last
/// fire would not precede the first batch's first resolve.
pub fn plan_batches(
    target: &Target,
    hack_threads: usize,
    now: f64,
    count: usize,
    config: &DaemonConfig,
    first_id: usize,
) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::with_capacity(count);

    for i in 0 .. count {
        let from = now + config.queue_delay + i as f64 * config.cycle_timing_delay;
        let batch = build_batch(target, hack_threads, from, config, first_id + i);

        if let Some(first) = batches.first() {
            if first.first_resolve <= batch.last_fire {
                break;
            }
        }

        batches.push(batch);
    }

    batches
}
