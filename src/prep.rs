//! Bringing a target to minimum security and maximum money.

use log::{
    debug,
    info,
};
use smallvec::SmallVec;

use crate::{
    allocator::{
        allocate,
        plan_allocation,
        AllocationRequest,
    },
    config::DaemonConfig,
    network::Network,
    oracle::{
        Oracle,
        Pid,
    },
    registry::{
        WorkMode,
        WorkRegistry,
    },
    tools::ToolKind,
    utils::format_duration,
};

/// Threads for one prep round, before they are launched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrepPlan {
    pub weaken: usize,
    pub grow: usize,
    pub weaken_for_grow: usize,
}

impl PrepPlan {
    pub fn is_empty(&self) -> bool {
        self.weaken == 0 && self.grow == 0
    }
}

/// Sizes a prep round against what the network can host right now.
///
/// Weaken comes first and may take everything. Grow must fit on one node once
/// the weaken is placed, and leaves room for the weaken that offsets it; both
/// shrink together when they don't fit.
pub fn plan_prep(
    network: &mut Network,
    target_idx: usize,
    security_only: bool,
) -> PrepPlan {
    let capacity = network.total_threads_available(ToolKind::Weaken);
    let weaken = network.target(target_idx).weaken_threads_needed().min(capacity);
    let mut plan = PrepPlan {
        weaken,
        ..PrepPlan::default()
    };

    let money_low = {
        let target = network.target(target_idx);
        target.get_money() < target.get_max_money() * 0.99
    };
    if security_only || !money_low {
        return plan;
    }

    let capacity = capacity - weaken;
    let largest = grow_room_after_weaken(network, weaken);

    let target = network.target(target_idx);
    let needed = target.grow_threads_needed();
    let mut grow = needed.min(largest);
    let mut offset = target.weaken_threads_to_offset_grow(grow);

    if capacity < grow + offset && 0 < grow + offset {
        let scale = capacity as f64 / (grow + offset) as f64;
        grow = ((grow as f64 * scale).floor() as usize).min(largest);
        offset = target.weaken_threads_to_offset_grow(grow);

        while 0 < grow && capacity < grow + offset {
            grow -= 1;
            offset = target.weaken_threads_to_offset_grow(grow);
        }
    }

    if grow == 0 {
        return plan;
    }

    plan.grow = grow;
    plan.weaken_for_grow = offset;
    plan
}

/// The most grow threads one node could host once `weaken` threads are
/// placed the way the allocator would place them.
fn grow_room_after_weaken(
    network: &mut Network,
    weaken: usize,
) -> usize {
    let request = AllocationRequest::new(ToolKind::Weaken, weaken, &[]);
    let (placements, _) = plan_allocation(network, &request);

    let weaken_cost = ToolKind::Weaken.ram_hundredths();
    let grow_cost = ToolKind::Grow.ram_hundredths();

    (0 .. network.nodes().len())
        .map(|idx| {
            let taken: u64 = placements
                .iter()
                .filter(|p| p.node == idx)
                .map(|p| p.threads as u64 * weaken_cost)
                .sum();
            let free = network.free_ram_for(idx, ToolKind::Grow).saturating_sub(taken);
            (free / grow_cost) as usize
        })
        .max()
        .unwrap_or(0)
}

/// Launches one prep round against a target.
///
/// Returns `None` if there is nothing to do, otherwise whether every planned
/// thread was launched.
pub async fn prep_target(
    oracle: &impl Oracle,
    network: &mut Network,
    registry: &mut WorkRegistry,
    target_idx: usize,
    config: &DaemonConfig,
) -> Option<bool> {
    let target = network.target(target_idx);
    let name = target.get_name().to_owned();

    if target.is_prepped() || registry.is_being_worked(&name, WorkMode::Batch) {
        return None;
    }

    let needed_weaken = target.weaken_threads_needed();
    let needed_grow = match config.security_only {
        true => 0,
        false => target.grow_threads_needed(),
    };
    let timings = target.get_timings();

    let plan = plan_prep(network, target_idx, config.security_only);
    if plan.is_empty() {
        debug!("{}: no room to prep", name);
        return Some(false);
    }

    let delta = config.phase_delay();
    let now = oracle.now();
    let mut pids: SmallVec<[Pid; 8]> = SmallVec::new();
    let mut complete = plan.weaken == needed_weaken;
    let mut completes_at = now + timings.weaken;

    if 0 < plan.weaken {
        let args = vec![name.clone(), format!("{}", now.round()), "prep-weaken".to_owned()];
        let request = AllocationRequest::new(ToolKind::Weaken, plan.weaken, &args);
        let allocation = allocate(
            oracle,
            network,
            &request,
            config.launch_retries,
            config.launch_backoff,
        )
        .await;

        complete &= allocation.is_success();
        pids.extend(allocation.pids);
    }

    if 0 < plan.grow {
        // land after the weaken above, then offset its security
        let grow_fire = now + timings.weaken - timings.grow + delta;
        let args = vec![name.clone(), format!("{}", grow_fire.round()), "prep-grow".to_owned()];
        let mut request = AllocationRequest::new(ToolKind::Grow, plan.grow, &args);
        request.allow_split = false;
        let grown = allocate(
            oracle,
            network,
            &request,
            config.launch_retries,
            config.launch_backoff,
        )
        .await;

        complete &= grown.is_success() && plan.grow == needed_grow;
        let grow_launched = grown.is_success();
        pids.extend(grown.pids);

        if grow_launched && 0 < plan.weaken_for_grow {
            let fire = now + 2. * delta;
            let args = vec![name.clone(), format!("{}", fire.round()), "prep-offset".to_owned()];
            let request =
                AllocationRequest::new(ToolKind::Weaken, plan.weaken_for_grow, &args);
            let offset = allocate(
                oracle,
                network,
                &request,
                config.launch_retries,
                config.launch_backoff,
            )
            .await;

            complete &= offset.is_success();
            pids.extend(offset.pids);
            completes_at = fire + timings.weaken;
        }
    }
    else if 0 < needed_grow {
        complete = false;
    }

    if pids.is_empty() {
        return Some(false);
    }

    info!(
        "{}: prepping with {}w {}g {}w, done in {}",
        name,
        plan.weaken,
        plan.grow,
        plan.weaken_for_grow,
        format_duration(completes_at - now)
    );
    registry.record(&name, WorkMode::Prep, completes_at, pids);

    Some(complete)
}
