//! Placing worker threads onto nodes.
//!
//! Planning is pure and works on a [`Network`] snapshot; [`allocate`] then
//! copies scripts and execs the plan, retrying exec with exponential back-off.

use log::{
    debug,
    warn,
};
use smallvec::SmallVec;

use crate::{
    error::LaunchError,
    network::Network,
    oracle::{
        Oracle,
        Pid,
    },
    tools::ToolKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub node: usize,
    pub threads: usize,
}

#[derive(Clone, Debug)]
pub struct AllocationRequest<'a> {
    pub tool: ToolKind,
    pub threads: usize,
    pub args: &'a [String],
    /// Tried first regardless of its free RAM.
    pub preferred_node: Option<&'a str>,
    /// Consolidate onto the smallest node that fits instead of the largest.
    pub smallest_first: bool,
    /// Only honored for tools that can be split at all.
    pub allow_split: bool,
}

impl<'a> AllocationRequest<'a> {
    pub fn new(
        tool: ToolKind,
        threads: usize,
        args: &'a [String],
    ) -> AllocationRequest<'a> {
        AllocationRequest {
            tool,
            threads,
            args,
            preferred_node: None,
            smallest_first: false,
            allow_split: true,
        }
    }

    fn can_split(&self) -> bool {
        self.allow_split && self.tool.can_split()
    }
}

/// What a call to [`allocate`] actually started.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Allocation {
    pub pids: SmallVec<[Pid; 4]>,
    pub placed: usize,
    pub requested: usize,
    pub error: Option<LaunchError>,
}

impl Allocation {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.placed == self.requested
    }
}

/// Node indices in the order a request would try them.
///
/// Also returns the node that was pulled to the front for affinity, if any.
fn candidate_order(
    network: &mut Network,
    request: &AllocationRequest,
) -> (Vec<usize>, Option<usize>) {
    let mut order = network
        .by_free_ram()
        .into_iter()
        .filter(|&idx| 0 < network.threads_available(idx, request.tool))
        .collect::<Vec<_>>();

    // weaken and grow outlast everything else, keep them on home's cores
    let affinity = match request.preferred_node {
        Some(name) => network.node_index(name),
        None if matches!(request.tool, ToolKind::Weaken | ToolKind::Grow) => {
            order.iter().copied().find(|&idx| network.node(idx).is_home())
        },
        None => None,
    };

    let affinity = affinity.and_then(|a| order.iter().position(|&idx| idx == a));
    let affinity = affinity.map(|pos| {
        let idx = order.remove(pos);
        order.insert(0, idx);
        idx
    });

    // stable, so both groups keep their relative order
    let (mut normal, low): (Vec<usize>, Vec<usize>) = order
        .into_iter()
        .partition(|&idx| Some(idx) == affinity || !network.node(idx).is_low_priority());
    normal.extend(low);
    (normal, affinity)
}

/// Works out where every thread of a request would go.
///
/// On failure the error carries how many threads could be placed. For tools
/// that may split, the returned placements still hold what fits.
pub fn plan_allocation(
    network: &mut Network,
    request: &AllocationRequest,
) -> (Vec<Placement>, Option<LaunchError>) {
    let (order, affinity) = candidate_order(network, request);
    let mut packing = network
        .by_max_ram()
        .into_iter()
        .filter(|idx| order.contains(idx))
        .collect::<Vec<_>>();
    if request.smallest_first {
        packing.reverse();
    }

    let mut available = vec![0usize; network.nodes().len()];
    for &idx in order.iter() {
        available[idx] = network.threads_available(idx, request.tool);
    }

    let mut placements: Vec<Placement> = vec![];
    let mut remaining = request.threads;

    for &idx in order.iter() {
        if remaining == 0 {
            break;
        }

        let fits = available[idx];
        if fits == 0 {
            continue;
        }

        if remaining <= fits {
            // prefer one node that swallows everything, earlier in packing order
            let chosen = match affinity == Some(idx) {
                true => idx,
                false => packing
                    .iter()
                    .take_while(|&&p| p != idx)
                    .copied()
                    .find(|&p| {
                        remaining <= available[p] && !network.node(p).is_low_priority()
                    })
                    .unwrap_or(idx),
            };

            available[chosen] -= remaining;
            placements.push(Placement {
                node: chosen,
                threads: remaining,
            });
            remaining = 0;
        }
        else if request.can_split() {
            available[idx] = 0;
            placements.push(Placement {
                node: idx,
                threads: fits,
            });
            remaining -= fits;
        }
    }

    if remaining == 0 {
        return (placements, None);
    }

    let error = LaunchError::InsufficientRam {
        placed: request.threads - remaining,
        requested: request.threads,
    };

    match request.can_split() {
        true => (placements, Some(error)),
        false => (vec![], Some(error)),
    }
}

/// Starts one process, retrying with exponential back-off when the game
/// refuses.
pub async fn launch_with_retry(
    oracle: &impl Oracle,
    script: &str,
    host: &str,
    threads: usize,
    args: &[String],
    retries: usize,
    backoff: f64,
) -> Result<Pid, LaunchError> {
    let mut delay = backoff;

    for attempt in 0 ..= retries {
        if let Some(pid) = oracle.exec(script, host, threads, args) {
            return Ok(pid);
        }

        if attempt < retries {
            debug!(
                "exec of {} on {} refused, retrying in {}ms",
                script, host, delay
            );
            oracle.sleep(delay).await;
            delay *= 2.;
        }
    }

    Err(LaunchError::RetriesExhausted {
        host: host.to_owned(),
        attempts: retries + 1,
    })
}

/// Places and starts a request. Threads that started are reflected in the
/// network's RAM accounting.
///
/// If a tool that cannot split fails to start, nothing of it is left running.
pub async fn allocate(
    oracle: &impl Oracle,
    network: &mut Network,
    request: &AllocationRequest<'_>,
    retries: usize,
    backoff: f64,
) -> Allocation {
    let (placements, plan_error) = plan_allocation(network, request);
    let mut allocation = Allocation {
        requested: request.threads,
        error: plan_error,
        ..Allocation::default()
    };

    let script = request.tool.tool().script;
    for placement in placements {
        let host = network.node(placement.node).get_name().to_owned();

        if !network.node(placement.node).has_file(script.filename) {
            if !script.deploy_to_node(oracle, &host) {
                warn!("could not copy {} to {}", script.filename, &host);
                allocation.error = Some(LaunchError::RetriesExhausted {
                    host,
                    attempts: 0,
                });
                break;
            }
            network.node_mut(placement.node).mark_file(script.filename);
        }

        let launched = launch_with_retry(
            oracle,
            script.filename,
            &host,
            placement.threads,
            request.args,
            retries,
            backoff,
        )
        .await;

        match launched {
            Ok(pid) => {
                network.record_launch(
                    placement.node,
                    placement.threads as u64 * request.tool.ram_hundredths(),
                );
                allocation.pids.push(pid);
                allocation.placed += placement.threads;
            },
            Err(e) => {
                warn!("{}", e);
                allocation.error = Some(e);
                break;
            },
        }
    }

    if allocation.error.is_some() && !request.can_split() {
        for pid in allocation.pids.drain(..) {
            oracle.kill(pid);
        }
        allocation.placed = 0;
    }

    allocation
}

/// Reserves a job in a list of free RAM amounts, largest node first.
///
/// Used to simulate allocations without touching the network. Returns false,
/// leaving `free` untouched, if the job does not fit.
pub fn pack_into(
    free: &mut [u64],
    cost: u64,
    threads: usize,
    can_split: bool,
) -> bool {
    if threads == 0 {
        return true;
    }

    let needed = cost * threads as u64;

    if !can_split {
        // free is kept sorted descending, so the first node is the roomiest
        return match free.iter().position(|f| needed <= *f) {
            Some(pos) => {
                free[pos] -= needed;
                free.sort_unstable_by(|a, b| b.cmp(a));
                true
            },
            None => false,
        };
    }

    let capacity: usize = free.iter().map(|f| (f / cost) as usize).sum();
    if capacity < threads {
        return false;
    }

    let mut remaining = threads;
    for f in free.iter_mut() {
        let take = ((*f / cost) as usize).min(remaining);
        *f -= take as u64 * cost;
        remaining -= take;
        if remaining == 0 {
            break;
        }
    }
    free.sort_unstable_by(|a, b| b.cmp(a));

    true
}
