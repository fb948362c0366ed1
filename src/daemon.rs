//! The targeting loop.
//!
//! Every tick refreshes what is known about the network, walks the targets in
//! priority order and decides, for each one, whether to root, prep, batch or
//! leave it. All scheduler state lives in [`SchedulerContext`].

use itertools::Itertools;
use log::{
    debug,
    error,
    info,
    warn,
};
use smallvec::SmallVec;

use crate::{
    allocator::{
        allocate,
        AllocationRequest,
    },
    batch::{
        paced_cycles,
        plan_batches,
    },
    config::DaemonConfig,
    error::DaemonError,
    helpers::{
        HelperRegistry,
        HelperState,
    },
    logging,
    machine::get_machines,
    network::Network,
    oracle::{
        Oracle,
        Pid,
        HOME,
    },
    prep::prep_target,
    registry::{
        WorkMode,
        WorkRegistry,
    },
    target::ModelParams,
    tools::{
        all_script_names,
        install_tools,
        ToolKind,
    },
    tuner::optimize_steal_fraction,
    utils::{
        format_duration,
        format_money,
    },
};

/// Ticks of high utilization with failures before the target cap drops.
const HIGH_UTILIZATION_TICKS: usize = 5;
/// Fewest ticks of low utilization before the target cap rises.
const MIN_LOW_UTILIZATION_TICKS: usize = 5;
/// Relative swing of the tuned steal fraction worth telling the player about.
const STEAL_DIVERGENCE: f64 = 0.5;

/// What happened to one target during a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetStatus {
    Ignored,
    NotRooted,
    AboveCapability,
    AlreadyTargeting,
    AlreadyPrepping,
    CapacityCapped,
    NewlyPrepped,
    PrepFailed,
    TargetCapReached,
    NewlyScheduled,
    ScheduleFailed,
    /// The tick ran out of time before getting to it.
    Skipped,
    /// The target reported data that made no sense.
    Errored,
}

impl TargetStatus {
    pub fn label(&self) -> &'static str {
        use TargetStatus::*;

        match self {
            Ignored => "ignored",
            NotRooted => "not rooted",
            AboveCapability => "above level",
            AlreadyTargeting => "targeting",
            AlreadyPrepping => "prepping",
            CapacityCapped => "capped",
            NewlyPrepped => "prep started",
            PrepFailed => "prep failed",
            TargetCapReached => "waiting",
            NewlyScheduled => "scheduled",
            ScheduleFailed => "schedule failed",
            Skipped => "skipped",
            Errored => "error",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub statuses: Vec<(String, TargetStatus)>,
    pub failures: usize,
    pub scheduled_batches: usize,
    /// Share of rooted RAM in use at the end of the tick.
    pub utilization: f64,
    pub max_targets: usize,
}

impl TickReport {
    pub fn status_of(
        &self,
        target: &str,
    ) -> Option<TargetStatus> {
        self.statuses
            .iter()
            .find(|(name, _)| name == target)
            .map(|(_, status)| *status)
    }

    fn names_with(
        &self,
        statuses: &[TargetStatus],
    ) -> String {
        self.statuses
            .iter()
            .filter(|(_, s)| statuses.contains(s))
            .map(|(name, _)| name.as_str())
            .join(", ")
    }

    /// One line describing the tick, without anything that changes every
    /// tick regardless of decisions.
    fn summary(&self) -> String {
        use TargetStatus::*;

        let counts = self
            .statuses
            .iter()
            .map(|(_, s)| *s)
            .filter(|s| {
                !matches!(
                    s,
                    AlreadyTargeting | NewlyScheduled | AlreadyPrepping | NewlyPrepped
                )
            })
            .counts()
            .into_iter()
            .sorted()
            .map(|(status, count)| format!("{} {}", count, status.label()))
            .join(", ");

        format!(
            "targeting [{}] prepping [{}] cap {} | {}",
            self.names_with(&[AlreadyTargeting, NewlyScheduled]),
            self.names_with(&[AlreadyPrepping, NewlyPrepped]),
            self.max_targets,
            counts
        )
    }
}

/// Per-tick counters shared by every classification in the tick.
#[derive(Clone, Copy, Debug, Default)]
struct TickBudget {
    active: usize,
    prepping: usize,
    ram_exhausted: bool,
    failures: usize,
    scheduled_batches: usize,
}

/// Everything the scheduler keeps between ticks.
pub struct SchedulerContext {
    pub config: DaemonConfig,
    pub network: Network,
    pub registry: WorkRegistry,
    pub helpers: HelperRegistry,
    params: ModelParams,
    tick: usize,
    max_targets: usize,
    low_streak: usize,
    high_streak: usize,
    next_batch_id: usize,
    force_rescan: bool,
    last_status: String,
}

impl SchedulerContext {
    pub fn new(config: DaemonConfig) -> SchedulerContext {
        let network = Network::new(config.reserved_home_ram, config.initial_steal_fraction);

        SchedulerContext {
            max_targets: config.max_targets.max(1),
            params: ModelParams {
                hacking_level: 0,
                recovery_padding: config.recovery_thread_padding,
                security_only: config.security_only,
                ..ModelParams::default()
            },
            config,
            network,
            registry: WorkRegistry::new(),
            helpers: HelperRegistry::new(),
            tick: 0,
            low_streak: 0,
            high_streak: 0,
            next_batch_id: 0,
            force_rescan: true,
            last_status: String::new(),
        }
    }
}

pub struct Daemon<'o, O: Oracle> {
    oracle: &'o O,
    ctx: SchedulerContext,
}

impl<'o, O: Oracle> Daemon<'o, O> {
    pub fn new(
        oracle: &'o O,
        config: DaemonConfig,
    ) -> Daemon<'o, O> {
        Daemon {
            oracle,
            ctx: SchedulerContext::new(config),
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn max_targets(&self) -> usize {
        self.ctx.max_targets
    }

    /// Runs until the stop flag appears on home.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        self.run_limited(None).await
    }

    /// Runs until the stop flag appears or `max_ticks` ticks have passed.
    pub async fn run_limited(
        &mut self,
        max_ticks: Option<usize>,
    ) -> Result<(), DaemonError> {
        let oracle = self.oracle;
        install_tools(oracle)?;
        info!(
            "daemon started: {} targets max, {} between batches",
            self.ctx.max_targets,
            format_duration(self.ctx.config.cycle_timing_delay)
        );

        let mut ticks = 0;
        loop {
            if oracle.file_exists(&self.ctx.config.stop_flag_file, HOME) {
                info!("found {}, stopping", self.ctx.config.stop_flag_file);
                break;
            }
            if max_ticks.map_or(false, |max| max <= ticks) {
                break;
            }

            if let Err(e) = self.tick().await {
                error!("tick {} failed: {}", self.ctx.tick, e);
            }
            self.flush_log();

            ticks += 1;
            oracle.sleep(self.ctx.config.loop_interval).await;
        }

        self.ctx.helpers.shutdown(oracle);
        if let Some(last) = self.ctx.registry.latest_completion() {
            info!("work in flight settles in {}", format_duration(last - oracle.now()));
        }
        self.flush_log();
        Ok(())
    }

    fn flush_log(&self) {
        for line in logging::drain() {
            self.oracle.print(&line);
        }
    }

    /// One pass over every known target.
    pub async fn tick(&mut self) -> Result<TickReport, DaemonError> {
        let oracle = self.oracle;
        let tick_start = oracle.now();
        self.ctx.tick += 1;
        self.ctx.registry.expire(tick_start);

        let level = oracle.hacking_level();
        let rescan_interval = self.ctx.config.rescan_interval.max(1);
        let rescan = self.ctx.force_rescan
            || level != self.ctx.params.hacking_level
            || (self.ctx.tick - 1) % rescan_interval == 0;

        if rescan {
            let machines = get_machines(oracle);
            if machines.is_empty() {
                return Err(DaemonError::Oracle {
                    host: HOME.to_owned(),
                    what: "network scan found nothing",
                });
            }

            let version = self.ctx.network.get_topology_version();
            self.ctx.network.sync(oracle, machines);
            if version != self.ctx.network.get_topology_version() {
                debug!("topology changed on tick {}", self.ctx.tick);
            }
            self.ctx.force_rescan = false;
        }

        if self.ctx.tick == 1 {
            self.reap_strays();
        }

        self.ctx.params.hacking_level = level;
        self.ctx.params.multipliers = oracle.multipliers();
        self.ctx.network.refresh_nodes(oracle);
        self.ctx.network.refresh_targets(oracle, self.ctx.params);

        let helper_state = HelperState {
            hacking_level: level,
            home_max_ram: oracle.max_ram(HOME),
            reserved_home_ram: self.ctx.config.reserved_home_ram,
        };
        self.ctx
            .helpers
            .run(oracle, &mut self.ctx.network, &self.ctx.config, &helper_state)
            .await;

        let mut budget = TickBudget {
            active: self.ctx.registry.count(WorkMode::Batch),
            prepping: self.ctx.registry.count(WorkMode::Prep),
            ..TickBudget::default()
        };
        let mut report = TickReport::default();

        for idx in self.targeting_order() {
            let name = self.ctx.network.target(idx).get_name().to_owned();

            let status = if self.ctx.config.max_tick_duration < oracle.now() - tick_start {
                TargetStatus::Skipped
            }
            else {
                match self.classify(idx, &mut budget).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("{}", e);
                        TargetStatus::Errored
                    },
                }
            };

            debug!("{}: {}", name, status.label());
            report.statuses.push((name, status));
        }

        if self.ctx.config.xp_mode {
            self.farm_xp().await;
        }

        let (used, total) = self.ctx.network.utilization();
        report.utilization = match total {
            0 => 1.,
            _ => used as f64 / total as f64,
        };
        report.failures = budget.failures;
        report.scheduled_batches = budget.scheduled_batches;

        self.adapt_concurrency(&report);
        report.max_targets = self.ctx.max_targets;
        self.report_status(&report);

        Ok(report)
    }

    /// Kills workers left behind by an earlier run. They resolve on a schedule
    /// nothing here knows about.
    fn reap_strays(&mut self) -> usize {
        let oracle = self.oracle;
        let scripts = all_script_names();
        let mut reaped = 0;

        for node in self.ctx.network.nodes() {
            for process in oracle.processes(node.get_name()) {
                if scripts.contains(&process.filename.as_str()) && oracle.kill(process.pid) {
                    reaped += 1;
                }
            }
        }

        if 0 < reaped {
            warn!("killed {} workers left by an earlier run", reaped);
        }
        reaped
    }

    /// Target indices in the order they get a shot at RAM this tick.
    ///
    /// The best target that still needs prepping jumps the queue so something
    /// is always being readied, however low the target cap.
    fn targeting_order(&mut self) -> Vec<usize> {
        let mut order = self.ctx.network.by_priority();
        let network = &self.ctx.network;
        let registry = &self.ctx.registry;

        let promoted = order.iter().position(|&idx| {
            let target = network.target(idx);
            let name = target.get_name();

            !target.is_ignored()
                && target.is_root()
                && target.is_hackable()
                && !target.is_prepped()
                && !registry.is_being_worked(name, WorkMode::Prep)
                && !registry.is_being_worked(name, WorkMode::Batch)
        });

        if let Some(pos) = promoted {
            let idx = order.remove(pos);
            order.insert(0, idx);
        }

        order
    }

    async fn classify(
        &mut self,
        idx: usize,
        budget: &mut TickBudget,
    ) -> Result<TargetStatus, DaemonError> {
        use TargetStatus::*;

        let oracle = self.oracle;
        let target = self.ctx.network.target(idx);
        target.check_consistency()?;

        if target.is_ignored() {
            return Ok(Ignored);
        }

        let name = target.get_name().to_owned();
        if !target.is_root() {
            if !oracle.try_root(&name) {
                return Ok(NotRooted);
            }

            info!("gained root on {}", name);
            self.ctx.force_rescan = true;
            self.ctx.network.target_mut(idx).refresh(oracle, self.ctx.params);
            self.ctx.network.target(idx).check_consistency()?;
        }

        if self.ctx.registry.is_being_worked(&name, WorkMode::Batch) {
            return Ok(AlreadyTargeting);
        }
        if self.ctx.registry.is_being_worked(&name, WorkMode::Prep) {
            return Ok(AlreadyPrepping);
        }

        let target = self.ctx.network.target(idx);
        if !target.is_hackable() {
            debug!("{} needs hacking level {}", name, target.get_required_level());
            let wants_prep = self.ctx.config.prep_above_level
                && !target.is_prepped()
                && !budget.ram_exhausted
                && budget.prepping < self.ctx.max_targets;

            if wants_prep && self.prep(idx).await == Some(true) {
                budget.prepping += 1;
            }
            return Ok(AboveCapability);
        }

        if target.is_prepped() {
            if self.ctx.max_targets <= budget.active {
                return Ok(TargetCapReached);
            }
            if budget.ram_exhausted {
                return Ok(CapacityCapped);
            }

            return Ok(match self.schedule(idx, budget).await {
                true => {
                    budget.active += 1;
                    NewlyScheduled
                },
                false => {
                    budget.failures += 1;
                    budget.ram_exhausted = true;
                    ScheduleFailed
                },
            });
        }

        if budget.ram_exhausted || self.ctx.max_targets <= budget.prepping {
            return Ok(CapacityCapped);
        }

        Ok(match self.prep(idx).await {
            Some(true) => {
                budget.prepping += 1;
                NewlyPrepped
            },
            Some(false) => {
                if self.ctx.registry.is_being_worked(&name, WorkMode::Prep) {
                    budget.prepping += 1;
                }
                budget.failures += 1;
                budget.ram_exhausted = true;
                PrepFailed
            },
            None => AlreadyTargeting,
        })
    }

    async fn prep(
        &mut self,
        idx: usize,
    ) -> Option<bool> {
        let ctx = &mut self.ctx;
        prep_target(self.oracle, &mut ctx.network, &mut ctx.registry, idx, &ctx.config).await
    }

    /// Tunes and launches a round of batches. False if not even one batch
    /// could be started.
    async fn schedule(
        &mut self,
        idx: usize,
        budget: &mut TickBudget,
    ) -> bool {
        let oracle = self.oracle;
        let ctx = &mut self.ctx;
        let now = oracle.now();

        let target = ctx.network.target(idx);
        let name = target.get_name().to_owned();
        let optimal = paced_cycles(target, &ctx.config);
        let free = ctx.network.free_ram_snapshot(ToolKind::Weaken);
        let outcome = optimize_steal_fraction(
            target,
            &free,
            optimal,
            ctx.config.max_steal_fraction,
            ctx.config.harvest_only,
        );

        if outcome.hack_threads == 0 || outcome.cycles == 0 {
            warn!("{}: not enough RAM for a single batch", name);
            return false;
        }

        let intended = target.get_steal_fraction();
        let divergence = (outcome.fraction - intended).abs() / intended.max(f64::EPSILON);
        if STEAL_DIVERGENCE < divergence {
            let message = format!(
                "{}: steal per batch moved from {:.1}% to {:.1}%",
                name,
                intended * 100.,
                outcome.fraction * 100.
            );
            warn!("{}", message);
            oracle.notify(&message);
        }

        ctx.network.target_mut(idx).set_steal_fraction(outcome.fraction);
        let target = ctx.network.target(idx);
        let batches = plan_batches(
            target,
            outcome.hack_threads,
            now,
            outcome.cycles.min(optimal),
            &ctx.config,
            ctx.next_batch_id,
        );
        ctx.next_batch_id += batches.len();
        let expected = target.stolen_fraction(outcome.hack_threads)
            * target.get_max_money()
            * target.get_hack_chance();

        let mut pids: SmallVec<[Pid; 8]> = SmallVec::new();
        let mut launched = 0;
        let mut completes_at = now;

        'batches: for batch in batches.iter() {
            let mut batch_pids: SmallVec<[Pid; 8]> = SmallVec::new();

            for item in batch.allocation_order() {
                let args = item.args(&name);
                let request = AllocationRequest::new(item.tool, item.threads, &args);
                let allocation = allocate(
                    oracle,
                    &mut ctx.network,
                    &request,
                    ctx.config.launch_retries,
                    ctx.config.launch_backoff,
                )
                .await;
                batch_pids.extend(allocation.pids.iter().copied());

                if !allocation.is_success() {
                    // a partial batch would leave the target off balance
                    for pid in batch_pids {
                        oracle.kill(pid);
                    }
                    break 'batches;
                }
            }

            pids.extend(batch_pids);
            launched += 1;
            completes_at = completes_at.max(batch.last_resolve);
        }

        if launched == 0 {
            return false;
        }

        if launched < batches.len() {
            warn!("{}: only {} of {} batches fit", name, launched, batches.len());
        }

        info!(
            "{}: {} batches of {} hack threads, {} each, done in {}",
            name,
            launched,
            outcome.hack_threads,
            format_money(expected),
            format_duration(completes_at - now)
        );

        ctx.registry.record(&name, WorkMode::Batch, completes_at, pids);
        budget.scheduled_batches += launched;
        true
    }

    /// Spends leftover RAM weakening the quickest target for experience.
    async fn farm_xp(&mut self) {
        let oracle = self.oracle;
        let ctx = &mut self.ctx;

        let quickest = ctx
            .network
            .targets()
            .iter()
            .filter(|t| !t.is_ignored() && t.is_root() && t.is_hackable())
            .filter(|t| 0. < t.time_to_weaken())
            .min_by(|a, b| a.time_to_weaken().total_cmp(&b.time_to_weaken()))
            .map(|t| (t.get_name().to_owned(), t.time_to_weaken()));

        let Some((name, weaken_time)) = quickest
        else {
            return;
        };

        let threads = ctx.network.total_threads_available(ToolKind::ExperienceHack);
        if threads == 0 {
            return;
        }

        let now = oracle.now();
        let args = vec![name.clone(), format!("{}", now.round()), "xp".to_owned()];
        let request = AllocationRequest::new(ToolKind::ExperienceHack, threads, &args);
        let allocation = allocate(
            oracle,
            &mut ctx.network,
            &request,
            ctx.config.launch_retries,
            ctx.config.launch_backoff,
        )
        .await;

        if !allocation.pids.is_empty() {
            debug!("{}: {} xp threads", name, allocation.placed);
            ctx.registry
                .record(&name, WorkMode::Xp, now + weaken_time, allocation.pids);
        }
    }

    /// Raises the target cap while RAM sits idle, lowers it while RAM is full
    /// and launches still fail.
    fn adapt_concurrency(
        &mut self,
        report: &TickReport,
    ) {
        let ctx = &mut self.ctx;

        if report.utilization < ctx.config.low_utilization_threshold {
            ctx.low_streak += 1;
            ctx.high_streak = 0;
        }
        else if ctx.config.high_utilization_threshold <= report.utilization
            && 0 < report.failures
        {
            ctx.high_streak += 1;
            ctx.low_streak = 0;
        }
        else {
            ctx.low_streak = 0;
            ctx.high_streak = 0;
        }

        // a raised cap only shows once the slowest round has cycled
        let slowest = ctx
            .network
            .targets()
            .iter()
            .filter(|t| ctx.registry.is_being_worked(t.get_name(), WorkMode::Batch))
            .map(|t| t.time_to_weaken())
            .fold(0., f64::max);
        let cycle = (slowest + ctx.config.cycle_timing_delay) / ctx.config.loop_interval.max(1.);
        let low_ticks = MIN_LOW_UTILIZATION_TICKS.max(cycle.ceil() as usize);

        if low_ticks <= ctx.low_streak {
            let limit = ctx.network.targets().len().max(1);
            if ctx.max_targets < limit {
                ctx.max_targets += 1;
                info!("RAM is idle, targeting up to {} servers", ctx.max_targets);
            }
            ctx.low_streak = 0;
        }

        if HIGH_UTILIZATION_TICKS <= ctx.high_streak {
            if 1 < ctx.max_targets {
                ctx.max_targets -= 1;
                info!("RAM is exhausted, targeting up to {} servers", ctx.max_targets);
            }
            ctx.high_streak = 0;
        }
    }

    fn report_status(
        &mut self,
        report: &TickReport,
    ) {
        let summary = report.summary();
        if summary != self.ctx.last_status {
            info!("{} | RAM {:.0}%", summary, report.utilization * 100.);
            self.ctx.last_status = summary;
        }
    }
}
