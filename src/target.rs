//! Per-target numeric model.
//!
//! Raw stats are snapshotted once per tick by [`Target::refresh`]; every
//! derived quantity is computed from that snapshot and cached until the next
//! refresh.

use std::cell::Cell;

use crate::{
    error::{
        DaemonError,
        FormulaUnavailable,
    },
    oracle::{
        Multipliers,
        Oracle,
        ServerProfile,
    },
    tools::ToolKind,
    utils::{
        ceil_threads,
        floor_threads,
    },
};

pub const WEAKEN_SECURITY_DECREASE: f64 = 0.05;
pub const HACK_SECURITY_INCREASE: f64 = 0.002;
pub const GROW_SECURITY_INCREASE: f64 = 0.004;

const PREP_TOLERANCE: f64 = 0.01;
const MAX_ADJUSTED_GROWTH_RATE: f64 = 1.0035;
const BASE_GROWTH_RATE: f64 = 0.03;
const HACK_BALANCE_FACTOR: f64 = 240.;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LiveStats {
    pub security: f64,
    pub money: f64,
    pub has_root: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timings {
    pub hack: f64,
    pub grow: f64,
    pub weaken: f64,
}

impl Timings {
    pub fn longest(&self) -> f64 {
        self.hack.max(self.grow).max(self.weaken)
    }
}

/// Player-wide inputs to the model, shared by every target in a tick.
#[derive(Clone, Copy, Debug)]
pub struct ModelParams {
    pub hacking_level: u32,
    pub multipliers: Multipliers,
    pub recovery_padding: f64,
    pub security_only: bool,
}

impl Default for ModelParams {
    fn default() -> ModelParams {
        ModelParams {
            hacking_level: 1,
            multipliers: Multipliers::default(),
            recovery_padding: 1.,
            security_only: false,
        }
    }
}

/// Threads for one batch against a prepped target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchThreads {
    pub hack: usize,
    pub weaken_after_hack: usize,
    pub grow: usize,
    pub weaken_after_grow: usize,
}

impl BatchThreads {
    pub fn ram_hundredths(&self) -> u64 {
        self.hack as u64 * ToolKind::Hack.ram_hundredths()
            + (self.weaken_after_hack + self.weaken_after_grow) as u64
                * ToolKind::Weaken.ram_hundredths()
            + self.grow as u64 * ToolKind::Grow.ram_hundredths()
    }
}

#[derive(Debug)]
pub struct Target {
    profile: ServerProfile,
    stats: LiveStats,
    timings: Timings,
    hack_chance: f64,
    formula_percent: Result<f64, FormulaUnavailable>,
    params: ModelParams,
    steal_fraction: f64,

    // per-tick caches
    fraction_per_thread: Cell<Option<f64>>,
    prepped: Cell<Option<bool>>,
}

impl Target {
    pub fn new(
        profile: ServerProfile,
        steal_fraction: f64,
    ) -> Target {
        let stats = LiveStats {
            security: profile.min_security,
            money: profile.max_money,
            has_root: false,
        };

        Target {
            profile,
            stats,
            timings: Timings::default(),
            hack_chance: 1.,
            formula_percent: Err(FormulaUnavailable),
            params: ModelParams::default(),
            steal_fraction,
            fraction_per_thread: Cell::new(None),
            prepped: Cell::new(None),
        }
    }

    /// Re-reads live stats from the game and drops every cached value.
    pub fn refresh(
        &mut self,
        oracle: &impl Oracle,
        params: ModelParams,
    ) {
        let name = self.get_name();
        let stats = LiveStats {
            security: oracle.security_level(name),
            money: oracle.money_available(name),
            has_root: oracle.has_root(name),
        };

        // the rest only matters for something we could act on
        let (timings, chance, formula) = if stats.has_root && 0. < self.profile.max_money {
            let timings = Timings {
                hack: oracle.hack_time(name),
                grow: oracle.grow_time(name),
                weaken: oracle.weaken_time(name),
            };
            let chance = oracle.hack_chance(name);
            let formula = oracle.hack_percent_at_min_security(name);

            (timings, chance, formula)
        }
        else {
            (self.timings, self.hack_chance, Err(FormulaUnavailable))
        };

        self.update(stats, timings, chance, formula, params);
    }

    pub fn update(
        &mut self,
        stats: LiveStats,
        timings: Timings,
        hack_chance: f64,
        formula_percent: Result<f64, FormulaUnavailable>,
        params: ModelParams,
    ) {
        self.stats = stats;
        self.timings = timings;
        self.hack_chance = hack_chance;
        self.formula_percent = formula_percent;
        self.params = params;
        self.reset_caches();
    }

    /// Must be called whenever the live stats change under us.
    pub fn reset_caches(&self) {
        self.fraction_per_thread.set(None);
        self.prepped.set(None);
    }

    pub fn set_profile(
        &mut self,
        profile: ServerProfile,
    ) {
        self.profile = profile;
        self.reset_caches();
    }

    pub fn get_name(&self) -> &str {
        &*self.profile.hostname
    }

    #[cfg(test)]
    pub fn get_stats(&self) -> LiveStats {
        self.stats
    }

    pub fn get_timings(&self) -> Timings {
        self.timings
    }

    pub fn get_security(&self) -> f64 {
        self.stats.security
    }

    pub fn get_money(&self) -> f64 {
        self.stats.money
    }

    pub fn get_min_security(&self) -> f64 {
        self.profile.min_security
    }

    pub fn get_max_money(&self) -> f64 {
        self.profile.max_money
    }

    pub fn get_required_level(&self) -> u32 {
        self.profile.required_hacking_level
    }

    pub fn get_hack_chance(&self) -> f64 {
        self.hack_chance
    }

    pub fn is_root(&self) -> bool {
        self.stats.has_root
    }

    pub fn is_hackable(&self) -> bool {
        self.profile.required_hacking_level <= self.params.hacking_level
    }

    /// Nothing to gain from this one.
    pub fn is_ignored(&self) -> bool {
        self.profile.player_owned || self.profile.max_money <= 0.
    }

    pub fn time_to_weaken(&self) -> f64 {
        self.timings.weaken
    }

    pub fn get_steal_fraction(&self) -> f64 {
        self.steal_fraction
    }

    pub fn set_steal_fraction(
        &mut self,
        fraction: f64,
    ) {
        self.steal_fraction = fraction.clamp(0., 1.);
    }

    /// Rejects stats no real server can have.
    pub fn check_consistency(&self) -> Result<(), DaemonError> {
        let inconsistent = |reason| DaemonError::InconsistentTarget {
            target: self.get_name().to_owned(),
            reason,
        };

        if !self.stats.security.is_finite() || self.stats.security < 0. {
            return Err(inconsistent("security is not a positive number"));
        }

        if !self.stats.money.is_finite() || self.stats.money < 0. {
            return Err(inconsistent("money is not a positive number"));
        }

        if !(0. < self.profile.min_security) {
            return Err(inconsistent("minimum security is not positive"));
        }

        if self.stats.has_root && !self.is_ignored() {
            let t = &self.timings;
            if !(0. < t.hack && 0. < t.grow && 0. < t.weaken) {
                return Err(inconsistent("operation durations are not positive"));
            }
        }

        Ok(())
    }

    /// Security and money are both within tolerance of their optimum.
    pub fn is_prepped(&self) -> bool {
        if let Some(prepped) = self.prepped.get() {
            return prepped;
        }

        let min_security = self.get_min_security();
        let security_ok =
            self.get_security() <= min_security * (1. + PREP_TOLERANCE);
        let money_ok = self.params.security_only
            || self.get_max_money() * (1. - PREP_TOLERANCE) <= self.get_money();

        let prepped = security_ok && money_ok;
        self.prepped.set(Some(prepped));
        prepped
    }

    /// Closed-form estimate of the money one hack thread steals at minimum
    /// security.
    pub fn fallback_fraction_per_thread(&self) -> f64 {
        let level = self.params.hacking_level.max(1) as f64;
        let required = self.profile.required_hacking_level as f64;
        let mults = &self.params.multipliers;

        let difficulty_mult = (100. - self.get_min_security()) / 100.;
        let skill_mult = (level - (required - 1.)) / level;

        let percent = difficulty_mult * skill_mult * mults.hacking_money
            * mults.script_hack_money
            / HACK_BALANCE_FACTOR;

        percent.clamp(0., 1.)
    }

    pub fn fraction_per_thread(&self) -> f64 {
        if let Some(fraction) = self.fraction_per_thread.get() {
            return fraction;
        }

        let fraction = match self.formula_percent {
            Ok(percent) if percent.is_finite() => percent.clamp(0., 1.),
            _ => self.fallback_fraction_per_thread(),
        };

        self.fraction_per_thread.set(Some(fraction));
        fraction
    }

    pub fn hack_threads_for(
        &self,
        fraction: f64,
    ) -> usize {
        let per_thread = self.fraction_per_thread();
        if per_thread <= 0. {
            return 0;
        }

        floor_threads(fraction / per_thread)
    }

    pub fn hack_threads_needed(&self) -> usize {
        self.hack_threads_for(self.steal_fraction)
    }

    /// Share of money actually taken by a number of hack threads.
    pub fn stolen_fraction(
        &self,
        hack_threads: usize,
    ) -> f64 {
        (hack_threads as f64 * self.fraction_per_thread()).min(1.)
    }

    pub fn adjusted_growth_rate(&self) -> f64 {
        (1. + BASE_GROWTH_RATE / self.get_min_security()).min(MAX_ADJUSTED_GROWTH_RATE)
    }

    pub fn server_growth_percentage(&self) -> f64 {
        let mults = &self.params.multipliers;
        self.profile.growth / 100. * mults.server_growth_rate * mults.hacking_grow
    }

    pub fn cycles_for_growth_coefficient(
        &self,
        coefficient: f64,
    ) -> f64 {
        if coefficient <= 1. || !coefficient.is_finite() {
            return 0.;
        }

        let per_cycle =
            self.adjusted_growth_rate().ln() * self.server_growth_percentage();
        if per_cycle <= 0. {
            return f64::INFINITY;
        }

        coefficient.ln() / per_cycle
    }

    /// Money after growing from a balance of `money` with `threads` threads.
    pub fn money_after_grow(
        &self,
        money: f64,
        threads: usize,
    ) -> f64 {
        let exponent = threads as f64 * self.server_growth_percentage();
        let grown = (money + threads as f64) * self.adjusted_growth_rate().powf(exponent);

        grown.min(self.get_max_money())
    }

    pub fn target_growth_coefficient(&self) -> f64 {
        self.get_max_money() / self.get_money().max(1.)
    }

    pub fn target_growth_coefficient_after_theft(
        &self,
        hack_threads: usize,
    ) -> f64 {
        let stolen = self.stolen_fraction(hack_threads);
        if 1. <= stolen {
            return f64::INFINITY;
        }

        1. / (1. - stolen)
    }

    pub fn grow_threads_needed(&self) -> usize {
        let cycles = self.cycles_for_growth_coefficient(self.target_growth_coefficient());
        if !cycles.is_finite() {
            return 0;
        }

        ceil_threads(cycles)
    }

    pub fn grow_threads_needed_after_theft(
        &self,
        hack_threads: usize,
    ) -> usize {
        let cycles = self.cycles_for_growth_coefficient(
            self.target_growth_coefficient_after_theft(hack_threads),
        );
        if !cycles.is_finite() {
            return 0;
        }

        self.padded(cycles)
    }

    pub fn weaken_potency(&self) -> f64 {
        WEAKEN_SECURITY_DECREASE * self.params.multipliers.server_weaken_rate
    }

    pub fn weaken_threads_needed(&self) -> usize {
        let excess = self.get_security() - self.get_min_security();
        ceil_threads(excess / self.weaken_potency())
    }

    pub fn weaken_threads_needed_after_theft(
        &self,
        hack_threads: usize,
    ) -> usize {
        self.padded(hack_threads as f64 * HACK_SECURITY_INCREASE / self.weaken_potency())
    }

    pub fn weaken_threads_needed_after_growth(
        &self,
        grow_threads: usize,
    ) -> usize {
        self.padded(grow_threads as f64 * GROW_SECURITY_INCREASE / self.weaken_potency())
    }

    /// Weaken threads that undo the security raised by unpadded prep grows.
    pub fn weaken_threads_to_offset_grow(
        &self,
        grow_threads: usize,
    ) -> usize {
        ceil_threads(grow_threads as f64 * GROW_SECURITY_INCREASE / self.weaken_potency())
    }

    fn padded(
        &self,
        threads: f64,
    ) -> usize {
        if threads <= 0. {
            return 0;
        }

        let padding = self.params.recovery_padding;
        let padded = ceil_threads(threads * padding);

        if 1. < padding {
            padded.max(2)
        }
        else {
            padded.max(1)
        }
    }

    /// Threads for one batch at a given number of hack threads.
    pub fn batch_threads(
        &self,
        hack_threads: usize,
    ) -> BatchThreads {
        let grow = self.grow_threads_needed_after_theft(hack_threads);

        BatchThreads {
            hack: hack_threads,
            weaken_after_hack: self.weaken_threads_needed_after_theft(hack_threads),
            grow,
            weaken_after_grow: self.weaken_threads_needed_after_growth(grow),
        }
    }

    /// Expected money per GB of RAM per second spent on this target.
    pub fn value_per_ram_second(&self) -> f64 {
        let hack_threads = self.hack_threads_needed().max(1);
        let threads = self.batch_threads(hack_threads);

        let ram_gb = threads.ram_hundredths() as f64 / 100.;
        let seconds = self.time_to_weaken() / 1000.;
        if ram_gb <= 0. || seconds <= 0. {
            return 0.;
        }

        let stolen = self.stolen_fraction(hack_threads)
            * self.get_max_money()
            * self.hack_chance;

        stolen / (ram_gb * seconds)
    }
}
