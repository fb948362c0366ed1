use clap::Args;
use log::LevelFilter;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    error::DaemonError,
    helpers::{
        default_helpers,
        HelperTool,
    },
};

const RESERVED_HOME_RAM: f64 = 32.;
const CYCLE_TIMING_DELAY: f64 = 4000.;
const QUEUE_DELAY: f64 = 1000.;
const LOOP_INTERVAL: f64 = 1000.;
const MAX_TICK_DURATION: f64 = 200.;
const MAX_BATCHES: usize = 40;
const MAX_TARGETS: usize = 2;
const INITIAL_STEAL_FRACTION: f64 = 0.6;
const MAX_STEAL_FRACTION: f64 = 0.9;
const RECOVERY_THREAD_PADDING: f64 = 1.;
const LOW_UTILIZATION: f64 = 0.8;
const HIGH_UTILIZATION: f64 = 0.95;
const LAUNCH_RETRIES: usize = 5;
const LAUNCH_BACKOFF: f64 = 20.;
const RESCAN_INTERVAL: usize = 30;
const HELPER_INTERVAL: f64 = 10_000.;
const STOP_FLAG_FILE: &str = "stop-batching.txt";

/// Knobs for the batching daemon. Every duration is in milliseconds and every
/// RAM amount in GB.
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// RAM on home kept free for interactive use.
    #[arg(long, default_value_t = RESERVED_HOME_RAM)]
    pub reserved_home_ram: f64,

    /// Spacing between batches. A quarter of it separates batch phases.
    #[arg(long, default_value_t = CYCLE_TIMING_DELAY)]
    pub cycle_timing_delay: f64,

    /// Offset between now and the first batch fire.
    #[arg(long, default_value_t = QUEUE_DELAY)]
    pub queue_delay: f64,

    #[arg(long, default_value_t = LOOP_INTERVAL)]
    pub loop_interval: f64,

    /// Wall-clock budget of one tick. Targets left over are skipped.
    #[arg(long, default_value_t = MAX_TICK_DURATION)]
    pub max_tick_duration: f64,

    /// Hard cap on batches in flight against a single target.
    #[arg(long, default_value_t = MAX_BATCHES)]
    pub max_batches: usize,

    /// Starting number of concurrently batched targets.
    #[arg(long, default_value_t = MAX_TARGETS)]
    pub max_targets: usize,

    #[arg(long, default_value_t = INITIAL_STEAL_FRACTION)]
    pub initial_steal_fraction: f64,

    #[arg(long, default_value_t = MAX_STEAL_FRACTION)]
    pub max_steal_fraction: f64,

    /// Multiplier on recovery grow/weaken threads to absorb misfires.
    #[arg(long, default_value_t = RECOVERY_THREAD_PADDING)]
    pub recovery_thread_padding: f64,

    /// Consider a target prepped once security is minimal, ignoring money.
    #[arg(long)]
    pub security_only: bool,

    /// Fire hacks immediately and skip the recovery phases.
    #[arg(long)]
    pub harvest_only: bool,

    /// Spend leftover RAM on experience farming.
    #[arg(long)]
    pub xp_mode: bool,

    /// Prep rooted targets that are still above our hacking level.
    #[arg(long)]
    pub prep_above_level: bool,

    #[arg(long, default_value_t = LOW_UTILIZATION)]
    pub low_utilization_threshold: f64,

    #[arg(long, default_value_t = HIGH_UTILIZATION)]
    pub high_utilization_threshold: f64,

    #[arg(long, default_value_t = LAUNCH_RETRIES)]
    pub launch_retries: usize,

    /// First back-off between exec retries; doubles on every retry.
    #[arg(long, default_value_t = LAUNCH_BACKOFF)]
    pub launch_backoff: f64,

    /// Ticks between full network rescans.
    #[arg(long, default_value_t = RESCAN_INTERVAL)]
    pub rescan_interval: usize,

    #[arg(long, default_value_t = HELPER_INTERVAL)]
    pub helper_interval: f64,

    /// File on home whose presence stops the daemon.
    #[arg(long, default_value_t = STOP_FLAG_FILE.to_owned())]
    pub stop_flag_file: String,

    #[arg(long, short)]
    pub verbose: bool,

    /// JSON object overriding any of the fields above.
    #[arg(long)]
    #[serde(skip)]
    pub config_json: Option<String>,

    #[arg(skip = default_helpers())]
    pub helpers: Vec<HelperTool>,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            reserved_home_ram: RESERVED_HOME_RAM,
            cycle_timing_delay: CYCLE_TIMING_DELAY,
            queue_delay: QUEUE_DELAY,
            loop_interval: LOOP_INTERVAL,
            max_tick_duration: MAX_TICK_DURATION,
            max_batches: MAX_BATCHES,
            max_targets: MAX_TARGETS,
            initial_steal_fraction: INITIAL_STEAL_FRACTION,
            max_steal_fraction: MAX_STEAL_FRACTION,
            recovery_thread_padding: RECOVERY_THREAD_PADDING,
            security_only: false,
            harvest_only: false,
            xp_mode: false,
            prep_above_level: false,
            low_utilization_threshold: LOW_UTILIZATION,
            high_utilization_threshold: HIGH_UTILIZATION,
            launch_retries: LAUNCH_RETRIES,
            launch_backoff: LAUNCH_BACKOFF,
            rescan_interval: RESCAN_INTERVAL,
            helper_interval: HELPER_INTERVAL,
            stop_flag_file: STOP_FLAG_FILE.to_owned(),
            verbose: false,
            config_json: None,
            helpers: default_helpers(),
        }
    }
}

impl DaemonConfig {
    /// Applies `--config-json` on top of the parsed flags, if present, and
    /// rejects values the scheduler can't work with.
    pub fn resolve(self) -> Result<DaemonConfig, DaemonError> {
        let config = match self.config_json.as_deref() {
            None => self,
            Some(json) => DaemonConfig::from_json(json)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DaemonError> {
        let durations = [
            ("cycle-timing-delay", self.cycle_timing_delay),
            ("loop-interval", self.loop_interval),
            ("launch-backoff", self.launch_backoff),
        ];
        for (name, value) in durations {
            if !(0. < value && value.is_finite()) {
                return Err(DaemonError::Setup(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let fractions = [
            ("initial-steal-fraction", self.initial_steal_fraction),
            ("max-steal-fraction", self.max_steal_fraction),
        ];
        for (name, value) in fractions {
            if !(0. < value && value <= 1.) {
                return Err(DaemonError::Setup(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<DaemonConfig, DaemonError> {
        let config: DaemonConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Gap between consecutive phases of one batch.
    pub fn phase_delay(&self) -> f64 {
        self.cycle_timing_delay / 4.
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_only_named_fields() {
        let config = DaemonConfig::from_json(
            r#"{ "max_targets": 5, "harvest_only": true }"#,
        )
        .unwrap();

        assert_eq!(config.max_targets, 5);
        assert!(config.harvest_only);
        assert_eq!(config.cycle_timing_delay, CYCLE_TIMING_DELAY);
        assert_eq!(config.helpers, default_helpers());
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let err = DaemonConfig::from_json("{ max_targets: }").unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn resolve_rejects_unusable_values() {
        assert!(DaemonConfig::default().resolve().is_ok());

        let config = DaemonConfig {
            cycle_timing_delay: 0.,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.resolve(), Err(DaemonError::Setup(_))));

        let config = DaemonConfig {
            launch_backoff: -5.,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.resolve(), Err(DaemonError::Setup(_))));

        let config = DaemonConfig {
            config_json: Some(r#"{ "max_steal_fraction": 1.5 }"#.to_owned()),
            ..DaemonConfig::default()
        };
        assert!(matches!(config.resolve(), Err(DaemonError::Setup(_))));

        let config = DaemonConfig {
            loop_interval: f64::NAN,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.resolve(), Err(DaemonError::Setup(_))));
    }

    #[test]
    fn phase_delay_is_a_quarter_of_the_cycle() {
        let config = DaemonConfig::default();
        assert_eq!(config.phase_delay(), CYCLE_TIMING_DELAY / 4.);
    }
}
