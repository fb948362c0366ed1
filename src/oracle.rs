//! The game as seen by the daemon.
//!
//! Everything the scheduler needs from the outside world goes through
//! [`Oracle`] and [`Clock`]. In game these are backed by the netscript
//! bindings; tests use a deterministic simulation.

use crate::error::{
    DaemonError,
    FormulaUnavailable,
};

pub type Pid = usize;

pub const HOME: &str = "home";

/// Constant details about a server. These only change on augmentation.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerProfile {
    pub hostname: String,
    pub max_money: f64,
    pub min_security: f64,
    pub growth: f64,
    pub required_hacking_level: u32,
    pub required_open_ports: usize,
    pub player_owned: bool,
    pub cpu_cores: usize,
    /// Hacknet nodes and the like; they lose income when their RAM is used.
    pub low_priority: bool,
}

/// Global multipliers that scale the closed-form fallbacks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Multipliers {
    pub hacking_money: f64,
    pub hacking_grow: f64,
    pub script_hack_money: f64,
    pub server_growth_rate: f64,
    pub server_weaken_rate: f64,
}

impl Default for Multipliers {
    fn default() -> Multipliers {
        Multipliers {
            hacking_money: 1.,
            hacking_grow: 1.,
            script_hack_money: 1.,
            server_growth_rate: 1.,
            server_weaken_rate: 1.,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub filename: String,
    pub threads: usize,
    pub args: Vec<String>,
}

pub trait Clock {
    /// Milliseconds since the epoch.
    fn now(&self) -> f64;
}

#[allow(async_fn_in_trait)]
pub trait Oracle: Clock {
    fn scan(
        &self,
        host: &str,
    ) -> Vec<String>;

    fn server_profile(
        &self,
        host: &str,
    ) -> Result<ServerProfile, DaemonError>;

    fn has_root(
        &self,
        host: &str,
    ) -> bool;

    /// Opens whatever ports we can and attempts to gain root.
    fn try_root(
        &self,
        host: &str,
    ) -> bool;

    fn security_level(
        &self,
        host: &str,
    ) -> f64;

    fn money_available(
        &self,
        host: &str,
    ) -> f64;

    fn max_ram(
        &self,
        host: &str,
    ) -> f64;

    fn used_ram(
        &self,
        host: &str,
    ) -> f64;

    fn hacking_level(&self) -> u32;

    fn multipliers(&self) -> Multipliers;

    fn hack_time(
        &self,
        host: &str,
    ) -> f64;

    fn grow_time(
        &self,
        host: &str,
    ) -> f64;

    fn weaken_time(
        &self,
        host: &str,
    ) -> f64;

    fn hack_chance(
        &self,
        host: &str,
    ) -> f64;

    /// Fraction of money a single hack thread steals once the server sits at
    /// its minimum security.
    fn hack_percent_at_min_security(
        &self,
        host: &str,
    ) -> Result<f64, FormulaUnavailable>;

    /// Returns `None` when the game refused to start the script.
    fn exec(
        &self,
        script: &str,
        host: &str,
        threads: usize,
        args: &[String],
    ) -> Option<Pid>;

    fn kill(
        &self,
        pid: Pid,
    ) -> bool;

    fn processes(
        &self,
        host: &str,
    ) -> Vec<ProcessInfo>;

    /// RAM cost of one thread of a script, or 0 if the script is missing.
    fn script_ram(
        &self,
        script: &str,
        host: &str,
    ) -> f64;

    fn file_exists(
        &self,
        file: &str,
        host: &str,
    ) -> bool;

    fn write_file(
        &self,
        file: &str,
        contents: &str,
    );

    fn copy_files(
        &self,
        files: &[&str],
        destination: &str,
        source: &str,
    ) -> bool;

    /// Writes to the script log.
    fn print(
        &self,
        text: &str,
    );

    /// Writes somewhere the player will actually see it.
    fn notify(
        &self,
        text: &str,
    );

    async fn sleep(
        &self,
        millis: f64,
    );
}
