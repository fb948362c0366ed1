//! Auxiliary scripts the daemon keeps running on home.
//!
//! Each helper is a script name plus rules for when it may run and what it is
//! passed. Helpers are relaunched only when their arguments change or they
//! stopped running.

use std::collections::HashMap;

use log::{
    debug,
    info,
    warn,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    allocator::launch_with_retry,
    config::DaemonConfig,
    network::Network,
    oracle::{
        Oracle,
        Pid,
        HOME,
    },
    utils::gb_to_hundredths_ceil,
};

/// When a helper may be launched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Gate {
    Always,
    Never,
    MinHackingLevel { level: u32 },
    MinHomeRam { gb: f64 },
}

/// Where a helper's arguments come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgSource {
    None,
    Static { args: Vec<String> },
    /// `--reserve <GB>`: the RAM kept free on home.
    ReservedRam,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelperTool {
    pub name: String,
    pub script: String,
    pub gate: Gate,
    pub args: ArgSource,
    /// Keeps running after the daemon stops.
    #[serde(default)]
    pub persistent: bool,
    /// May use the RAM reserved on home.
    #[serde(default)]
    pub ignore_reserved: bool,
}

/// What helper rules get to look at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HelperState {
    pub hacking_level: u32,
    pub home_max_ram: f64,
    pub reserved_home_ram: f64,
}

pub trait LaunchGate {
    fn is_eligible(
        &self,
        state: &HelperState,
    ) -> bool;
}

impl LaunchGate for Gate {
    fn is_eligible(
        &self,
        state: &HelperState,
    ) -> bool {
        use Gate::*;

        match self {
            Always => true,
            Never => false,
            MinHackingLevel { level } => *level <= state.hacking_level,
            MinHomeRam { gb } => *gb <= state.home_max_ram,
        }
    }
}

pub trait ArgBuilder {
    fn build_args(
        &self,
        state: &HelperState,
    ) -> Vec<String>;
}

impl ArgBuilder for ArgSource {
    fn build_args(
        &self,
        state: &HelperState,
    ) -> Vec<String> {
        match self {
            ArgSource::None => vec![],
            ArgSource::Static { args } => args.clone(),
            ArgSource::ReservedRam => {
                vec!["--reserve".to_owned(), format!("{}", state.reserved_home_ram)]
            },
        }
    }
}

pub fn default_helpers() -> Vec<HelperTool> {
    vec![
        HelperTool {
            name: "stats".to_owned(),
            script: "stats.js".to_owned(),
            gate: Gate::Always,
            args: ArgSource::None,
            persistent: true,
            ignore_reserved: true,
        },
        HelperTool {
            name: "hacknet".to_owned(),
            script: "hacknet-upgrade-manager.js".to_owned(),
            gate: Gate::MinHomeRam { gb: 64. },
            args: ArgSource::Static {
                args: vec!["--max-payoff-time".to_owned(), "1h".to_owned()],
            },
            persistent: false,
            ignore_reserved: false,
        },
        HelperTool {
            name: "servers".to_owned(),
            script: "host-manager.js".to_owned(),
            gate: Gate::MinHackingLevel { level: 50 },
            args: ArgSource::ReservedRam,
            persistent: false,
            ignore_reserved: false,
        },
    ]
}

#[derive(Clone, Debug)]
struct Launched {
    args: Vec<String>,
    pid: Pid,
    persistent: bool,
}

/// Launches helpers on home and remembers what they were given.
#[derive(Debug, Default)]
pub struct HelperRegistry {
    launched: HashMap<String, Launched>,
    last_run: Option<f64>,
}

impl HelperRegistry {
    pub fn new() -> HelperRegistry {
        HelperRegistry::default()
    }

    /// Launches every eligible helper that isn't already running with the same
    /// arguments. Does nothing more often than the configured interval.
    pub async fn run(
        &mut self,
        oracle: &impl Oracle,
        network: &mut Network,
        config: &DaemonConfig,
        state: &HelperState,
    ) -> usize {
        let now = oracle.now();
        if let Some(last) = self.last_run {
            if now - last < config.helper_interval {
                return 0;
            }
        }
        self.last_run = Some(now);

        let Some(home) = network.node_index(HOME)
        else {
            return 0;
        };

        let running = oracle
            .processes(HOME)
            .into_iter()
            .map(|p| p.pid)
            .collect::<Vec<_>>();
        let mut started = 0;

        for helper in config.helpers.iter() {
            if !helper.gate.is_eligible(state) {
                continue;
            }

            let args = helper.args.build_args(state);
            if let Some(previous) = self.launched.get(&helper.name) {
                if previous.args == args && running.contains(&previous.pid) {
                    continue;
                }

                // arguments changed, restart it
                if running.contains(&previous.pid) {
                    oracle.kill(previous.pid);
                }
            }

            if !oracle.file_exists(&helper.script, HOME) {
                debug!("helper {} has no script {}", helper.name, helper.script);
                continue;
            }

            let ram = gb_to_hundredths_ceil(oracle.script_ram(&helper.script, HOME));
            let free = network
                .node(home)
                .get_free_ram_hundredths(network.get_reserved_home_ram(), helper.ignore_reserved);
            if ram == 0 || free < ram {
                debug!("no room on {} for helper {}", HOME, helper.name);
                continue;
            }

            let launched = launch_with_retry(
                oracle,
                &helper.script,
                HOME,
                1,
                &args,
                config.launch_retries,
                config.launch_backoff,
            )
            .await;

            match launched {
                Ok(pid) => {
                    info!("started helper {} {:?}", helper.name, args);
                    network.record_launch(home, ram);
                    self.launched.insert(
                        helper.name.clone(),
                        Launched {
                            args,
                            pid,
                            persistent: helper.persistent,
                        },
                    );
                    started += 1;
                },
                Err(e) => warn!("helper {}: {}", helper.name, e),
            }
        }

        started
    }

    /// Kills the helpers that shouldn't outlive the daemon.
    pub fn shutdown(
        &mut self,
        oracle: &impl Oracle,
    ) {
        for (name, launched) in self.launched.drain() {
            if !launched.persistent && oracle.kill(launched.pid) {
                debug!("stopped helper {}", name);
            }
        }
    }
}
