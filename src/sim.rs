//! Deterministic stand-in for the game, used by tests.
//!
//! Workers take effect when they finish: at their fire instant plus the
//! duration of their operation. Time only moves through [`SimOracle::advance`]
//! or [`Oracle::sleep`].

use std::{
    cell::RefCell,
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
    },
};

use crate::{
    error::{
        DaemonError,
        FormulaUnavailable,
    },
    oracle::{
        Clock,
        Multipliers,
        Oracle,
        Pid,
        ProcessInfo,
        ServerProfile,
        HOME,
    },
    target::{
        GROW_SECURITY_INCREASE,
        HACK_SECURITY_INCREASE,
        WEAKEN_SECURITY_DECREASE,
    },
    tools::{
        ToolKind,
        GROW_SCRIPT,
        HACK_SCRIPT,
        SHARE_SCRIPT,
        TOOLS,
        WEAKEN_SCRIPT,
        XP_SCRIPT,
    },
};

const HELPER_SCRIPT_RAM: f64 = 2.;
const SHARE_DURATION: f64 = 10_000.;
const DEFAULT_HACK_PERCENT: f64 = 0.01;

#[derive(Clone, Debug)]
struct SimServer {
    profile: ServerProfile,
    has_root: bool,
    can_root: bool,
    security: f64,
    money: f64,
    max_ram: f64,
    external_used_ram: f64,
    hack_time: f64,
    hack_percent: f64,
    files: HashSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Effect {
    Weaken,
    Grow,
    Hack,
    Nothing,
}

#[derive(Clone, Debug)]
struct SimProcess {
    info: ProcessInfo,
    host: String,
    ram: f64,
    effect: Effect,
    target: String,
    /// `None` for processes that run until killed.
    ends_at: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Launch {
    pub script: String,
    pub host: String,
    pub threads: usize,
    pub args: Vec<String>,
    pub at: f64,
}

#[derive(Debug, Default)]
struct SimState {
    now: f64,
    servers: BTreeMap<String, SimServer>,
    links: HashMap<String, Vec<String>>,
    processes: Vec<SimProcess>,
    next_pid: Pid,
    hacking_level: u32,
    multipliers: Multipliers,
    formulas: bool,
    failing_execs: usize,
    script_ram: HashMap<String, f64>,
    copies: usize,
    launches: Vec<Launch>,
    printed: Vec<String>,
    notifications: Vec<String>,
}

pub struct SimOracle {
    state: RefCell<SimState>,
}

fn blank_profile(
    name: &str,
    player_owned: bool,
) -> ServerProfile {
    ServerProfile {
        hostname: name.to_owned(),
        max_money: 0.,
        min_security: 1.,
        growth: 0.,
        required_hacking_level: 1,
        required_open_ports: 0,
        player_owned,
        cpu_cores: 1,
        low_priority: false,
    }
}

impl SimOracle {
    /// A world holding only home: 64GB, rooted, player at level 100.
    pub fn new() -> SimOracle {
        let mut state = SimState {
            now: 1_000_000.,
            next_pid: 1,
            hacking_level: 100,
            formulas: true,
            ..SimState::default()
        };

        state.servers.insert(
            HOME.to_owned(),
            SimServer {
                profile: blank_profile(HOME, true),
                has_root: true,
                can_root: true,
                security: 1.,
                money: 0.,
                max_ram: 64.,
                external_used_ram: 0.,
                hack_time: 1000.,
                hack_percent: 0.,
                files: HashSet::new(),
            },
        );

        SimOracle {
            state: RefCell::new(state),
        }
    }

    fn add_server(
        &self,
        server: SimServer,
    ) {
        let name = server.profile.hostname.clone();
        let unlinked = self
            .state
            .borrow()
            .links
            .get(&name)
            .map_or(true, |l| l.is_empty());

        self.state.borrow_mut().servers.insert(name.clone(), server);
        if unlinked {
            self.link(HOME, &name);
        }
    }

    /// A purchased server: rooted, no money.
    pub fn add_node(
        &self,
        name: &str,
        max_ram: f64,
    ) {
        self.add_server(SimServer {
            profile: blank_profile(name, true),
            has_root: true,
            can_root: true,
            security: 1.,
            money: 0.,
            max_ram,
            external_used_ram: 0.,
            hack_time: 1000.,
            hack_percent: 0.,
            files: HashSet::new(),
        });
    }

    /// A rooted world server sitting at max money and min security, without
    /// RAM of its own. Grow takes 3.2x and weaken 4x the hack time.
    pub fn add_target(
        &self,
        name: &str,
        required_level: u32,
        max_money: f64,
        min_security: f64,
        hack_time: f64,
    ) {
        let mut profile = blank_profile(name, false);
        profile.max_money = max_money;
        profile.min_security = min_security;
        profile.growth = 100.;
        profile.required_hacking_level = required_level;

        self.add_server(SimServer {
            profile,
            has_root: true,
            can_root: true,
            security: min_security,
            money: max_money,
            max_ram: 0.,
            external_used_ram: 0.,
            hack_time,
            hack_percent: DEFAULT_HACK_PERCENT,
            files: HashSet::new(),
        });
    }

    pub fn remove(
        &self,
        name: &str,
    ) {
        let mut state = self.state.borrow_mut();
        state.servers.remove(name);
        state.links.remove(name);
        for links in state.links.values_mut() {
            links.retain(|l| l != name);
        }
    }

    pub fn link(
        &self,
        a: &str,
        b: &str,
    ) {
        let mut state = self.state.borrow_mut();
        for (from, to) in [(a, b), (b, a)] {
            let links = state.links.entry(from.to_owned()).or_default();
            if !links.iter().any(|l| l == to) {
                links.push(to.to_owned());
            }
        }
    }

    fn with_server(
        &self,
        name: &str,
        f: impl FnOnce(&mut SimServer),
    ) {
        if let Some(server) = self.state.borrow_mut().servers.get_mut(name) {
            f(server);
        }
    }

    pub fn set_security(
        &self,
        name: &str,
        security: f64,
    ) {
        self.with_server(name, |s| s.security = security);
    }

    pub fn set_money(
        &self,
        name: &str,
        money: f64,
    ) {
        self.with_server(name, |s| s.money = money);
    }

    pub fn set_root(
        &self,
        name: &str,
        has_root: bool,
    ) {
        self.with_server(name, |s| s.has_root = has_root);
    }

    pub fn set_rootable(
        &self,
        name: &str,
        can_root: bool,
    ) {
        self.with_server(name, |s| s.can_root = can_root);
    }

    pub fn set_max_ram(
        &self,
        name: &str,
        max_ram: f64,
    ) {
        self.with_server(name, |s| s.max_ram = max_ram);
    }

    /// RAM held by processes the daemon did not start.
    pub fn set_used_ram(
        &self,
        name: &str,
        used_ram: f64,
    ) {
        self.with_server(name, |s| s.external_used_ram = used_ram);
    }

    pub fn set_low_priority(
        &self,
        name: &str,
    ) {
        self.with_server(name, |s| s.profile.low_priority = true);
    }

    pub fn set_hack_percent(
        &self,
        name: &str,
        percent: f64,
    ) {
        self.with_server(name, |s| s.hack_percent = percent);
    }

    pub fn set_hacking_level(
        &self,
        level: u32,
    ) {
        self.state.borrow_mut().hacking_level = level;
    }

    pub fn set_formulas(
        &self,
        available: bool,
    ) {
        self.state.borrow_mut().formulas = available;
    }

    pub fn set_script_ram(
        &self,
        script: &str,
        ram: f64,
    ) {
        self.state
            .borrow_mut()
            .script_ram
            .insert(script.to_owned(), ram);
    }

    pub fn add_file(
        &self,
        host: &str,
        file: &str,
    ) {
        self.with_server(host, |s| {
            s.files.insert(file.to_owned());
        });
    }

    /// The next `count` calls to exec fail regardless of free RAM.
    pub fn fail_next_execs(
        &self,
        count: usize,
    ) {
        self.state.borrow_mut().failing_execs = count;
    }

    pub fn copy_count(&self) -> usize {
        self.state.borrow().copies
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.state.borrow().launches.clone()
    }

    pub fn running(
        &self,
        script: &str,
    ) -> usize {
        self.state
            .borrow()
            .processes
            .iter()
            .filter(|p| p.info.filename == script)
            .count()
    }

    pub fn printed(&self) -> Vec<String> {
        self.state.borrow().printed.clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.state.borrow().notifications.clone()
    }

    /// Moves time forward, applying every worker that finishes on the way.
    pub fn advance(
        &self,
        millis: f64,
    ) {
        let mut state = self.state.borrow_mut();
        let until = state.now + millis.max(0.);

        loop {
            let next = state
                .processes
                .iter()
                .enumerate()
                .filter_map(|(idx, p)| p.ends_at.map(|at| (idx, at)))
                .filter(|(_, at)| *at <= until)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            let Some((idx, at)) = next
            else {
                break;
            };

            let process = state.processes.remove(idx);
            state.now = state.now.max(at);
            apply_effect(&mut state, &process);
        }

        state.now = until;
    }

    fn duration_of(
        server: &SimServer,
        effect: Effect,
    ) -> f64 {
        match effect {
            Effect::Hack => server.hack_time,
            Effect::Grow => server.hack_time * 3.2,
            Effect::Weaken => server.hack_time * 4.,
            Effect::Nothing => SHARE_DURATION,
        }
    }

    fn catalog_ram(script: &str) -> Option<f64> {
        TOOLS
            .iter()
            .find(|t| t.script.filename == script)
            .map(|t| t.ram_hundredths as f64 / 100.)
    }
}

fn apply_effect(
    state: &mut SimState,
    process: &SimProcess,
) {
    let threads = process.info.threads as f64;
    let mults = state.multipliers;
    let Some(server) = state.servers.get_mut(&process.target)
    else {
        return;
    };
    let min_security = server.profile.min_security;

    match process.effect {
        Effect::Weaken => {
            let potency = WEAKEN_SECURITY_DECREASE * mults.server_weaken_rate;
            server.security = (server.security - threads * potency).max(min_security);
        },
        Effect::Grow => {
            let rate = (1. + 0.03 / min_security).min(1.0035);
            let sgp =
                server.profile.growth / 100. * mults.server_growth_rate * mults.hacking_grow;
            let grown = (server.money + threads) * rate.powf(threads * sgp);

            server.money = grown.min(server.profile.max_money);
            server.security += threads * GROW_SECURITY_INCREASE;
        },
        Effect::Hack => {
            let stolen = (threads * server.hack_percent).min(1.);

            server.money *= 1. - stolen;
            server.security += threads * HACK_SECURITY_INCREASE;
        },
        Effect::Nothing => {},
    }
}

impl Clock for SimOracle {
    fn now(&self) -> f64 {
        self.state.borrow().now
    }
}

impl Oracle for SimOracle {
    fn scan(
        &self,
        host: &str,
    ) -> Vec<String> {
        let state = self.state.borrow();
        state
            .links
            .get(host)
            .map(|links| {
                links
                    .iter()
                    .filter(|l| state.servers.contains_key(*l))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn server_profile(
        &self,
        host: &str,
    ) -> Result<ServerProfile, DaemonError> {
        self.state
            .borrow()
            .servers
            .get(host)
            .map(|s| s.profile.clone())
            .ok_or_else(|| DaemonError::Oracle {
                host: host.to_owned(),
                what: "no such server",
            })
    }

    fn has_root(
        &self,
        host: &str,
    ) -> bool {
        self.state
            .borrow()
            .servers
            .get(host)
            .map_or(false, |s| s.has_root)
    }

    fn try_root(
        &self,
        host: &str,
    ) -> bool {
        let mut state = self.state.borrow_mut();
        match state.servers.get_mut(host) {
            Some(server) => {
                server.has_root |= server.can_root;
                server.has_root
            },
            None => false,
        }
    }

    fn security_level(
        &self,
        host: &str,
    ) -> f64 {
        self.state
            .borrow()
            .servers
            .get(host)
            .map_or(0., |s| s.security)
    }

    fn money_available(
        &self,
        host: &str,
    ) -> f64 {
        self.state.borrow().servers.get(host).map_or(0., |s| s.money)
    }

    fn max_ram(
        &self,
        host: &str,
    ) -> f64 {
        self.state.borrow().servers.get(host).map_or(0., |s| s.max_ram)
    }

    fn used_ram(
        &self,
        host: &str,
    ) -> f64 {
        let state = self.state.borrow();
        let external = state
            .servers
            .get(host)
            .map_or(0., |s| s.external_used_ram);

        external
            + state
                .processes
                .iter()
                .filter(|p| p.host == host)
                .map(|p| p.ram)
                .sum::<f64>()
    }

    fn hacking_level(&self) -> u32 {
        self.state.borrow().hacking_level
    }

    fn multipliers(&self) -> Multipliers {
        self.state.borrow().multipliers
    }

    fn hack_time(
        &self,
        host: &str,
    ) -> f64 {
        self.state
            .borrow()
            .servers
            .get(host)
            .map_or(0., |s| SimOracle::duration_of(s, Effect::Hack))
    }

    fn grow_time(
        &self,
        host: &str,
    ) -> f64 {
        self.state
            .borrow()
            .servers
            .get(host)
            .map_or(0., |s| SimOracle::duration_of(s, Effect::Grow))
    }

    fn weaken_time(
        &self,
        host: &str,
    ) -> f64 {
        self.state
            .borrow()
            .servers
            .get(host)
            .map_or(0., |s| SimOracle::duration_of(s, Effect::Weaken))
    }

    fn hack_chance(
        &self,
        _host: &str,
    ) -> f64 {
        1.
    }

    fn hack_percent_at_min_security(
        &self,
        host: &str,
    ) -> Result<f64, FormulaUnavailable> {
        let state = self.state.borrow();
        if !state.formulas {
            return Err(FormulaUnavailable);
        }

        state
            .servers
            .get(host)
            .map(|s| s.hack_percent)
            .ok_or(FormulaUnavailable)
    }

    fn exec(
        &self,
        script: &str,
        host: &str,
        threads: usize,
        args: &[String],
    ) -> Option<Pid> {
        if threads == 0 {
            return None;
        }

        let ram = self.script_ram(script, host) * threads as f64;
        let used = self.used_ram(host);
        let mut state = self.state.borrow_mut();

        if 0 < state.failing_execs {
            state.failing_execs -= 1;
            return None;
        }

        let server = state.servers.get(host)?;
        if !server.has_root || !server.files.contains(script) || ram <= 0. {
            return None;
        }
        if server.max_ram + 1e-9 < used + ram {
            return None;
        }

        let duplicate = state.processes.iter().any(|p| {
            p.host == host && p.info.filename == script && p.info.args == args
        });
        if duplicate {
            return None;
        }

        let effect = match script {
            s if s == WEAKEN_SCRIPT.filename => Effect::Weaken,
            s if s == GROW_SCRIPT.filename => Effect::Grow,
            s if s == HACK_SCRIPT.filename => Effect::Hack,
            _ => Effect::Nothing,
        };

        let target = args.first().cloned().unwrap_or_default();
        let fire_at = args
            .get(1)
            .and_then(|a| a.parse::<f64>().ok())
            .unwrap_or(state.now)
            .max(state.now);

        let ends_at = if script == XP_SCRIPT.filename {
            state
                .servers
                .get(&target)
                .map(|s| state.now + SimOracle::duration_of(s, Effect::Weaken))
        }
        else if script == SHARE_SCRIPT.filename {
            Some(state.now + SHARE_DURATION)
        }
        else if effect == Effect::Nothing {
            None
        }
        else {
            state
                .servers
                .get(&target)
                .map(|s| fire_at + SimOracle::duration_of(s, effect))
        };

        let pid = state.next_pid;
        state.next_pid += 1;

        let now = state.now;
        state.launches.push(Launch {
            script: script.to_owned(),
            host: host.to_owned(),
            threads,
            args: args.to_vec(),
            at: now,
        });
        state.processes.push(SimProcess {
            info: ProcessInfo {
                pid,
                filename: script.to_owned(),
                threads,
                args: args.to_vec(),
            },
            host: host.to_owned(),
            ram,
            effect,
            target,
            ends_at,
        });

        Some(pid)
    }

    fn kill(
        &self,
        pid: Pid,
    ) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.processes.len();
        state.processes.retain(|p| p.info.pid != pid);

        before != state.processes.len()
    }

    fn processes(
        &self,
        host: &str,
    ) -> Vec<ProcessInfo> {
        self.state
            .borrow()
            .processes
            .iter()
            .filter(|p| p.host == host)
            .map(|p| p.info.clone())
            .collect()
    }

    fn script_ram(
        &self,
        script: &str,
        host: &str,
    ) -> f64 {
        let state = self.state.borrow();
        if let Some(ram) = state.script_ram.get(script) {
            return *ram;
        }

        let exists = state
            .servers
            .get(host)
            .map_or(false, |s| s.files.contains(script));
        if !exists {
            return 0.;
        }

        SimOracle::catalog_ram(script).unwrap_or(HELPER_SCRIPT_RAM)
    }

    fn file_exists(
        &self,
        file: &str,
        host: &str,
    ) -> bool {
        self.state
            .borrow()
            .servers
            .get(host)
            .map_or(false, |s| s.files.contains(file))
    }

    fn write_file(
        &self,
        file: &str,
        _contents: &str,
    ) {
        self.add_file(HOME, file);
    }

    fn copy_files(
        &self,
        files: &[&str],
        destination: &str,
        source: &str,
    ) -> bool {
        let mut state = self.state.borrow_mut();
        state.copies += 1;

        let available = match state.servers.get(source) {
            Some(server) => files
                .iter()
                .filter(|f| server.files.contains(**f))
                .map(|f| f.to_string())
                .collect::<Vec<_>>(),
            None => return false,
        };

        match state.servers.get_mut(destination) {
            Some(server) => {
                let copied = available.len();
                server.files.extend(available);
                copied == files.len()
            },
            None => false,
        }
    }

    fn print(
        &self,
        text: &str,
    ) {
        self.state.borrow_mut().printed.push(text.to_owned());
    }

    fn notify(
        &self,
        text: &str,
    ) {
        self.state.borrow_mut().notifications.push(text.to_owned());
    }

    async fn sleep(
        &self,
        millis: f64,
    ) {
        self.advance(millis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_apply_when_they_finish() {
        let oracle = SimOracle::new();
        oracle.add_target("n00dles", 1, 1e6, 1., 1000.);
        oracle.set_security("n00dles", 2.);
        oracle.add_file(HOME, WEAKEN_SCRIPT.filename);

        let fire = oracle.now() + 500.;
        let args = vec!["n00dles".to_owned(), fire.to_string()];
        let pid = oracle.exec(WEAKEN_SCRIPT.filename, HOME, 10, &args).unwrap();

        assert_eq!(oracle.used_ram(HOME), 17.5);
        assert_eq!(ToolKind::Weaken.ram_hundredths(), 175);

        oracle.advance(4499.);
        assert_eq!(oracle.security_level("n00dles"), 2.);
        assert_eq!(oracle.processes(HOME)[0].pid, pid);

        oracle.advance(1.);
        assert_eq!(oracle.security_level("n00dles"), 1.5);
        assert_eq!(oracle.used_ram(HOME), 0.);
    }

    #[test]
    fn exec_refuses_what_does_not_fit() {
        let oracle = SimOracle::new();
        oracle.add_file(HOME, HACK_SCRIPT.filename);
        let args = vec!["x".to_owned()];

        assert!(oracle.exec(HACK_SCRIPT.filename, HOME, 38, &args).is_none());
        assert!(oracle.exec(HACK_SCRIPT.filename, HOME, 37, &args).is_some());
        // same script, host and arguments
        assert!(oracle.exec(HACK_SCRIPT.filename, HOME, 1, &args).is_none());
    }
}
