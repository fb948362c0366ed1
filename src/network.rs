//! Every server the daemon knows about.
//!
//! A server can be both a node (somewhere to run workers) and a target
//! (something to take money from). Sort orders over nodes are memoized and
//! keyed on version counters that are bumped whenever topology or RAM usage
//! changes.

use std::collections::HashSet;

use compact_str::CompactString;
use decorum::N64;
use itertools::Itertools;
use log::{
    debug,
    info,
};

use crate::{
    machine::Machine,
    oracle::{
        Oracle,
        HOME,
    },
    target::{
        ModelParams,
        Target,
    },
    tools::ToolKind,
    utils::{
        gb_to_hundredths_ceil,
        gb_to_hundredths_floor,
    },
};

#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    max_ram: u64,
    used_ram: u64,
    has_root: bool,
    low_priority: bool,
    files: HashSet<CompactString>,
}

impl Node {
    pub fn new(
        name: String,
        max_ram: u64,
        used_ram: u64,
        has_root: bool,
        low_priority: bool,
    ) -> Node {
        Node {
            name,
            max_ram,
            used_ram,
            has_root,
            low_priority,
            files: HashSet::new(),
        }
    }

    pub fn get_name(&self) -> &str {
        &*self.name
    }

    pub fn is_home(&self) -> bool {
        self.name == HOME
    }

    pub fn is_root(&self) -> bool {
        self.has_root
    }

    pub fn is_low_priority(&self) -> bool {
        self.low_priority
    }

    /// Free RAM, minus the reservation if this is home.
    pub fn get_free_ram_hundredths(
        &self,
        reserved: u64,
        ignore_reserved: bool,
    ) -> u64 {
        let free = self.max_ram.saturating_sub(self.used_ram);

        if self.is_home() && !ignore_reserved {
            free.saturating_sub(reserved)
        }
        else {
            free
        }
    }

    pub fn has_file(
        &self,
        file: &str,
    ) -> bool {
        self.files.contains(file)
    }

    pub fn mark_file(
        &mut self,
        file: &str,
    ) {
        self.files.insert(CompactString::from(file));
    }
}

#[derive(Debug, Default)]
struct SortMemo {
    version: Option<u64>,
    order: Vec<usize>,
}

impl SortMemo {
    fn get_or_compute(
        &mut self,
        version: u64,
        compute: impl FnOnce() -> Vec<usize>,
    ) -> Vec<usize> {
        if self.version != Some(version) {
            self.order = compute();
            self.version = Some(version);
        }

        self.order.clone()
    }

    fn invalidate(&mut self) {
        self.version = None;
    }
}

#[derive(Debug)]
pub struct Network {
    nodes: Vec<Node>,
    targets: Vec<Target>,
    reserved_home_ram: u64,
    initial_steal_fraction: f64,

    topology_version: u64,
    ram_version: u64,
    tick_version: u64,

    by_max_ram: SortMemo,
    by_free_ram: SortMemo,
    by_priority: SortMemo,
}

impl Network {
    pub fn new(
        reserved_home_ram_gb: f64,
        initial_steal_fraction: f64,
    ) -> Network {
        Network {
            nodes: vec![],
            targets: vec![],
            reserved_home_ram: gb_to_hundredths_ceil(reserved_home_ram_gb),
            initial_steal_fraction,
            topology_version: 0,
            ram_version: 0,
            tick_version: 0,
            by_max_ram: SortMemo::default(),
            by_free_ram: SortMemo::default(),
            by_priority: SortMemo::default(),
        }
    }

    /// Folds a fresh scan into the registry.
    ///
    /// Servers that vanished are dropped, new ones are added, and known ones
    /// keep their state (tuned steal fraction, deployed file cache).
    pub fn sync(
        &mut self,
        oracle: &impl Oracle,
        machines: Vec<Machine>,
    ) {
        let found = machines
            .iter()
            .map(|m| m.get_hostname().to_owned())
            .collect::<HashSet<_>>();

        let nodes_before = self.nodes.len();
        let targets_before = self.targets.len();
        self.nodes.retain(|n| found.contains(n.get_name()));
        self.targets.retain(|t| found.contains(t.get_name()));
        let mut changed =
            nodes_before != self.nodes.len() || targets_before != self.targets.len();

        for machine in machines {
            let hops = machine.get_degree();
            let route = machine.get_traversal().join(" > ");
            let profile = machine.into_profile();
            let name = profile.hostname.clone();

            let max_ram = gb_to_hundredths_floor(oracle.max_ram(&name));
            let has_root = oracle.has_root(&name);

            match self.nodes.iter_mut().find(|n| n.get_name() == name) {
                Some(node) => {
                    if node.max_ram != max_ram || node.has_root != has_root {
                        changed = true;
                    }
                    node.max_ram = max_ram;
                    node.has_root = has_root;
                },
                None if 0 < max_ram => {
                    debug!("new node {} ({}GB)", name, max_ram / 100);
                    self.nodes.push(Node::new(
                        name.clone(),
                        max_ram,
                        gb_to_hundredths_ceil(oracle.used_ram(&name)),
                        has_root,
                        profile.low_priority,
                    ));
                    changed = true;
                },
                None => {},
            }

            if profile.player_owned {
                continue;
            }

            match self.targets.iter_mut().find(|t| t.get_name() == name) {
                Some(target) => target.set_profile(profile),
                None => {
                    debug!("new target {} ({} hops: {})", name, hops, route);
                    self.targets.push(Target::new(profile, self.initial_steal_fraction));
                    changed = true;
                },
            }
        }

        if changed {
            self.topology_version += 1;
            self.by_max_ram.invalidate();
            self.by_priority.invalidate();
            self.bump_ram_version();

            info!(
                "network: {} nodes, {} targets",
                self.nodes.len(),
                self.targets.len()
            );
        }
    }

    /// Re-reads RAM usage and root access of every node.
    pub fn refresh_nodes(
        &mut self,
        oracle: &impl Oracle,
    ) {
        for node in self.nodes.iter_mut() {
            node.used_ram = gb_to_hundredths_ceil(oracle.used_ram(node.get_name()));
            node.has_root = oracle.has_root(node.get_name());
        }

        self.bump_ram_version();
    }

    pub fn refresh_targets(
        &mut self,
        oracle: &impl Oracle,
        params: ModelParams,
    ) {
        for target in self.targets.iter_mut() {
            target.refresh(oracle, params);
        }

        self.tick_version += 1;
    }

    fn bump_ram_version(&mut self) {
        self.ram_version += 1;
    }

    pub fn get_topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn get_reserved_home_ram(&self) -> u64 {
        self.reserved_home_ram
    }

    pub fn nodes(&self) -> &[Node] {
        &*self.nodes
    }

    pub fn node(
        &self,
        idx: usize,
    ) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(
        &mut self,
        idx: usize,
    ) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn node_index(
        &self,
        name: &str,
    ) -> Option<usize> {
        self.nodes.iter().position(|n| n.get_name() == name)
    }

    pub fn targets(&self) -> &[Target] {
        &*self.targets
    }

    pub fn target(
        &self,
        idx: usize,
    ) -> &Target {
        &self.targets[idx]
    }

    pub fn target_mut(
        &mut self,
        idx: usize,
    ) -> &mut Target {
        &mut self.targets[idx]
    }

    pub fn target_index(
        &self,
        name: &str,
    ) -> Option<usize> {
        self.targets.iter().position(|t| t.get_name() == name)
    }

    /// Free RAM a tool may use on a node.
    pub fn free_ram_for(
        &self,
        idx: usize,
        tool: ToolKind,
    ) -> u64 {
        let node = &self.nodes[idx];
        if !node.is_root() {
            return 0;
        }

        node.get_free_ram_hundredths(self.reserved_home_ram, tool.tool().ignore_reserved)
    }

    pub fn threads_available(
        &self,
        idx: usize,
        tool: ToolKind,
    ) -> usize {
        (self.free_ram_for(idx, tool) / tool.ram_hundredths()) as usize
    }

    /// Threads of a tool the whole network could host right now.
    pub fn total_threads_available(
        &self,
        tool: ToolKind,
    ) -> usize {
        (0 .. self.nodes.len())
            .map(|idx| self.threads_available(idx, tool))
            .sum()
    }

    /// Free RAM of every usable node, largest first.
    pub fn free_ram_snapshot(
        &self,
        tool: ToolKind,
    ) -> Vec<u64> {
        (0 .. self.nodes.len())
            .map(|idx| self.free_ram_for(idx, tool))
            .filter(|free| 0 < *free)
            .sorted_unstable_by(|a, b| b.cmp(a))
            .collect()
    }

    pub fn record_launch(
        &mut self,
        idx: usize,
        ram: u64,
    ) {
        let node = &mut self.nodes[idx];
        node.used_ram = (node.used_ram + ram).min(node.max_ram);
        self.bump_ram_version();
    }

    /// Rooted RAM, excluding the home reservation. (used, total)
    pub fn utilization(&self) -> (u64, u64) {
        self.nodes
            .iter()
            .filter(|n| n.is_root())
            .fold((0, 0), |(used, total), node| {
                let reserved = match node.is_home() {
                    true => self.reserved_home_ram.min(node.max_ram),
                    false => 0,
                };
                let usable = node.max_ram - reserved;
                let node_used = node.used_ram.saturating_sub(reserved).min(usable);

                (used + node_used, total + usable)
            })
    }

    /// Node indices by descending total RAM.
    pub fn by_max_ram(&mut self) -> Vec<usize> {
        let nodes = &self.nodes;
        self.by_max_ram.get_or_compute(self.topology_version, || {
            (0 .. nodes.len())
                .sorted_by(|&a, &b| {
                    nodes[b]
                        .max_ram
                        .cmp(&nodes[a].max_ram)
                        .then(nodes[a].name.cmp(&nodes[b].name))
                })
                .collect()
        })
    }

    /// Node indices by descending free RAM, reservation included.
    pub fn by_free_ram(&mut self) -> Vec<usize> {
        let nodes = &self.nodes;
        let reserved = self.reserved_home_ram;
        self.by_free_ram.get_or_compute(self.ram_version, || {
            (0 .. nodes.len())
                .sorted_by(|&a, &b| {
                    let free_a = nodes[a].get_free_ram_hundredths(reserved, false);
                    let free_b = nodes[b].get_free_ram_hundredths(reserved, false);

                    free_b.cmp(&free_a).then(nodes[a].name.cmp(&nodes[b].name))
                })
                .collect()
        })
    }

    /// Target indices by how worthwhile they are this tick: hackable first,
    /// then prepped, then by money per GB-second.
    pub fn by_priority(&mut self) -> Vec<usize> {
        let targets = &self.targets;
        self.by_priority.get_or_compute(self.tick_version, || {
            (0 .. targets.len())
                .sorted_by_cached_key(|&idx| {
                    let target = &targets[idx];
                    let value = target.value_per_ram_second();
                    let value = match value.is_finite() {
                        true => value,
                        false => 0.,
                    };

                    (
                        !target.is_hackable(),
                        !target.is_prepped(),
                        std::cmp::Reverse(N64::from_inner(value)),
                        target.get_name().to_owned(),
                    )
                })
                .collect()
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        machine::get_machines,
        sim::SimOracle,
    };

    /// A network made of bare nodes with the given free RAM in GB.
    pub(crate) fn network_with_nodes(nodes: &[(&str, f64)]) -> Network {
        let mut network = Network::new(0., 0.5);
        for (name, gb) in nodes {
            network.nodes.push(Node::new(
                name.to_string(),
                gb_to_hundredths_floor(*gb),
                0,
                true,
                false,
            ));
        }
        network.topology_version += 1;
        network.bump_ram_version();
        network
    }

    #[test]
    fn sync_adds_and_removes_servers() {
        let oracle = SimOracle::new();
        oracle.add_node("pserv-0", 32.);
        oracle.add_target("n00dles", 1, 1e6, 1., 1000.);

        let mut network = Network::new(8., 0.5);
        network.sync(&oracle, get_machines(&oracle));
        let version = network.get_topology_version();

        assert_eq!(network.nodes().len(), 2);
        assert_eq!(network.targets().len(), 1);

        oracle.remove("pserv-0");
        network.sync(&oracle, get_machines(&oracle));

        assert_eq!(network.nodes().len(), 1);
        assert!(version < network.get_topology_version());
    }

    #[test]
    fn home_reservation_is_respected() {
        let oracle = SimOracle::new();
        oracle.set_max_ram(HOME, 64.);

        let mut network = Network::new(32., 0.5);
        network.sync(&oracle, get_machines(&oracle));

        let home = network.node_index(HOME).unwrap();
        assert_eq!(network.free_ram_for(home, ToolKind::Weaken), 3200);
        assert_eq!(network.threads_available(home, ToolKind::Weaken), 18);
        assert_eq!(network.utilization(), (0, 3200));
    }

    #[test]
    fn refresh_reads_live_state() {
        let oracle = SimOracle::new();
        oracle.add_node("pserv-0", 32.);
        oracle.add_target("n00dles", 1, 1e6, 10., 1000.);
        oracle.set_hack_percent("n00dles", 0.02);

        let mut network = Network::new(0., 0.5);
        network.sync(&oracle, get_machines(&oracle));
        let params = ModelParams {
            hacking_level: 100,
            ..ModelParams::default()
        };
        network.refresh_targets(&oracle, params);

        let idx = network.target_index("n00dles").unwrap();
        assert_eq!(network.target(idx).fraction_per_thread(), 0.02);

        // without formulas the closed form takes over
        oracle.set_formulas(false);
        network.refresh_targets(&oracle, params);
        let fallback = network.target(idx).fallback_fraction_per_thread();
        assert_eq!(network.target(idx).fraction_per_thread(), fallback);

        oracle.set_used_ram("pserv-0", 30.);
        network.refresh_nodes(&oracle);
        let node = network.node_index("pserv-0").unwrap();
        assert_eq!(network.free_ram_for(node, ToolKind::Weaken), 200);
    }

    #[test]
    fn free_ram_order_follows_launches() {
        let mut network = network_with_nodes(&[("a", 16.), ("b", 32.), ("c", 8.)]);
        let names = |n: &Network, order: Vec<usize>| {
            order.iter().map(|&i| n.node(i).get_name().to_owned()).collect::<Vec<_>>()
        };

        let order = network.by_free_ram();
        assert_eq!(names(&network, order), vec!["b", "a", "c"]);

        network.record_launch(1, 2800);
        let order = network.by_free_ram();
        assert_eq!(names(&network, order), vec!["a", "c", "b"]);

        let order = network.by_max_ram();
        assert_eq!(names(&network, order), vec!["b", "a", "c"]);
    }
}
