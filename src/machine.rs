use std::collections::{
    HashSet,
    VecDeque,
};

use log::warn;

use crate::oracle::{
    Oracle,
    ServerProfile,
    HOME,
};

/// A server found by scanning, with where it sits in the network.
#[derive(Clone, Debug)]
pub struct Machine {
    degree: usize,
    traversal: Vec<String>,
    profile: ServerProfile,
}

impl Machine {
    fn new(
        profile: ServerProfile,
        degree: usize,
        traversal: Vec<String>,
    ) -> Machine {
        Machine {
            degree,
            traversal,
            profile,
        }
    }

    fn create_child(
        &self,
        profile: ServerProfile,
    ) -> Machine {
        let mut traversal = self.traversal.clone();
        traversal.push(profile.hostname.clone());

        Machine::new(profile, self.degree + 1, traversal)
    }

    pub fn get_hostname(&self) -> &str {
        &*self.profile.hostname
    }

    pub fn get_degree(&self) -> usize {
        self.degree
    }

    pub fn get_traversal(&self) -> &[String] {
        &*self.traversal
    }

    pub fn into_profile(self) -> ServerProfile {
        self.profile
    }
}

/// Breadth-first walk of the whole network starting at home.
///
/// Servers whose details can't be read are logged and left out; they will be
/// picked up by a later rescan.
pub fn get_machines(oracle: &impl Oracle) -> Vec<Machine> {
    let mut traversed: Vec<Machine> = vec![];
    let mut seen = HashSet::new();
    let mut pending = VecDeque::new();

    match oracle.server_profile(HOME) {
        Ok(profile) => {
            seen.insert(HOME.to_owned());
            pending.push_front(Machine::new(profile, 0, vec![HOME.to_owned()]));
        },
        Err(e) => {
            warn!("cannot read {}: {}", HOME, e);
            return traversed;
        },
    }

    while let Some(machine) = pending.pop_back() {
        for child_name in oracle.scan(machine.get_hostname()) {
            // don't consider machines that are already found
            if !seen.insert(child_name.clone()) {
                continue;
            }

            match oracle.server_profile(&child_name) {
                Ok(profile) => pending.push_front(machine.create_child(profile)),
                Err(e) => warn!("skipping {}: {}", child_name, e),
            }
        }

        // put this node into the list of traversed machines
        traversed.push(machine);
    }

    traversed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimOracle;

    #[test]
    fn walks_breadth_first() {
        let oracle = SimOracle::new();
        oracle.add_target("n00dles", 1, 1_000_000., 1., 3000.);
        oracle.add_target("foodnstuff", 1, 1_000_000., 1., 3000.);
        oracle.link("n00dles", "zer0");
        oracle.add_target("zer0", 75, 5_000_000., 10., 3000.);

        let machines = get_machines(&oracle);
        let names = machines.iter().map(|m| m.get_hostname()).collect::<Vec<_>>();

        assert_eq!(names, vec!["home", "n00dles", "foodnstuff", "zer0"]);
        assert_eq!(machines[3].get_degree(), 2);
        assert_eq!(machines[3].get_traversal(), &["home", "n00dles", "zer0"]);
    }

    #[test]
    fn cycles_are_visited_once() {
        let oracle = SimOracle::new();
        oracle.add_target("a", 1, 1., 1., 1.);
        oracle.link("a", "b");
        oracle.add_target("b", 1, 1., 1., 1.);
        oracle.link("b", "home");

        assert_eq!(get_machines(&oracle).len(), 3);
    }
}
