// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::topology::Topology;
use muster_common::command::CommandSpec;
use muster_common::model::CommandId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::warn;

/// Maps the currently online workers onto command alternatives. `None`
/// marks a worker as excluded from the distribution.
pub trait Selector: Send + Debug {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>>;
}

/// Most selectors pick a subset of workers and hand everyone the first
/// command alternative.
fn binary_selection(
    selected: Vec<String>,
    topology: &Topology,
    commands: &[CommandSpec],
) -> BTreeMap<String, Option<CommandId>> {
    if commands.len() > 1 {
        warn!("Selector ignores all but the first command alternative");
    }
    let main_uuid = commands.first().and_then(|command| command.uuid);
    topology
        .online_clients()
        .into_iter()
        .map(|name| {
            let choice = if selected.contains(&name) { main_uuid } else { None };
            (name, choice)
        })
        .collect()
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Selects every online worker.
#[derive(Debug, Clone, Default)]
pub struct AllSelector;

impl Selector for AllSelector {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>> {
        binary_selection(topology.online_clients(), topology, commands)
    }
}

/// Selects a percentage of the online workers, randomly shuffled.
#[derive(Debug, Clone)]
pub struct PercentageSelector {
    pub percentage: u32,
    pub seed: Option<u64>,
}

impl PercentageSelector {
    pub fn new(percentage: u32, seed: Option<u64>) -> Self {
        Self { percentage, seed }
    }
}

impl Selector for PercentageSelector {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>> {
        let mut online = topology.online_clients();
        let mut rng = seeded_rng(self.seed);
        online.shuffle(&mut rng);
        let take = online.len() * self.percentage as usize / 100;
        online.truncate(take);
        binary_selection(online, topology, commands)
    }
}

/// Selects N random online workers (or everyone when fewer are online).
#[derive(Debug, Clone)]
pub struct NSelector {
    pub n: usize,
    pub seed: Option<u64>,
}

impl NSelector {
    pub fn new(n: usize, seed: Option<u64>) -> Self {
        Self { n, seed }
    }
}

impl Selector for NSelector {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>> {
        let mut online = topology.online_clients();
        let mut rng = seeded_rng(self.seed);
        online.shuffle(&mut rng);
        online.truncate(self.n);
        binary_selection(online, topology, commands)
    }
}

/// Selects every online worker carrying a flag.
#[derive(Debug, Clone)]
pub struct FlagSelector {
    pub flag: String,
}

impl FlagSelector {
    pub fn new(flag: impl Into<String>) -> Self {
        Self { flag: flag.into() }
    }
}

impl Selector for FlagSelector {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>> {
        let online = topology.online_clients();
        let flagged = topology
            .clients_with_flag(&self.flag)
            .into_iter()
            .filter(|name| online.contains(name))
            .collect();
        binary_selection(flagged, topology, commands)
    }
}

/// Selects an explicit list of workers; names not currently online are
/// ignored.
#[derive(Debug, Clone)]
pub struct ListSelector {
    pub clients: Vec<String>,
}

impl ListSelector {
    pub fn new(clients: Vec<String>) -> Self {
        Self { clients }
    }
}

impl Selector for ListSelector {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>> {
        let online = topology.online_clients();
        let selected = self
            .clients
            .iter()
            .filter(|name| online.contains(name))
            .cloned()
            .collect();
        binary_selection(selected, topology, commands)
    }
}

/// Selects a uniformly random number (at least one) of online workers.
#[derive(Debug, Clone)]
pub struct RandomCountSelector {
    pub seed: Option<u64>,
}

impl RandomCountSelector {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }
}

impl Selector for RandomCountSelector {
    fn select(
        &self,
        topology: &Topology,
        commands: &[CommandSpec],
    ) -> BTreeMap<String, Option<CommandId>> {
        let mut online = topology.online_clients();
        if online.is_empty() {
            return BTreeMap::new();
        }
        let mut rng = seeded_rng(self.seed);
        let count = rng.random_range(1..=online.len());
        online.shuffle(&mut rng);
        online.truncate(count);
        binary_selection(online, topology, commands)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use muster_common::model::{Node, NodeRole};

    fn topology(online: usize) -> Topology {
        let mut nodes = vec![Node::new("server", NodeRole::Server)];
        for i in 1..=4 {
            nodes.push(Node::new(format!("site-{i}"), NodeRole::Client));
        }
        let mut topology = Topology::new(nodes).unwrap();
        for i in 1..=online {
            topology.set_online(&format!("site-{i}")).unwrap();
        }
        topology
    }

    fn print_command() -> Vec<CommandSpec> {
        let mut spec = CommandSpec::print("hello");
        spec.assign_uuids();
        vec![spec]
    }

    #[test]
    fn all_selector_takes_every_online_worker() {
        let topology = topology(3);
        let commands = print_command();
        let selection = AllSelector.select(&topology, &commands);

        assert_eq!(selection.len(), 3);
        assert!(selection.values().all(|choice| choice.is_some()));
        assert!(!selection.contains_key("site-4"));
    }

    #[test]
    fn n_selector_is_deterministic_with_a_seed() {
        let topology = topology(4);
        let commands = print_command();
        let selector = NSelector::new(2, Some(7));

        let first = selector.select(&topology, &commands);
        let second = selector.select(&topology, &commands);
        assert_eq!(first, second);
        assert_eq!(
            first.values().filter(|choice| choice.is_some()).count(),
            2
        );
        // unselected workers are excluded, not missing
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn flag_selector_ignores_offline_flagged_workers() {
        let mut topology = topology(2);
        topology.set_flag("site-1", "gpu").unwrap();
        topology.set_flag("site-4", "gpu").unwrap();
        let commands = print_command();

        let selection = FlagSelector::new("gpu").select(&topology, &commands);
        assert_eq!(selection.get("site-1").unwrap().is_some(), true);
        assert_eq!(selection.get("site-2").unwrap().is_some(), false);
        assert!(!selection.contains_key("site-4"));
    }

    #[test]
    fn list_selector_keeps_only_online_listed_workers() {
        let topology = topology(2);
        let commands = print_command();
        let selector = ListSelector::new(vec!["site-2".to_string(), "site-4".to_string()]);

        let selection = selector.select(&topology, &commands);
        assert!(selection.get("site-2").unwrap().is_some());
        assert!(selection.get("site-1").unwrap().is_none());
    }

    #[test]
    fn percentage_selector_takes_the_floor() {
        let topology = topology(4);
        let commands = print_command();
        let selection = PercentageSelector::new(50, Some(1)).select(&topology, &commands);
        assert_eq!(
            selection.values().filter(|choice| choice.is_some()).count(),
            2
        );
    }
}
