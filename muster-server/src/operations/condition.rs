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
use muster_common::resources::ResourceRegistry;
use std::fmt::Debug;

/// A gate in the operation program. The interpreter re-evaluates the head
/// condition on every dispatch tick until it resolves.
pub trait Condition: Send + Debug {
    fn resolved(&self, topology: &Topology, resources: &ResourceRegistry) -> bool;
}

/// Resolves once at least `count` clients are online.
#[derive(Debug, Clone)]
pub struct RequireClientCount {
    pub count: usize,
}

impl RequireClientCount {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "required client count must be positive");
        Self { count }
    }
}

impl Condition for RequireClientCount {
    fn resolved(&self, topology: &Topology, _resources: &ResourceRegistry) -> bool {
        topology.num_online_clients() >= self.count
    }
}

/// Resolves once every named client is online.
#[derive(Debug, Clone)]
pub struct RequireClients {
    pub clients: Vec<String>,
}

impl RequireClients {
    pub fn new(clients: Vec<String>) -> Self {
        Self { clients }
    }
}

impl Condition for RequireClients {
    fn resolved(&self, topology: &Topology, _resources: &ResourceRegistry) -> bool {
        let online = topology.online_clients();
        self.clients.iter().all(|name| online.contains(name))
    }
}

/// Resolves once the connected fraction reaches the threshold; 1.0 requires
/// the full fleet.
#[derive(Debug, Clone)]
pub struct RequireConnectedFraction {
    pub fraction: f64,
}

impl RequireConnectedFraction {
    pub fn new(fraction: f64) -> Self {
        assert!(
            fraction > 0.0 && fraction <= 1.0,
            "fraction must be in (0, 1]"
        );
        Self { fraction }
    }

    pub fn all() -> Self {
        Self::new(1.0)
    }
}

impl Condition for RequireConnectedFraction {
    fn resolved(&self, topology: &Topology, _resources: &ResourceRegistry) -> bool {
        topology.num_clients() > 0 && topology.fraction_connected() >= self.fraction
    }
}

/// Resolves once a resource registry path exists, e.g. a checkpoint staged
/// by an earlier operation.
#[derive(Debug, Clone)]
pub struct RequireResource {
    pub path: String,
}

impl RequireResource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Condition for RequireResource {
    fn resolved(&self, _topology: &Topology, resources: &ResourceRegistry) -> bool {
        resources.contains(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use muster_common::model::{Node, NodeRole};

    fn topology() -> Topology {
        Topology::new(vec![
            Node::new("server", NodeRole::Server),
            Node::new("site-1", NodeRole::Client),
            Node::new("site-2", NodeRole::Client),
        ])
        .unwrap()
    }

    #[test]
    fn client_count_gate() {
        let mut topology = topology();
        let resources = ResourceRegistry::new();
        let condition = RequireClientCount::new(2);

        assert!(!condition.resolved(&topology, &resources));
        topology.set_online("site-1").unwrap();
        assert!(!condition.resolved(&topology, &resources));
        topology.set_online("site-2").unwrap();
        assert!(condition.resolved(&topology, &resources));
    }

    #[test]
    fn named_clients_gate() {
        let mut topology = topology();
        let resources = ResourceRegistry::new();
        let condition = RequireClients::new(vec!["site-2".to_string()]);

        topology.set_online("site-1").unwrap();
        assert!(!condition.resolved(&topology, &resources));
        topology.set_online("site-2").unwrap();
        assert!(condition.resolved(&topology, &resources));
    }

    #[test]
    fn fraction_gate() {
        let mut topology = topology();
        let resources = ResourceRegistry::new();

        topology.set_online("site-1").unwrap();
        assert!(RequireConnectedFraction::new(0.5).resolved(&topology, &resources));
        assert!(!RequireConnectedFraction::all().resolved(&topology, &resources));
    }

    #[test]
    fn resource_gate() {
        let topology = topology();
        let mut resources = ResourceRegistry::new();
        let condition = RequireResource::new("model:resnet");

        assert!(!condition.resolved(&topology, &resources));
        resources.set("model:resnet", 1u8).unwrap();
        assert!(condition.resolved(&topology, &resources));
    }
}
