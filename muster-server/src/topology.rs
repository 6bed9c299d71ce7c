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

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use muster_common::error::CoreError;
use muster_common::model::{Node, NodeRole, NodeStatus, ScalarValue};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
struct TopologyFile {
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Deserialize)]
struct NodeRecord {
    name: String,
    role: NodeRole,
}

/// The inventory of nodes in the federation. Owned by the engine; only the
/// server mutates it, request handlers read snapshots.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: IndexMap<String, Node>,
}

impl Topology {
    pub fn new(nodes: Vec<Node>) -> Result<Self, CoreError> {
        let mut topology = Topology::default();
        for node in nodes {
            if topology.nodes.contains_key(&node.name) {
                return Err(CoreError::Topology(format!(
                    "Node with name {} already exists",
                    node.name
                )));
            }
            topology.nodes.insert(node.name.clone(), node);
        }
        topology.validate()?;
        Ok(topology)
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CoreError::ClientConfiguration(format!("Cannot read topology file {path:?}: {err}"))
        })?;
        let parsed: TopologyFile = toml::from_str(&raw).map_err(|err| {
            CoreError::ClientConfiguration(format!("Cannot parse topology file {path:?}: {err}"))
        })?;

        info!(path = ?path, "Loading topology");
        Self::new(
            parsed
                .nodes
                .into_iter()
                .map(|record| Node::new(record.name, record.role))
                .collect(),
        )
    }

    /// A topology without a configured node list, for simulation mode; the
    /// server node is implicit.
    pub fn simulated() -> Self {
        let mut topology = Topology::default();
        let server = Node::new("server", NodeRole::Server);
        topology.nodes.insert(server.name.clone(), server);
        topology
    }

    fn validate(&self) -> Result<(), CoreError> {
        let servers = self
            .nodes
            .values()
            .filter(|node| node.role == NodeRole::Server)
            .count();
        if servers != 1 {
            return Err(CoreError::Topology(format!(
                "Expected exactly one server node, found {servers}"
            )));
        }
        Ok(())
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), CoreError> {
        if self.nodes.contains_key(&node.name) {
            return Err(CoreError::Conflict(format!(
                "Node with name {} already exists",
                node.name
            )));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
            .filter(|node| node.role == NodeRole::Client)
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients().map(|node| node.name.clone()).collect()
    }

    pub fn online_clients(&self) -> Vec<String> {
        self.clients()
            .filter(|node| node.is_online())
            .map(|node| node.name.clone())
            .collect()
    }

    pub fn num_clients(&self) -> usize {
        self.clients().count()
    }

    pub fn num_online_clients(&self) -> usize {
        self.clients().filter(|node| node.is_online()).count()
    }

    pub fn fraction_connected(&self) -> f64 {
        let total = self.num_clients();
        if total == 0 {
            0.0
        } else {
            self.num_online_clients() as f64 / total as f64
        }
    }

    pub fn clients_with_flag(&self, flag: &str) -> Vec<String> {
        self.clients()
            .filter(|node| node.flags.contains(flag))
            .map(|node| node.name.clone())
            .collect()
    }

    /// Returns true when the status actually changed.
    pub fn set_online(&mut self, name: &str) -> Result<bool, CoreError> {
        let node = self.client_mut(name)?;
        node.last_active = Utc::now();
        let changed = node.status != NodeStatus::Online;
        node.status = NodeStatus::Online;
        if changed {
            info!(node = name, "Node is online");
        }
        Ok(changed)
    }

    pub fn set_offline(&mut self, name: &str) -> Result<bool, CoreError> {
        let node = self.client_mut(name)?;
        let changed = node.status != NodeStatus::Offline;
        node.status = NodeStatus::Offline;
        if changed {
            info!(node = name, "Node is offline");
        }
        Ok(changed)
    }

    /// Refreshes the liveness clock of a node without a status transition.
    pub fn touch(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.last_active = Utc::now();
        }
    }

    /// Idempotent; returns true when the flag set changed.
    pub fn set_flag(&mut self, name: &str, flag: &str) -> Result<bool, CoreError> {
        let node = self.client_mut(name)?;
        Ok(node.flags.insert(flag.to_string()))
    }

    pub fn remove_flag(&mut self, name: &str, flag: &str) -> Result<bool, CoreError> {
        let node = self.client_mut(name)?;
        Ok(node.flags.remove(flag))
    }

    pub fn set_data(&mut self, name: &str, key: &str, value: ScalarValue) -> Result<(), CoreError> {
        let node = self.client_mut(name)?;
        node.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Online clients that have been silent for longer than `timeout`.
    pub fn timed_out_clients(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        self.clients()
            .filter(|node| {
                node.is_online()
                    && node
                        .last_active
                        .checked_add_signed(timeout)
                        .map(|deadline| deadline < now)
                        .unwrap_or(false)
            })
            .map(|node| node.name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    fn client_mut(&mut self, name: &str) -> Result<&mut Node, CoreError> {
        match self.nodes.get_mut(name) {
            Some(node) if node.role == NodeRole::Client => Ok(node),
            Some(_) => Err(CoreError::Conflict(format!(
                "Node {name} is not a client"
            ))),
            None => Err(CoreError::NotFound(format!(
                "Client with name {name} not found"
            ))),
        }
    }
}
