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

use crate::operations::{
    Action, Condition, Distribution, OpCtx, Operation, OperationProgram, OperationStatus,
};
use crate::storage::BlobStore;
use crate::topology::Topology;
use crate::watcher::{Notification, WatcherPool};
use chrono::Utc;
use muster_common::checkpoints::CheckpointStore;
use muster_common::command::CommandSpec;
use muster_common::error::CoreError;
use muster_common::message::{ExecutionResponse, ServerRequest, StatusUpdate};
use muster_common::model::{keys, Node, NodeRole};
use muster_common::resources::ResourceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Mutable server state. Every mutation is serialized behind the engine's
/// mutex; request handlers take snapshots for reads.
pub struct EngineState {
    pub topology: Topology,
    pub resources: ResourceRegistry,
    pub watchers: WatcherPool,
    pub program: OperationProgram,
    /// A distribution that continuously admits newly joined workers,
    /// checked before the program head.
    pub open_distribution: Option<Distribution>,
    /// Conditions evaluated on every dispatch tick; any unresolved one
    /// pauses dispatch entirely.
    pub permanent_conditions: Vec<Box<dyn Condition>>,
    pub simulation: bool,
    action_running: bool,
    halted: bool,
}

impl EngineState {
    pub fn new(topology: Topology, operations: Vec<Operation>) -> Self {
        let mut resources = ResourceRegistry::new();
        resources
            .set_arc(keys::CHECKPOINTS, Arc::new(CheckpointStore::new()))
            .expect("fresh registry accepts the checkpoint store");
        resources
            .set_arc(keys::CLIENT_CHECKPOINTS, Arc::new(CheckpointStore::new()))
            .expect("fresh registry accepts the accumulator");

        Self {
            topology,
            resources,
            watchers: WatcherPool::new(),
            program: OperationProgram::new(operations),
            open_distribution: None,
            permanent_conditions: Vec::new(),
            simulation: false,
            action_running: false,
            halted: false,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

enum HeadStep {
    Nothing,
    Dispatch(Option<CommandSpec>),
    Pop(Vec<Operation>),
    Spawn(Box<dyn Action>),
}

/// The operation interpreter: advances the program, hands out commands per
/// worker poll and routes status updates back into the owning distribution.
/// The pull request is the scheduling tick.
pub struct Engine {
    state: Mutex<EngineState>,
    blobs: Arc<BlobStore>,
}

impl Engine {
    pub fn new(mut state: EngineState, blobs: Arc<BlobStore>, run_name: &str) -> Arc<Self> {
        let EngineState {
            watchers, resources, ..
        } = &mut state;
        watchers.notify_all(
            Notification::Initialization {
                run_name: run_name.to_string(),
            },
            resources,
        );
        Arc::new(Self {
            state: Mutex::new(state),
            blobs,
        })
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub async fn topology_snapshot(&self) -> Vec<Node> {
        self.state.lock().await.topology.snapshot()
    }

    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted
    }

    /// True once the program ran to completion (no halt, no pending
    /// operations, no running action).
    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        !state.halted && state.program.is_empty() && !state.action_running
    }

    /// One interpreter step for one worker; returns the command to hand out,
    /// if any.
    pub async fn next_command(
        self: &Arc<Self>,
        worker: &str,
    ) -> Result<Option<CommandSpec>, CoreError> {
        let mut state = self.state.lock().await;
        state.topology.touch(worker);

        if state.halted {
            return Ok(None);
        }

        let gates_unresolved = state
            .permanent_conditions
            .iter()
            .any(|condition| !condition.resolved(&state.topology, &state.resources));
        if gates_unresolved {
            return Ok(None);
        }

        if state.action_running {
            return Ok(None);
        }

        if state.open_distribution.is_some() {
            let EngineState {
                open_distribution,
                topology,
                resources,
                watchers,
                ..
            } = &mut *state;
            let open = open_distribution.as_mut().expect("checked above");
            let mut cx = OpCtx {
                topology,
                resources,
                watchers,
                blobs: &self.blobs,
            };
            if open.status() == OperationStatus::Created {
                open.init(&mut cx)?;
            }
            if let Some(spec) = open.infer_command(worker, &mut cx) {
                return Ok(Some(spec));
            }
        }

        loop {
            if state.program.flatten_head_group() {
                continue;
            }

            let step = {
                let EngineState {
                    program,
                    topology,
                    resources,
                    watchers,
                    ..
                } = &mut *state;
                let mut cx = OpCtx {
                    topology,
                    resources,
                    watchers,
                    blobs: &self.blobs,
                };

                match program.head_mut() {
                    None => HeadStep::Nothing,
                    Some(Operation::Group(_)) => {
                        // handled by flatten_head_group above
                        continue;
                    }
                    Some(Operation::Condition(condition)) => {
                        if condition.resolved(cx.topology, cx.resources) {
                            HeadStep::Pop(Vec::new())
                        } else {
                            HeadStep::Nothing
                        }
                    }
                    Some(Operation::Action(cell)) => match cell.status {
                        OperationStatus::Created => {
                            let action = cell.take_action().expect("created cell holds an action");
                            HeadStep::Spawn(action)
                        }
                        OperationStatus::Completed => HeadStep::Pop(cell.take_successors()),
                        _ => HeadStep::Nothing,
                    },
                    Some(Operation::Distribution(distribution)) => {
                        if distribution.status() == OperationStatus::Created {
                            distribution.init(&mut cx)?;
                        }
                        if distribution.status() == OperationStatus::Completed {
                            HeadStep::Pop(distribution.take_successors())
                        } else {
                            HeadStep::Dispatch(distribution.infer_command(worker, &mut cx))
                        }
                    }
                }
            };

            match step {
                HeadStep::Nothing => return Ok(None),
                HeadStep::Dispatch(spec) => return Ok(spec),
                HeadStep::Pop(successors) => {
                    state.program.complete_head(successors);
                    continue;
                }
                HeadStep::Spawn(action) => {
                    state.action_running = true;
                    self.spawn_action(action);
                    return Ok(None);
                }
            }
        }
    }

    fn spawn_action(self: &Arc<Self>, mut action: Box<dyn Action>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let name = action.name();
            let result = {
                let mut state = engine.state.lock().await;
                let EngineState {
                    topology,
                    resources,
                    watchers,
                    ..
                } = &mut *state;
                let mut cx = OpCtx {
                    topology,
                    resources,
                    watchers,
                    blobs: &engine.blobs,
                };
                action.perform(&mut cx)
            };

            let mut state = engine.state.lock().await;
            state.action_running = false;
            match result {
                Ok(successors) => {
                    if let Some(Operation::Action(cell)) = state.program.head_mut() {
                        cell.complete(successors);
                    }
                }
                Err(err) => {
                    error!(action = name, error = %err, "Server action failed; halting the program");
                    state.halted = true;
                }
            }
        });
    }

    /// Routes a status update to the live distribution owning its command
    /// UUID.
    pub async fn handle_status_update(&self, update: StatusUpdate) -> Result<(), CoreError> {
        let worker = update.node_name.clone().ok_or_else(|| {
            CoreError::InvalidRequest("Status update without a node name".to_string())
        })?;

        let mut state = self.state.lock().await;
        state.topology.touch(&worker);

        let EngineState {
            program,
            open_distribution,
            topology,
            resources,
            watchers,
            halted,
            ..
        } = &mut *state;
        let mut cx = OpCtx {
            topology,
            resources,
            watchers,
            blobs: &self.blobs,
        };

        let owner = if open_distribution
            .as_ref()
            .map(|open| open.owns_command(update.command_uuid))
            .unwrap_or(false)
        {
            open_distribution.as_mut()
        } else {
            match program.head_mut() {
                Some(Operation::Distribution(distribution))
                    if distribution.owns_command(update.command_uuid) =>
                {
                    Some(distribution)
                }
                _ => None,
            }
        };

        match owner {
            Some(distribution) => {
                let halt = distribution.handle_status_update(&update, &mut cx)?;
                if halt {
                    error!(
                        command = %update.command_uuid,
                        worker,
                        "Main command failed; halting the program"
                    );
                    *halted = true;
                }
            }
            None => {
                warn!(
                    command = %update.command_uuid,
                    worker,
                    "No live distribution owns this command; dropping status update"
                );
            }
        }
        Ok(())
    }

    pub async fn handle_server_request(
        self: &Arc<Self>,
        request: ServerRequest,
        worker: &str,
    ) -> Result<ExecutionResponse, CoreError> {
        match request {
            ServerRequest::PullCommand(_) => {
                let spec = self.next_command(worker).await?;
                Ok(ExecutionResponse::command(spec.as_ref()))
            }
            ServerRequest::FetchCheckpoint {
                resource_type,
                resource_key,
                checkpoint_key,
            } => {
                let state = self.state.lock().await;
                let checkpoints: Arc<CheckpointStore> = state.resources.get(keys::CHECKPOINTS)?;
                let checkpoint = checkpoints
                    .get(&resource_type, &resource_key, &checkpoint_key)
                    .ok_or_else(|| {
                        CoreError::NotFound(format!(
                            "No checkpoint {resource_type}:{resource_key}:{checkpoint_key}"
                        ))
                    })?;
                Ok(ExecutionResponse::resource(resource_key, checkpoint.data))
            }
        }
    }

    /// An authenticated worker connected (or re-connected). In simulation
    /// mode unknown workers join the topology on the fly.
    pub async fn connect(&self, worker: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.topology.contains(worker) {
            if state.simulation {
                state.topology.add_node(Node::new(worker, NodeRole::Client))?;
            } else {
                return Err(CoreError::Conflict(format!(
                    "Worker {worker} is not part of the configured topology"
                )));
            }
        }
        let changed = state.topology.set_online(worker)?;
        if changed {
            apply_topology_change(&mut state, &self.blobs, worker)?;
        }
        Ok(())
    }

    pub async fn disconnect(&self, worker: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let changed = state.topology.set_offline(worker)?;
        if changed {
            apply_topology_change(&mut state, &self.blobs, worker)?;
        }
        Ok(())
    }

    /// Marks every client offline that has been silent for longer than
    /// `timeout`; their in-flight work is treated as lost.
    pub async fn check_liveness(&self, timeout: Duration) -> Result<Vec<String>, CoreError> {
        let mut state = self.state.lock().await;
        let timed_out = state.topology.timed_out_clients(Utc::now(), timeout);
        for worker in &timed_out {
            warn!(worker, "Client timed out");
            if state.topology.set_offline(worker)? {
                apply_topology_change(&mut state, &self.blobs, worker)?;
            }
        }
        Ok(timed_out)
    }

    /// Test and bootstrap access to the serialized state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

/// Pokes every registered live distribution and then the watchers.
fn apply_topology_change(
    state: &mut EngineState,
    blobs: &Arc<BlobStore>,
    node: &str,
) -> Result<(), CoreError> {
    let EngineState {
        program,
        open_distribution,
        topology,
        resources,
        watchers,
        ..
    } = state;

    {
        let mut cx = OpCtx {
            topology,
            resources,
            watchers,
            blobs,
        };
        if let Some(open) = open_distribution.as_mut() {
            open.handle_topology_change(node, &mut cx)?;
        }
        if let Some(Operation::Distribution(distribution)) = program.head_mut() {
            distribution.handle_topology_change(node, &mut cx)?;
        }
    }

    let nodes = topology.snapshot();
    watchers.notify_all(Notification::TopologyChange { nodes }, resources);
    Ok(())
}
