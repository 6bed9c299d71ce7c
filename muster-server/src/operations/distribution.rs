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

use super::hooks;
use super::selector::{AllSelector, Selector};
use super::{OpCtx, Operation, OperationStatus};
use crate::watcher::Notification;
use muster_common::command::CommandSpec;
use muster_common::error::CoreError;
use muster_common::message::StatusUpdate;
use muster_common::model::{CommandId, CommandStatus, DistributionId};
use indexmap::IndexMap;
use tracing::{debug, warn};

/// Per-worker, per-command progress of one distribution. A `None` row marks
/// a worker that is known but excluded. The first UUID in a selected
/// worker's map is the main UUID; the UUID set of a row never changes after
/// selection.
#[derive(Debug, Default)]
pub struct DistTable {
    rows: IndexMap<String, Option<IndexMap<CommandId, CommandStatus>>>,
}

impl DistTable {
    pub fn add_node(&mut self, node: &str, command_uuids: Vec<CommandId>) {
        let row = command_uuids
            .into_iter()
            .map(|uuid| (uuid, CommandStatus::Unrequested))
            .collect();
        self.rows.insert(node.to_string(), Some(row));
    }

    pub fn add_excluded(&mut self, node: &str) {
        self.rows.insert(node.to_string(), None);
    }

    /// Nulls out a row; the UUIDs are gone with the in-flight work.
    pub fn exclude(&mut self, node: &str) {
        if let Some(row) = self.rows.get_mut(node) {
            *row = None;
        }
    }

    pub fn remove(&mut self, node: &str) {
        self.rows.shift_remove(node);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.rows.contains_key(node)
    }

    pub fn is_selected(&self, node: &str) -> bool {
        matches!(self.rows.get(node), Some(Some(_)))
    }

    pub fn selected(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|(_, row)| row.is_some())
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn main_uuid(&self, node: &str) -> Option<CommandId> {
        self.rows
            .get(node)?
            .as_ref()?
            .keys()
            .next()
            .copied()
    }

    pub fn main_status(&self, node: &str) -> Option<CommandStatus> {
        let row = self.rows.get(node)?.as_ref()?;
        row.values().next().copied()
    }

    pub fn status(&self, node: &str, uuid: CommandId) -> Option<CommandStatus> {
        self.rows.get(node)?.as_ref()?.get(&uuid).copied()
    }

    pub fn has_command(&self, node: &str, uuid: CommandId) -> bool {
        self.status(node, uuid).is_some()
    }

    /// Returns false when the node is unselected or the UUID is not part of
    /// its subtree.
    pub fn set_status(&mut self, node: &str, uuid: CommandId, status: CommandStatus) -> bool {
        match self.rows.get_mut(node) {
            Some(Some(row)) => match row.get_mut(&uuid) {
                Some(entry) => {
                    *entry = status;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn set_all(&mut self, node: &str, status: CommandStatus) {
        match self.rows.get_mut(node) {
            Some(Some(row)) => {
                for entry in row.values_mut() {
                    *entry = status;
                }
            }
            _ => warn!(
                node,
                "Attempted to set status of all commands on a node that is not part of the distribution"
            ),
        }
    }

    /// Workers whose main command is SEND or STARTED.
    pub fn active(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|(node, row)| {
                let row = row.as_ref()?;
                let main = row.values().next()?;
                matches!(main, CommandStatus::Send | CommandStatus::Started).then(|| node.clone())
            })
            .collect()
    }

    /// True when every command of the node reached a terminal state;
    /// unselected nodes count as done.
    pub fn node_terminal(&self, node: &str) -> bool {
        match self.rows.get(node) {
            Some(Some(row)) => row.values().all(|status| status.is_terminal()),
            _ => true,
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.selected().iter().all(|node| self.node_terminal(node))
    }

    /// True when the command reached FINISHED or FAILED on every selected
    /// worker that carries it.
    pub fn command_terminal_everywhere(&self, uuid: CommandId) -> bool {
        let mut seen = false;
        for row in self.rows.values().flatten() {
            if let Some(status) = row.get(&uuid) {
                seen = true;
                if !matches!(status, CommandStatus::Finished | CommandStatus::Failed) {
                    return false;
                }
            }
        }
        seen
    }

    pub fn rows(&self) -> &IndexMap<String, Option<IndexMap<CommandId, CommandStatus>>> {
        &self.rows
    }
}

/// What to do when a worker's main command fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Stop interpreting the program; failures need an operator.
    HaltOnFailure,
    /// FAILED counts as terminal and the distribution finishes around it.
    ContinueOnFailure,
}

enum DistributionMode {
    Closed { selector: Box<dyn Selector> },
    Open,
}

pub type FinishHook =
    Box<dyn FnMut(&Distribution, &mut OpCtx<'_>) -> Vec<Operation> + Send>;
pub type InitHook = Box<dyn FnMut(&mut OpCtx<'_>) + Send>;

/// An operation that dispatches command trees to a set of workers and
/// tracks per-worker progress until every subtree terminates.
pub struct Distribution {
    id: Option<DistributionId>,
    mode: DistributionMode,
    commands: Vec<CommandSpec>,
    pub table: DistTable,
    status: OperationStatus,
    simultaneous_execution: usize,
    set_flags: Vec<String>,
    remove_flags: Vec<String>,
    error_policy: ErrorPolicy,
    successors: Vec<Operation>,
    on_init_hooks: Vec<InitHook>,
    on_finish_hooks: Vec<FinishHook>,
}

impl Distribution {
    /// Fixed membership chosen at init time by a selector.
    pub fn closed(commands: Vec<CommandSpec>, selector: impl Selector + 'static) -> Self {
        Self::with_mode(
            commands,
            DistributionMode::Closed {
                selector: Box::new(selector),
            },
        )
    }

    pub fn closed_all(commands: Vec<CommandSpec>) -> Self {
        Self::closed(commands, AllSelector)
    }

    /// Admits any online worker, including ones connecting later; runs until
    /// explicitly stopped.
    pub fn open(command: CommandSpec) -> Self {
        Self::with_mode(vec![command], DistributionMode::Open)
    }

    fn with_mode(commands: Vec<CommandSpec>, mode: DistributionMode) -> Self {
        assert!(!commands.is_empty(), "a distribution needs at least one command");
        Self {
            id: None,
            mode,
            commands,
            table: DistTable::default(),
            status: OperationStatus::Created,
            simultaneous_execution: 0,
            set_flags: Vec::new(),
            remove_flags: Vec::new(),
            error_policy: ErrorPolicy::ContinueOnFailure,
            successors: Vec::new(),
            on_init_hooks: Vec::new(),
            on_finish_hooks: Vec::new(),
        }
    }

    /// 0 means unlimited concurrently active workers.
    pub fn with_simultaneous_execution(mut self, limit: usize) -> Self {
        self.simultaneous_execution = limit;
        self
    }

    pub fn with_set_flags(mut self, flags: Vec<String>) -> Self {
        self.set_flags = flags;
        self
    }

    pub fn with_remove_flags(mut self, flags: Vec<String>) -> Self {
        self.remove_flags = flags;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn on_init(mut self, hook: InitHook) -> Self {
        self.on_init_hooks.push(hook);
        self
    }

    pub fn on_finish(mut self, hook: FinishHook) -> Self {
        self.on_finish_hooks.push(hook);
        self
    }

    pub fn id(&self) -> Option<DistributionId> {
        self.id
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    pub fn is_open(&self) -> bool {
        matches!(self.mode, DistributionMode::Open)
    }

    /// Live distributions receive topology change callbacks.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Booting | OperationStatus::Execution
        )
    }

    pub fn owns_command(&self, uuid: CommandId) -> bool {
        self.commands.iter().any(|command| command.contains(uuid))
    }

    fn find_command(&self, uuid: CommandId) -> Option<&CommandSpec> {
        self.commands.iter().find_map(|command| command.find(uuid))
    }

    /// Initialization: assign UUIDs, populate the table, run the command
    /// init hooks. An empty closed selection completes immediately.
    pub fn init(&mut self, cx: &mut OpCtx<'_>) -> Result<(), CoreError> {
        let id = DistributionId::new_v4();
        self.id = Some(id);
        self.status = OperationStatus::Booting;

        let mut init_hooks = std::mem::take(&mut self.on_init_hooks);
        for hook in init_hooks.iter_mut() {
            hook(cx);
        }

        for command in &mut self.commands {
            command.assign_uuids();
        }

        match &self.mode {
            DistributionMode::Closed { selector } => {
                let selection = selector.select(cx.topology, &self.commands);
                for (node, choice) in selection {
                    match choice {
                        None => self.table.add_excluded(&node),
                        Some(main_uuid) => {
                            let command = self
                                .commands
                                .iter()
                                .find(|command| command.contains(main_uuid))
                                .ok_or_else(|| {
                                    CoreError::Conflict(format!(
                                        "Selector picked unknown command {main_uuid}"
                                    ))
                                })?;
                            self.table.add_node(&node, command.collect_uuids());
                        }
                    }
                }
            }
            DistributionMode::Open => {
                let uuids = self.commands[0].collect_uuids();
                for node in cx.topology.online_clients() {
                    self.table.add_node(&node, uuids.clone());
                }
            }
        }

        debug!(distribution = %id, selected = ?self.table.selected(), "Distribution initialized");

        if matches!(self.mode, DistributionMode::Closed { .. }) && self.table.selected().is_empty()
        {
            return self.finish(cx);
        }

        let selected = self.table.selected();
        for command in &mut self.commands {
            hooks::command_on_init(command, cx, &selected)?;
        }

        self.status = OperationStatus::Execution;
        Ok(())
    }

    /// Picks the command to hand to a polling worker, or none: not part of
    /// the distribution, already dispatched, or held back by backpressure.
    pub fn infer_command(&mut self, node: &str, _cx: &mut OpCtx<'_>) -> Option<CommandSpec> {
        if self.status != OperationStatus::Execution {
            return None;
        }
        if self.table.main_status(node) != Some(CommandStatus::Unrequested) {
            return None;
        }
        if self.simultaneous_execution > 0
            && self.table.active().len() >= self.simultaneous_execution
        {
            return None;
        }

        self.table.set_all(node, CommandStatus::Send);
        let main_uuid = self.table.main_uuid(node)?;
        let command = self
            .commands
            .iter()
            .find(|command| command.contains(main_uuid))?;

        let mut spec = command.clone();
        hooks::node_specific_modification(&mut spec, &self.table, node);
        Some(spec)
    }

    /// Absorbs a status update into the table and fires the server-side
    /// hooks. Returns true when the interpreter should halt (main command
    /// failed under `HaltOnFailure`).
    pub fn handle_status_update(
        &mut self,
        update: &StatusUpdate,
        cx: &mut OpCtx<'_>,
    ) -> Result<bool, CoreError> {
        let node = update
            .node_name
            .clone()
            .ok_or_else(|| CoreError::InvalidRequest("Status update without a node name".to_string()))?;

        if !self.table.is_selected(&node) {
            warn!(
                node,
                command = %update.command_uuid,
                "Received status update from a worker that is excluded from the distribution"
            );
            return Ok(false);
        }
        if !self.table.set_status(&node, update.command_uuid, update.status) {
            warn!(
                node,
                command = %update.command_uuid,
                "Received status update for a command that is not part of the distribution"
            );
            return Ok(false);
        }

        if update.status == CommandStatus::Finished {
            if let Some(spec) = self.find_command(update.command_uuid) {
                hooks::on_client_finish(
                    spec,
                    self.id.expect("initialized distribution has an id"),
                    &node,
                    update.response.as_ref(),
                    cx,
                )?;
            }
        }

        {
            let OpCtx {
                watchers, resources, ..
            } = cx;
            watchers.notify_all(Notification::StatusUpdate(update.clone()), resources);
        }

        if self.table.node_terminal(&node) {
            let mut flags_changed = false;
            for flag in &self.set_flags {
                flags_changed |= cx.topology.set_flag(&node, flag)?;
            }
            for flag in &self.remove_flags {
                flags_changed |= cx.topology.remove_flag(&node, flag)?;
            }
            if flags_changed {
                let nodes = cx.topology.snapshot();
                let OpCtx {
                    watchers, resources, ..
                } = cx;
                watchers.notify_all(Notification::TopologyChange { nodes }, resources);
            }
        }

        if self.table.command_terminal_everywhere(update.command_uuid) {
            if let Some(spec) = self.find_command(update.command_uuid) {
                hooks::all_clients_finished(spec, cx)?;
            }
            let OpCtx {
                watchers, resources, ..
            } = cx;
            watchers.notify_all(
                Notification::CommandFinished {
                    command_uuid: update.command_uuid,
                },
                resources,
            );
        }

        let halt = update.status == CommandStatus::Failed
            && self.table.main_uuid(&node) == Some(update.command_uuid)
            && self.error_policy == ErrorPolicy::HaltOnFailure;

        if matches!(self.mode, DistributionMode::Closed { .. }) && self.table.all_terminal() {
            self.finish(cx)?;
        }

        Ok(halt)
    }

    /// Topology change callback. Open distributions admit newly online
    /// workers and evict offline ones; closed distributions null out the
    /// offline worker's row and re-check their finish condition.
    pub fn handle_topology_change(&mut self, node: &str, cx: &mut OpCtx<'_>) -> Result<(), CoreError> {
        if !self.is_live() {
            return Ok(());
        }
        let online = cx
            .topology
            .get(node)
            .map(|record| record.is_online())
            .unwrap_or(false);

        match self.mode {
            DistributionMode::Open => {
                if online && !self.table.contains(node) {
                    let uuids = self.commands[0].collect_uuids();
                    self.table.add_node(node, uuids);
                    debug!(node, "Open distribution admitted a late joiner");
                } else if !online {
                    self.table.remove(node);
                    debug!(node, "Open distribution evicted an offline worker");
                }
            }
            DistributionMode::Closed { .. } => {
                if !online && self.table.is_selected(node) {
                    self.table.exclude(node);
                    if self.table.all_terminal() {
                        self.finish(cx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, cx: &mut OpCtx<'_>) -> Result<(), CoreError> {
        self.status = OperationStatus::ExecutionFinished;

        let mut finish_hooks = std::mem::take(&mut self.on_finish_hooks);
        let mut successors = Vec::new();
        for hook in finish_hooks.iter_mut() {
            successors.extend(hook(&*self, cx));
        }
        self.successors.extend(successors);

        // staged broadcast blobs are consumed once the distribution is done
        for command in &self.commands {
            for blob_id in hooks::staged_blob_ids(command) {
                let _ = cx.blobs.delete(blob_id, muster_common::model::UserRole::Server);
            }
        }

        self.status = OperationStatus::Completed;

        if let Some(id) = self.id {
            let _ = cx.resources.remove_path(&id.to_string());
        }
        debug!(distribution = ?self.id, "Distribution completed");
        Ok(())
    }

    /// Successor operations collected by the finish hooks; the interpreter
    /// splices them at the program front.
    pub fn take_successors(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.successors)
    }
}
