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

use crate::model::{BlobId, CommandId};
use crate::wire::WireValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A unit of work sent to a worker. The wire form is
/// `{uuid, datatype, data}`; `datatype` names the command implementation and
/// `data` carries its construction fields. Composite kinds own child specs,
/// so a spec is a tree.
///
/// UUIDs are assigned on the server when the owning distribution
/// initializes; a spec built by a program author carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<CommandId>,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "datatype", content = "data")]
pub enum CommandKind {
    Sequence(SequenceCommand),
    Conditional(ConditionalCommand),
    Wrap(WrapCommand),
    Print(PrintCommand),
    FetchModel(FetchModelCommand),
    PushModel(PushModelCommand),
    ReportScore(ReportScoreCommand),
    AssignPartition(AssignPartitionCommand),
    SetResource(SetResourceCommand),
    Plugin(PluginCommand),
}

/// Runs its children in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceCommand {
    pub commands: Vec<CommandSpec>,
}

/// Runs the child only when the worker registry contains `resource_key`;
/// otherwise the child reports EXCLUDED so the distribution table still
/// terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalCommand {
    pub resource_key: String,
    pub command: Box<CommandSpec>,
}

/// Pre/post commands around a payload command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapCommand {
    pub before: Vec<CommandSpec>,
    pub command: Box<CommandSpec>,
    pub after: Vec<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintCommand {
    pub message: String,
}

/// Instructs a worker to download a checkpoint from the blob store and
/// install it locally. `blob_id` is filled in by the server side init hook,
/// which stages the checkpoint before any worker pulls the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchModelCommand {
    pub resource_type: String,
    pub resource_key: String,
    pub checkpoint_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<BlobId>,
}

/// Instructs a worker to return its local checkpoint bytes to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushModelCommand {
    pub resource_type: String,
    pub resource_key: String,
}

/// Instructs a worker to report a numeric score (e.g. local dataset length)
/// used as an aggregation weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportScoreCommand {
    pub score_type: String,
}

/// Hands a worker its slot among the selected workers. `index` is left empty
/// by the program author and filled per worker when the command is
/// dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignPartitionCommand {
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Installs a typed value into the worker's resource registry. Registered
/// datatypes are rebuilt on the worker through its constructor table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetResourceCommand {
    pub resource_key: String,
    pub value: WireValue,
}

/// An opaque user workload, resolved on the worker through its executor
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub name: String,
    pub params: WireValue,
}

impl CommandKind {
    pub fn datatype(&self) -> &'static str {
        match self {
            CommandKind::Sequence(_) => "Sequence",
            CommandKind::Conditional(_) => "Conditional",
            CommandKind::Wrap(_) => "Wrap",
            CommandKind::Print(_) => "Print",
            CommandKind::FetchModel(_) => "FetchModel",
            CommandKind::PushModel(_) => "PushModel",
            CommandKind::ReportScore(_) => "ReportScore",
            CommandKind::AssignPartition(_) => "AssignPartition",
            CommandKind::SetResource(_) => "SetResource",
            CommandKind::Plugin(_) => "Plugin",
        }
    }
}

impl CommandSpec {
    pub fn new(kind: CommandKind) -> Self {
        Self { uuid: None, kind }
    }

    pub fn print(message: impl Into<String>) -> Self {
        Self::new(CommandKind::Print(PrintCommand {
            message: message.into(),
        }))
    }

    pub fn sequence(commands: Vec<CommandSpec>) -> Self {
        Self::new(CommandKind::Sequence(SequenceCommand { commands }))
    }

    /// N repetitions serialize as a sequence of N copies, each with its own
    /// UUID once assigned.
    pub fn repeat(times: usize, command: CommandSpec) -> Self {
        Self::sequence(vec![command; times])
    }

    pub fn conditional(resource_key: impl Into<String>, command: CommandSpec) -> Self {
        Self::new(CommandKind::Conditional(ConditionalCommand {
            resource_key: resource_key.into(),
            command: Box::new(command),
        }))
    }

    pub fn wrap(before: Vec<CommandSpec>, command: CommandSpec, after: Vec<CommandSpec>) -> Self {
        Self::new(CommandKind::Wrap(WrapCommand {
            before,
            command: Box::new(command),
            after,
        }))
    }

    pub fn fetch_model(
        resource_type: impl Into<String>,
        resource_key: impl Into<String>,
        checkpoint_key: impl Into<String>,
    ) -> Self {
        Self::new(CommandKind::FetchModel(FetchModelCommand {
            resource_type: resource_type.into(),
            resource_key: resource_key.into(),
            checkpoint_key: checkpoint_key.into(),
            blob_id: None,
        }))
    }

    pub fn push_model(resource_type: impl Into<String>, resource_key: impl Into<String>) -> Self {
        Self::new(CommandKind::PushModel(PushModelCommand {
            resource_type: resource_type.into(),
            resource_key: resource_key.into(),
        }))
    }

    pub fn report_score(score_type: impl Into<String>) -> Self {
        Self::new(CommandKind::ReportScore(ReportScoreCommand {
            score_type: score_type.into(),
        }))
    }

    pub fn assign_partition(count: usize) -> Self {
        Self::new(CommandKind::AssignPartition(AssignPartitionCommand {
            count,
            index: None,
        }))
    }

    pub fn set_resource(resource_key: impl Into<String>, value: WireValue) -> Self {
        Self::new(CommandKind::SetResource(SetResourceCommand {
            resource_key: resource_key.into(),
            value,
        }))
    }

    pub fn plugin(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self::new(CommandKind::Plugin(PluginCommand {
            name: name.into(),
            params: WireValue::encode(&params),
        }))
    }

    pub fn children(&self) -> Vec<&CommandSpec> {
        match &self.kind {
            CommandKind::Sequence(inner) => inner.commands.iter().collect(),
            CommandKind::Conditional(inner) => vec![&inner.command],
            CommandKind::Wrap(inner) => {
                let mut children: Vec<&CommandSpec> = inner.before.iter().collect();
                children.push(&inner.command);
                children.extend(inner.after.iter());
                children
            }
            _ => Vec::new(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut CommandSpec> {
        match &mut self.kind {
            CommandKind::Sequence(inner) => inner.commands.iter_mut().collect(),
            CommandKind::Conditional(inner) => vec![&mut inner.command],
            CommandKind::Wrap(inner) => {
                let mut children: Vec<&mut CommandSpec> = inner.before.iter_mut().collect();
                children.push(&mut inner.command);
                children.extend(inner.after.iter_mut());
                children
            }
            _ => Vec::new(),
        }
    }

    /// Assigns fresh UUIDs to this command and every subcommand, depth first.
    pub fn assign_uuids(&mut self) {
        self.uuid = Some(CommandId::new_v4());
        for child in self.children_mut() {
            child.assign_uuids();
        }
    }

    /// All UUIDs in this subtree in depth-first order. The first entry is
    /// the main UUID. Panics only if called before `assign_uuids`.
    pub fn collect_uuids(&self) -> Vec<CommandId> {
        let mut uuids = Vec::new();
        self.visit(&mut |spec| {
            if let Some(uuid) = spec.uuid {
                uuids.push(uuid)
            }
        });
        uuids
    }

    pub fn main_uuid(&self) -> Option<CommandId> {
        self.uuid
    }

    pub fn find(&self, uuid: CommandId) -> Option<&CommandSpec> {
        if self.uuid == Some(uuid) {
            return Some(self);
        }
        self.children().into_iter().find_map(|child| child.find(uuid))
    }

    pub fn find_mut(&mut self, uuid: CommandId) -> Option<&mut CommandSpec> {
        if self.uuid == Some(uuid) {
            return Some(self);
        }
        self.children_mut()
            .into_iter()
            .find_map(|child| child.find_mut(uuid))
    }

    pub fn contains(&self, uuid: CommandId) -> bool {
        self.find(uuid).is_some()
    }

    /// Datatype names of every node in the tree; the worker side guard
    /// checks this set before executing anything.
    pub fn datatypes(&self) -> BTreeSet<&'static str> {
        let mut names = BTreeSet::new();
        self.visit(&mut |spec| {
            names.insert(spec.kind.datatype());
        });
        names
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a CommandSpec)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Hash of the construction data, independent of assigned UUIDs: the
    /// initialization hash of the typed encoding. Used as a cache key for
    /// derived artifacts such as partition indices.
    pub fn init_hash(&self) -> String {
        let value = serde_json::to_value(&self.kind).expect("command kinds serialize to JSON");
        WireValue::encode(&value).init_hash()
    }
}
