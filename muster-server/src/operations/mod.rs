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

pub mod action;
pub mod condition;
pub mod distribution;
pub mod hooks;
pub mod selector;

pub use action::{Action, ActionCell, AggregateAction, Aggregator};
pub use condition::Condition;
pub use distribution::{DistTable, Distribution, ErrorPolicy};
pub use selector::Selector;

use crate::storage::BlobStore;
use crate::topology::Topology;
use crate::watcher::WatcherPool;
use muster_common::resources::ResourceRegistry;
use std::collections::VecDeque;
use std::sync::Arc;

/// Everything an operation may touch while it runs on the server. Handed
/// down per call; operations hold no back-references.
pub struct OpCtx<'a> {
    pub topology: &'a mut Topology,
    pub resources: &'a mut ResourceRegistry,
    pub watchers: &'a mut WatcherPool,
    pub blobs: &'a Arc<BlobStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Created,
    Booting,
    Execution,
    ExecutionFinished,
    Completed,
}

/// One step of the operation program: a gate, a server-local action, a
/// multi-worker distribution, or a group that splices its members at the
/// front when it reaches the head.
pub enum Operation {
    Condition(Box<dyn Condition>),
    Action(ActionCell),
    Distribution(Distribution),
    Group(Vec<Operation>),
}

impl Operation {
    pub fn condition(condition: impl Condition + 'static) -> Self {
        Operation::Condition(Box::new(condition))
    }

    pub fn action(action: impl Action + 'static) -> Self {
        Operation::Action(ActionCell::new(Box::new(action)))
    }

    pub fn distribution(distribution: Distribution) -> Self {
        Operation::Distribution(distribution)
    }

    pub fn group(operations: Vec<Operation>) -> Self {
        Operation::Group(operations)
    }
}

/// The ordered operation list. Operations advance strictly head-of-list;
/// completed heads move into the history counter and splice their successors
/// at the front.
#[derive(Default)]
pub struct OperationProgram {
    operations: VecDeque<Operation>,
    completed: usize,
}

impl OperationProgram {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            operations: operations.into(),
            completed: 0,
        }
    }

    pub fn head(&self) -> Option<&Operation> {
        self.operations.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Operation> {
        self.operations.front_mut()
    }

    /// Drops the head and splices its successors at the front.
    pub fn complete_head(&mut self, successors: Vec<Operation>) {
        self.operations.pop_front();
        self.completed += 1;
        for successor in successors.into_iter().rev() {
            self.operations.push_front(successor);
        }
    }

    /// Replaces a group head by its members.
    pub fn flatten_head_group(&mut self) -> bool {
        if matches!(self.operations.front(), Some(Operation::Group(_))) {
            let Some(Operation::Group(members)) = self.operations.pop_front() else {
                return false;
            };
            for member in members.into_iter().rev() {
                self.operations.push_front(member);
            }
            true
        } else {
            false
        }
    }

    pub fn push_back(&mut self, operation: Operation) {
        self.operations.push_back(operation);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}
