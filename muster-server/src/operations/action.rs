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

use super::{OpCtx, Operation, OperationStatus};
use crate::watcher::Notification;
use bytes::Bytes;
use indexmap::IndexMap;
use muster_common::checkpoints::{Checkpoint, CheckpointStore};
use muster_common::error::CoreError;
use muster_common::model::{keys, GLOBAL_CHECKPOINT};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A server-local, potentially long-running step of the operation program.
/// It runs off the dispatcher; while one is alive no commands are handed
/// out.
pub trait Action: Send {
    fn name(&self) -> &'static str;

    fn perform(&mut self, cx: &mut OpCtx<'_>) -> Result<Vec<Operation>, CoreError>;
}

/// Program slot for an action: holds the action until it is spawned and the
/// successors once it completed.
pub struct ActionCell {
    pub status: OperationStatus,
    action: Option<Box<dyn Action>>,
    pub successors: Vec<Operation>,
}

impl ActionCell {
    pub fn new(action: Box<dyn Action>) -> Self {
        Self {
            status: OperationStatus::Created,
            action: Some(action),
            successors: Vec::new(),
        }
    }

    /// Hands the action to the background task and marks the cell running.
    pub fn take_action(&mut self) -> Option<Box<dyn Action>> {
        let action = self.action.take();
        if action.is_some() {
            self.status = OperationStatus::Execution;
        }
        action
    }

    pub fn complete(&mut self, successors: Vec<Operation>) {
        self.successors = successors;
        self.status = OperationStatus::Completed;
    }

    pub fn take_successors(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.successors)
    }
}

/// The aggregation interface the core invokes between training rounds. The
/// math itself (FedAvg, FedOpt, ...) is user territory; the core hands over
/// opaque per-worker states plus normalized weights and expects one merged
/// state back.
pub trait Aggregator: Send {
    fn name(&self) -> &'static str;

    fn aggregate(
        &mut self,
        resource_key: &str,
        states: &IndexMap<String, Bytes>,
        weights: &BTreeMap<String, f64>,
    ) -> Result<Bytes, CoreError>;
}

/// Merges the accumulated per-worker checkpoints into a new global
/// checkpoint.
pub struct AggregateAction {
    resource_type: String,
    resource_key: String,
    /// Weight source; `None` weighs every worker equally.
    score_type: Option<String>,
    aggregator: Box<dyn Aggregator>,
    comm_round: Option<u64>,
}

impl AggregateAction {
    pub fn new(
        resource_type: impl Into<String>,
        resource_key: impl Into<String>,
        aggregator: Box<dyn Aggregator>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_key: resource_key.into(),
            score_type: None,
            aggregator,
            comm_round: None,
        }
    }

    pub fn weighted_by(mut self, score_type: impl Into<String>) -> Self {
        self.score_type = Some(score_type.into());
        self
    }

    pub fn with_comm_round(mut self, comm_round: u64) -> Self {
        self.comm_round = Some(comm_round);
        self
    }

    fn weights(
        &self,
        nodes: &[String],
        cx: &OpCtx<'_>,
    ) -> Result<BTreeMap<String, f64>, CoreError> {
        let mut raw = BTreeMap::new();
        match &self.score_type {
            None => {
                for node in nodes {
                    raw.insert(node.clone(), 1.0);
                }
            }
            Some(score_type) => {
                for node in nodes {
                    let score = cx
                        .resources
                        .get_opt::<f64>(&format!("scores:{score_type}:{node}"))
                        .map_err(CoreError::from)?
                        .ok_or_else(|| {
                            CoreError::Aggregation(format!(
                                "Client score {score_type} missing for worker {node}"
                            ))
                        })?;
                    raw.insert(node.clone(), *score);
                }
            }
        }

        let total: f64 = raw.values().sum();
        if total <= 0.0 {
            return Err(CoreError::Aggregation(
                "Client scores sum to zero".to_string(),
            ));
        }
        Ok(raw.into_iter().map(|(node, score)| (node, score / total)).collect())
    }
}

impl Action for AggregateAction {
    fn name(&self) -> &'static str {
        "AggregateAction"
    }

    fn perform(&mut self, cx: &mut OpCtx<'_>) -> Result<Vec<Operation>, CoreError> {
        let accumulator: Arc<CheckpointStore> =
            cx.resources.get(keys::CLIENT_CHECKPOINTS).map_err(|_| {
                CoreError::Aggregation("No worker states have been collected".to_string())
            })?;

        let collected = accumulator.all_of(&self.resource_type, &self.resource_key);
        if collected.is_empty() {
            return Err(CoreError::Aggregation(format!(
                "No {}:{} states to aggregate",
                self.resource_type, self.resource_key
            )));
        }

        let states: IndexMap<String, Bytes> = collected
            .into_iter()
            .map(|(node, checkpoint)| (node, checkpoint.data))
            .collect();
        let nodes: Vec<String> = states.keys().cloned().collect();
        let weights = self.weights(&nodes, cx)?;

        let merged = self
            .aggregator
            .aggregate(&self.resource_key, &states, &weights)?;
        if merged.is_empty() {
            return Err(CoreError::Aggregation(format!(
                "Aggregator {} returned an empty state",
                self.aggregator.name()
            )));
        }

        let checkpoints: Arc<CheckpointStore> = cx.resources.get(keys::CHECKPOINTS)?;
        checkpoints.register(
            &self.resource_type,
            &self.resource_key,
            GLOBAL_CHECKPOINT,
            Checkpoint::new(merged),
        );
        accumulator.clear_resource(&self.resource_type, &self.resource_key);

        info!(
            resource = self.resource_key,
            workers = nodes.len(),
            aggregator = self.aggregator.name(),
            comm_round = self.comm_round,
            "Aggregated worker states into a new global checkpoint"
        );

        let OpCtx {
            watchers, resources, ..
        } = cx;
        watchers.notify_all(
            Notification::AggregationCompleted {
                comm_round: self.comm_round,
            },
            resources,
        );

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::storage::BlobStore;
    use crate::topology::Topology;
    use crate::watcher::WatcherPool;
    use muster_common::model::{Node, NodeRole};
    use muster_common::resources::ResourceRegistry;

    /// Concatenates states in weight order; enough to observe the plumbing.
    struct ConcatAggregator;

    impl Aggregator for ConcatAggregator {
        fn name(&self) -> &'static str {
            "ConcatAggregator"
        }

        fn aggregate(
            &mut self,
            _resource_key: &str,
            states: &IndexMap<String, Bytes>,
            weights: &BTreeMap<String, f64>,
        ) -> Result<Bytes, CoreError> {
            let mut merged = Vec::new();
            for (node, state) in states {
                assert!(weights.contains_key(node));
                merged.extend_from_slice(state);
            }
            Ok(Bytes::from(merged))
        }
    }

    struct EmptyAggregator;

    impl Aggregator for EmptyAggregator {
        fn name(&self) -> &'static str {
            "EmptyAggregator"
        }

        fn aggregate(
            &mut self,
            _resource_key: &str,
            _states: &IndexMap<String, Bytes>,
            _weights: &BTreeMap<String, f64>,
        ) -> Result<Bytes, CoreError> {
            Ok(Bytes::new())
        }
    }

    fn test_ctx() -> (Topology, ResourceRegistry, WatcherPool, Arc<BlobStore>) {
        let topology = Topology::new(vec![
            Node::new("server", NodeRole::Server),
            Node::new("site-1", NodeRole::Client),
            Node::new("site-2", NodeRole::Client),
        ])
        .unwrap();
        let mut resources = ResourceRegistry::new();
        resources
            .set_arc(keys::CHECKPOINTS, Arc::new(CheckpointStore::new()))
            .unwrap();
        resources
            .set_arc(keys::CLIENT_CHECKPOINTS, Arc::new(CheckpointStore::new()))
            .unwrap();
        (topology, resources, WatcherPool::new(), Arc::new(BlobStore::new()))
    }

    #[test]
    fn aggregation_produces_a_new_global_checkpoint() {
        let (mut topology, mut resources, mut watchers, blobs) = test_ctx();

        let accumulator: Arc<CheckpointStore> =
            resources.get(keys::CLIENT_CHECKPOINTS).unwrap();
        accumulator.register("model", "resnet", "site-1", Checkpoint::new("aa"));
        accumulator.register("model", "resnet", "site-2", Checkpoint::new("bb"));

        let mut action = AggregateAction::new("model", "resnet", Box::new(ConcatAggregator));
        let mut cx = OpCtx {
            topology: &mut topology,
            resources: &mut resources,
            watchers: &mut watchers,
            blobs: &blobs,
        };
        action.perform(&mut cx).unwrap();

        let checkpoints: Arc<CheckpointStore> = resources.get(keys::CHECKPOINTS).unwrap();
        let merged = checkpoints.get("model", "resnet", GLOBAL_CHECKPOINT).unwrap();
        assert_eq!(merged.data, Bytes::from_static(b"aabb"));

        // the accumulator is drained for the next round
        let accumulator: Arc<CheckpointStore> =
            resources.get(keys::CLIENT_CHECKPOINTS).unwrap();
        assert!(accumulator.all_of("model", "resnet").is_empty());
    }

    #[test]
    fn missing_scores_fail_weighted_aggregation() {
        let (mut topology, mut resources, mut watchers, blobs) = test_ctx();
        let accumulator: Arc<CheckpointStore> =
            resources.get(keys::CLIENT_CHECKPOINTS).unwrap();
        accumulator.register("model", "resnet", "site-1", Checkpoint::new("aa"));

        let mut action = AggregateAction::new("model", "resnet", Box::new(ConcatAggregator))
            .weighted_by("dataset_length");
        let mut cx = OpCtx {
            topology: &mut topology,
            resources: &mut resources,
            watchers: &mut watchers,
            blobs: &blobs,
        };
        assert!(matches!(
            action.perform(&mut cx),
            Err(CoreError::Aggregation(_))
        ));
    }

    #[test]
    fn empty_aggregator_output_is_a_shape_error() {
        let (mut topology, mut resources, mut watchers, blobs) = test_ctx();
        let accumulator: Arc<CheckpointStore> =
            resources.get(keys::CLIENT_CHECKPOINTS).unwrap();
        accumulator.register("model", "resnet", "site-1", Checkpoint::new("aa"));

        let mut action = AggregateAction::new("model", "resnet", Box::new(EmptyAggregator));
        let mut cx = OpCtx {
            topology: &mut topology,
            resources: &mut resources,
            watchers: &mut watchers,
            blobs: &blobs,
        };
        assert!(matches!(
            action.perform(&mut cx),
            Err(CoreError::Aggregation(_))
        ));
    }

    #[test]
    fn nothing_collected_is_an_error() {
        let (mut topology, mut resources, mut watchers, blobs) = test_ctx();
        let mut action = AggregateAction::new("model", "resnet", Box::new(ConcatAggregator));
        let mut cx = OpCtx {
            topology: &mut topology,
            resources: &mut resources,
            watchers: &mut watchers,
            blobs: &blobs,
        };
        assert!(matches!(
            action.perform(&mut cx),
            Err(CoreError::Aggregation(_))
        ));
    }
}
