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

//! Server-side command hooks. Commands execute on workers; these are the
//! points where the server prepares a command tree before dispatch and
//! absorbs what workers send back.

use super::distribution::DistTable;
use super::OpCtx;
use crate::watcher::Notification;
use muster_common::checkpoints::{Checkpoint, CheckpointStore};
use muster_common::command::{CommandKind, CommandSpec};
use muster_common::error::CoreError;
use muster_common::message::ExecutionResponse;
use muster_common::model::{keys, BlobId, DistributionId, ScalarValue};
use std::sync::Arc;
use tracing::debug;

/// Runs before any worker pulls the command. `FetchModel` nodes stage their
/// checkpoint in the blob store and record the blob id in the spec so every
/// selected worker can download it.
pub fn command_on_init(
    spec: &mut CommandSpec,
    cx: &mut OpCtx<'_>,
    selected: &[String],
) -> Result<(), CoreError> {
    if let CommandKind::FetchModel(command) = &mut spec.kind {
        let checkpoints: Arc<CheckpointStore> = cx.resources.get(keys::CHECKPOINTS)?;
        let checkpoint = checkpoints
            .get(&command.resource_type, &command.resource_key, &command.checkpoint_key)
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "No checkpoint {}:{}:{} to distribute",
                    command.resource_type, command.resource_key, command.checkpoint_key
                ))
            })?;
        let blob_id = cx.blobs.put(
            &command.resource_key,
            checkpoint.data,
            false,
            "server",
        );
        command.blob_id = Some(blob_id);
        debug!(
            blob = %blob_id,
            resource = command.resource_key,
            workers = selected.len(),
            "Staged checkpoint for distribution"
        );
    }

    for child in spec.children_mut() {
        command_on_init(child, cx, selected)?;
    }
    Ok(())
}

/// Rewrites a command tree for one worker right before dispatch.
/// `AssignPartition` receives the worker's position among the selected
/// workers.
pub fn node_specific_modification(spec: &mut CommandSpec, table: &DistTable, node: &str) {
    if let CommandKind::AssignPartition(command) = &mut spec.kind {
        let selected = table.selected();
        command.index = selected.iter().position(|name| name == node);
        command.count = selected.len().max(command.count);
    }
    for child in spec.children_mut() {
        node_specific_modification(child, table, node);
    }
}

/// Runs when one worker reports FINISHED for a command, with the response
/// re-materialized from the blob store.
pub fn on_client_finish(
    spec: &CommandSpec,
    distribution_id: DistributionId,
    node: &str,
    response: Option<&ExecutionResponse>,
    cx: &mut OpCtx<'_>,
) -> Result<(), CoreError> {
    match &spec.kind {
        CommandKind::PushModel(command) => {
            let Some(response) = response else {
                return Err(CoreError::InvalidRequest(format!(
                    "Worker {node} finished a model push without a response"
                )));
            };
            let Some(bytes) = response.files.get(&command.resource_key) else {
                return Err(CoreError::InvalidRequest(format!(
                    "Worker {node} pushed no `{}` payload",
                    command.resource_key
                )));
            };

            cx.resources.set(
                &format!("{distribution_id}:{}:{node}", command.resource_key),
                bytes.clone(),
            )?;

            let accumulator = client_checkpoints(cx)?;
            accumulator.register(
                &command.resource_type,
                &command.resource_key,
                node,
                Checkpoint::new(bytes.clone()),
            );
            debug!(
                node,
                resource = command.resource_key,
                bytes = bytes.len(),
                "Recorded worker model state"
            );
        }
        CommandKind::ReportScore(command) => {
            let score = response
                .and_then(|response| response.data.get("score"))
                .and_then(|value| value.as_f64())
                .ok_or_else(|| {
                    CoreError::InvalidRequest(format!(
                        "Worker {node} reported no `{}` score",
                        command.score_type
                    ))
                })?;
            cx.resources
                .set(&format!("scores:{}:{node}", command.score_type), score)?;
            cx.topology
                .set_data(node, &command.score_type, ScalarValue::Float(score))?;
        }
        _ => {}
    }
    Ok(())
}

/// Runs once a command reached a terminal state on every selected worker.
pub fn all_clients_finished(spec: &CommandSpec, cx: &mut OpCtx<'_>) -> Result<(), CoreError> {
    if let CommandKind::ReportScore(command) = &spec.kind {
        let prefix = format!("scores:{}", command.score_type);
        let mut params = std::collections::BTreeMap::new();
        for node in cx.resources.keys(&prefix).unwrap_or_default() {
            if let Ok(Some(score)) = cx.resources.get_opt::<f64>(&format!("{prefix}:{node}")) {
                params.insert(node, ScalarValue::Float(*score));
            }
        }
        let OpCtx {
            watchers, resources, ..
        } = cx;
        watchers.notify_all(
            Notification::Parameter {
                params,
                comm_round: None,
            },
            resources,
        );
    }
    Ok(())
}

/// Blob ids staged into a command tree by `command_on_init`.
pub fn staged_blob_ids(spec: &CommandSpec) -> Vec<BlobId> {
    let mut ids = Vec::new();
    if let CommandKind::FetchModel(command) = &spec.kind {
        if let Some(blob_id) = command.blob_id {
            ids.push(blob_id);
        }
    }
    for child in spec.children() {
        ids.extend(staged_blob_ids(child));
    }
    ids
}

fn client_checkpoints(cx: &mut OpCtx<'_>) -> Result<Arc<CheckpointStore>, CoreError> {
    if let Some(store) = cx.resources.get_opt::<CheckpointStore>(keys::CLIENT_CHECKPOINTS)? {
        return Ok(store);
    }
    let store = Arc::new(CheckpointStore::new());
    cx.resources.set_arc(keys::CLIENT_CHECKPOINTS, store.clone())?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn partition_indices_follow_the_selection_order() {
        let mut table = DistTable::default();
        let mut spec = CommandSpec::sequence(vec![
            CommandSpec::print("hi"),
            CommandSpec::assign_partition(0),
        ]);
        spec.assign_uuids();
        table.add_node("site-a", spec.collect_uuids());
        table.add_node("site-b", spec.collect_uuids());
        table.add_excluded("site-c");

        let mut for_b = spec.clone();
        node_specific_modification(&mut for_b, &table, "site-b");
        let CommandKind::Sequence(sequence) = &for_b.kind else {
            panic!("expected a sequence");
        };
        let CommandKind::AssignPartition(assign) = &sequence.commands[1].kind else {
            panic!("expected a partition assignment");
        };
        assert_eq!(assign.index, Some(1));
        assert_eq!(assign.count, 2);

        // an excluded worker gets no slot
        let mut for_c = spec.clone();
        node_specific_modification(&mut for_c, &table, "site-c");
        let CommandKind::Sequence(sequence) = &for_c.kind else {
            panic!("expected a sequence");
        };
        let CommandKind::AssignPartition(assign) = &sequence.commands[1].kind else {
            panic!("expected a partition assignment");
        };
        assert_eq!(assign.index, None);
    }

    #[test]
    fn staged_blob_ids_walk_the_whole_tree() {
        let mut spec = CommandSpec::sequence(vec![
            CommandSpec::fetch_model("model", "resnet", "__global__"),
            CommandSpec::print("between"),
            CommandSpec::fetch_model("optimizer", "adam", "__global__"),
        ]);
        spec.assign_uuids();
        assert!(staged_blob_ids(&spec).is_empty());

        let expected: Vec<BlobId> = spec
            .children_mut()
            .into_iter()
            .filter_map(|child| match &mut child.kind {
                CommandKind::FetchModel(command) => {
                    let id = BlobId::new_v4();
                    command.blob_id = Some(id);
                    Some(id)
                }
                _ => None,
            })
            .collect();

        assert_eq!(staged_blob_ids(&spec), expected);
    }
}
