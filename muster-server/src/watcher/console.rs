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

use super::{Notification, Watcher, WatcherContext};
use tracing::info;

/// Emits every interesting notification as a structured log event; the
/// tracking backend is whatever the subscriber forwards to.
#[derive(Default)]
pub struct ConsoleWatcher;

impl Watcher for ConsoleWatcher {
    fn name(&self) -> &'static str {
        "ConsoleWatcher"
    }

    fn on_notification(
        &mut self,
        notification: &Notification,
        _cx: &mut WatcherContext<'_>,
    ) -> anyhow::Result<()> {
        match notification {
            Notification::Initialization { run_name } => {
                info!(run_name, "Run initialized");
            }
            Notification::StatusUpdate(update) => {
                info!(
                    command = %update.command_uuid,
                    status = %update.status,
                    datatype = update.datatype,
                    node = update.node_name.as_deref().unwrap_or("?"),
                    "Status update"
                );
            }
            Notification::Metric(metric) => {
                info!(
                    metrics = ?metric.metrics,
                    metric_type = metric.metric_type,
                    comm_round = metric.comm_round,
                    epoch = metric.epoch,
                    node = metric.node_name.as_deref().unwrap_or("aggregate"),
                    is_aggregate = metric.is_aggregate,
                    "Metric"
                );
            }
            Notification::CommandFinished { command_uuid } => {
                info!(command = %command_uuid, "Command finished on all selected workers");
            }
            Notification::NewBestModel {
                metric,
                split,
                comm_round,
            } => {
                info!(metric, split, comm_round, "New best model");
            }
            Notification::AggregationCompleted { comm_round } => {
                info!(comm_round, "Aggregation completed");
            }
            Notification::Parameter { params, comm_round } => {
                info!(?params, comm_round, "Parameters");
            }
            Notification::TopologyChange { nodes } => {
                let online = nodes.iter().filter(|node| node.is_online()).count();
                info!(nodes = nodes.len(), online, "Topology changed");
            }
        }
        Ok(())
    }
}
