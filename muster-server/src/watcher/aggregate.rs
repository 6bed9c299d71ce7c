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

use super::{MetricNotification, Notification, Watcher, WatcherContext};
use muster_common::model::CommandId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    Mean,
    Median,
}

/// Buffers per-worker metrics and, once a command has finished on every
/// selected worker, publishes one aggregate metric per
/// `(comm_round, epoch, metric_type)` group.
pub struct MetricAggregationWatcher {
    method: AggregationMethod,
    buffered: HashMap<CommandId, Vec<MetricNotification>>,
}

impl MetricAggregationWatcher {
    pub fn new(method: AggregationMethod) -> Self {
        Self {
            method,
            buffered: HashMap::new(),
        }
    }

    fn buffer(&mut self, metric: MetricNotification) {
        if metric.is_aggregate {
            return;
        }
        let Some(command_uuid) = metric.command_uuid else {
            return;
        };
        self.buffered.entry(command_uuid).or_default().push(metric);
    }

    fn aggregate(&self, group: &[&MetricNotification]) -> Option<BTreeMap<String, f64>> {
        let names: BTreeSet<&String> = group.iter().flat_map(|m| m.metrics.keys()).collect();

        let mut aggregated = BTreeMap::new();
        for name in names {
            let mut values = Vec::with_capacity(group.len());
            for metric in group {
                // a worker missing a value poisons the whole group
                values.push(*metric.metrics.get(name)?);
            }
            let value = match self.method {
                AggregationMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
                AggregationMethod::Median => {
                    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let mid = values.len() / 2;
                    if values.len() % 2 == 0 {
                        (values[mid - 1] + values[mid]) / 2.0
                    } else {
                        values[mid]
                    }
                }
            };
            aggregated.insert(name.clone(), value);
        }
        Some(aggregated)
    }

    fn flush(&mut self, command_uuid: CommandId, cx: &mut WatcherContext<'_>) {
        let Some(metrics) = self.buffered.remove(&command_uuid) else {
            return;
        };

        let mut groups: BTreeMap<(Option<u64>, Option<u64>, String), Vec<&MetricNotification>> =
            BTreeMap::new();
        for metric in &metrics {
            groups
                .entry((metric.comm_round, metric.epoch, metric.metric_type.clone()))
                .or_default()
                .push(metric);
        }

        for ((comm_round, epoch, metric_type), group) in groups {
            let Some(aggregated) = self.aggregate(&group) else {
                continue;
            };
            cx.publish(Notification::Metric(MetricNotification {
                metrics: aggregated,
                metric_type,
                comm_round,
                epoch,
                node_name: None,
                is_aggregate: true,
                command_uuid: Some(command_uuid),
            }));
        }
    }
}

impl Watcher for MetricAggregationWatcher {
    fn name(&self) -> &'static str {
        "MetricAggregationWatcher"
    }

    fn on_notification(
        &mut self,
        notification: &Notification,
        cx: &mut WatcherContext<'_>,
    ) -> anyhow::Result<()> {
        match notification {
            Notification::StatusUpdate(update) => {
                if let Some(metric) = MetricNotification::from_status_update(update) {
                    self.buffer(metric);
                }
            }
            Notification::Metric(metric) => {
                self.buffer(metric.clone());
            }
            Notification::CommandFinished { command_uuid } => {
                self.flush(*command_uuid, cx);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::super::WatcherPool;
    use super::*;
    use muster_common::resources::ResourceRegistry;
    use std::sync::{Arc, Mutex};

    struct Sink {
        aggregates: Arc<Mutex<Vec<MetricNotification>>>,
    }

    impl Watcher for Sink {
        fn name(&self) -> &'static str {
            "Sink"
        }

        fn on_notification(
            &mut self,
            notification: &Notification,
            _cx: &mut WatcherContext<'_>,
        ) -> anyhow::Result<()> {
            if let Notification::Metric(metric) = notification {
                if metric.is_aggregate {
                    self.aggregates.lock().unwrap().push(metric.clone());
                }
            }
            Ok(())
        }
    }

    fn worker_metric(command: CommandId, node: &str, acc: f64) -> MetricNotification {
        MetricNotification {
            metrics: BTreeMap::from([("acc".to_string(), acc)]),
            metric_type: "val".to_string(),
            comm_round: Some(1),
            epoch: Some(0),
            node_name: Some(node.to_string()),
            is_aggregate: false,
            command_uuid: Some(command),
        }
    }

    #[test]
    fn mean_aggregate_is_published_on_command_finished() {
        let aggregates = Arc::new(Mutex::new(Vec::new()));
        let mut pool = WatcherPool::new();
        pool.add(Box::new(MetricAggregationWatcher::new(AggregationMethod::Mean)));
        pool.add(Box::new(Sink {
            aggregates: aggregates.clone(),
        }));

        let mut resources = ResourceRegistry::new();
        let command = CommandId::new_v4();

        pool.notify_all(
            Notification::Metric(worker_metric(command, "site-1", 0.5)),
            &mut resources,
        );
        pool.notify_all(
            Notification::Metric(worker_metric(command, "site-2", 0.7)),
            &mut resources,
        );
        assert!(aggregates.lock().unwrap().is_empty());

        pool.notify_all(
            Notification::CommandFinished {
                command_uuid: command,
            },
            &mut resources,
        );

        let published = aggregates.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert!((published[0].metrics["acc"] - 0.6).abs() < 1e-9);
        assert!(published[0].is_aggregate);
        assert_eq!(published[0].comm_round, Some(1));

        // buffer is cleared after aggregation
        drop(published);
    }

    #[test]
    fn median_of_even_group_averages_the_middle() {
        let watcher = MetricAggregationWatcher::new(AggregationMethod::Median);
        let command = CommandId::new_v4();
        let metrics = vec![
            worker_metric(command, "a", 0.1),
            worker_metric(command, "b", 0.9),
            worker_metric(command, "c", 0.3),
            worker_metric(command, "d", 0.5),
        ];
        let group: Vec<&MetricNotification> = metrics.iter().collect();
        let aggregated = watcher.aggregate(&group).unwrap();
        assert!((aggregated["acc"] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn groups_with_missing_values_are_skipped() {
        let watcher = MetricAggregationWatcher::new(AggregationMethod::Mean);
        let command = CommandId::new_v4();
        let complete = worker_metric(command, "a", 0.5);
        let mut partial = worker_metric(command, "b", 0.5);
        partial.metrics = BTreeMap::from([("loss".to_string(), 1.0)]);

        let group = vec![&complete, &partial];
        assert!(watcher.aggregate(&group).is_none());
    }
}
