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

mod aggregate;
mod best;
mod console;
mod saver;

pub use aggregate::{AggregationMethod, MetricAggregationWatcher};
pub use best::NewBestDetectorWatcher;
pub use console::ConsoleWatcher;
pub use saver::ModelSaverWatcher;

use muster_common::message::{StatusUpdate, RESPONSE_TYPE_METRIC};
use muster_common::model::{CommandId, Node, ScalarValue};
use muster_common::resources::ResourceRegistry;
use std::collections::BTreeMap;
use tracing::warn;

/// Typed notifications published through the pool. The variant names are
/// contracts; watchers subscribe by matching.
#[derive(Debug, Clone)]
pub enum Notification {
    Initialization {
        run_name: String,
    },
    StatusUpdate(StatusUpdate),
    Metric(MetricNotification),
    CommandFinished {
        command_uuid: CommandId,
    },
    NewBestModel {
        metric: String,
        split: String,
        comm_round: Option<u64>,
    },
    AggregationCompleted {
        comm_round: Option<u64>,
    },
    Parameter {
        params: BTreeMap<String, ScalarValue>,
        comm_round: Option<u64>,
    },
    TopologyChange {
        nodes: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricNotification {
    pub metrics: BTreeMap<String, f64>,
    pub metric_type: String,
    pub comm_round: Option<u64>,
    pub epoch: Option<u64>,
    pub node_name: Option<String>,
    pub is_aggregate: bool,
    pub command_uuid: Option<CommandId>,
}

impl MetricNotification {
    /// Extracts the metric payload of a status update carrying a metric
    /// response, if any.
    pub fn from_status_update(update: &StatusUpdate) -> Option<MetricNotification> {
        let response = update.response.as_ref()?;
        if response.response_type.as_deref() != Some(RESPONSE_TYPE_METRIC) {
            return None;
        }
        let metrics = response
            .data
            .get("metrics")?
            .as_object()?
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
            .collect();
        Some(MetricNotification {
            metrics,
            metric_type: response
                .data
                .get("metric_type")
                .and_then(|v| v.as_str())
                .unwrap_or("train")
                .to_string(),
            comm_round: response.data.get("comm_round").and_then(|v| v.as_u64()),
            epoch: response.data.get("epoch").and_then(|v| v.as_u64()),
            node_name: update.node_name.clone(),
            is_aggregate: false,
            command_uuid: Some(update.command_uuid),
        })
    }
}

/// Handed to a watcher while it processes a notification. Re-publication
/// goes through the queue instead of re-entering the pool, which keeps
/// delivery a plain loop.
pub struct WatcherContext<'a> {
    pub resources: &'a mut ResourceRegistry,
    origin: usize,
    outgoing: &'a mut Vec<Outgoing>,
}

impl WatcherContext<'_> {
    /// Publishes to every other watcher (the publisher is skipped).
    pub fn publish(&mut self, notification: Notification) {
        self.outgoing.push(Outgoing {
            notification,
            origin: Some(self.origin),
            of_type: None,
        });
    }

    /// Publishes to watchers of one kind only.
    pub fn publish_to(&mut self, watcher_name: &'static str, notification: Notification) {
        self.outgoing.push(Outgoing {
            notification,
            origin: Some(self.origin),
            of_type: Some(watcher_name),
        });
    }
}

struct Outgoing {
    notification: Notification,
    origin: Option<usize>,
    of_type: Option<&'static str>,
}

pub trait Watcher: Send {
    fn name(&self) -> &'static str;

    fn on_notification(
        &mut self,
        notification: &Notification,
        cx: &mut WatcherContext<'_>,
    ) -> anyhow::Result<()>;
}

/// Publish/subscribe bus for typed notifications. Delivery is synchronous
/// and best effort: a failing watcher is logged and the rest still receive
/// the notification.
#[derive(Default)]
pub struct WatcherPool {
    watchers: Vec<Box<dyn Watcher>>,
}

impl WatcherPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, watcher: Box<dyn Watcher>) -> &mut Self {
        self.watchers.push(watcher);
        self
    }

    pub fn remove(&mut self, watcher_name: &str) -> &mut Self {
        self.watchers.retain(|watcher| watcher.name() != watcher_name);
        self
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn notify_all(&mut self, notification: Notification, resources: &mut ResourceRegistry) {
        self.deliver(
            vec![Outgoing {
                notification,
                origin: None,
                of_type: None,
            }],
            resources,
        )
    }

    pub fn notify_of_type(
        &mut self,
        watcher_name: &'static str,
        notification: Notification,
        resources: &mut ResourceRegistry,
    ) {
        self.deliver(
            vec![Outgoing {
                notification,
                origin: None,
                of_type: Some(watcher_name),
            }],
            resources,
        )
    }

    fn deliver(&mut self, mut queue: Vec<Outgoing>, resources: &mut ResourceRegistry) {
        while !queue.is_empty() {
            for outgoing in std::mem::take(&mut queue) {
                for (index, watcher) in self.watchers.iter_mut().enumerate() {
                    if outgoing.origin == Some(index) {
                        continue;
                    }
                    if let Some(of_type) = outgoing.of_type {
                        if watcher.name() != of_type {
                            continue;
                        }
                    }
                    let mut cx = WatcherContext {
                        resources: &mut *resources,
                        origin: index,
                        outgoing: &mut queue,
                    };
                    if let Err(err) = watcher.on_notification(&outgoing.notification, &mut cx) {
                        warn!(
                            watcher = watcher.name(),
                            error = %err,
                            "Exception while notifying watcher"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    struct Recorder {
        seen: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        fail: bool,
        republish: bool,
    }

    impl Watcher for Recorder {
        fn name(&self) -> &'static str {
            "Recorder"
        }

        fn on_notification(
            &mut self,
            notification: &Notification,
            cx: &mut WatcherContext<'_>,
        ) -> anyhow::Result<()> {
            if let Notification::Initialization { run_name } = notification {
                self.seen.lock().unwrap().push(run_name.clone());
                if self.republish {
                    self.republish = false;
                    cx.publish(Notification::Initialization {
                        run_name: format!("{run_name}-echo"),
                    });
                }
            }
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[test]
    fn failing_watcher_does_not_block_delivery() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pool = WatcherPool::new();
        pool.add(Box::new(Recorder {
            seen: seen.clone(),
            fail: true,
            republish: false,
        }));
        pool.add(Box::new(Recorder {
            seen: seen.clone(),
            fail: false,
            republish: false,
        }));

        let mut resources = ResourceRegistry::new();
        pool.notify_all(
            Notification::Initialization {
                run_name: "run".to_string(),
            },
            &mut resources,
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn republication_skips_the_origin() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pool = WatcherPool::new();
        pool.add(Box::new(Recorder {
            seen: seen.clone(),
            fail: false,
            republish: true,
        }));

        let mut resources = ResourceRegistry::new();
        pool.notify_all(
            Notification::Initialization {
                run_name: "run".to_string(),
            },
            &mut resources,
        );

        // the republished echo is not delivered back to its origin
        assert_eq!(*seen.lock().unwrap(), vec!["run".to_string()]);
    }

    #[test]
    fn metric_extraction_from_status_updates() {
        use muster_common::message::ExecutionResponse;
        use muster_common::model::CommandStatus;

        let response = ExecutionResponse::metric(
            BTreeMap::from([("acc".to_string(), 0.9)]),
            "val",
            Some(3),
            Some(1),
        );
        let mut update =
            StatusUpdate::new(CommandId::new_v4(), CommandStatus::Finished, "Plugin")
                .with_response(response);
        update.node_name = Some("site-1".to_string());

        let metric = MetricNotification::from_status_update(&update).unwrap();
        assert_eq!(metric.metrics.get("acc"), Some(&0.9));
        assert_eq!(metric.metric_type, "val");
        assert_eq!(metric.comm_round, Some(3));
        assert!(!metric.is_aggregate);

        let plain = StatusUpdate::new(CommandId::new_v4(), CommandStatus::Finished, "Print");
        assert!(MetricNotification::from_status_update(&plain).is_none());
    }
}
