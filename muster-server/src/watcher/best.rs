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
use std::collections::HashMap;
use tracing::info;

/// Watches aggregate metrics for the chosen criterion and publishes
/// `NewBestModel` whenever a better value arrives. Direction is a criterion
/// attribute: accuracy-style metrics improve upwards, losses downwards.
pub struct NewBestDetectorWatcher {
    metric: String,
    lower_is_better: bool,
    /// Whether to watch aggregates (the default) or raw per-worker metrics.
    watch_aggregates: bool,
    best_per_split: HashMap<String, f64>,
}

impl NewBestDetectorWatcher {
    pub fn new(metric: impl Into<String>, lower_is_better: bool) -> Self {
        Self {
            metric: metric.into(),
            lower_is_better,
            watch_aggregates: true,
            best_per_split: HashMap::new(),
        }
    }

    pub fn watching_single_metrics(mut self) -> Self {
        self.watch_aggregates = false;
        self
    }

    fn is_improvement(&self, split: &str, value: f64) -> bool {
        match self.best_per_split.get(split) {
            None => true,
            Some(best) if self.lower_is_better => value < *best,
            Some(best) => value > *best,
        }
    }
}

impl Watcher for NewBestDetectorWatcher {
    fn name(&self) -> &'static str {
        "NewBestDetectorWatcher"
    }

    fn on_notification(
        &mut self,
        notification: &Notification,
        cx: &mut WatcherContext<'_>,
    ) -> anyhow::Result<()> {
        let Notification::Metric(metric) = notification else {
            return Ok(());
        };
        if metric.is_aggregate != self.watch_aggregates {
            return Ok(());
        }
        let Some(value) = metric.metrics.get(&self.metric).copied() else {
            return Ok(());
        };

        if self.is_improvement(&metric.metric_type, value) {
            self.best_per_split.insert(metric.metric_type.clone(), value);
            info!(
                metric = self.metric,
                split = metric.metric_type,
                value,
                comm_round = metric.comm_round,
                "New best metric"
            );
            cx.publish(Notification::NewBestModel {
                metric: self.metric.clone(),
                split: metric.metric_type.clone(),
                comm_round: metric.comm_round,
            });
        }
        Ok(())
    }
}
