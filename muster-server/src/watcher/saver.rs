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
use muster_common::checkpoints::CheckpointStore;
use muster_common::model::{keys, GLOBAL_CHECKPOINT};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Reacts to `NewBestModel` by snapshotting the current global checkpoint
/// under a `<key>_best_<split>` checkpoint key and serializing it to disk.
pub struct ModelSaverWatcher {
    listen_to: String,
    model_key: String,
    save_folder: PathBuf,
    run_name: String,
}

impl ModelSaverWatcher {
    pub fn new(
        listen_to: impl Into<String>,
        model_key: impl Into<String>,
        save_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            listen_to: listen_to.into(),
            model_key: model_key.into(),
            save_folder: save_folder.into(),
            run_name: String::new(),
        }
    }
}

impl Watcher for ModelSaverWatcher {
    fn name(&self) -> &'static str {
        "ModelSaverWatcher"
    }

    fn on_notification(
        &mut self,
        notification: &Notification,
        cx: &mut WatcherContext<'_>,
    ) -> anyhow::Result<()> {
        match notification {
            Notification::Initialization { run_name } => {
                self.run_name = run_name.clone();
            }
            Notification::NewBestModel { metric, split, .. } if *metric == self.listen_to => {
                let checkpoints: Arc<CheckpointStore> = cx.resources.get(keys::CHECKPOINTS)?;

                let best_key = format!("{}_best_{}", self.model_key, split);
                let Some(checkpoint) =
                    checkpoints.copy("model", &self.model_key, GLOBAL_CHECKPOINT, &best_key)
                else {
                    anyhow::bail!(
                        "No global checkpoint for model `{}` to snapshot",
                        self.model_key
                    );
                };

                let mut path = self.save_folder.clone();
                if !self.run_name.is_empty() {
                    path = path.join(&self.run_name);
                }
                let path = path.join(format!("{best_key}.bin"));

                info!(
                    model = self.model_key,
                    split, path = %path.display(),
                    "Saving new best model"
                );
                checkpoint.save(&path)?;
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
    use muster_common::checkpoints::Checkpoint;
    use muster_common::resources::ResourceRegistry;

    #[test]
    fn new_best_copies_and_saves_the_global_checkpoint() {
        let dir = tempfile::tempdir().unwrap();

        let checkpoints = Arc::new(CheckpointStore::new());
        checkpoints.register("model", "resnet", GLOBAL_CHECKPOINT, Checkpoint::new("v3"));

        let mut resources = ResourceRegistry::new();
        resources.set_arc(keys::CHECKPOINTS, checkpoints.clone()).unwrap();

        let mut pool = WatcherPool::new();
        pool.add(Box::new(ModelSaverWatcher::new("acc", "resnet", dir.path())));

        pool.notify_all(
            Notification::Initialization {
                run_name: "demo".to_string(),
            },
            &mut resources,
        );
        pool.notify_all(
            Notification::NewBestModel {
                metric: "acc".to_string(),
                split: "val".to_string(),
                comm_round: Some(3),
            },
            &mut resources,
        );

        assert!(checkpoints.contains("model", "resnet", "resnet_best_val"));
        let saved = dir.path().join("demo/resnet_best_val.bin");
        assert_eq!(std::fs::read(saved).unwrap(), b"v3");
    }

    #[test]
    fn other_metrics_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(CheckpointStore::new());
        let mut resources = ResourceRegistry::new();
        resources.set_arc(keys::CHECKPOINTS, checkpoints.clone()).unwrap();

        let mut pool = WatcherPool::new();
        pool.add(Box::new(ModelSaverWatcher::new("acc", "resnet", dir.path())));
        pool.notify_all(
            Notification::NewBestModel {
                metric: "loss".to_string(),
                split: "val".to_string(),
                comm_round: None,
            },
            &mut resources,
        );

        assert!(!checkpoints.contains("model", "resnet", "resnet_best_val"));
    }
}
