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

use crate::model::GLOBAL_CHECKPOINT;
use bytes::Bytes;
use indexmap::IndexMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A byte-serialized snapshot of a model or optimizer state. The core never
/// interprets the bytes; (de)serialization of actual tensors is plug-in
/// territory.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub data: Bytes,
}

impl Checkpoint {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn save(&self, path: &Path) -> io::Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.data)?;
        Ok(path.to_path_buf())
    }
}

/// Checkpoints addressed by `(resource_type, resource_key, checkpoint_key)`,
/// e.g. `("model", "resnet", "__global__")`. The store lives in a resource
/// registry as a shared handle, so all mutation goes through an interior
/// lock.
#[derive(Default)]
pub struct CheckpointStore {
    inner: Mutex<IndexMap<String, IndexMap<String, IndexMap<String, Checkpoint>>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        resource_type: &str,
        resource_key: &str,
        checkpoint_key: &str,
        checkpoint: Checkpoint,
    ) {
        let mut inner = self.inner.lock().expect("checkpoint store poisoned");
        inner
            .entry(resource_type.to_string())
            .or_default()
            .entry(resource_key.to_string())
            .or_default()
            .insert(checkpoint_key.to_string(), checkpoint);
    }

    pub fn get(
        &self,
        resource_type: &str,
        resource_key: &str,
        checkpoint_key: &str,
    ) -> Option<Checkpoint> {
        let inner = self.inner.lock().expect("checkpoint store poisoned");
        inner
            .get(resource_type)?
            .get(resource_key)?
            .get(checkpoint_key)
            .cloned()
    }

    pub fn contains(&self, resource_type: &str, resource_key: &str, checkpoint_key: &str) -> bool {
        self.get(resource_type, resource_key, checkpoint_key).is_some()
    }

    /// Duplicates a checkpoint under a new checkpoint key and returns the
    /// copy.
    pub fn copy(
        &self,
        resource_type: &str,
        resource_key: &str,
        checkpoint_key: &str,
        new_checkpoint_key: &str,
    ) -> Option<Checkpoint> {
        let checkpoint = self.get(resource_type, resource_key, checkpoint_key)?;
        self.register(resource_type, resource_key, new_checkpoint_key, checkpoint.clone());
        Some(checkpoint)
    }

    pub fn remove(&self, resource_type: &str, resource_key: &str, checkpoint_key: &str) {
        let mut inner = self.inner.lock().expect("checkpoint store poisoned");
        if let Some(keys) = inner
            .get_mut(resource_type)
            .and_then(|types| types.get_mut(resource_key))
        {
            keys.shift_remove(checkpoint_key);
        }
    }

    /// All checkpoint keys registered for a resource; the order is
    /// registration order.
    pub fn checkpoint_keys(&self, resource_type: &str, resource_key: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("checkpoint store poisoned");
        inner
            .get(resource_type)
            .and_then(|types| types.get(resource_key))
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every checkpoint of a resource, keyed by checkpoint key.
    pub fn all_of(
        &self,
        resource_type: &str,
        resource_key: &str,
    ) -> IndexMap<String, Checkpoint> {
        let inner = self.inner.lock().expect("checkpoint store poisoned");
        inner
            .get(resource_type)
            .and_then(|types| types.get(resource_key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_resource(&self, resource_type: &str, resource_key: &str) {
        let mut inner = self.inner.lock().expect("checkpoint store poisoned");
        if let Some(types) = inner.get_mut(resource_type) {
            types.shift_remove(resource_key);
        }
    }

    /// `(resource_type, resource_key)` pairs that currently carry a
    /// `__global__` checkpoint.
    pub fn global_checkpoints(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().expect("checkpoint store poisoned");
        let mut found = Vec::new();
        for (resource_type, keys) in inner.iter() {
            for (resource_key, checkpoints) in keys.iter() {
                if checkpoints.contains_key(GLOBAL_CHECKPOINT) {
                    found.push((resource_type.clone(), resource_key.clone()));
                }
            }
        }
        found
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("checkpoint store poisoned");
        let mut map = f.debug_map();
        for (resource_type, keys) in inner.iter() {
            for (resource_key, checkpoints) in keys.iter() {
                map.entry(
                    &format!("{resource_type}:{resource_key}"),
                    &checkpoints.keys().collect::<Vec<_>>(),
                );
            }
        }
        map.finish()
    }
}
