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

use crate::error::CoreError;
use indexmap::IndexMap;
use std::any::Any;
use std::sync::Arc;

/// A hierarchical, type-asserting key→value store. Paths use `:` as the
/// separator: `a:b:c` addresses key `c` inside sub-registry `b` inside
/// sub-registry `a`. Intermediate sub-registries are created on demand when
/// setting. Keys keep insertion order at every level.
///
/// Values are shared handles; `copy` duplicates the handle, not the value,
/// so a copied entry observes later mutations of interior-mutable resources.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: IndexMap<String, ResourceEntry>,
}

enum ResourceEntry {
    Value {
        value: Arc<dyn Any + Send + Sync>,
        type_name: &'static str,
    },
    Registry(ResourceRegistry),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceError {
    #[error("Resource with key `{path}` does not exist")]
    NotFound { path: String },
    #[error("Resource `{path}` not of type `{expected}` but of type `{actual}`")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Resource `{path}` is not a sub-registry")]
    NotARegistry { path: String },
    #[error("Resource with key `{path}` already exists")]
    AlreadyExists { path: String },
}

impl From<ResourceError> for CoreError {
    fn from(value: ResourceError) -> Self {
        match value {
            ResourceError::NotFound { .. } => CoreError::NotFound(value.to_string()),
            ResourceError::TypeMismatch { .. } | ResourceError::NotARegistry { .. } => {
                CoreError::Conflict(value.to_string())
            }
            ResourceError::AlreadyExists { .. } => CoreError::Conflict(value.to_string()),
        }
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&mut self, path: &str, value: T) -> Result<(), ResourceError> {
        self.set_arc(path, Arc::new(value))
    }

    pub fn set_arc<T: Any + Send + Sync>(
        &mut self,
        path: &str,
        value: Arc<T>,
    ) -> Result<(), ResourceError> {
        self.insert(path, value, true)
    }

    /// Like `set` but refuses to replace an existing entry.
    pub fn set_new<T: Any + Send + Sync>(
        &mut self,
        path: &str,
        value: T,
    ) -> Result<(), ResourceError> {
        self.insert(path, Arc::new(value), false)
    }

    /// Stores an already type-erased value, as produced by a wire-value
    /// constructor; `type_name` keeps the error messages honest.
    pub fn set_erased(
        &mut self,
        path: &str,
        value: Arc<dyn Any + Send + Sync>,
        type_name: &'static str,
    ) -> Result<(), ResourceError> {
        self.insert_entry(path, ResourceEntry::Value { value, type_name }, true)
    }

    fn insert<T: Any + Send + Sync>(
        &mut self,
        path: &str,
        value: Arc<T>,
        overwrite: bool,
    ) -> Result<(), ResourceError> {
        let type_name = std::any::type_name::<T>();
        self.insert_entry(
            path,
            ResourceEntry::Value { value, type_name },
            overwrite,
        )
    }

    fn insert_entry(
        &mut self,
        path: &str,
        entry: ResourceEntry,
        overwrite: bool,
    ) -> Result<(), ResourceError> {
        match path.split_once(':') {
            Some((head, rest)) => {
                let child = self
                    .entries
                    .entry(head.to_string())
                    .or_insert_with(|| ResourceEntry::Registry(ResourceRegistry::new()));
                match child {
                    ResourceEntry::Registry(registry) => {
                        registry.insert_entry(rest, entry, overwrite)
                    }
                    ResourceEntry::Value { .. } if overwrite => {
                        *child = ResourceEntry::Registry(ResourceRegistry::new());
                        match child {
                            ResourceEntry::Registry(registry) => {
                                registry.insert_entry(rest, entry, overwrite)
                            }
                            _ => unreachable!(),
                        }
                    }
                    ResourceEntry::Value { .. } => Err(ResourceError::NotARegistry {
                        path: head.to_string(),
                    }),
                }
            }
            None => {
                if !overwrite && self.entries.contains_key(path) {
                    return Err(ResourceError::AlreadyExists {
                        path: path.to_string(),
                    });
                }
                self.entries.insert(path.to_string(), entry);
                Ok(())
            }
        }
    }

    pub fn get<T: Any + Send + Sync>(&self, path: &str) -> Result<Arc<T>, ResourceError> {
        self.get_opt(path)?.ok_or_else(|| ResourceError::NotFound {
            path: path.to_string(),
        })
    }

    /// `Ok(None)` when absent, an error only on a type mismatch.
    pub fn get_opt<T: Any + Send + Sync>(&self, path: &str) -> Result<Option<Arc<T>>, ResourceError> {
        match self.lookup(path) {
            None => Ok(None),
            Some(ResourceEntry::Registry(_)) => Err(ResourceError::TypeMismatch {
                path: path.to_string(),
                expected: std::any::type_name::<T>(),
                actual: "ResourceRegistry",
            }),
            Some(ResourceEntry::Value { value, type_name }) => value
                .clone()
                .downcast::<T>()
                .map(Some)
                .map_err(|_| ResourceError::TypeMismatch {
                    path: path.to_string(),
                    expected: std::any::type_name::<T>(),
                    actual: type_name,
                }),
        }
    }

    pub fn get_or<T: Any + Send + Sync>(&self, path: &str, default: T) -> Result<Arc<T>, ResourceError> {
        Ok(self.get_opt(path)?.unwrap_or_else(|| Arc::new(default)))
    }

    pub fn remove<T: Any + Send + Sync>(&mut self, path: &str) -> Result<Arc<T>, ResourceError> {
        // checked before removal so a mismatch leaves the entry in place
        let value = self.get::<T>(path)?;
        self.remove_path(path)?;
        Ok(value)
    }

    /// Removes a value or an entire sub-registry.
    pub fn remove_path(&mut self, path: &str) -> Result<(), ResourceError> {
        match path.split_once(':') {
            Some((head, rest)) => match self.entries.get_mut(head) {
                Some(ResourceEntry::Registry(registry)) => registry.remove_path(rest),
                Some(ResourceEntry::Value { .. }) => Err(ResourceError::NotARegistry {
                    path: head.to_string(),
                }),
                None => Err(ResourceError::NotFound {
                    path: path.to_string(),
                }),
            },
            None => {
                self.entries
                    .shift_remove(path)
                    .ok_or(ResourceError::NotFound {
                        path: path.to_string(),
                    })?;
                Ok(())
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Copies the shared handle under `src` to `dst`.
    pub fn copy(&mut self, src: &str, dst: &str) -> Result<(), ResourceError> {
        let entry = match self.lookup(src) {
            Some(ResourceEntry::Value { value, type_name }) => ResourceEntry::Value {
                value: value.clone(),
                type_name,
            },
            Some(ResourceEntry::Registry(_)) => {
                return Err(ResourceError::NotARegistry {
                    path: src.to_string(),
                })
            }
            None => {
                return Err(ResourceError::NotFound {
                    path: src.to_string(),
                })
            }
        };
        self.insert_entry(dst, entry, true)
    }

    /// Keys directly under a path (the path must address a sub-registry; the
    /// root is addressed by "").
    pub fn keys(&self, path: &str) -> Result<Vec<String>, ResourceError> {
        let registry = if path.is_empty() {
            self
        } else {
            match self.lookup(path) {
                Some(ResourceEntry::Registry(registry)) => registry,
                Some(ResourceEntry::Value { .. }) => {
                    return Err(ResourceError::NotARegistry {
                        path: path.to_string(),
                    })
                }
                None => {
                    return Err(ResourceError::NotFound {
                        path: path.to_string(),
                    })
                }
            }
        };
        Ok(registry.entries.keys().cloned().collect())
    }

    /// Every path (joined with `:`) whose value downcasts to `T`, across all
    /// levels.
    pub fn paths_of_type<T: Any + Send + Sync>(&self) -> Vec<(String, Arc<T>)> {
        let mut found = Vec::new();
        self.collect_of_type(None, &mut found);
        found
    }

    fn collect_of_type<T: Any + Send + Sync>(
        &self,
        prefix: Option<&str>,
        found: &mut Vec<(String, Arc<T>)>,
    ) {
        for (key, entry) in &self.entries {
            let path = match prefix {
                Some(prefix) => format!("{prefix}:{key}"),
                None => key.clone(),
            };
            match entry {
                ResourceEntry::Value { value, .. } => {
                    if let Ok(typed) = value.clone().downcast::<T>() {
                        found.push((path, typed));
                    }
                }
                ResourceEntry::Registry(registry) => {
                    registry.collect_of_type(Some(&path), found)
                }
            }
        }
    }

    fn lookup(&self, path: &str) -> Option<&ResourceEntry> {
        match path.split_once(':') {
            Some((head, rest)) => match self.entries.get(head) {
                Some(ResourceEntry::Registry(registry)) => registry.lookup(rest),
                _ => None,
            },
            None => self.entries.get(path),
        }
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, entry) in &self.entries {
            match entry {
                ResourceEntry::Value { type_name, .. } => map.entry(key, type_name),
                ResourceEntry::Registry(registry) => map.entry(key, registry),
            };
        }
        map.finish()
    }
}
