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
use crate::model::BlobId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Access to the out-of-band blob store. The server talks to its own store
/// directly; workers go through the HTTP storage endpoints. Either way the
/// contract is the same: upload before referencing, delete after consuming.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Uploads the named payloads and returns the blob id per name.
    /// `server_only` restricts later fetches to the server role.
    async fn upload(
        &self,
        files: BTreeMap<String, Bytes>,
        server_only: bool,
    ) -> Result<BTreeMap<String, BlobId>, CoreError>;

    async fn fetch(&self, id: BlobId) -> Result<Bytes, CoreError>;

    async fn delete(&self, id: BlobId) -> Result<(), CoreError>;

    /// Fetches and then eagerly deletes; the common consumption pattern.
    async fn consume(&self, id: BlobId) -> Result<Bytes, CoreError> {
        let bytes = self.fetch(id).await?;
        self.delete(id).await?;
        Ok(bytes)
    }
}

/// In-process store for single-process runs and tests; no role checks, the
/// caller owns everything.
#[derive(Default)]
pub struct MemoryBlobClient {
    blobs: std::sync::Mutex<std::collections::HashMap<BlobId, Bytes>>,
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobClient for MemoryBlobClient {
    async fn upload(
        &self,
        files: BTreeMap<String, Bytes>,
        _server_only: bool,
    ) -> Result<BTreeMap<String, BlobId>, CoreError> {
        let mut blobs = self.blobs.lock().expect("blob map poisoned");
        let mut ids = BTreeMap::new();
        for (name, data) in files {
            let id = BlobId::new_v4();
            blobs.insert(id, data);
            ids.insert(name, id);
        }
        Ok(ids)
    }

    async fn fetch(&self, id: BlobId) -> Result<Bytes, CoreError> {
        self.blobs
            .lock()
            .expect("blob map poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound("File not found".to_string()))
    }

    async fn delete(&self, id: BlobId) -> Result<(), CoreError> {
        self.blobs
            .lock()
            .expect("blob map poisoned")
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound("File not found".to_string()))
    }
}
