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

use async_trait::async_trait;
use bytes::Bytes;
use muster_common::error::CoreError;
use muster_common::model::{BlobId, UserRole};
use muster_common::storage::BlobClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone)]
struct StoredBlob {
    name: String,
    data: Bytes,
    server_only: bool,
    owner: String,
    fetched: bool,
}

/// The out-of-band byte store. Blobs are addressed by opaque ids, have one
/// intended consumer and are expected to be deleted right after consumption.
/// Blobs still unfetched at the end of a run are leaked: reported, not
/// recovered.
#[derive(Default)]
pub struct BlobStore {
    blobs: RwLock<HashMap<BlobId, StoredBlob>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: &str, data: Bytes, server_only: bool, owner: &str) -> BlobId {
        let id = BlobId::new_v4();
        let mut blobs = self.blobs.write().expect("blob store poisoned");
        blobs.insert(
            id,
            StoredBlob {
                name: name.to_string(),
                data,
                server_only,
                owner: owner.to_string(),
                fetched: false,
            },
        );
        id
    }

    /// Uploads a named batch and returns the blob id per name.
    pub fn put_all(
        &self,
        files: &BTreeMap<String, Bytes>,
        server_only: bool,
        owner: &str,
    ) -> BTreeMap<String, BlobId> {
        files
            .iter()
            .map(|(name, data)| (name.clone(), self.put(name, data.clone(), server_only, owner)))
            .collect()
    }

    /// Server-only blobs are only visible to the server role. Forbidden and
    /// missing are indistinguishable to the caller.
    pub fn fetch(&self, id: BlobId, role: UserRole) -> Result<Bytes, CoreError> {
        let mut blobs = self.blobs.write().expect("blob store poisoned");
        match blobs.get_mut(&id) {
            Some(blob) if Self::visible(blob, role) => {
                blob.fetched = true;
                Ok(blob.data.clone())
            }
            _ => Err(CoreError::NotFound("File not found".to_string())),
        }
    }

    pub fn delete(&self, id: BlobId, role: UserRole) -> Result<(), CoreError> {
        let mut blobs = self.blobs.write().expect("blob store poisoned");
        match blobs.get(&id) {
            Some(blob) if Self::visible(blob, role) => {
                blobs.remove(&id);
                Ok(())
            }
            _ => Err(CoreError::NotFound("File not found".to_string())),
        }
    }

    pub fn contains(&self, id: BlobId) -> bool {
        self.blobs.read().expect("blob store poisoned").contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().expect("blob store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blobs never fetched by anyone. Called at shutdown; each one is a
    /// producer whose consumer never arrived.
    pub fn leaked(&self) -> Vec<(BlobId, String)> {
        self.blobs
            .read()
            .expect("blob store poisoned")
            .iter()
            .filter(|(_, blob)| !blob.fetched)
            .map(|(id, blob)| (*id, blob.name.clone()))
            .collect()
    }

    pub fn report_leaks(&self) {
        for (id, name) in self.leaked() {
            warn!(%id, name, "Blob was uploaded but never fetched");
        }
    }

    fn visible(blob: &StoredBlob, role: UserRole) -> bool {
        !blob.server_only || role == UserRole::Server
    }
}

/// The server's own view of the store: full access under the server role.
#[async_trait]
impl BlobClient for BlobStore {
    async fn upload(
        &self,
        files: BTreeMap<String, Bytes>,
        server_only: bool,
    ) -> Result<BTreeMap<String, BlobId>, CoreError> {
        let mut ids = BTreeMap::new();
        for (name, data) in files {
            let id = self.put(&name, data, server_only, "server");
            ids.insert(name, id);
        }
        Ok(ids)
    }

    async fn fetch(&self, id: BlobId) -> Result<Bytes, CoreError> {
        BlobStore::fetch(self, id, UserRole::Server)
    }

    async fn delete(&self, id: BlobId) -> Result<(), CoreError> {
        BlobStore::delete(self, id, UserRole::Server)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn put_fetch_delete() {
        let store = BlobStore::new();
        let id = store.put("model", Bytes::from_static(b"weights"), false, "site-1");

        assert_eq!(
            store.fetch(id, UserRole::Client).unwrap(),
            Bytes::from_static(b"weights")
        );
        store.delete(id, UserRole::Client).unwrap();
        assert!(matches!(
            store.fetch(id, UserRole::Client),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn server_only_blobs_hide_from_clients() {
        let store = BlobStore::new();
        let id = store.put("model", Bytes::from_static(b"weights"), true, "site-1");

        assert!(matches!(
            store.fetch(id, UserRole::Client),
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(id, UserRole::Observer),
            Err(CoreError::NotFound(_))
        ));
        assert!(store.fetch(id, UserRole::Server).is_ok());
    }

    #[test]
    fn unfetched_blobs_are_reported_as_leaked() {
        let store = BlobStore::new();
        let fetched = store.put("a", Bytes::from_static(b"1"), false, "site-1");
        let leaked = store.put("b", Bytes::from_static(b"2"), false, "site-1");

        store.fetch(fetched, UserRole::Server).unwrap();
        let leaks = store.leaked();
        assert_eq!(leaks, vec![(leaked, "b".to_string())]);
    }
}
