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

use crate::transport::request_token;
use async_trait::async_trait;
use bytes::Bytes;
use muster_common::error::CoreError;
use muster_common::model::BlobId;
use muster_common::storage::BlobClient;
use std::collections::{BTreeMap, HashMap};

/// Blob store access over the storage endpoints.
pub struct HttpBlobClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBlobClient {
    pub async fn connect(
        base_url: impl Into<String>,
        username: &str,
        password: &str,
    ) -> Result<Self, CoreError> {
        let base_url = base_url.into();
        let http = reqwest::Client::new();
        let token = request_token(&http, &base_url, "/storage-token", username, password).await?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }
}

#[async_trait]
impl BlobClient for HttpBlobClient {
    async fn upload(
        &self,
        files: BTreeMap<String, Bytes>,
        server_only: bool,
    ) -> Result<BTreeMap<String, BlobId>, CoreError> {
        let mut form =
            reqwest::multipart::Form::new().text("is_server_only", server_only.to_string());
        for (name, data) in &files {
            form = form.part(
                "files",
                reqwest::multipart::Part::bytes(data.to_vec()).file_name(name.clone()),
            );
        }

        let response = self
            .http
            .post(format!("{}/file", self.base_url))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Blob upload failed: {err}")))?;

        if !response.status().is_success() {
            return Err(CoreError::ServerRequest(format!(
                "Blob upload failed: {}",
                response.status()
            )));
        }

        let ids: HashMap<String, String> = response
            .json()
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Malformed upload reply: {err}")))?;

        let mut parsed = BTreeMap::new();
        for (name, id) in ids {
            parsed.insert(
                name,
                id.parse::<BlobId>().map_err(CoreError::ServerRequest)?,
            );
        }
        Ok(parsed)
    }

    async fn fetch(&self, id: BlobId) -> Result<Bytes, CoreError> {
        let response = self
            .http
            .get(format!("{}/file/{id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Blob fetch failed: {err}")))?;

        match response.status() {
            status if status == reqwest::StatusCode::NOT_FOUND => {
                Err(CoreError::NotFound("File not found".to_string()))
            }
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|err| CoreError::ServerRequest(format!("Blob fetch failed: {err}"))),
            status => Err(CoreError::ServerRequest(format!(
                "Blob fetch failed: {status}"
            ))),
        }
    }

    async fn delete(&self, id: BlobId) -> Result<(), CoreError> {
        let response = self
            .http
            .delete(format!("{}/file/{id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Blob delete failed: {err}")))?;

        match response.status() {
            status if status == reqwest::StatusCode::NOT_FOUND => {
                Err(CoreError::NotFound("File not found".to_string()))
            }
            status if status.is_success() => Ok(()),
            status => Err(CoreError::ServerRequest(format!(
                "Blob delete failed: {status}"
            ))),
        }
    }
}
