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
use muster_common::message::{
    BrokerMessage, BrokerMessageType, ExecutionResponse, ServerRequest, ServerRequestEnvelope,
    ServerRequestReply, StatusUpdate, WireExecutionResponse,
};
use muster_common::model::RequestId;
use muster_common::storage::BlobClient;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// A worker's connection to the control plane, independent of the carrier.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Sends a typed request and returns the re-materialized response.
    async fn request(&self, request: ServerRequest) -> Result<ExecutionResponse, CoreError>;

    /// Fire-and-forget status delivery; file payloads are uploaded as blobs
    /// first.
    async fn send_status_update(&self, update: StatusUpdate) -> Result<(), CoreError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponseBody {
    access_token: String,
}

/// Request/reply over HTTP. The token is fetched once at connect time; an
/// expired token surfaces as `Unauthorized`, which is fatal for the worker
/// loop.
pub struct HttpConnection {
    http: reqwest::Client,
    base_url: String,
    token: String,
    blobs: Arc<dyn BlobClient>,
}

impl HttpConnection {
    pub async fn connect(
        base_url: impl Into<String>,
        username: &str,
        password: &str,
        blobs: Arc<dyn BlobClient>,
    ) -> Result<Self, CoreError> {
        let base_url = base_url.into();
        let http = reqwest::Client::new();
        let token = request_token(&http, &base_url, "/token", username, password).await?;
        Ok(Self {
            http,
            base_url,
            token,
            blobs,
        })
    }

    async fn refill(&self, wire: WireExecutionResponse) -> Result<ExecutionResponse, CoreError> {
        let mut files = BTreeMap::new();
        for (name, blob_id) in wire.files.clone() {
            // the worker is the single consumer of response payloads
            let bytes = self.blobs.consume(blob_id).await?;
            files.insert(name, bytes);
        }
        wire.refill(files)
    }
}

pub async fn request_token(
    http: &reqwest::Client,
    base_url: &str,
    path: &str,
    username: &str,
    password: &str,
) -> Result<String, CoreError> {
    let response = http
        .post(format!("{base_url}{path}"))
        .form(&[("username", username), ("password", password)])
        .send()
        .await
        .map_err(|err| CoreError::ServerRequest(format!("Could not connect to server: {err}")))?;

    match response.status() {
        status if status == reqwest::StatusCode::UNAUTHORIZED => Err(CoreError::Unauthorized(
            "Invalid username or password".to_string(),
        )),
        status if status.is_success() => {
            let body: TokenResponseBody = response.json().await.map_err(|err| {
                CoreError::ServerRequest(format!("Malformed token response: {err}"))
            })?;
            Ok(body.access_token)
        }
        status => Err(CoreError::ServerRequest(format!(
            "Could not get token: {status}"
        ))),
    }
}

#[async_trait]
impl ServerConnection for HttpConnection {
    async fn request(&self, request: ServerRequest) -> Result<ExecutionResponse, CoreError> {
        let response = self
            .http
            .post(format!("{}/serverrequest", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                CoreError::ServerRequest(format!("Could not connect to server: {err}"))
            })?;

        match response.status() {
            status if status == reqwest::StatusCode::UNAUTHORIZED => {
                Err(CoreError::Unauthorized("Token rejected".to_string()))
            }
            status if status.is_success() => {
                let wire: WireExecutionResponse = response.json().await.map_err(|err| {
                    CoreError::ServerRequest(format!("Malformed response: {err}"))
                })?;
                self.refill(wire).await
            }
            status => Err(CoreError::ServerRequest(format!(
                "Server request failed: {status}"
            ))),
        }
    }

    async fn send_status_update(&self, update: StatusUpdate) -> Result<(), CoreError> {
        let blob_ids = if update.contains_files() {
            let files = update
                .response
                .as_ref()
                .map(|response| response.files.clone())
                .unwrap_or_default();
            // result payloads are for the server only
            self.blobs.upload(files, true).await?
        } else {
            BTreeMap::new()
        };

        let wire = update.unload(blob_ids);
        let response = self
            .http
            .post(format!("{}/status", self.base_url))
            .bearer_auth(&self.token)
            .json(&wire)
            .send()
            .await
            .map_err(|err| {
                CoreError::ServerRequest(format!("Could not connect to server: {err}"))
            })?;

        match response.status() {
            status if status == reqwest::StatusCode::UNAUTHORIZED => {
                Err(CoreError::Unauthorized("Token rejected".to_string()))
            }
            status if status.is_success() => Ok(()),
            status => Err(CoreError::ServerRequest(format!(
                "Could not send status update: {status}"
            ))),
        }
    }
}

/// The broker carrier: the worker pushes onto `server_queue_<name>` and
/// pops replies from `client_queue_<name>`, correlated by request id.
pub struct BrokerConnection {
    connection: Mutex<redis::aio::MultiplexedConnection>,
    worker_name: String,
    poll_timeout: Duration,
    request_timeout: Duration,
    blobs: Arc<dyn BlobClient>,
}

impl BrokerConnection {
    pub async fn connect(
        url: &str,
        worker_name: impl Into<String>,
        blobs: Arc<dyn BlobClient>,
    ) -> Result<Self, CoreError> {
        let client = redis::Client::open(url)
            .map_err(|err| CoreError::ServerRequest(format!("Broker connect failed: {err}")))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Broker connect failed: {err}")))?;
        Ok(Self {
            connection: Mutex::new(connection),
            worker_name: worker_name.into(),
            poll_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            blobs,
        })
    }

    fn server_queue(&self) -> String {
        format!("server_queue_{}", self.worker_name)
    }

    fn client_queue(&self) -> String {
        format!("client_queue_{}", self.worker_name)
    }

    async fn push(&self, message: &BrokerMessage) -> Result<(), CoreError> {
        use redis::AsyncCommands;
        let encoded = serde_json::to_string(message)
            .map_err(|err| CoreError::ServerRequest(format!("Cannot encode message: {err}")))?;
        let mut connection = self.connection.lock().await;
        connection
            .lpush::<_, _, ()>(self.server_queue(), encoded)
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Broker push failed: {err}")))
    }
}

#[async_trait]
impl ServerConnection for BrokerConnection {
    async fn request(&self, request: ServerRequest) -> Result<ExecutionResponse, CoreError> {
        use redis::AsyncCommands;

        let envelope = ServerRequestEnvelope {
            request_id: RequestId::new_v4(),
            request,
        };
        self.push(&BrokerMessage::server_request(&envelope)).await?;

        let deadline = tokio::time::Instant::now() + self.request_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::ServerRequest(
                    "Timed out waiting for a broker reply".to_string(),
                ));
            }

            let popped: Option<(String, String)> = {
                let mut connection = self.connection.lock().await;
                connection
                    .brpop(self.client_queue(), self.poll_timeout.as_secs_f64())
                    .await
                    .map_err(|err| {
                        CoreError::ServerRequest(format!("Broker pop failed: {err}"))
                    })?
            };
            let Some((_, payload)) = popped else {
                continue;
            };

            let message: BrokerMessage = serde_json::from_str(&payload).map_err(|err| {
                CoreError::ServerRequest(format!("Malformed broker message: {err}"))
            })?;
            if message.message_type != BrokerMessageType::ServerRequestResponse {
                warn!(message_type = ?message.message_type, "Dropping unexpected broker message");
                continue;
            }

            let reply: ServerRequestReply = serde_json::from_value(message.data).map_err(|err| {
                CoreError::ServerRequest(format!("Malformed broker reply: {err}"))
            })?;
            if reply.request_id != envelope.request_id {
                warn!(request = %reply.request_id, "Dropping stale broker reply");
                continue;
            }

            let mut files: BTreeMap<String, Bytes> = BTreeMap::new();
            for (name, blob_id) in reply.response.files.clone() {
                files.insert(name, self.blobs.consume(blob_id).await?);
            }
            return reply.response.refill(files);
        }
    }

    async fn send_status_update(&self, update: StatusUpdate) -> Result<(), CoreError> {
        let blob_ids = if update.contains_files() {
            let files = update
                .response
                .as_ref()
                .map(|response| response.files.clone())
                .unwrap_or_default();
            self.blobs.upload(files, true).await?
        } else {
            BTreeMap::new()
        };

        let wire = update.unload(blob_ids);
        self.push(&BrokerMessage::status_update(&wire)).await
    }
}
