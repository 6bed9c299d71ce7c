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

use crate::config::BrokerConfig;
use crate::engine::Engine;
use muster_common::error::CoreError;
use muster_common::message::{
    BrokerMessage, BrokerMessageType, ServerRequestEnvelope, ServerRequestReply, WireStatusUpdate,
};
use muster_common::model::{NodeRole, UserRole};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn server_queue(client: &str) -> String {
    format!("server_queue_{client}")
}

pub fn client_queue(client: &str) -> String {
    format!("client_queue_{client}")
}

/// The broker carrier: one queue pair per configured client. The listener
/// consumes every `server_queue_<name>`, routes the messages into the
/// engine, and pushes correlated replies to `client_queue_<name>`.
pub struct BrokerListener {
    engine: Arc<Engine>,
    config: BrokerConfig,
}

impl BrokerListener {
    pub fn new(engine: Arc<Engine>, config: BrokerConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CoreError> {
        let client = redis::Client::open(self.config.url.as_str())
            .map_err(|err| CoreError::ServerRequest(format!("Broker connect failed: {err}")))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CoreError::ServerRequest(format!("Broker connect failed: {err}")))?;

        let clients: Vec<String> = self
            .engine
            .topology_snapshot()
            .await
            .into_iter()
            .filter(|node| node.role == NodeRole::Client)
            .map(|node| node.name)
            .collect();

        // drop stale messages from prior runs
        for name in &clients {
            let _: Result<(), _> = connection.del(server_queue(name)).await;
            let _: Result<(), _> = connection.del(client_queue(name)).await;
        }
        info!(clients = clients.len(), "Broker listener started; queues purged");

        let queues: Vec<String> = clients.iter().map(|name| server_queue(name)).collect();
        let timeout = self.config.poll_timeout.as_secs_f64();

        while !shutdown.is_cancelled() {
            if queues.is_empty() {
                tokio::time::sleep(self.config.poll_timeout).await;
                continue;
            }

            let popped: Option<(String, String)> =
                match connection.brpop(queues.clone(), timeout).await {
                    Ok(popped) => popped,
                    Err(err) => {
                        warn!(error = %err, "Broker pop failed; retrying");
                        tokio::time::sleep(self.config.poll_timeout).await;
                        continue;
                    }
                };

            let Some((queue, payload)) = popped else {
                continue;
            };
            let Some(worker) = queue.strip_prefix("server_queue_").map(str::to_string) else {
                continue;
            };

            // any broker traffic proves the worker is alive
            if let Err(err) = self.engine.connect(&worker).await {
                warn!(worker, error = %err, "Broker message from unknown worker");
                continue;
            }

            if let Err(err) = self.handle_message(&mut connection, &worker, &payload).await {
                warn!(worker, error = %err, "Broker message handling failed");
            }
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        connection: &mut redis::aio::MultiplexedConnection,
        worker: &str,
        payload: &str,
    ) -> Result<(), CoreError> {
        let message: BrokerMessage = serde_json::from_str(payload)
            .map_err(|err| CoreError::InvalidRequest(format!("Malformed broker message: {err}")))?;

        match message.message_type {
            BrokerMessageType::StatusUpdate => {
                let wire: WireStatusUpdate = serde_json::from_value(message.data).map_err(|err| {
                    CoreError::InvalidRequest(format!("Malformed status update: {err}"))
                })?;

                let mut files = BTreeMap::new();
                for (name, blob_id) in wire.blob_ids() {
                    let bytes = self.engine.blobs().fetch(blob_id, UserRole::Server)?;
                    self.engine.blobs().delete(blob_id, UserRole::Server)?;
                    files.insert(name, bytes);
                }

                let mut update = wire.refill(files)?;
                update.node_name = Some(worker.to_string());
                self.engine.handle_status_update(update).await
            }
            BrokerMessageType::ServerRequest => {
                let envelope: ServerRequestEnvelope = serde_json::from_value(message.data)
                    .map_err(|err| {
                        CoreError::InvalidRequest(format!("Malformed server request: {err}"))
                    })?;
                debug!(worker, request = envelope.request.datatype(), "Broker server request");

                let response = self
                    .engine
                    .handle_server_request(envelope.request, worker)
                    .await?;

                let blob_ids = if response.contains_files() {
                    self.engine.blobs().put_all(&response.files, false, "server")
                } else {
                    BTreeMap::new()
                };
                let reply = ServerRequestReply {
                    request_id: envelope.request_id,
                    response: response.unload(blob_ids),
                };

                let encoded = serde_json::to_string(&BrokerMessage::server_request_response(&reply))
                    .map_err(|err| {
                        CoreError::ServerRequest(format!("Cannot encode reply: {err}"))
                    })?;
                connection
                    .lpush::<_, _, ()>(client_queue(worker), encoded)
                    .await
                    .map_err(|err| CoreError::ServerRequest(format!("Broker push failed: {err}")))
            }
            BrokerMessageType::ServerRequestResponse => Err(CoreError::InvalidRequest(
                "Server received a response message".to_string(),
            )),
        }
    }
}
