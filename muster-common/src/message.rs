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

use crate::command::CommandSpec;
use crate::error::CoreError;
use crate::model::{BlobId, CommandId, CommandStatus, RequestId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The in-memory result of executing a command. File payloads are raw bytes
/// here; they never travel inline — `unload` swaps them for blob ids before
/// a message is sent and `refill` restores them on the receiving side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResponse {
    pub response_type: Option<String>,
    pub data: Value,
    pub files: BTreeMap<String, Bytes>,
}

pub const RESPONSE_TYPE_METRIC: &str = "metric";
pub const RESPONSE_TYPE_RESOURCE: &str = "resource";
pub const RESPONSE_TYPE_CLIENT_SCORE: &str = "client_score";
pub const RESPONSE_TYPE_COMMAND: &str = "command";

impl ExecutionResponse {
    pub fn metric(
        metrics: BTreeMap<String, f64>,
        metric_type: impl Into<String>,
        comm_round: Option<u64>,
        epoch: Option<u64>,
    ) -> Self {
        Self {
            response_type: Some(RESPONSE_TYPE_METRIC.to_string()),
            data: serde_json::json!({
                "metrics": metrics,
                "metric_type": metric_type.into(),
                "comm_round": comm_round,
                "epoch": epoch,
            }),
            files: BTreeMap::new(),
        }
    }

    pub fn resource(name: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            response_type: Some(RESPONSE_TYPE_RESOURCE.to_string()),
            data: Value::Null,
            files: BTreeMap::from([(name.into(), bytes)]),
        }
    }

    pub fn client_score(score_type: impl Into<String>, score: f64) -> Self {
        Self {
            response_type: Some(RESPONSE_TYPE_CLIENT_SCORE.to_string()),
            data: serde_json::json!({
                "score_type": score_type.into(),
                "score": score,
            }),
            files: BTreeMap::new(),
        }
    }

    /// The reply to a `PullCommand` request; `None` means nothing eligible.
    pub fn command(spec: Option<&CommandSpec>) -> Self {
        Self {
            response_type: Some(RESPONSE_TYPE_COMMAND.to_string()),
            data: match spec {
                Some(spec) => serde_json::to_value(spec).expect("command specs serialize to JSON"),
                None => Value::Null,
            },
            files: BTreeMap::new(),
        }
    }

    pub fn contains_files(&self) -> bool {
        !self.files.is_empty()
    }

    /// Replaces file bytes with the blob ids they were uploaded under.
    pub fn unload(self, blob_ids: BTreeMap<String, BlobId>) -> WireExecutionResponse {
        WireExecutionResponse {
            response_type: self.response_type,
            data: self.data,
            files: blob_ids,
        }
    }
}

/// The on-wire form of an execution response: files are blob ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireExecutionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, BlobId>,
}

impl WireExecutionResponse {
    pub fn contains_files(&self) -> bool {
        !self.files.is_empty()
    }

    /// Restores fetched bytes; every referenced blob must be present.
    pub fn refill(self, mut files: BTreeMap<String, Bytes>) -> Result<ExecutionResponse, CoreError> {
        let mut restored = BTreeMap::new();
        for name in self.files.keys() {
            let bytes = files
                .remove(name)
                .ok_or_else(|| CoreError::NotFound(format!("Missing file payload: {name}")))?;
            restored.insert(name.clone(), bytes);
        }
        Ok(ExecutionResponse {
            response_type: self.response_type,
            data: self.data,
            files: restored,
        })
    }
}

/// A worker's report about one command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub command_uuid: CommandId,
    pub status: CommandStatus,
    pub datatype: String,
    pub node_name: Option<String>,
    pub response: Option<ExecutionResponse>,
}

impl StatusUpdate {
    pub fn new(command_uuid: CommandId, status: CommandStatus, datatype: impl Into<String>) -> Self {
        Self {
            command_uuid,
            status,
            datatype: datatype.into(),
            node_name: None,
            response: None,
        }
    }

    pub fn with_response(mut self, response: ExecutionResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn contains_files(&self) -> bool {
        self.response
            .as_ref()
            .map(|r| r.contains_files())
            .unwrap_or(false)
    }

    pub fn unload(self, blob_ids: BTreeMap<String, BlobId>) -> WireStatusUpdate {
        WireStatusUpdate {
            command_uuid: self.command_uuid,
            status: self.status,
            datatype: self.datatype,
            node_name: self.node_name,
            response: self.response.map(|r| r.unload(blob_ids)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireStatusUpdate {
    pub command_uuid: CommandId,
    pub status: CommandStatus,
    pub datatype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WireExecutionResponse>,
}

impl WireStatusUpdate {
    pub fn contains_files(&self) -> bool {
        self.response
            .as_ref()
            .map(|r| r.contains_files())
            .unwrap_or(false)
    }

    pub fn blob_ids(&self) -> Vec<(String, BlobId)> {
        self.response
            .as_ref()
            .map(|r| r.files.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    pub fn refill(self, files: BTreeMap<String, Bytes>) -> Result<StatusUpdate, CoreError> {
        let response = match self.response {
            Some(response) => Some(response.refill(files)?),
            None => None,
        };
        Ok(StatusUpdate {
            command_uuid: self.command_uuid,
            status: self.status,
            datatype: self.datatype,
            node_name: self.node_name,
            response,
        })
    }
}

/// Control-plane RPC from a worker to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "datatype", content = "data")]
pub enum ServerRequest {
    PullCommand(crate::model::Empty),
    FetchCheckpoint {
        resource_type: String,
        resource_key: String,
        checkpoint_key: String,
    },
}

impl ServerRequest {
    pub fn pull_command() -> Self {
        ServerRequest::PullCommand(crate::model::Empty {})
    }

    pub fn datatype(&self) -> &'static str {
        match self {
            ServerRequest::PullCommand(_) => "PullCommand",
            ServerRequest::FetchCheckpoint { .. } => "FetchCheckpoint",
        }
    }
}

/// Broker-carrier envelope for a server request; responses are correlated by
/// `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRequestEnvelope {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub request: ServerRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRequestReply {
    pub request_id: RequestId,
    pub response: WireExecutionResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerMessageType {
    ServerRequest,
    ServerRequestResponse,
    StatusUpdate,
}

/// Every broker-carrier message is `{message_type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_type: BrokerMessageType,
    pub data: Value,
}

impl BrokerMessage {
    pub fn server_request(envelope: &ServerRequestEnvelope) -> Self {
        Self {
            message_type: BrokerMessageType::ServerRequest,
            data: serde_json::to_value(envelope).expect("envelopes serialize to JSON"),
        }
    }

    pub fn server_request_response(reply: &ServerRequestReply) -> Self {
        Self {
            message_type: BrokerMessageType::ServerRequestResponse,
            data: serde_json::to_value(reply).expect("replies serialize to JSON"),
        }
    }

    pub fn status_update(update: &WireStatusUpdate) -> Self {
        Self {
            message_type: BrokerMessageType::StatusUpdate,
            data: serde_json::to_value(update).expect("status updates serialize to JSON"),
        }
    }
}
