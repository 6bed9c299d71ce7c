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

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};

/// The stable error kinds of the coordination core. The names are part of
/// the contract; carriers map them onto their own status codes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Request denied: {0}")]
    RequestDenied(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Topology error: {0}")]
    Topology(String),
    #[error("Abstract command reached execution: {0}")]
    AbstractCommand(String),
    #[error("Server request failed: {0}")]
    ServerRequest(String),
    #[error("Aggregation error: {0}")]
    Aggregation(String),
    #[error("Client configuration error: {0}")]
    ClientConfiguration(String),
}

impl CoreError {
    /// Transient transport failures are retried by the worker's pull loop;
    /// everything else surfaces as a FAILED status or terminates the loop.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoreError::ServerRequest(_))
    }

    /// Worker-fatal errors stop the loop instead of being reported per
    /// command.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Unauthorized(_))
    }
}

impl SafeDisplay for CoreError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// JSON error bodies returned by the HTTP carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

/// Process exit codes of the server and worker binaries.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const AUTH_FAILURE: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
}
