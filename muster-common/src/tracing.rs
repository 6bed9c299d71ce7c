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
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// env-filter directive, e.g. "info" or "muster_server=debug,info".
    pub filter: String,
    pub json: bool,
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn local_dev(service: &str) -> Self {
        Self {
            filter: format!("{}=debug,info", service.replace('-', "_")),
            json: false,
            ansi: true,
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "filter: {}", self.filter);
        let _ = writeln!(&mut result, "json: {}", self.json);
        result
    }
}

/// Installs the global subscriber. Called once per process, from binaries
/// only.
pub fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_new(&config.filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_ansi(config.ansi)
            .with_env_filter(filter)
            .init();
    }
}
