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

use muster_common::config::ConfigLoader;
use muster_common::tracing::TracingConfig;
use muster_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    /// Base URL of the control plane, e.g. "http://localhost:8000".
    pub server_url: String,
    /// Base URL of the blob store; defaults to the control plane URL.
    pub storage_url: Option<String>,
    pub transport: TransportKind,
    /// Broker URL when the broker carrier is selected.
    pub broker_url: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    pub device: String,
    /// Exactly one of these may be set.
    pub allowed_commands: Option<Vec<String>>,
    pub denied_commands: Option<Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("muster-worker"),
            server_url: "http://localhost:8000".to_string(),
            storage_url: None,
            transport: TransportKind::Http,
            broker_url: None,
            username: "client".to_string(),
            password: "client".to_string(),
            ping_interval: Duration::from_secs(1),
            device: "cpu".to_string(),
            allowed_commands: None,
            denied_commands: None,
        }
    }
}

impl WorkerConfig {
    pub fn storage_url(&self) -> &str {
        self.storage_url.as_deref().unwrap_or(&self.server_url)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.allowed_commands.is_some() && self.denied_commands.is_some() {
            return Err("allowed_commands and denied_commands are mutually exclusive".to_string());
        }
        if self.transport == TransportKind::Broker && self.broker_url.is_none() {
            return Err("the broker transport requires a broker_url".to_string());
        }
        Ok(())
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "server url: {}", self.server_url);
        let _ = writeln!(&mut result, "storage url: {}", self.storage_url());
        let _ = writeln!(&mut result, "transport: {:?}", self.transport);
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "ping interval: {:?}", self.ping_interval);
        let _ = writeln!(&mut result, "device: {}", self.device);
        let _ = writeln!(&mut result, "allowed commands: {:?}", self.allowed_commands);
        let _ = writeln!(&mut result, "denied commands: {:?}", self.denied_commands);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new(&PathBuf::from("config/muster-worker.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    pub fn config_is_loadable() {
        std::env::set_current_dir(std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }

    #[test]
    fn guard_lists_are_mutually_exclusive() {
        let mut config = WorkerConfig::default();
        config.allowed_commands = Some(vec!["Print".to_string()]);
        config.denied_commands = Some(vec!["Plugin".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn broker_transport_requires_a_url() {
        let mut config = WorkerConfig::default();
        config.transport = TransportKind::Broker;
        assert!(config.validate().is_err());
        config.broker_url = Some("redis://localhost".to_string());
        assert!(config.validate().is_ok());
    }
}
