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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tracing: TracingConfig,
    pub run_name: String,
    pub host: String,
    pub http_port: u16,
    pub topology_file: Option<PathBuf>,
    pub users_file: Option<PathBuf>,
    /// Auto-creates client users and topology nodes on first contact. For
    /// tests and demos only; must be off in production.
    pub simulation: bool,
    pub tls: Option<TlsConfig>,
    pub broker: Option<BrokerConfig>,
    pub auth: AuthConfig,
    pub liveness: LivenessConfig,
    pub watchers: WatchersConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("muster-server"),
            run_name: "muster".to_string(),
            host: "0.0.0.0".to_string(),
            http_port: 8000,
            topology_file: None,
            users_file: None,
            simulation: false,
            tls: None,
            broker: None,
            auth: AuthConfig::default(),
            liveness: LivenessConfig::default(),
            watchers: WatchersConfig::default(),
        }
    }
}

impl SafeDisplay for ServerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "run name: {}", self.run_name);
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "topology file: {:?}", self.topology_file);
        let _ = writeln!(&mut result, "users file: {:?}", self.users_file);
        let _ = writeln!(&mut result, "simulation: {}", self.simulation);
        if let Some(tls) = &self.tls {
            let _ = writeln!(&mut result, "TLS:");
            let _ = writeln!(&mut result, "{}", tls.to_safe_string_indented());
        }
        if let Some(broker) = &self.broker {
            let _ = writeln!(&mut result, "broker:");
            let _ = writeln!(&mut result, "{}", broker.to_safe_string_indented());
        }
        let _ = writeln!(&mut result, "auth:");
        let _ = writeln!(&mut result, "{}", self.auth.to_safe_string_indented());
        let _ = writeln!(&mut result, "liveness:");
        let _ = writeln!(&mut result, "{}", self.liveness.to_safe_string_indented());
        let _ = writeln!(&mut result, "watchers:");
        let _ = writeln!(&mut result, "{}", self.watchers.to_safe_string_indented());
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl SafeDisplay for TlsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "cert file: {:?}", self.cert_file);
        let _ = writeln!(&mut result, "key file: {:?}", self.key_file);
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    /// How long a blocking queue pop waits before the listener re-checks for
    /// shutdown.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl SafeDisplay for BrokerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        // the URL may carry credentials
        let _ = writeln!(&mut result, "url: ****");
        let _ = writeln!(&mut result, "poll timeout: {:?}", self.poll_timeout);
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(60 * 60 * 24 * 3),
        }
    }
}

impl SafeDisplay for AuthConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "token TTL: {:?}", self.token_ttl);
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    /// A client silent for longer than this is marked offline.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

impl SafeDisplay for LivenessConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "scan interval: {:?}", self.scan_interval);
        let _ = writeln!(&mut result, "timeout: {:?}", self.timeout);
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchersConfig {
    pub console: bool,
    pub metric_aggregation: bool,
    pub new_best: Option<CriterionConfig>,
    pub model_saver: Option<ModelSaverConfig>,
}

impl Default for WatchersConfig {
    fn default() -> Self {
        Self {
            console: true,
            metric_aggregation: true,
            new_best: None,
            model_saver: None,
        }
    }
}

impl SafeDisplay for WatchersConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "console: {}", self.console);
        let _ = writeln!(&mut result, "metric aggregation: {}", self.metric_aggregation);
        let _ = writeln!(&mut result, "new best: {:?}", self.new_best);
        let _ = writeln!(&mut result, "model saver: {:?}", self.model_saver);
        result
    }
}

/// The metric that decides which model state is "best".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionConfig {
    pub metric: String,
    pub lower_is_better: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSaverConfig {
    pub model_key: String,
    pub save_folder: PathBuf,
}

pub fn make_config_loader() -> ConfigLoader<ServerConfig> {
    ConfigLoader::new(&PathBuf::from("config/muster-server.toml"))
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::path::PathBuf;
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
