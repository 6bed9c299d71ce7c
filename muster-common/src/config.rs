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

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "MUSTER__";

/// Layered configuration: defaults, then an optional TOML file, then
/// `MUSTER__`-prefixed environment variables (`__` as the separator).
pub struct ConfigLoader<T: Default + Serialize + DeserializeOwned> {
    config_file: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file: &Path) -> Self {
        Self {
            config_file: config_file.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        port: u16,
        name: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                port: 9000,
                name: "default".to_string(),
            }
        }
    }

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(Path::new("does/not/exist.toml"));
        let config = loader.load().unwrap();
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 1234\n").unwrap();

        let loader: ConfigLoader<TestConfig> = ConfigLoader::new(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.name, "default");
    }
}
