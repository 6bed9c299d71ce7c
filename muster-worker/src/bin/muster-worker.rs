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

use clap::Parser;
use muster_common::config::ConfigLoader;
use muster_common::error::{exit_codes, CoreError};
use muster_common::storage::BlobClient;
use muster_common::SafeDisplay;
use muster_worker::config::{TransportKind, WorkerConfig};
use muster_worker::executor::{CommandGuard, ExecutorRegistry};
use muster_worker::runner::Worker;
use muster_worker::storage::HttpBlobClient;
use muster_worker::transport::{BrokerConnection, HttpConnection, ServerConnection};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "muster-worker", about = "Federated learning worker node")]
struct Cli {
    /// Path to the worker config file.
    #[arg(long, default_value = "config/muster-worker.toml")]
    config: PathBuf,

    /// Control plane base URL.
    #[arg(long)]
    server: Option<String>,

    /// Blob store base URL (defaults to the server URL).
    #[arg(long)]
    storage: Option<String>,

    /// Use the broker carrier instead of HTTP polling.
    #[arg(long)]
    broker: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Seconds between command pulls.
    #[arg(long)]
    ping_interval: Option<f64>,

    #[arg(long)]
    device: Option<String>,
}

fn load_config(cli: &Cli) -> Result<WorkerConfig, String> {
    let loader: ConfigLoader<WorkerConfig> = ConfigLoader::new(&cli.config);
    let mut config = loader.load().map_err(|err| err.to_string())?;

    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(storage) = &cli.storage {
        config.storage_url = Some(storage.clone());
    }
    if let Some(broker) = &cli.broker {
        config.transport = TransportKind::Broker;
        config.broker_url = Some(broker.clone());
    }
    if let Some(username) = &cli.username {
        config.username = username.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    if let Some(ping_interval) = cli.ping_interval {
        config.ping_interval = std::time::Duration::from_secs_f64(ping_interval);
    }
    if let Some(device) = &cli.device {
        config.device = device.clone();
    }

    config.validate()?;
    Ok(config)
}

fn guard_from(config: &WorkerConfig) -> CommandGuard {
    if let Some(allowed) = &config.allowed_commands {
        CommandGuard::allow_list(allowed.iter().cloned())
    } else if let Some(denied) = &config.denied_commands {
        CommandGuard::deny_list(denied.iter().cloned())
    } else {
        CommandGuard::default()
    }
}

async fn connect(
    config: &WorkerConfig,
    blobs: Arc<dyn BlobClient>,
) -> Result<Arc<dyn ServerConnection>, CoreError> {
    match config.transport {
        TransportKind::Http => {
            let connection = HttpConnection::connect(
                config.server_url.clone(),
                &config.username,
                &config.password,
                blobs,
            )
            .await?;
            Ok(Arc::new(connection))
        }
        TransportKind::Broker => {
            let url = config
                .broker_url
                .as_deref()
                .expect("validated configuration carries a broker url");
            let connection = BrokerConnection::connect(url, config.username.clone(), blobs).await?;
            Ok(Arc::new(connection))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            return ExitCode::from(exit_codes::CONFIGURATION_ERROR as u8);
        }
    };

    muster_common::tracing::init_tracing(&config.tracing);
    info!("\n{}", config.to_safe_string());

    let blobs: Arc<dyn BlobClient> = match HttpBlobClient::connect(
        config.storage_url(),
        &config.username,
        &config.password,
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(err) if err.is_fatal() => {
            error!(error = %err, "Blob store authentication failed");
            return ExitCode::from(exit_codes::AUTH_FAILURE as u8);
        }
        Err(err) => {
            error!(error = %err, "Cannot reach the blob store");
            return ExitCode::FAILURE;
        }
    };

    let connection = match connect(&config, blobs.clone()).await {
        Ok(connection) => connection,
        Err(err) if err.is_fatal() => {
            error!(error = %err, "Authentication failed");
            return ExitCode::from(exit_codes::AUTH_FAILURE as u8);
        }
        Err(err) => {
            error!(error = %err, "Cannot reach the server");
            return ExitCode::FAILURE;
        }
    };

    // plug-in workloads register here, and constructors for registered
    // resource datatypes go onto worker.context_mut().values, both before
    // the loop starts
    let plugins = ExecutorRegistry::new();

    let worker = Worker::new(
        connection,
        blobs,
        config.device.clone(),
        guard_from(&config),
        plugins,
        config.ping_interval,
    );

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        signal_stop.cancel();
    });

    match worker.run(stop).await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(err) if err.is_fatal() => {
            error!(error = %err, "Worker stopped: authentication failure");
            ExitCode::from(exit_codes::AUTH_FAILURE as u8)
        }
        Err(err) => {
            error!(error = %err, "Worker stopped");
            ExitCode::FAILURE
        }
    }
}
