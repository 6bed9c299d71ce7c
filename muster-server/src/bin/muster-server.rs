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
use muster_common::command::CommandSpec;
use muster_common::config::ConfigLoader;
use muster_common::error::exit_codes;
use muster_common::SafeDisplay;
use muster_server::bootstrap::MusterServer;
use muster_server::config::{BrokerConfig, ServerConfig, TlsConfig};
use muster_server::operations::condition::RequireClientCount;
use muster_server::operations::{Distribution, Operation};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "muster-server", about = "Federated learning control plane")]
struct Cli {
    /// Path to the server config file.
    #[arg(long, default_value = "config/muster-server.toml")]
    config: PathBuf,

    /// Topology file (list of nodes with roles).
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Users file (hashed credentials).
    #[arg(long)]
    users: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    tls_cert: Option<PathBuf>,

    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Broker URL; enables the broker carrier next to HTTP.
    #[arg(long)]
    broker: Option<String>,

    #[arg(long)]
    run_name: Option<String>,

    /// Auto-create users and topology nodes on first contact. Tests and
    /// demos only.
    #[arg(long)]
    simulation: bool,

    /// Minimum number of online workers before the program starts.
    #[arg(long, default_value_t = 2)]
    min_workers: usize,
}

fn load_config(cli: &Cli) -> Result<ServerConfig, String> {
    let loader: ConfigLoader<ServerConfig> = ConfigLoader::new(&cli.config);
    let mut config = loader.load().map_err(|err| err.to_string())?;

    if let Some(topology) = &cli.topology {
        config.topology_file = Some(topology.clone());
    }
    if let Some(users) = &cli.users {
        config.users_file = Some(users.clone());
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }
    if let (Some(cert_file), Some(key_file)) = (&cli.tls_cert, &cli.tls_key) {
        config.tls = Some(TlsConfig {
            cert_file: cert_file.clone(),
            key_file: key_file.clone(),
        });
    }
    if let Some(url) = &cli.broker {
        config.broker = Some(BrokerConfig {
            url: url.clone(),
            ..BrokerConfig::default()
        });
    }
    if let Some(run_name) = &cli.run_name {
        config.run_name = run_name.clone();
    }
    if cli.simulation {
        config.simulation = true;
    }
    Ok(config)
}

/// The demonstration program: wait for the fleet, greet it, hand every
/// worker its partition slot.
fn demo_program(min_workers: usize) -> Vec<Operation> {
    vec![
        Operation::condition(RequireClientCount::new(min_workers)),
        Operation::distribution(Distribution::closed_all(vec![CommandSpec::sequence(vec![
            CommandSpec::print("Welcome to the federation"),
            CommandSpec::assign_partition(min_workers),
        ])])),
    ]
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

    let server = match MusterServer::new(config, demo_program(cli.min_workers)) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "Startup failed");
            return ExitCode::from(exit_codes::CONFIGURATION_ERROR as u8);
        }
    };

    let shutdown = CancellationToken::new();
    let mut join_set: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();

    if let Err(err) = server.run(&mut join_set, shutdown.clone()).await {
        error!(error = %err, "Server failed to start");
        return ExitCode::from(exit_codes::CONFIGURATION_ERROR as u8);
    }

    let engine = server.engine().clone();
    let completion_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if engine.is_complete().await {
                info!("Operation program complete");
                completion_shutdown.cancel();
                break;
            }
        }
    });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            shutdown.cancel();
        }
        Some(result) = join_set.join_next() => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "Server task failed");
                    return ExitCode::FAILURE;
                }
                Err(err) => {
                    error!(error = %err, "Server task panicked");
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    join_set.abort_all();
    server.engine().blobs().report_leaks();
    ExitCode::from(exit_codes::SUCCESS as u8)
}
