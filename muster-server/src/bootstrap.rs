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

use crate::api::{make_open_api_service, ApiServices};
use crate::auth::{TokenIssuer, UserStore};
use crate::broker::BrokerListener;
use crate::config::ServerConfig;
use crate::engine::{Engine, EngineState};
use crate::operations::Operation;
use crate::storage::BlobStore;
use crate::topology::Topology;
use crate::watcher::{
    AggregationMethod, ConsoleWatcher, MetricAggregationWatcher, ModelSaverWatcher,
    NewBestDetectorWatcher,
};
use anyhow::{anyhow, Context};
use poem::listener::{Acceptor, Listener, RustlsCertificate, RustlsConfig, TcpListener};
use poem::middleware::SetHeader;
use poem::{EndpointExt, Route};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The assembled control plane: engine, auth, blob store and the carriers.
pub struct MusterServer {
    config: ServerConfig,
    services: ApiServices,
}

impl MusterServer {
    pub fn new(config: ServerConfig, operations: Vec<Operation>) -> anyhow::Result<Self> {
        debug!("Initializing muster server");

        let topology = match &config.topology_file {
            Some(path) => Topology::from_file(path).context("Topology configuration")?,
            None if config.simulation => Topology::simulated(),
            None => {
                return Err(anyhow!(
                    "A topology file is required outside simulation mode"
                ))
            }
        };

        let users = match &config.users_file {
            Some(path) => {
                UserStore::from_file(path, config.simulation).context("User configuration")?
            }
            None if config.simulation => UserStore::new(true),
            None => {
                return Err(anyhow!("A users file is required outside simulation mode"))
            }
        };

        let mut state = EngineState::new(topology, operations);
        state.simulation = config.simulation;

        if config.watchers.console {
            state.watchers.add(Box::new(ConsoleWatcher));
        }
        if config.watchers.metric_aggregation {
            state
                .watchers
                .add(Box::new(MetricAggregationWatcher::new(AggregationMethod::Mean)));
        }
        if let Some(criterion) = &config.watchers.new_best {
            state.watchers.add(Box::new(NewBestDetectorWatcher::new(
                criterion.metric.clone(),
                criterion.lower_is_better,
            )));
        }
        if let Some(saver) = &config.watchers.model_saver {
            let listen_to = config
                .watchers
                .new_best
                .as_ref()
                .map(|criterion| criterion.metric.clone())
                .ok_or_else(|| anyhow!("The model saver requires a new-best criterion"))?;
            state.watchers.add(Box::new(ModelSaverWatcher::new(
                listen_to,
                saver.model_key.clone(),
                saver.save_folder.clone(),
            )));
        }

        let blobs = Arc::new(BlobStore::new());
        let engine = Engine::new(state, blobs, &config.run_name);

        let services = ApiServices {
            engine,
            users: Arc::new(users),
            tokens: Arc::new(TokenIssuer::new(config.auth.token_ttl)),
        };

        Ok(Self { config, services })
    }

    pub fn services(&self) -> &ApiServices {
        &self.services
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.services.engine
    }

    /// Starts the HTTP carrier, the liveness observer and (when configured)
    /// the broker listener. Returns the bound HTTP port.
    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<u16> {
        let api_service = make_open_api_service(&self.services);
        let app = Route::new().nest("/", api_service).with(
            SetHeader::new()
                .overriding("Strict-Transport-Security", "max-age=63072000")
                .overriding("X-Content-Type-Options", "nosniff")
                .overriding("X-XSS-Protection", "1; mode=block")
                .overriding("Permissions-Policy", "interest-cohort=()")
                .overriding("Content-Security-Policy", "frame-ancestors 'none'"),
        );

        let bind = format!("{}:{}", self.config.host, self.config.http_port);
        let port = match &self.config.tls {
            None => {
                let acceptor = TcpListener::bind(bind).into_acceptor().await?;
                let port = acceptor.local_addr()[0]
                    .as_socket_addr()
                    .map(|addr| addr.port())
                    .ok_or_else(|| anyhow!("No socket address"))?;
                join_set.spawn(async move {
                    poem::Server::new_with_acceptor(acceptor)
                        .run(app)
                        .await
                        .map_err(|err| err.into())
                });
                port
            }
            Some(tls) => {
                let cert = std::fs::read(&tls.cert_file).context("TLS certificate")?;
                let key = std::fs::read(&tls.key_file).context("TLS key")?;
                let rustls =
                    RustlsConfig::new().fallback(RustlsCertificate::new().cert(cert).key(key));
                let acceptor = TcpListener::bind(bind).rustls(rustls).into_acceptor().await?;
                let port = acceptor.local_addr()[0]
                    .as_socket_addr()
                    .map(|addr| addr.port())
                    .ok_or_else(|| anyhow!("No socket address"))?;
                join_set.spawn(async move {
                    poem::Server::new_with_acceptor(acceptor)
                        .run(app)
                        .await
                        .map_err(|err| err.into())
                });
                port
            }
        };

        let engine = self.services.engine.clone();
        let liveness = self.config.liveness.clone();
        let liveness_shutdown = shutdown.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(liveness.scan_interval);
            loop {
                tokio::select! {
                    _ = liveness_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.check_liveness(liveness.timeout).await?;
                    }
                }
            }
            Ok(())
        });

        if let Some(broker) = &self.config.broker {
            let listener = BrokerListener::new(self.services.engine.clone(), broker.clone());
            let broker_shutdown = shutdown.clone();
            join_set.spawn(async move {
                listener.run(broker_shutdown).await?;
                Ok(())
            });
        }

        info!(port, "Started muster server");
        Ok(port)
    }
}
