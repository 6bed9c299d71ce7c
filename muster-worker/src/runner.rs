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

use crate::executor::{CommandGuard, CommandRunner, ExecutorRegistry, StatusReporter, WorkerContext};
use crate::transport::ServerConnection;
use async_trait::async_trait;
use muster_common::command::CommandSpec;
use muster_common::error::CoreError;
use muster_common::message::{ServerRequest, StatusUpdate};
use muster_common::storage::BlobClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sends status updates over the connection; a rejected token stops the
/// whole loop.
struct ConnectionReporter {
    connection: Arc<dyn ServerConnection>,
    stop: CancellationToken,
    auth_failed: Arc<AtomicBool>,
}

#[async_trait]
impl StatusReporter for ConnectionReporter {
    async fn report(&self, update: StatusUpdate) -> Result<(), CoreError> {
        match self.connection.send_status_update(update).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Authentication failed while reporting status");
                self.auth_failed.store(true, Ordering::SeqCst);
                self.stop.cancel();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// The worker loop: a pull task polling for commands on every ping interval
/// and an execute task consuming the queue one command at a time. Both
/// observe the stop token; there is no finer-grained cancellation.
pub struct Worker {
    connection: Arc<dyn ServerConnection>,
    runner: CommandRunner,
    context: WorkerContext,
    ping_interval: Duration,
}

impl Worker {
    pub fn new(
        connection: Arc<dyn ServerConnection>,
        blobs: Arc<dyn BlobClient>,
        device: impl Into<String>,
        guard: CommandGuard,
        plugins: ExecutorRegistry,
        ping_interval: Duration,
    ) -> Self {
        Self {
            connection,
            runner: CommandRunner::new(guard, plugins),
            context: WorkerContext::new(blobs, device),
            ping_interval,
        }
    }

    pub fn context_mut(&mut self) -> &mut WorkerContext {
        &mut self.context
    }

    pub async fn run(mut self, stop: CancellationToken) -> Result<(), CoreError> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let auth_failed = Arc::new(AtomicBool::new(false));

        let pull_connection = self.connection.clone();
        let pull_stop = stop.clone();
        let pull_auth_failed = auth_failed.clone();
        let ping_interval = self.ping_interval;
        let pull_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pull_stop.cancelled() => break,
                    _ = tokio::time::sleep(ping_interval) => {
                        match pull_connection.request(ServerRequest::pull_command()).await {
                            Ok(response) => {
                                if !response.data.is_null() {
                                    let _ = queue_tx.send(response.data);
                                }
                            }
                            Err(err) if err.is_fatal() => {
                                error!(error = %err, "Authentication failed; stopping worker");
                                pull_auth_failed.store(true, Ordering::SeqCst);
                                pull_stop.cancel();
                                break;
                            }
                            Err(err) => {
                                // transient; the next tick retries
                                debug!(error = %err, "Pull failed, retrying");
                            }
                        }
                    }
                }
            }
        });

        let reporter = ConnectionReporter {
            connection: self.connection.clone(),
            stop: stop.clone(),
            auth_failed: auth_failed.clone(),
        };

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = queue_rx.recv() => {
                    let Some(raw) = received else { break };
                    match serde_json::from_value::<CommandSpec>(raw) {
                        Ok(spec) => {
                            info!(datatype = spec.kind.datatype(), "Executing command");
                            if let Err(err) = self
                                .runner
                                .run(&spec, &mut self.context, &reporter)
                                .await
                            {
                                warn!(error = %err, "Command dispatch failed");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "Dropping malformed command");
                        }
                    }
                }
            }
        }

        let _ = pull_task.await;

        if auth_failed.load(Ordering::SeqCst) {
            Err(CoreError::Unauthorized(
                "Could not authenticate with server".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}
