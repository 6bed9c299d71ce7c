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

test_r::enable!();

use bytes::Bytes;
use muster_common::checkpoints::{Checkpoint, CheckpointStore};
use muster_common::command::CommandSpec;
use muster_common::model::{keys, CommandStatus, Node, NodeRole, UserRole, GLOBAL_CHECKPOINT};
use muster_server::api::{make_open_api_service, ApiServices};
use muster_server::auth::{TokenIssuer, UserStore};
use muster_server::engine::{Engine, EngineState};
use muster_server::operations::{Distribution, Operation};
use muster_server::storage::BlobStore;
use muster_server::topology::Topology;
use muster_server::watcher::{
    AggregationMethod, MetricAggregationWatcher, ModelSaverWatcher, NewBestDetectorWatcher,
};
use poem::http::StatusCode;
use poem::middleware::SetHeader;
use poem::test::TestClient;
use poem::{EndpointExt, Route};
use std::sync::Arc;
use std::time::Duration;
use test_r::test;

fn topology(num_clients: usize) -> Topology {
    let mut nodes = vec![Node::new("server", NodeRole::Server)];
    for i in 1..=num_clients {
        nodes.push(Node::new(format!("site-{i}"), NodeRole::Client));
    }
    Topology::new(nodes).unwrap()
}

struct TestServer {
    services: ApiServices,
    client: TestClient<poem::endpoint::BoxEndpoint<'static, poem::Response>>,
}

fn test_server(mut state: EngineState) -> TestServer {
    state.simulation = true;
    let engine = Engine::new(state, Arc::new(BlobStore::new()), "test-run");
    let services = ApiServices {
        engine,
        users: Arc::new(UserStore::new(true)),
        tokens: Arc::new(TokenIssuer::new(Duration::from_secs(60))),
    };

    let app = Route::new()
        .nest("/", make_open_api_service(&services))
        .with(
            SetHeader::new()
                .overriding("Strict-Transport-Security", "max-age=63072000")
                .overriding("X-Content-Type-Options", "nosniff")
                .overriding("X-XSS-Protection", "1; mode=block")
                .overriding("Permissions-Policy", "interest-cohort=()")
                .overriding("Content-Security-Policy", "frame-ancestors 'none'"),
        )
        .boxed();
    TestServer {
        services,
        client: TestClient::new(app),
    }
}

async fn fetch_token(server: &TestServer, username: &str) -> String {
    let response = server
        .client
        .post("/token")
        .content_type("application/x-www-form-urlencoded")
        .body(format!("username={username}&password=secret"))
        .send()
        .await;
    response.assert_status_is_ok();
    let json = response.json().await;
    let token = json.value().object().get("access_token").string().to_string();
    assert_eq!(json.value().object().get("token_type").string(), "bearer");
    token
}

#[test]
async fn token_endpoint_issues_bearer_tokens_and_marks_online() {
    let server = test_server(EngineState::new(topology(1), vec![]));
    let token = fetch_token(&server, "site-1").await;
    assert!(!token.is_empty());

    let nodes = server.services.engine.topology_snapshot().await;
    let site = nodes.iter().find(|node| node.name == "site-1").unwrap();
    assert!(site.is_online());
}

#[test]
async fn endpoints_reject_missing_and_garbage_tokens() {
    let server = test_server(EngineState::new(topology(1), vec![]));

    let response = server
        .client
        .post("/serverrequest")
        .body_json(&serde_json::json!({"datatype": "PullCommand", "data": {}}))
        .send()
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let response = server
        .client
        .post("/serverrequest")
        .header("Authorization", "Bearer not-a-token")
        .body_json(&serde_json::json!({"datatype": "PullCommand", "data": {}}))
        .send()
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[test]
async fn security_headers_are_present_on_every_response() {
    let server = test_server(EngineState::new(topology(1), vec![]));
    let response = server.client.get("/healthcheck").send().await;
    response.assert_status_is_ok();
    response.assert_header("X-Content-Type-Options", "nosniff");
    response.assert_header("Strict-Transport-Security", "max-age=63072000");
    response.assert_header("X-XSS-Protection", "1; mode=block");
    response.assert_header("Permissions-Policy", "interest-cohort=()");
    response.assert_header("Content-Security-Policy", "frame-ancestors 'none'");
}

#[test]
async fn server_only_blobs_are_invisible_to_clients() {
    let server = test_server(EngineState::new(topology(1), vec![]));
    let token = fetch_token(&server, "site-1").await;

    let store = server.services.engine.blobs();
    let open_id = store.put("open", Bytes::from_static(b"public"), false, "server");
    let hidden_id = store.put("hidden", Bytes::from_static(b"secret"), true, "server");

    let response = server
        .client
        .get(format!("/file/{open_id}"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status_is_ok();
    response.assert_bytes(b"public".to_vec()).await;

    let response = server
        .client
        .get(format!("/file/{hidden_id}"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = server
        .client
        .delete(format!("/file/{hidden_id}"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert!(store.fetch(hidden_id, UserRole::Server).is_ok());
}

/// S4: a worker pushes a model; the bytes travel as a blob, land in the
/// registry keyed by distribution and worker, and the blob is deleted after
/// consumption.
#[test]
async fn pushed_model_blob_round_trip() {
    let state = EngineState::new(
        topology(1),
        vec![Operation::distribution(Distribution::closed_all(vec![
            CommandSpec::push_model("model", "resnet"),
        ]))],
    );
    let server = test_server(state);
    let token = fetch_token(&server, "site-1").await;

    // pull the command over the RPC endpoint
    let response = server
        .client
        .post("/serverrequest")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&serde_json::json!({"datatype": "PullCommand", "data": {}}))
        .send()
        .await;
    response.assert_status_is_ok();
    let pull = response.json().await;
    let spec: CommandSpec = pull.value().object().get("data").deserialize();
    let uuid = spec.uuid.unwrap();

    // the worker uploads the model payload out of band (server-only)
    let payload = Bytes::from_static(b"trained weights");
    let blob_id = server
        .services
        .engine
        .blobs()
        .put("resnet", payload.clone(), true, "site-1");

    let response = server
        .client
        .post("/status")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&serde_json::json!({
            "command_uuid": uuid,
            "status": "STARTED",
            "datatype": "PushModel",
        }))
        .send()
        .await;
    response.assert_status_is_ok();

    let response = server
        .client
        .post("/status")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&serde_json::json!({
            "command_uuid": uuid,
            "status": "FINISHED",
            "datatype": "PushModel",
            "response": {
                "response_type": "resource",
                "data": null,
                "files": {"resnet": blob_id},
            },
        }))
        .send()
        .await;
    response.assert_status_is_ok();

    // the bytes landed under <dist_uuid>:<resource_key>:<worker>
    server
        .services
        .engine
        .with_state(|state| {
            let Some(Operation::Distribution(distribution)) = state.program.head() else {
                panic!("expected a distribution head");
            };
            assert_eq!(distribution.table.status("site-1", uuid), Some(CommandStatus::Finished));

            let accumulator: Arc<CheckpointStore> =
                state.resources.get(keys::CLIENT_CHECKPOINTS).unwrap();
            let checkpoint = accumulator.get("model", "resnet", "site-1").unwrap();
            assert_eq!(checkpoint.data, payload);
        })
        .await;

    // consumed blobs are gone
    let response = server
        .client
        .get(format!("/file/{blob_id}"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

/// S6: per-worker metrics aggregate per round; the new-best detector fires
/// on improvements only and the saver snapshots the global checkpoint.
#[test]
async fn new_best_detection_across_rounds() {
    let save_dir = tempfile::tempdir().unwrap();

    let rounds: Vec<Operation> = (0..3)
        .map(|_| {
            Operation::distribution(Distribution::closed_all(vec![CommandSpec::plugin(
                "train",
                serde_json::json!({}),
            )]))
        })
        .collect();

    let mut state = EngineState::new(topology(2), rounds);
    state
        .watchers
        .add(Box::new(MetricAggregationWatcher::new(AggregationMethod::Mean)));
    state
        .watchers
        .add(Box::new(NewBestDetectorWatcher::new("acc", false)));
    state.watchers.add(Box::new(ModelSaverWatcher::new(
        "acc",
        "resnet",
        save_dir.path(),
    )));

    let checkpoints: Arc<CheckpointStore> = state.resources.get(keys::CHECKPOINTS).unwrap();
    checkpoints.register("model", "resnet", GLOBAL_CHECKPOINT, Checkpoint::new("round-0"));

    let server = test_server(state);
    let token_1 = fetch_token(&server, "site-1").await;
    let token_2 = fetch_token(&server, "site-2").await;

    let round_metrics = [(0.5, 0.7), (0.5, 0.6), (0.6, 0.8)];
    for (comm_round, (acc_1, acc_2)) in round_metrics.iter().enumerate() {
        let mut uuid = None;
        for (token, acc) in [(&token_1, acc_1), (&token_2, acc_2)] {
            let response = server
                .client
                .post("/serverrequest")
                .header("Authorization", format!("Bearer {token}"))
                .body_json(&serde_json::json!({"datatype": "PullCommand", "data": {}}))
                .send()
                .await;
            response.assert_status_is_ok();
            let pull = response.json().await;
            let spec: CommandSpec = pull.value().object().get("data").deserialize();
            uuid = spec.uuid;

            let response = server
                .client
                .post("/status")
                .header("Authorization", format!("Bearer {token}"))
                .body_json(&serde_json::json!({
                    "command_uuid": spec.uuid.unwrap(),
                    "status": "FINISHED",
                    "datatype": "Plugin",
                    "response": {
                        "response_type": "metric",
                        "data": {
                            "metrics": {"acc": acc},
                            "metric_type": "val",
                            "comm_round": comm_round,
                            "epoch": 0,
                        },
                    },
                }))
                .send()
                .await;
            response.assert_status_is_ok();
        }
        assert!(uuid.is_some());
    }

    // round 1 aggregate 0.6 fired, round 2 (0.55) did not, round 3 (0.7) did
    let saved = save_dir.path().join("test-run/resnet_best_val.bin");
    assert_eq!(std::fs::read(&saved).unwrap(), b"round-0");

    server
        .services
        .engine
        .with_state(|state| {
            let checkpoints: Arc<CheckpointStore> =
                state.resources.get(keys::CHECKPOINTS).unwrap();
            assert!(checkpoints.contains("model", "resnet", "resnet_best_val"));
        })
        .await;
}
