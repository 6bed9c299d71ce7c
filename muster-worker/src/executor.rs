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

use async_recursion::async_recursion;
use async_trait::async_trait;
use bytes::Bytes;
use muster_common::checkpoints::{Checkpoint, CheckpointStore};
use muster_common::command::{CommandKind, CommandSpec};
use muster_common::error::CoreError;
use muster_common::message::{ExecutionResponse, StatusUpdate};
use muster_common::model::{keys, CommandStatus, GLOBAL_CHECKPOINT};
use muster_common::resources::ResourceRegistry;
use muster_common::storage::BlobClient;
use muster_common::wire::ValueRegistry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a command may touch while executing on a worker.
pub struct WorkerContext {
    pub resources: ResourceRegistry,
    pub blobs: Arc<dyn BlobClient>,
    pub device: String,
    /// Constructor table for registered wire values, assembled before the
    /// loop starts.
    pub values: ValueRegistry,
}

impl WorkerContext {
    pub fn new(blobs: Arc<dyn BlobClient>, device: impl Into<String>) -> Self {
        let device = device.into();
        let mut resources = ResourceRegistry::new();
        resources
            .set(keys::DEVICE, device.clone())
            .expect("fresh registry accepts the device");
        resources
            .set_arc(keys::CLIENT_CHECKPOINTS, Arc::new(CheckpointStore::new()))
            .expect("fresh registry accepts the checkpoint store");
        Self {
            resources,
            blobs,
            device,
            values: ValueRegistry::new(),
        }
    }

    pub fn checkpoints(&self) -> Arc<CheckpointStore> {
        self.resources
            .get(keys::CLIENT_CHECKPOINTS)
            .expect("worker context always carries a checkpoint store")
    }
}

/// Allow/deny list over command datatype names. A tree is rejected as a
/// whole if any node is not permitted.
#[derive(Debug, Clone, Default)]
pub struct CommandGuard {
    allow: Option<BTreeSet<String>>,
    deny: Option<BTreeSet<String>>,
}

impl CommandGuard {
    pub fn allow_list(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow: Some(names.into_iter().collect()),
            deny: None,
        }
    }

    pub fn deny_list(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow: None,
            deny: Some(names.into_iter().collect()),
        }
    }

    /// The first datatype in the tree that is not permitted, if any.
    pub fn first_rejected(&self, spec: &CommandSpec) -> Option<String> {
        for datatype in spec.datatypes() {
            if let Some(allow) = &self.allow {
                if !allow.contains(datatype) {
                    return Some(datatype.to_string());
                }
            }
            if let Some(deny) = &self.deny {
                if deny.contains(datatype) {
                    return Some(datatype.to_string());
                }
            }
        }
        None
    }
}

/// An opaque user workload; the registry resolves plugin names to these.
#[async_trait]
pub trait PluginCommand: Send + Sync {
    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: &mut WorkerContext,
    ) -> Result<Option<ExecutionResponse>, CoreError>;
}

/// Name → plugin constructor table, assembled at startup. Re-registering a
/// name replaces the implementation, which is how declared-abstract commands
/// are overridden before a program runs.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    plugins: HashMap<String, Arc<dyn PluginCommand>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<dyn PluginCommand>) {
        self.plugins.insert(name.into(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginCommand>> {
        self.plugins.get(name).cloned()
    }
}

/// Delivery of status updates back to the server; the transport provides
/// the real implementation, tests record.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, update: StatusUpdate) -> Result<(), CoreError>;
}

/// A worker's slot among the selected workers of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub index: usize,
    pub count: usize,
}

struct CommandFailed;

/// Why a node did not finish: its own error, or a subcommand that already
/// reported its failure.
enum ExecError {
    ChildFailed,
    Core(CoreError),
}

impl From<CoreError> for ExecError {
    fn from(value: CoreError) -> Self {
        ExecError::Core(value)
    }
}

impl From<muster_common::resources::ResourceError> for ExecError {
    fn from(value: muster_common::resources::ResourceError) -> Self {
        ExecError::Core(value.into())
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::ChildFailed => write!(f, "a subcommand failed"),
            ExecError::Core(err) => write!(f, "{err}"),
        }
    }
}

/// Executes command trees. Every node produces exactly one STARTED and one
/// terminal status update per invocation; composite nodes recurse.
pub struct CommandRunner {
    guard: CommandGuard,
    plugins: ExecutorRegistry,
}

impl CommandRunner {
    pub fn new(guard: CommandGuard, plugins: ExecutorRegistry) -> Self {
        Self { guard, plugins }
    }

    pub async fn run(
        &self,
        spec: &CommandSpec,
        ctx: &mut WorkerContext,
        reporter: &dyn StatusReporter,
    ) -> Result<(), CoreError> {
        if let Some(rejected) = self.guard.first_rejected(spec) {
            warn!(datatype = rejected, "Refusing command rejected by the guard");
            let uuid = spec
                .uuid
                .ok_or_else(|| CoreError::InvalidRequest("Command without a UUID".to_string()))?;
            self.send(
                reporter,
                StatusUpdate::new(uuid, CommandStatus::Failed, spec.kind.datatype()),
            )
            .await;
            return Ok(());
        }

        // the failure was already reported command-by-command
        let _ = self.execute_node(spec, ctx, reporter).await;
        Ok(())
    }

    #[async_recursion]
    async fn execute_node(
        &self,
        spec: &CommandSpec,
        ctx: &mut WorkerContext,
        reporter: &dyn StatusReporter,
    ) -> Result<(), CommandFailed> {
        let Some(uuid) = spec.uuid else {
            warn!(datatype = spec.kind.datatype(), "Dropping command without a UUID");
            return Err(CommandFailed);
        };
        let datatype = spec.kind.datatype();

        self.send(
            reporter,
            StatusUpdate::new(uuid, CommandStatus::Started, datatype),
        )
        .await;

        match self.execute_kind(spec, ctx, reporter).await {
            Ok(response) => {
                let mut update = StatusUpdate::new(uuid, CommandStatus::Finished, datatype);
                if let Some(response) = response {
                    update = update.with_response(response);
                }
                self.send(reporter, update).await;
                Ok(())
            }
            Err(err) => {
                warn!(datatype, command = %uuid, error = %err, "Command failed");
                self.send(
                    reporter,
                    StatusUpdate::new(uuid, CommandStatus::Failed, datatype),
                )
                .await;
                Err(CommandFailed)
            }
        }
    }

    async fn execute_kind(
        &self,
        spec: &CommandSpec,
        ctx: &mut WorkerContext,
        reporter: &dyn StatusReporter,
    ) -> Result<Option<ExecutionResponse>, ExecError> {
        match &spec.kind {
            CommandKind::Sequence(command) => {
                for child in &command.commands {
                    self.execute_node(child, ctx, reporter)
                        .await
                        .map_err(|_| ExecError::ChildFailed)?;
                }
                Ok(None)
            }
            CommandKind::Wrap(command) => {
                for child in command
                    .before
                    .iter()
                    .chain(std::iter::once(command.command.as_ref()))
                    .chain(command.after.iter())
                {
                    self.execute_node(child, ctx, reporter)
                        .await
                        .map_err(|_| ExecError::ChildFailed)?;
                }
                Ok(None)
            }
            CommandKind::Conditional(command) => {
                if ctx.resources.contains(&command.resource_key) {
                    self.execute_node(&command.command, ctx, reporter)
                        .await
                        .map_err(|_| ExecError::ChildFailed)?;
                } else {
                    // the skipped subtree still has to reach a terminal state
                    for uuid in command.command.collect_uuids() {
                        self.send(
                            reporter,
                            StatusUpdate::new(
                                uuid,
                                CommandStatus::Excluded,
                                command.command.kind.datatype(),
                            ),
                        )
                        .await;
                    }
                }
                Ok(None)
            }
            CommandKind::Print(command) => {
                info!(message = command.message, "Print");
                Ok(None)
            }
            CommandKind::FetchModel(command) => {
                let blob_id = command.blob_id.ok_or_else(|| {
                    CoreError::ClientConfiguration(
                        "Model fetch without a staged blob".to_string(),
                    )
                })?;
                // broadcast blob: the server deletes it once the
                // distribution completes
                let bytes = ctx.blobs.fetch(blob_id).await?;
                ctx.checkpoints().register(
                    &command.resource_type,
                    &command.resource_key,
                    &command.checkpoint_key,
                    Checkpoint::new(bytes),
                );
                Ok(None)
            }
            CommandKind::PushModel(command) => {
                let bytes = self.local_state(command, ctx)?;
                Ok(Some(ExecutionResponse::resource(
                    command.resource_key.clone(),
                    bytes,
                )))
            }
            CommandKind::ReportScore(command) => {
                let score = ctx
                    .resources
                    .get_opt::<f64>(&format!("scores:{}", command.score_type))
                    .map_err(CoreError::from)?
                    .ok_or_else(|| {
                        CoreError::ClientConfiguration(format!(
                            "No local `{}` score available",
                            command.score_type
                        ))
                    })?;
                Ok(Some(ExecutionResponse::client_score(
                    command.score_type.clone(),
                    *score,
                )))
            }
            CommandKind::AssignPartition(command) => {
                let index = command.index.ok_or_else(|| {
                    CoreError::ClientConfiguration(
                        "Partition assignment without an index".to_string(),
                    )
                })?;
                let assignment = PartitionAssignment {
                    index,
                    count: command.count,
                };
                // derived artifacts are cached under the spec's init hash
                let hash = spec.init_hash();
                ctx.resources
                    .set(&format!("partition:{}", &hash[..16]), assignment)?;
                ctx.resources.set("partition:current", assignment)?;
                Ok(None)
            }
            CommandKind::SetResource(command) => {
                let constructed = ctx.values.construct(&command.value)?;
                ctx.resources.set_erased(
                    &command.resource_key,
                    constructed.value,
                    constructed.type_name,
                )?;
                Ok(None)
            }
            CommandKind::Plugin(command) => {
                let plugin = self.plugins.get(&command.name).ok_or_else(|| {
                    CoreError::AbstractCommand(format!(
                        "No implementation registered for `{}`",
                        command.name
                    ))
                })?;
                let params = command.params.decode()?;
                plugin
                    .execute(&params, ctx)
                    .await
                    .map_err(ExecError::from)
            }
        }
    }

    /// A worker's current state for a resource: what a plugin trained, or
    /// the fetched global state when nothing was trained yet.
    fn local_state(
        &self,
        command: &muster_common::command::PushModelCommand,
        ctx: &mut WorkerContext,
    ) -> Result<Bytes, CoreError> {
        let trained = ctx
            .resources
            .get_opt::<Bytes>(&format!(
                "state:{}:{}",
                command.resource_type, command.resource_key
            ))
            .map_err(CoreError::from)?;
        if let Some(bytes) = trained {
            return Ok((*bytes).clone());
        }

        ctx.checkpoints()
            .get(&command.resource_type, &command.resource_key, GLOBAL_CHECKPOINT)
            .map(|checkpoint| checkpoint.data)
            .ok_or_else(|| {
                CoreError::ClientConfiguration(format!(
                    "No local state for {}:{}",
                    command.resource_type, command.resource_key
                ))
            })
    }

    /// Status sends are at-most-once; a transport hiccup is logged, not
    /// retried.
    async fn send(&self, reporter: &dyn StatusReporter, update: StatusUpdate) {
        if let Err(err) = reporter.report(update).await {
            warn!(error = %err, "Could not send status update");
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use muster_common::model::CommandId;
    use muster_common::storage::MemoryBlobClient;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        updates: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn report(&self, update: StatusUpdate) -> Result<(), CoreError> {
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    impl RecordingReporter {
        fn statuses_of(&self, uuid: CommandId) -> Vec<CommandStatus> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|update| update.command_uuid == uuid)
                .map(|update| update.status)
                .collect()
        }
    }

    fn context() -> WorkerContext {
        WorkerContext::new(Arc::new(MemoryBlobClient::new()), "cpu")
    }

    fn runner() -> CommandRunner {
        CommandRunner::new(CommandGuard::default(), ExecutorRegistry::new())
    }

    #[test]
    async fn print_sends_started_then_finished() {
        let mut spec = CommandSpec::print("hello");
        spec.assign_uuids();
        let reporter = RecordingReporter::default();
        let mut ctx = context();

        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        assert_eq!(
            reporter.statuses_of(spec.uuid.unwrap()),
            vec![CommandStatus::Started, CommandStatus::Finished]
        );
    }

    #[test]
    async fn sequence_reports_every_node() {
        let mut spec = CommandSpec::sequence(vec![
            CommandSpec::print("one"),
            CommandSpec::print("two"),
        ]);
        spec.assign_uuids();
        let reporter = RecordingReporter::default();
        let mut ctx = context();

        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        for uuid in spec.collect_uuids() {
            assert_eq!(
                reporter.statuses_of(uuid),
                vec![CommandStatus::Started, CommandStatus::Finished]
            );
        }
    }

    #[test]
    async fn unknown_plugin_fails_with_exactly_one_terminal() {
        let mut spec = CommandSpec::plugin("train", serde_json::json!({}));
        spec.assign_uuids();
        let reporter = RecordingReporter::default();
        let mut ctx = context();

        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        assert_eq!(
            reporter.statuses_of(spec.uuid.unwrap()),
            vec![CommandStatus::Started, CommandStatus::Failed]
        );
    }

    #[test]
    async fn failing_child_fails_the_sequence_too() {
        let mut spec = CommandSpec::sequence(vec![
            CommandSpec::plugin("missing", serde_json::json!({})),
            CommandSpec::print("never runs"),
        ]);
        spec.assign_uuids();
        let uuids = spec.collect_uuids();
        let reporter = RecordingReporter::default();
        let mut ctx = context();

        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        assert_eq!(
            reporter.statuses_of(uuids[0]),
            vec![CommandStatus::Started, CommandStatus::Failed]
        );
        assert_eq!(
            reporter.statuses_of(uuids[1]),
            vec![CommandStatus::Started, CommandStatus::Failed]
        );
        // the skipped sibling never started
        assert!(reporter.statuses_of(uuids[2]).is_empty());
    }

    #[test]
    async fn guard_rejects_before_execution() {
        let mut spec = CommandSpec::sequence(vec![CommandSpec::print("hello")]);
        spec.assign_uuids();
        let reporter = RecordingReporter::default();
        let mut ctx = context();

        let runner = CommandRunner::new(
            CommandGuard::deny_list(vec!["Print".to_string()]),
            ExecutorRegistry::new(),
        );
        runner.run(&spec, &mut ctx, &reporter).await.unwrap();

        // one FAILED for the main command, nothing ever started
        assert_eq!(
            reporter.statuses_of(spec.uuid.unwrap()),
            vec![CommandStatus::Failed]
        );
        assert!(reporter.statuses_of(spec.collect_uuids()[1]).is_empty());
    }

    #[test]
    async fn conditional_skips_and_excludes() {
        let mut spec = CommandSpec::conditional("dataset", CommandSpec::print("guarded"));
        spec.assign_uuids();
        let child_uuid = spec.collect_uuids()[1];
        let reporter = RecordingReporter::default();
        let mut ctx = context();

        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        assert_eq!(
            reporter.statuses_of(child_uuid),
            vec![CommandStatus::Excluded]
        );

        // with the resource present the child runs
        let mut spec2 = CommandSpec::conditional("dataset", CommandSpec::print("guarded"));
        spec2.assign_uuids();
        let child2 = spec2.collect_uuids()[1];
        ctx.resources.set("dataset", 1u8).unwrap();
        runner().run(&spec2, &mut ctx, &reporter).await.unwrap();
        assert_eq!(
            reporter.statuses_of(child2),
            vec![CommandStatus::Started, CommandStatus::Finished]
        );
    }

    #[test]
    async fn fetch_model_installs_the_checkpoint() {
        let blobs = Arc::new(MemoryBlobClient::new());
        let ids = blobs
            .upload(
                std::collections::BTreeMap::from([(
                    "resnet".to_string(),
                    Bytes::from_static(b"weights"),
                )]),
                false,
            )
            .await
            .unwrap();

        let mut spec = CommandSpec::fetch_model("model", "resnet", GLOBAL_CHECKPOINT);
        if let CommandKind::FetchModel(command) = &mut spec.kind {
            command.blob_id = Some(ids["resnet"]);
        }
        spec.assign_uuids();

        let mut ctx = WorkerContext::new(blobs.clone(), "cpu");
        let reporter = RecordingReporter::default();
        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        let checkpoint = ctx
            .checkpoints()
            .get("model", "resnet", GLOBAL_CHECKPOINT)
            .unwrap();
        assert_eq!(checkpoint.data, Bytes::from_static(b"weights"));
        // broadcast blobs stay until the server cleans them up
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    async fn push_model_returns_trained_state() {
        let mut ctx = context();
        ctx.resources
            .set("state:model:resnet", Bytes::from_static(b"trained"))
            .unwrap();

        let mut spec = CommandSpec::push_model("model", "resnet");
        spec.assign_uuids();
        let reporter = RecordingReporter::default();
        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        let updates = reporter.updates.lock().unwrap();
        let finished = updates
            .iter()
            .find(|update| update.status == CommandStatus::Finished)
            .unwrap();
        let response = finished.response.as_ref().unwrap();
        assert_eq!(
            response.files.get("resnet"),
            Some(&Bytes::from_static(b"trained"))
        );
    }

    #[test]
    async fn partition_assignment_is_cached_under_the_init_hash() {
        let mut spec = CommandSpec::assign_partition(4);
        if let CommandKind::AssignPartition(command) = &mut spec.kind {
            command.index = Some(2);
        }
        spec.assign_uuids();
        let hash = spec.init_hash();

        let mut ctx = context();
        let reporter = RecordingReporter::default();
        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        let assignment: Arc<PartitionAssignment> = ctx
            .resources
            .get(&format!("partition:{}", &hash[..16]))
            .unwrap();
        assert_eq!(assignment.index, 2);
        assert_eq!(assignment.count, 4);
    }

    #[derive(Debug, PartialEq)]
    struct CosineSchedule {
        t_max: i64,
    }

    fn cosine_schedule(
        _registry: &ValueRegistry,
        fields: &std::collections::BTreeMap<String, muster_common::wire::WireValue>,
    ) -> Result<muster_common::wire::Constructed, CoreError> {
        let t_max = fields
            .get("t_max")
            .and_then(muster_common::wire::WireValue::as_i64)
            .ok_or_else(|| CoreError::InvalidRequest("CosineSchedule needs t_max".to_string()))?;
        Ok(muster_common::wire::Constructed::of(CosineSchedule { t_max }))
    }

    #[test]
    async fn set_resource_rebuilds_registered_values() {
        use muster_common::wire::WireValue;

        let mut ctx = context();
        ctx.values.register("CosineSchedule", cosine_schedule);

        let value = WireValue::registered(
            "CosineSchedule",
            std::collections::BTreeMap::from([("t_max".to_string(), WireValue::Int(1000))]),
        );
        let mut spec = CommandSpec::set_resource("lr_schedule", value);
        spec.assign_uuids();

        let reporter = RecordingReporter::default();
        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        assert_eq!(
            reporter.statuses_of(spec.uuid.unwrap()),
            vec![CommandStatus::Started, CommandStatus::Finished]
        );
        let schedule: Arc<CosineSchedule> = ctx.resources.get("lr_schedule").unwrap();
        assert_eq!(*schedule, CosineSchedule { t_max: 1000 });
    }

    #[test]
    async fn set_resource_stores_plain_scalars_directly() {
        use muster_common::wire::WireValue;

        let mut ctx = context();
        let mut spec =
            CommandSpec::set_resource("batch_size", WireValue::Int(12));
        spec.assign_uuids();

        let reporter = RecordingReporter::default();
        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        assert_eq!(*ctx.resources.get::<i64>("batch_size").unwrap(), 12);
    }

    #[test]
    async fn set_resource_without_a_constructor_fails() {
        use muster_common::wire::WireValue;

        let mut ctx = context();
        let mut spec = CommandSpec::set_resource(
            "augmentation",
            WireValue::registered("StainAugmentation", std::collections::BTreeMap::new()),
        );
        spec.assign_uuids();

        let reporter = RecordingReporter::default();
        runner().run(&spec, &mut ctx, &reporter).await.unwrap();

        // an unregistered datatype is an abstract command: exactly one FAILED
        assert_eq!(
            reporter.statuses_of(spec.uuid.unwrap()),
            vec![CommandStatus::Started, CommandStatus::Failed]
        );
        assert!(!ctx.resources.contains("augmentation"));
    }

    #[test]
    async fn registered_plugin_runs_and_can_be_replaced() {
        struct StaticScore(f64);

        #[async_trait]
        impl PluginCommand for StaticScore {
            async fn execute(
                &self,
                _params: &serde_json::Value,
                ctx: &mut WorkerContext,
            ) -> Result<Option<ExecutionResponse>, CoreError> {
                ctx.resources.set("scores:dataset_length", self.0)?;
                Ok(None)
            }
        }

        let mut plugins = ExecutorRegistry::new();
        plugins.register("score", Arc::new(StaticScore(10.0)));
        // startup-time overwrite replaces the implementation
        plugins.register("score", Arc::new(StaticScore(42.0)));

        let mut spec = CommandSpec::sequence(vec![
            CommandSpec::plugin("score", serde_json::json!({})),
            CommandSpec::report_score("dataset_length"),
        ]);
        spec.assign_uuids();

        let mut ctx = context();
        let reporter = RecordingReporter::default();
        CommandRunner::new(CommandGuard::default(), plugins)
            .run(&spec, &mut ctx, &reporter)
            .await
            .unwrap();

        let updates = reporter.updates.lock().unwrap();
        let score_response = updates
            .iter()
            .filter_map(|update| update.response.as_ref())
            .find(|response| response.response_type.as_deref() == Some("client_score"))
            .unwrap();
        assert_eq!(score_response.data["score"], 42.0);
    }
}
