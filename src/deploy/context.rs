use std::fmt;
use std::sync::Arc;

use crate::engine::EngineSettings;
use crate::model::{Application, BuildPack, DeploymentRecord, DeploymentStatus, Server};
use crate::remote::{self, ExecOptions, ExecOutput, LogTarget, RemoteCommand, RemoteError, RemoteExecutor};
use crate::store::Store;

use super::error::DeployError;
use super::log::DeploymentLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    SourceAcquire,
    ConfigGenerate,
    Build,
    RegistryPush,
    Rollout,
    PostDeploy,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Prepare => "prepare",
            Stage::SourceAcquire => "source_acquire",
            Stage::ConfigGenerate => "config_generate",
            Stage::Build => "build",
            Stage::RegistryPush => "registry_push",
            Stage::Rollout => "rollout",
            Stage::PostDeploy => "post_deploy",
        };
        f.write_str(s)
    }
}

/// Everything one pipeline run knows about itself.
pub struct DeployContext {
    pub store: Arc<dyn Store>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub settings: EngineSettings,
    pub log: DeploymentLog,

    pub record: DeploymentRecord,
    pub application: Application,
    /// Deploy target
    pub server: Server,
    /// Where the helper container runs; the target unless offloaded
    pub builder: Server,
    pub offloaded: bool,

    pub commit: String,
    pub buildkit: bool,
    pub skip_build: bool,
    /// Configuration hash taken when the run started
    pub config_hash: String,
    pub container_name: String,
    pub previous_containers: Vec<String>,
    /// Containers this run brought up
    pub started_containers: Vec<String>,
    pub dockerfile_location: String,
    pub compose: Option<String>,
    pub runtime_env: Option<String>,

    pub helper_started: bool,
    pub canary_handoff: bool,

    pub stages: Vec<Stage>,
    stage: Option<Stage>,
    batch: u32,
}

impl DeployContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn RemoteExecutor>,
        settings: EngineSettings,
        record: DeploymentRecord,
        application: Application,
        server: Server,
        builder: Server,
        offloaded: bool,
    ) -> Self {
        let log = DeploymentLog::new(store.clone(), record.deployment_uuid.clone());
        let container_name = container_name(&application, &record);
        let config_hash = application.configuration_hash(record.pull_request_id);
        Self {
            store,
            executor,
            settings,
            log,
            commit: record.commit.clone(),
            dockerfile_location: application.dockerfile_location.clone(),
            record,
            application,
            server,
            builder,
            offloaded,
            buildkit: false,
            skip_build: false,
            config_hash,
            container_name,
            previous_containers: Vec::new(),
            started_containers: Vec::new(),
            compose: None,
            runtime_env: None,
            helper_started: false,
            canary_handoff: false,
            stages: Vec::new(),
            stage: None,
            batch: 0,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.record.deployment_uuid
    }

    pub fn pull_request_id(&self) -> u64 {
        self.record.pull_request_id
    }

    /// Helper container name
    pub fn helper(&self) -> &str {
        &self.record.deployment_uuid
    }

    pub fn workdir(&self) -> String {
        format!("{}/{}", self.settings.artifacts_dir, self.record.deployment_uuid)
    }

    /// Lives beside the per-deployment workdir, never inside the build context.
    pub fn build_env_path(&self) -> String {
        format!("{}/build-time.env", self.settings.artifacts_dir)
    }

    pub fn source_dir(&self) -> String {
        let base = self.application.base_directory.trim_matches('/');
        if base.is_empty() {
            self.workdir()
        } else {
            format!("{}/{}", self.workdir(), base)
        }
    }

    pub fn config_dir(&self) -> String {
        let dir = format!(
            "{}/applications/{}",
            self.settings.config_root, self.application.uuid
        );
        if self.record.pull_request_id > 0 {
            format!("{}/pr-{}", dir, self.record.pull_request_id)
        } else {
            dir
        }
    }

    /// Files of this run before they replace the live configuration.
    pub fn staging_dir(&self) -> String {
        format!("{}/.staging/{}", self.config_dir(), self.record.deployment_uuid)
    }

    /// Tag of the image this run deploys.
    pub fn image(&self) -> String {
        if self.application.build_pack == BuildPack::Image {
            return self.application.docker_image.clone().unwrap_or_default();
        }
        let repository = self
            .application
            .registry
            .as_ref()
            .map(|r| r.image.clone())
            .unwrap_or_else(|| self.application.uuid.clone());
        let tag = if self.commit.is_empty() { "latest" } else { &self.commit };
        if self.record.pull_request_id > 0 {
            format!("{}:pr-{}-{}", repository, self.record.pull_request_id, tag)
        } else {
            format!("{}:{}", repository, tag)
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub async fn enter(&mut self, stage: Stage) {
        self.stages.push(stage);
        self.stage = Some(stage);
        self.log.info(format!("Stage: {}", stage)).await;
    }

    pub fn next_batch(&mut self) -> u32 {
        self.batch += 1;
        self.batch
    }

    pub async fn on_target(&mut self, commands: &[RemoteCommand]) -> Result<String, RemoteError> {
        let server = self.server.clone();
        self.run_on(&server, commands).await
    }

    pub async fn on_builder(&mut self, commands: &[RemoteCommand]) -> Result<String, RemoteError> {
        let server = self.builder.clone();
        self.run_on(&server, commands).await
    }

    /// Runs each command inside the helper container.
    pub async fn in_helper(&mut self, commands: &[RemoteCommand]) -> Result<String, RemoteError> {
        let wrapped: Vec<RemoteCommand> = commands
            .iter()
            .map(|c| RemoteCommand {
                command: remote::in_container(self.helper(), &c.command),
                hidden: c.hidden,
                ignore_errors: c.ignore_errors,
            })
            .collect();
        self.on_builder(&wrapped).await
    }

    async fn run_on(&mut self, server: &Server, commands: &[RemoteCommand]) -> Result<String, RemoteError> {
        let batch = self.next_batch();
        remote::execute(
            self.executor.as_ref(),
            server,
            commands,
            &ExecOptions::default(),
            Some(LogTarget {
                log: &self.log,
                batch,
            }),
        )
        .await
    }

    /// Runs one command and hands back its exit status instead of failing.
    pub async fn probe(&self, server: &Server, command: &str) -> Result<ExecOutput, RemoteError> {
        self.executor
            .exec(server, command, &ExecOptions::default())
            .await
    }

    /// Cooperative cancellation point.
    pub async fn checkpoint(&self) -> Result<(), DeployError> {
        let current = self.store.deployment(self.uuid()).await?;
        if current.status == DeploymentStatus::CancelledByUser {
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }
}

/// Deterministic from the application and pull request; unsuffixed when the
/// application asks for a consistent name.
pub fn container_name(app: &Application, record: &DeploymentRecord) -> String {
    let base = app.container_base_name(record.pull_request_id);
    if app.settings.consistent_container_name {
        return base;
    }
    let suffix: String = record.deployment_uuid.chars().take(12).collect();
    format!("{}-{}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn container_names_follow_application_identity() {
        let mut app = fixtures::application(1);
        let mut record = fixtures::record(1, "0123456789abcdef0123");

        assert_eq!(container_name(&app, &record), format!("{}-0123456789ab", app.uuid));

        record.pull_request_id = 4;
        assert_eq!(
            container_name(&app, &record),
            format!("{}-pr-4-0123456789ab", app.uuid)
        );

        app.settings.consistent_container_name = true;
        assert_eq!(container_name(&app, &record), format!("{}-pr-4", app.uuid));
    }

    #[test]
    fn build_env_file_is_outside_the_build_context() {
        let ctx = fixtures::context();
        assert!(!ctx.build_env_path().starts_with(&format!("{}/", ctx.workdir())));
        assert!(!ctx.build_env_path().starts_with(&format!("{}/", ctx.source_dir())));
    }

    #[test]
    fn preview_config_lives_under_its_own_directory() {
        let mut ctx = fixtures::context();
        let production = ctx.config_dir();
        ctx.record.pull_request_id = 9;
        assert_eq!(ctx.config_dir(), format!("{}/pr-9", production));
        assert!(ctx.staging_dir().starts_with(&ctx.config_dir()));
    }

    #[test]
    fn image_tag_carries_commit_and_pull_request() {
        let mut ctx = fixtures::context();
        ctx.commit = "abc123".to_string();
        assert_eq!(ctx.image(), format!("{}:abc123", ctx.application.uuid));
        ctx.record.pull_request_id = 2;
        assert_eq!(ctx.image(), format!("{}:pr-2-abc123", ctx.application.uuid));
    }
}
