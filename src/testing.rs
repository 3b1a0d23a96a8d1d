//! Fakes and fixtures shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use regex::Regex;

use crate::deploy::context::DeployContext;
use crate::engine::{Engine, Job, Scheduler};
use crate::integrations::{GitHost, Notification, Notifier, PullRequestStatus};
use crate::model::{Server, Application};
use crate::remote::{ExecOptions, ExecOutput, RemoteError, RemoteExecutor};
use crate::store::{MemoryStore, Store};
use crate::traefik::{ProxyController, Route};

enum Reply {
    Output(ExecOutput),
    Sequence(VecDeque<ExecOutput>),
    Transport,
}

struct Rule {
    pattern: String,
    reply: Reply,
}

#[derive(Default)]
struct FakeState {
    rules: Vec<Rule>,
    /// `(server name, command)` in execution order
    commands: Vec<(String, String)>,
    unreachable: bool,
}

/// Scripted executor. The most recently registered matching rule answers;
/// anything unmatched succeeds with empty output.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(&self, pattern: &str, reply: Reply) {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
        });
    }

    pub fn respond(&self, pattern: &str, output: ExecOutput) {
        self.rule(pattern, Reply::Output(output));
    }

    /// Answers in order; the last answer repeats.
    pub fn respond_seq(&self, pattern: &str, outputs: Vec<ExecOutput>) {
        self.rule(pattern, Reply::Sequence(outputs.into()));
    }

    pub fn respond_transport(&self, pattern: &str) {
        self.rule(pattern, Reply::Transport);
    }

    pub fn unreachable(&self) {
        self.state.lock().unwrap().unreachable = true;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Commands that ran on the server called `name`.
    pub fn commands_on(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(server, _)| server == name)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn exec(
        &self,
        server: &Server,
        command: &str,
        _options: &ExecOptions,
    ) -> Result<ExecOutput, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .push((server.name.clone(), command.to_string()));
        let transport = || RemoteError::Transport {
            server: server.label(),
            message: "connection refused".to_string(),
        };
        if state.unreachable {
            return Err(transport());
        }
        let Some(rule) = state
            .rules
            .iter_mut()
            .rev()
            .find(|r| command.contains(&r.pattern))
        else {
            return Ok(ExecOutput::ok(""));
        };
        match &mut rule.reply {
            Reply::Output(output) => Ok(output.clone()),
            Reply::Sequence(outputs) => {
                if outputs.len() > 1 {
                    Ok(outputs.pop_front().unwrap_or_default())
                } else {
                    Ok(outputs.front().cloned().unwrap_or_default())
                }
            }
            Reply::Transport => Err(transport()),
        }
    }
}

/// Files written through `remote::write_file`, as `(path, contents)`.
pub fn written_files(commands: &[String]) -> Vec<(String, String)> {
    let re = Regex::new(r"echo '([A-Za-z0-9+/=]*)' \| base64 -d > '([^']+)'\.tmp").unwrap();
    commands
        .iter()
        .flat_map(|cmd| {
            let unwrapped = cmd.replace("'\\''", "'");
            re.captures_iter(&unwrapped)
                .map(|c| {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(&c[1])
                        .unwrap();
                    (c[2].to_string(), String::from_utf8(bytes).unwrap())
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Records the traffic split of every proxy update; a single upstream is `[100]`.
#[derive(Default)]
pub struct RecordingProxy {
    weights: Mutex<Vec<Vec<u8>>>,
    resyncs: Mutex<Vec<String>>,
}

impl RecordingProxy {
    pub fn weights(&self) -> Vec<Vec<u8>> {
        self.weights.lock().unwrap().clone()
    }

    pub fn resyncs(&self) -> Vec<String> {
        self.resyncs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyController for RecordingProxy {
    async fn set_upstream(&self, _server: &Server, _route: &Route, _container: &str) -> Result<()> {
        self.weights.lock().unwrap().push(vec![100]);
        Ok(())
    }

    async fn set_weighted_upstream(
        &self,
        _server: &Server,
        _route: &Route,
        upstreams: &[(String, u8)],
    ) -> Result<()> {
        self.weights
            .lock()
            .unwrap()
            .push(upstreams.iter().map(|(_, w)| *w).collect());
        Ok(())
    }

    async fn resync(&self, _server: &Server, _route: &Route, container: &str) -> Result<()> {
        self.resyncs.lock().unwrap().push(container.to_string());
        Ok(())
    }
}

/// Holds dispatched jobs until the test runs them.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<Vec<(Job, Duration)>>,
}

impl ManualScheduler {
    pub fn jobs(&self) -> Vec<(Job, Duration)> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<(Job, Duration)> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

impl Scheduler for ManualScheduler {
    fn dispatch(&self, job: Job, delay: Duration) {
        self.jobs.lock().unwrap().push((job, delay));
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Everything except the status-changed pings.
    pub fn events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !matches!(e, Notification::ServiceStatusChanged { .. }))
            .cloned()
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, _team_id: u64, event: Notification) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct RecordingGitHost {
    diff: Mutex<Vec<String>>,
    statuses: Mutex<Vec<(u64, PullRequestStatus)>>,
}

impl RecordingGitHost {
    pub fn set_diff(&self, files: Vec<String>) {
        *self.diff.lock().unwrap() = files;
    }

    pub fn statuses(&self) -> Vec<(u64, PullRequestStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHost for RecordingGitHost {
    async fn fetch_diff(&self, _repository: &str, _commit: &str) -> Result<Vec<String>> {
        Ok(self.diff.lock().unwrap().clone())
    }

    async fn update_pull_request_status(
        &self,
        _repository: &str,
        pull_request_id: u64,
        status: PullRequestStatus,
        _preview_url: Option<&str>,
    ) -> Result<()> {
        self.statuses.lock().unwrap().push((pull_request_id, status));
        Ok(())
    }
}

pub mod fixtures {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::FakeExecutor;
    use crate::deploy::context::DeployContext;
    use crate::engine::EngineSettings;
    use crate::model::application::{GitSource, HealthCheckConfig, ApplicationSettings};
    use crate::model::{
        Application, BuildPack, DeploymentRecord, DeploymentStatus, EnvVar, Server,
    };
    use crate::remote::ExecOutput;
    use crate::store::{MemoryStore, Store};

    pub fn server(id: u64) -> Server {
        Server {
            id,
            name: format!("web-{}", id),
            address: format!("10.0.0.{}", id),
            user: "root".to_string(),
            port: None,
            proxy: None,
            team_id: 1,
            build_server: false,
            proxy_enabled: true,
        }
    }

    pub fn application(id: u64) -> Application {
        Application {
            id,
            uuid: format!("app-{}", id),
            name: format!("shop-{}", id),
            team_id: 1,
            server_id: 1,
            network: "berth".to_string(),
            additional_servers: Vec::new(),
            build_pack: BuildPack::Dockerfile,
            git: Some(GitSource {
                repository: "git@github.com:acme/shop.git".to_string(),
                branch: "main".to_string(),
                port: None,
            }),
            base_directory: "/".to_string(),
            dockerfile_location: "/Dockerfile".to_string(),
            compose_location: "/docker-compose.yaml".to_string(),
            publish_directory: "/".to_string(),
            docker_image: None,
            registry: None,
            port: 3000,
            port_mappings: Vec::new(),
            fqdn: None,
            health_check: HealthCheckConfig::default(),
            settings: ApplicationSettings::default(),
            pre_deployment_command: None,
            post_deployment_command: None,
            environment: Vec::new(),
            watch_paths: Vec::new(),
            config_hash: None,
        }
    }

    pub fn env(key: &str, value: &str) -> EnvVar {
        EnvVar {
            key: key.to_string(),
            value: value.to_string(),
            build_time: false,
            runtime: true,
            preview: false,
        }
    }

    pub fn store() -> MemoryStore {
        MemoryStore::with_fleet(vec![server(1)], vec![application(1)])
    }

    pub fn record(application_id: u64, uuid: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: 0,
            deployment_uuid: uuid.to_string(),
            application_id,
            server_id: 1,
            destination_id: 1,
            build_server_id: None,
            commit: "abc1234".to_string(),
            pull_request_id: 0,
            rollback: false,
            force_rebuild: false,
            restart_only: false,
            only_this_server: false,
            requires_approval: false,
            approval_status: None,
            approved_by: None,
            approval_note: None,
            status: DeploymentStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker: None,
            container_name: None,
            went_live: false,
            canary: None,
        }
    }

    /// Engine settings with millisecond health polling.
    pub fn settings() -> EngineSettings {
        EngineSettings {
            health_poll_interval: Duration::from_millis(1),
            health_timeout: Duration::from_secs(2),
            deployment_timeout: Duration::from_secs(30),
            ..EngineSettings::default()
        }
    }

    /// Context over a store that does not hold the record.
    pub fn context() -> DeployContext {
        DeployContext::new(
            Arc::new(store()),
            Arc::new(FakeExecutor::new()),
            settings(),
            record(1, "d1"),
            application(1),
            server(1),
            server(1),
            false,
        )
    }

    pub async fn context_with(executor: FakeExecutor) -> DeployContext {
        let store = Arc::new(store());
        let record = store.insert_deployment(record(1, "d1")).await.unwrap();
        DeployContext::new(
            store,
            Arc::new(executor),
            settings(),
            record,
            application(1),
            server(1),
            server(1),
            false,
        )
    }

    /// Scripts a host where every probe of a deployment succeeds.
    pub fn healthy_host(executor: &FakeExecutor) {
        executor.respond("docker buildx version", ExecOutput::ok("github.com/docker/buildx v0.17.1\n"));
        executor.respond(
            "git ls-remote",
            ExecOutput::ok("abc1234def5678\trefs/heads/main\n"),
        );
        executor.respond(
            "docker inspect --format '{{.State.Status}}",
            ExecOutput::ok("running|healthy\n"),
        );
        executor.respond("{{.State.Running}}", ExecOutput::ok("true\n"));
        executor.respond("{{.RestartCount}}", ExecOutput::ok("0|running|healthy\n"));
    }
}

/// An engine wired to in-memory fakes.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub executor: FakeExecutor,
    pub proxy: Arc<RecordingProxy>,
    pub scheduler: Arc<ManualScheduler>,
    pub notifier: Arc<RecordingNotifier>,
    pub git: Arc<RecordingGitHost>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_executor(FakeExecutor::new())
    }

    pub fn with_executor(executor: FakeExecutor) -> Self {
        let store = Arc::new(fixtures::store());
        let proxy = Arc::new(RecordingProxy::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let git = Arc::new(RecordingGitHost::default());
        let engine = Engine {
            store: store.clone(),
            executor: Arc::new(executor.clone()),
            proxy: proxy.clone(),
            scheduler: scheduler.clone(),
            notifier: notifier.clone(),
            git_host: git.clone(),
            settings: fixtures::settings(),
        };
        Self {
            store,
            executor,
            proxy,
            scheduler,
            notifier,
            git,
            engine,
        }
    }

    /// Same fakes, different scheduler.
    pub fn engine_with_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> Engine {
        Engine {
            store: self.store.clone(),
            executor: Arc::new(self.executor.clone()),
            proxy: self.proxy.clone(),
            scheduler,
            notifier: self.notifier.clone(),
            git_host: self.git.clone(),
            settings: self.engine.settings.clone(),
        }
    }

    pub async fn application(&self) -> Application {
        self.store.application(1).await.unwrap()
    }

    /// Inserts a queued record for application 1 and builds its context.
    pub async fn context(&self, uuid: &str) -> DeployContext {
        let record = self
            .store
            .insert_deployment(fixtures::record(1, uuid))
            .await
            .unwrap();
        let server = self.store.server(1).await.unwrap();
        DeployContext::new(
            self.store.clone(),
            Arc::new(self.executor.clone()),
            self.engine.settings.clone(),
            record,
            self.application().await,
            server.clone(),
            server,
            false,
        )
    }

    /// Runs dispatched jobs, including the ones they dispatch, until none are left.
    pub async fn run_jobs(&self) -> Vec<Job> {
        let mut ran = Vec::new();
        for _ in 0..100 {
            let jobs = self.scheduler.take();
            if jobs.is_empty() {
                break;
            }
            for (job, _) in jobs {
                ran.push(job.clone());
                self.engine.handle(job, "test-worker").await;
            }
        }
        ran
    }
}
