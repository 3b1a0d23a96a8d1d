use anyhow::{bail, Result};
use indicatif::ProgressBar;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cli::DeployArgs;
use crate::config::BerthConfig;
use crate::engine::worker::spawn_mux_sweeper;
use crate::engine::{Engine, EngineSettings, TokioScheduler, WorkerPool};
use crate::integrations::{LogNotifier, NoGitHost};
use crate::model::{DeploymentRequest, DeploymentStatus};
use crate::output;
use crate::remote::{RemoteExecutor, SshExecutor};
use crate::ssh::MuxPool;
use crate::store::{MemoryStore, Store};
use crate::traefik::TraefikProxy;

/// An engine running in this process for the duration of one command.
pub struct Runtime {
    pub engine: Arc<Engine>,
    scheduler: Arc<TokioScheduler>,
    workers: WorkerPool,
    sweeper: JoinHandle<()>,
}

impl Runtime {
    pub fn start(config: &BerthConfig) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::with_fleet(
            config.servers.clone(),
            config.applications.clone(),
        ));
        let pool = Arc::new(MuxPool::new(config.engine.ssh.mux_settings()));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(pool.clone()));
        let settings = EngineSettings::from(&config.engine);
        let (scheduler, receiver) = TokioScheduler::new();

        let engine = Arc::new(Engine {
            store: store.clone(),
            executor: executor.clone(),
            proxy: Arc::new(TraefikProxy::new(executor, &settings.config_root)),
            scheduler: scheduler.clone(),
            notifier: Arc::new(LogNotifier),
            git_host: Arc::new(NoGitHost),
            settings,
        });
        let workers = WorkerPool::start(
            engine.clone(),
            scheduler.clone(),
            receiver,
            config.engine.workers.max(1),
        );
        let sweeper = spawn_mux_sweeper(pool, store, config.engine.ssh.sweep_interval());

        Self {
            engine,
            scheduler,
            workers,
            sweeper,
        }
    }

    async fn print_new(
        &self,
        uuid: &str,
        after: &mut Option<u64>,
        include_hidden: bool,
        spinner: &ProgressBar,
    ) -> Result<()> {
        let lines = self.engine.logs(uuid, *after, include_hidden).await?;
        if let Some(last) = lines.last() {
            *after = Some(last.order);
        }
        spinner.suspend(|| {
            for line in &lines {
                output::log_line(line);
            }
        });
        Ok(())
    }

    /// Streams the deployment log until every job, follow-ups included, has run.
    pub async fn follow(&self, uuid: &str, include_hidden: bool) -> Result<DeploymentStatus> {
        let spinner = output::create_spinner(&format!("Deployment {}", uuid));
        let mut after = None;
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        let idle = self.scheduler.wait_idle();
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = &mut idle => break,
                _ = ticker.tick() => {
                    self.print_new(uuid, &mut after, include_hidden, &spinner).await?;
                }
            }
        }
        self.print_new(uuid, &mut after, include_hidden, &spinner)
            .await?;
        spinner.finish_and_clear();

        Ok(self.engine.status(uuid).await?.status)
    }

    pub fn stop(self) {
        self.workers.shutdown();
        self.sweeper.abort();
    }
}

/// Reports how the followed deployment ended.
pub fn report(uuid: &str, status: DeploymentStatus) -> Result<()> {
    match status {
        DeploymentStatus::Finished => {
            output::success(&format!("Deployment {} finished", uuid));
            Ok(())
        }
        DeploymentStatus::CancelledByUser => {
            output::warning(&format!("Deployment {} was cancelled", uuid));
            bail!("Deployment {} was cancelled", uuid)
        }
        other => {
            output::error(&format!("Deployment {} is {}", uuid, other));
            bail!("Deployment {} did not finish", uuid)
        }
    }
}

pub async fn run(config: BerthConfig, args: DeployArgs) -> Result<()> {
    let runtime = Runtime::start(&config);
    let app = runtime.engine.store.application_by_name(&args.app).await?;
    output::header(&format!("Deploying {}", app.name));

    let mut request = DeploymentRequest::new(app.id)
        .commit(args.commit.unwrap_or_default())
        .pull_request(args.pr.unwrap_or(0));
    request.force_rebuild = args.force_rebuild;
    request.restart_only = args.restart_only;
    request.only_this_server = args.only_this_server;

    let uuid = runtime.engine.queue_deployment(request).await?;
    output::info(&format!("Queued deployment {}", uuid));

    let status = runtime.follow(&uuid, args.show_hidden).await;
    runtime.stop();
    report(&uuid, status?)
}
