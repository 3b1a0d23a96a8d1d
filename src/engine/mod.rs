//! Entry points of the orchestration core.

pub mod builder;
pub mod gate;
pub mod scheduler;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::deploy::{self, log::DeploymentLog};
use crate::integrations::{GitHost, Notifier};
use crate::model::{
    ApprovalStatus, DeploymentRecord, DeploymentRequest, DeploymentStatus, LogEntry,
};
use crate::monitor;
use crate::remote::{ExecOptions, RemoteExecutor};
use crate::rollout::canary;
use crate::store::Store;
use crate::traefik::ProxyController;

pub use scheduler::{Job, Scheduler, TokioScheduler};
pub use worker::WorkerPool;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub deployment_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Vec<Duration>,
    pub lock_retry_delay: Duration,
    pub helper_image: String,
    pub artifacts_dir: String,
    pub config_root: String,
    pub health_poll_interval: Duration,
    pub health_timeout: Duration,
    /// Seconds the helper gets to stop gracefully
    pub helper_stop_timeout: u64,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            deployment_timeout: Duration::from_secs(config.deployment_timeout),
            max_attempts: config.max_attempts,
            retry_backoff: config
                .retry_backoff
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            lock_retry_delay: Duration::from_secs(config.lock_retry_delay),
            helper_image: config.helper_image.clone(),
            artifacts_dir: config.artifacts_dir.clone(),
            config_root: config.config_root.clone(),
            health_poll_interval: Duration::from_secs(config.health_poll_interval),
            health_timeout: Duration::from_secs(config.health_timeout),
            helper_stop_timeout: config.helper_stop_timeout,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl EngineSettings {
    /// Delay before attempt `attempt + 1`; the last entry repeats.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.retry_backoff
            .get(index)
            .or_else(|| self.retry_backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(30))
    }
}

/// What a status query reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSummary {
    pub deployment_uuid: String,
    pub status: DeploymentStatus,
    pub commit: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct Engine {
    pub store: Arc<dyn Store>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub proxy: Arc<dyn ProxyController>,
    pub scheduler: Arc<dyn Scheduler>,
    pub notifier: Arc<dyn Notifier>,
    pub git_host: Arc<dyn GitHost>,
    pub settings: EngineSettings,
}

fn new_deployment_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Engine {
    /// Queues a deployment and returns its uuid.
    ///
    /// An identical request that is still queued is reused unless
    /// `force_rebuild` is set.
    pub async fn queue_deployment(&self, request: DeploymentRequest) -> Result<String> {
        let app = self.store.application(request.application_id).await?;
        let server_id = request.server_id.unwrap_or(app.server_id);
        self.store
            .server(server_id)
            .await
            .with_context(|| format!("Cannot deploy {} to server {}", app.name, server_id))?;

        if !request.force_rebuild {
            let existing = self
                .store
                .deployments_for_application(app.id)
                .await?
                .into_iter()
                .find(|d| {
                    d.status == DeploymentStatus::Queued
                        && d.server_id == server_id
                        && d.commit == request.commit
                        && d.pull_request_id == request.pull_request_id
                        && d.rollback == request.rollback
                });
            if let Some(existing) = existing {
                info!(
                    "Deployment {} of {} is already queued",
                    existing.deployment_uuid, app.name
                );
                return Ok(existing.deployment_uuid);
            }
        }

        let record = DeploymentRecord {
            id: 0,
            deployment_uuid: new_deployment_uuid(),
            application_id: app.id,
            server_id,
            destination_id: server_id,
            build_server_id: None,
            commit: request.commit,
            pull_request_id: request.pull_request_id,
            rollback: request.rollback,
            force_rebuild: request.force_rebuild,
            restart_only: request.restart_only,
            only_this_server: request.only_this_server,
            requires_approval: request.requires_approval,
            approval_status: request.requires_approval.then_some(ApprovalStatus::Pending),
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
        };
        let record = self.store.insert_deployment(record).await?;
        let uuid = record.deployment_uuid.clone();

        let log = DeploymentLog::new(self.store.clone(), &uuid);
        let what = if record.rollback { "Rollback" } else { "Deployment" };
        log.info(format!(
            "{} of {} ({}) queued",
            what,
            app.name,
            record.short_commit()
        ))
        .await;
        info!("Queued deployment {} for {}", uuid, app.name);

        if record.awaiting_approval() {
            log.info("Waiting for approval").await;
        } else {
            self.scheduler.dispatch(Job::deploy(&uuid), Duration::ZERO);
        }
        Ok(uuid)
    }

    /// Queues a deployment for a pushed commit when it touches a watched path.
    pub async fn queue_push_deployment(
        &self,
        application_id: u64,
        commit: &str,
    ) -> Result<Option<String>> {
        let app = self.store.application(application_id).await?;
        if !app.watch_paths.is_empty() {
            let repository = app
                .git
                .as_ref()
                .map(|g| g.repository.clone())
                .unwrap_or_default();
            match self.git_host.fetch_diff(&repository, commit).await {
                Ok(files) => {
                    if !matches_watch_paths(&app.watch_paths, &files) {
                        info!(
                            "Push {} to {} touches no watched path, not deploying",
                            commit, app.name
                        );
                        return Ok(None);
                    }
                }
                Err(e) => warn!(
                    "Could not fetch the diff of {} for {}, deploying anyway: {:#}",
                    commit, app.name, e
                ),
            }
        }
        let uuid = self
            .queue_deployment(DeploymentRequest::new(application_id).commit(commit))
            .await?;
        Ok(Some(uuid))
    }

    /// Sets the cancellation flag; a running pipeline notices it at its next checkpoint.
    pub async fn cancel_deployment(&self, uuid: &str) -> Result<DeploymentRecord> {
        let record = self.store.deployment(uuid).await?;
        if record.status.is_terminal() {
            bail!("Deployment {} is already {}", uuid, record.status);
        }
        if record.went_live {
            bail!("Deployment {} is already serving traffic", uuid);
        }
        let was_running = record.status == DeploymentStatus::InProgress;

        self.store
            .transition(uuid, DeploymentStatus::CancelledByUser)
            .await?;
        let record = self
            .store
            .update_deployment(uuid, Box::new(|d| d.finished_at = Some(Utc::now())))
            .await?;

        let log = DeploymentLog::new(self.store.clone(), uuid);
        log.warning("Deployment cancelled by user").await;

        if was_running {
            let host = record.build_server_id.unwrap_or(record.server_id);
            match self.store.server(host).await {
                Ok(server) => {
                    let command = format!("docker rm -f {}", uuid);
                    if let Err(e) = self
                        .executor
                        .exec(&server, &command, &ExecOptions::default())
                        .await
                    {
                        warn!("Could not remove helper of cancelled deployment {}: {}", uuid, e);
                    }
                }
                Err(e) => warn!("{:#}", e),
            }
        }
        Ok(record)
    }

    pub async fn approve_deployment(
        &self,
        uuid: &str,
        approved_by: &str,
        note: Option<String>,
    ) -> Result<DeploymentRecord> {
        let record = self.store.deployment(uuid).await?;
        if !record.awaiting_approval() || record.status != DeploymentStatus::Queued {
            bail!("Deployment {} is not waiting for approval", uuid);
        }
        let by = approved_by.to_string();
        let record = self
            .store
            .update_deployment(
                uuid,
                Box::new(move |d| {
                    d.approval_status = Some(ApprovalStatus::Approved);
                    d.approved_by = Some(by);
                    d.approval_note = note;
                }),
            )
            .await?;
        DeploymentLog::new(self.store.clone(), uuid)
            .info(format!("Approved by {}", approved_by))
            .await;
        self.scheduler.dispatch(Job::deploy(uuid), Duration::ZERO);
        Ok(record)
    }

    pub async fn reject_deployment(
        &self,
        uuid: &str,
        rejected_by: &str,
        note: Option<String>,
    ) -> Result<DeploymentRecord> {
        let record = self.store.deployment(uuid).await?;
        if !record.awaiting_approval() || record.status != DeploymentStatus::Queued {
            bail!("Deployment {} is not waiting for approval", uuid);
        }
        let by = rejected_by.to_string();
        self.store
            .update_deployment(
                uuid,
                Box::new(move |d| {
                    d.approval_status = Some(ApprovalStatus::Rejected);
                    d.approved_by = Some(by);
                    d.approval_note = note;
                    d.finished_at = Some(Utc::now());
                }),
            )
            .await?;
        let record = self
            .store
            .transition(uuid, DeploymentStatus::CancelledByUser)
            .await?;
        DeploymentLog::new(self.store.clone(), uuid)
            .warning(format!("Rejected by {}", rejected_by))
            .await;
        Ok(record)
    }

    pub async fn status(&self, uuid: &str) -> Result<DeploymentSummary> {
        let record = self.store.deployment(uuid).await?;
        Ok(DeploymentSummary {
            deployment_uuid: record.deployment_uuid,
            status: record.status,
            commit: record.commit,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }

    /// Log lines after `after`, for live tailing.
    pub async fn logs(
        &self,
        uuid: &str,
        after: Option<u64>,
        include_hidden: bool,
    ) -> Result<Vec<LogEntry>> {
        let lines = self.store.logs(uuid, after).await?;
        Ok(lines
            .into_iter()
            .filter(|l| include_hidden || !l.hidden)
            .collect())
    }

    /// Runs one job to completion. Failures are logged, never propagated to the worker.
    pub async fn handle(&self, job: Job, worker: &str) {
        let kind = job.kind();
        let uuid = job.deployment_uuid().to_string();
        debug!("{} picked up {} for {}", worker, kind, uuid);

        let result = match job {
            Job::Deploy {
                deployment_uuid,
                attempt,
            } => deploy::run(self, &deployment_uuid, attempt, worker).await,
            Job::CanaryTick { deployment_uuid } => canary::tick(self, &deployment_uuid).await,
            Job::HealthCheck {
                deployment_uuid,
                round,
                baseline_restarts,
                started_at,
            } => {
                monitor::check(
                    self,
                    monitor::Round {
                        deployment_uuid,
                        round,
                        baseline_restarts,
                        started_at,
                    },
                )
                .await
            }
        };

        if let Err(e) = result {
            error!("{} job for {} failed: {:#}", kind, uuid, e);
        }
    }
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.trim_start_matches('/').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// A changed file counts when it matches a pattern and no `!`-negated one.
pub fn matches_watch_paths(patterns: &[String], files: &[String]) -> bool {
    let (negated, positive): (Vec<&String>, Vec<&String>) =
        patterns.iter().partition(|p| p.starts_with('!'));
    let positive: Vec<Regex> = positive.iter().filter_map(|p| glob_to_regex(p)).collect();
    let negated: Vec<Regex> = negated
        .iter()
        .filter_map(|p| glob_to_regex(&p[1..]))
        .collect();

    files.iter().any(|file| {
        let file = file.trim_start_matches('/');
        positive.iter().any(|re| re.is_match(file)) && !negated.iter().any(|re| re.is_match(file))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, Harness};

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn watch_paths_use_globs_with_negation() {
        let patterns = paths(&["src/**", "Dockerfile", "!src/**/*.md"]);
        assert!(matches_watch_paths(&patterns, &paths(&["src/api/main.rs"])));
        assert!(matches_watch_paths(&patterns, &paths(&["Dockerfile"])));
        assert!(!matches_watch_paths(&patterns, &paths(&["docs/index.md"])));
        assert!(!matches_watch_paths(&patterns, &paths(&["src/api/README.md"])));
    }

    #[test]
    fn backoff_repeats_the_last_step() {
        let settings = EngineSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_secs(30));
        assert_eq!(settings.backoff(2), Duration::from_secs(60));
        assert_eq!(settings.backoff(3), Duration::from_secs(120));
        assert_eq!(settings.backoff(7), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn queue_dispatches_and_deduplicates() {
        let h = Harness::new();
        let first = h
            .engine
            .queue_deployment(DeploymentRequest::new(1).commit("abc123"))
            .await
            .unwrap();
        let second = h
            .engine
            .queue_deployment(DeploymentRequest::new(1).commit("abc123"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.scheduler.jobs(), vec![(Job::deploy(&first), Duration::ZERO)]);

        let forced = h
            .engine
            .queue_deployment(DeploymentRequest {
                force_rebuild: true,
                ..DeploymentRequest::new(1).commit("abc123")
            })
            .await
            .unwrap();
        assert_ne!(first, forced);
    }

    #[tokio::test]
    async fn approval_gates_dispatch() {
        let h = Harness::new();
        let uuid = h
            .engine
            .queue_deployment(DeploymentRequest {
                requires_approval: true,
                ..DeploymentRequest::new(1)
            })
            .await
            .unwrap();
        assert!(h.scheduler.jobs().is_empty());

        let record = h
            .engine
            .approve_deployment(&uuid, "ops", Some("ship it".to_string()))
            .await
            .unwrap();
        assert_eq!(record.approval_status, Some(ApprovalStatus::Approved));
        assert_eq!(record.approved_by.as_deref(), Some("ops"));
        assert_eq!(h.scheduler.jobs().len(), 1);

        assert!(h.engine.approve_deployment(&uuid, "ops", None).await.is_err());
    }

    #[tokio::test]
    async fn rejection_cancels_the_record() {
        let h = Harness::new();
        let uuid = h
            .engine
            .queue_deployment(DeploymentRequest {
                requires_approval: true,
                ..DeploymentRequest::new(1)
            })
            .await
            .unwrap();

        let record = h.engine.reject_deployment(&uuid, "ops", None).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::CancelledByUser);
        assert_eq!(record.approval_status, Some(ApprovalStatus::Rejected));
    }

    #[tokio::test]
    async fn cancelling_a_finished_deployment_fails() {
        let h = Harness::new();
        let mut record = fixtures::record(1, "done");
        record.status = DeploymentStatus::Finished;
        h.store.insert_deployment(record).await.unwrap();
        assert!(h.engine.cancel_deployment("done").await.is_err());
    }

    #[tokio::test]
    async fn cancelling_a_live_deployment_fails() {
        let h = Harness::new();
        let mut record = fixtures::record(1, "live");
        record.status = DeploymentStatus::InProgress;
        record.went_live = true;
        h.store.insert_deployment(record).await.unwrap();

        let err = h.engine.cancel_deployment("live").await.unwrap_err();
        assert!(err.to_string().contains("already serving traffic"));
        assert_eq!(
            h.store.deployment("live").await.unwrap().status,
            DeploymentStatus::InProgress
        );
        assert!(h.executor.commands().is_empty());
    }

    #[tokio::test]
    async fn push_outside_watch_paths_is_ignored() {
        let h = Harness::new();
        let mut app = fixtures::application(1);
        app.watch_paths = paths(&["api/**"]);
        h.store.put_application(app).await;

        h.git.set_diff(paths(&["web/index.html"]));
        assert_eq!(h.engine.queue_push_deployment(1, "abc").await.unwrap(), None);

        h.git.set_diff(paths(&["api/server.rs"]));
        assert!(h.engine.queue_push_deployment(1, "def").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn hidden_lines_are_filtered_from_default_view() {
        let h = Harness::new();
        let log = DeploymentLog::new(h.store.clone(), "d1");
        log.info("visible").await;
        log.debug("secret detail").await;

        assert_eq!(h.engine.logs("d1", None, false).await.unwrap().len(), 1);
        assert_eq!(h.engine.logs("d1", None, true).await.unwrap().len(), 2);
    }
}
