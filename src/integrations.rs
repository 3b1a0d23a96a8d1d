//! Collaborators outside the engine: git hosting and notification delivery.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    DeploymentFinished {
        application: String,
        deployment_uuid: String,
        commit: String,
    },
    DeploymentFailed {
        application: String,
        deployment_uuid: String,
        error: String,
    },
    CanaryPromoted {
        application: String,
        deployment_uuid: String,
    },
    CanaryRolledBack {
        application: String,
        deployment_uuid: String,
        reason: String,
    },
    AutoRollbackTriggered {
        application: String,
        failed_deployment_uuid: String,
        reason: String,
        to_commit: String,
    },
    AutoRollbackSkipped {
        application: String,
        failed_deployment_uuid: String,
        reason: String,
    },
    ServiceStatusChanged {
        application_id: u64,
    },
}

/// Fire-and-forget delivery; implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, team_id: u64, event: Notification);
}

/// Writes notifications to the process log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, team_id: u64, event: Notification) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(team = team_id, "notification {}", json),
            Err(_) => info!(team = team_id, "notification {:?}", event),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    InProgress,
    Finished,
    Failed,
}

#[async_trait]
pub trait GitHost: Send + Sync {
    /// Paths touched by `commit`.
    async fn fetch_diff(&self, repository: &str, commit: &str) -> Result<Vec<String>>;

    async fn update_pull_request_status(
        &self,
        repository: &str,
        pull_request_id: u64,
        status: PullRequestStatus,
        preview_url: Option<&str>,
    ) -> Result<()>;
}

/// Used when no git hosting API is configured.
pub struct NoGitHost;

#[async_trait]
impl GitHost for NoGitHost {
    async fn fetch_diff(&self, repository: &str, _commit: &str) -> Result<Vec<String>> {
        bail!("No git host API configured for {}", repository)
    }

    async fn update_pull_request_status(
        &self,
        _repository: &str,
        _pull_request_id: u64,
        _status: PullRequestStatus,
        _preview_url: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}
