use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rollout::canary::CanaryState;

/// Lifecycle of one deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    InProgress,
    Finished,
    Failed,
    CancelledByUser,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Finished | DeploymentStatus::Failed | DeploymentStatus::CancelledByUser
        )
    }

    /// Allowed edges of the state machine.
    ///
    /// `InProgress -> Queued` is the job-level retry path.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, CancelledByUser)
                | (InProgress, Finished)
                | (InProgress, Failed)
                | (InProgress, CancelledByUser)
                | (InProgress, Queued)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Finished => "finished",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::CancelledByUser => "cancelled_by_user",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// What the caller asked for when queueing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub application_id: u64,
    /// Defaults to the application's primary server
    pub server_id: Option<u64>,
    pub commit: String,
    pub pull_request_id: u64,
    pub rollback: bool,
    pub force_rebuild: bool,
    pub restart_only: bool,
    pub only_this_server: bool,
    pub requires_approval: bool,
}

impl DeploymentRequest {
    pub fn new(application_id: u64) -> Self {
        Self {
            application_id,
            ..Default::default()
        }
    }

    pub fn commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = commit.into();
        self
    }

    pub fn pull_request(mut self, id: u64) -> Self {
        self.pull_request_id = id;
        self
    }

    pub fn server(mut self, server_id: u64) -> Self {
        self.server_id = Some(server_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: u64,
    pub deployment_uuid: String,
    pub application_id: u64,
    pub server_id: u64,
    pub destination_id: u64,
    pub build_server_id: Option<u64>,

    pub commit: String,
    pub pull_request_id: u64,
    pub rollback: bool,
    pub force_rebuild: bool,
    pub restart_only: bool,
    pub only_this_server: bool,

    pub requires_approval: bool,
    pub approval_status: Option<ApprovalStatus>,
    pub approved_by: Option<String>,
    pub approval_note: Option<String>,

    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Identity of the worker that owns the run
    pub worker: Option<String>,

    /// Running container this deployment produced
    pub container_name: Option<String>,
    /// Set once the new version passed its health check; the run can no
    /// longer be cancelled from then on.
    #[serde(default)]
    pub went_live: bool,
    pub canary: Option<CanaryState>,
}

impl DeploymentRecord {
    pub fn is_preview(&self) -> bool {
        self.pull_request_id > 0
    }

    pub fn awaiting_approval(&self) -> bool {
        self.requires_approval && self.approval_status == Some(ApprovalStatus::Pending)
    }

    pub fn short_commit(&self) -> &str {
        if self.commit.is_empty() {
            return "HEAD";
        }
        match self.commit.char_indices().nth(7) {
            Some((end, _)) => &self.commit[..end],
            None => &self.commit,
        }
    }

    /// Status table plus the rule that a live deployment is past cancelling.
    pub fn accepts(&self, next: DeploymentStatus) -> bool {
        if self.went_live && next == DeploymentStatus::CancelledByUser {
            return false;
        }
        self.status.can_transition_to(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Info,
    Warning,
}

/// One line of a deployment's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub order: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub stream: LogStream,
    /// Suppressed from the default view
    pub hidden: bool,
    pub batch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub text: String,
    pub stream: LogStream,
    pub hidden: bool,
    pub batch: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        use DeploymentStatus::*;
        for from in [Finished, Failed, CancelledByUser] {
            for to in [Queued, InProgress, Finished, Failed, CancelledByUser] {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn queued_can_start_or_be_cancelled() {
        use DeploymentStatus::*;
        assert!(Queued.can_transition_to(InProgress));
        assert!(Queued.can_transition_to(CancelledByUser));
        assert!(!Queued.can_transition_to(Finished));
        assert!(!Queued.can_transition_to(Failed));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::CancelledByUser).unwrap();
        assert_eq!(json, "\"cancelled_by_user\"");
        assert_eq!(DeploymentStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn short_commit_counts_characters() {
        let mut record = crate::testing::fixtures::record(1, "d1");
        record.commit = "abc1234def".to_string();
        assert_eq!(record.short_commit(), "abc1234");
        record.commit = "é1ü2ö3ä4".to_string();
        assert_eq!(record.short_commit(), "é1ü2ö3ä");
        record.commit = "ab".to_string();
        assert_eq!(record.short_commit(), "ab");
        record.commit.clear();
        assert_eq!(record.short_commit(), "HEAD");
    }

    #[test]
    fn live_deployments_cannot_be_cancelled() {
        let mut record = crate::testing::fixtures::record(1, "d1");
        record.status = DeploymentStatus::InProgress;
        assert!(record.accepts(DeploymentStatus::CancelledByUser));
        record.went_live = true;
        assert!(!record.accepts(DeploymentStatus::CancelledByUser));
        assert!(record.accepts(DeploymentStatus::Finished));
        assert!(record.accepts(DeploymentStatus::Failed));
    }
}
