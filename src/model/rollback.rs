use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    CrashLoop,
    ContainerExited,
    HealthCheckFailed,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerReason::CrashLoop => "crash_loop",
            TriggerReason::ContainerExited => "container_exited",
            TriggerReason::HealthCheckFailed => "health_check_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Container state at the moment the rollback decision was made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub container: String,
    pub status: String,
    pub health: Option<String>,
    pub restart_count: u32,
    pub baseline_restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: u64,
    pub application_id: u64,
    pub failed_deployment_id: u64,
    pub trigger_reason: TriggerReason,
    pub trigger_type: TriggerType,
    pub metrics_snapshot: MetricsSnapshot,
    pub status: RollbackStatus,
    pub from_commit: String,
    pub to_commit: Option<String>,
    pub rollback_deployment_uuid: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRollbackEvent {
    pub application_id: u64,
    pub failed_deployment_id: u64,
    pub trigger_reason: TriggerReason,
    pub trigger_type: TriggerType,
    pub metrics_snapshot: MetricsSnapshot,
    pub from_commit: String,
}
