//! Post-deployment watchdog.
//!
//! Each check is its own [`Job::HealthCheck`]; a check either schedules the
//! next round, declares the deployment validated, or triggers a rollback to
//! the last good commit.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::deploy::log::DeploymentLog;
use crate::engine::{Engine, Job};
use crate::integrations::Notification;
use crate::model::application::AutoRollbackConfig;
use crate::model::{
    Application, DeploymentRecord, DeploymentRequest, DeploymentStatus, MetricsSnapshot,
    NewRollbackEvent, RollbackEvent, RollbackStatus, TriggerReason, TriggerType,
};
use crate::remote::{ExecOptions, RemoteError};

const INSPECT_HEALTH: &str =
    "{{.RestartCount}}|{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";

/// Position of one check in the monitoring sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub deployment_uuid: String,
    pub round: u32,
    pub baseline_restarts: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHealth {
    pub restart_count: u32,
    pub status: String,
    pub health: Option<String>,
}

impl ContainerHealth {
    fn missing() -> Self {
        Self {
            restart_count: 0,
            status: "missing".to_string(),
            health: None,
        }
    }

    pub fn parse(sample: &str) -> Option<Self> {
        let mut parts = sample.trim().splitn(3, '|');
        let restart_count = parts.next()?.trim().parse().ok()?;
        let status = parts.next()?.trim().to_string();
        let health = parts
            .next()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        Some(Self {
            restart_count,
            status,
            health,
        })
    }
}

/// First matching problem, in priority order.
pub fn classify(
    sample: &ContainerHealth,
    baseline_restarts: u32,
    config: &AutoRollbackConfig,
    health_check_enabled: bool,
) -> Option<TriggerReason> {
    if sample.restart_count.saturating_sub(baseline_restarts) >= config.max_restarts {
        return Some(TriggerReason::CrashLoop);
    }
    if matches!(sample.status.as_str(), "exited" | "dead" | "missing") {
        return Some(TriggerReason::ContainerExited);
    }
    if health_check_enabled && sample.health.as_deref() == Some("unhealthy") {
        return Some(TriggerReason::HealthCheckFailed);
    }
    None
}

/// Whether a just-finished deployment gets watched.
pub fn eligible(record: &DeploymentRecord, app: &Application) -> bool {
    app.settings.auto_rollback.enabled
        && !record.is_preview()
        && !record.rollback
        && record.canary.is_none()
        && record.container_name.is_some()
}

/// The newest earlier successful production deployment with a different commit.
pub fn rollback_target<'a>(
    history: &'a [DeploymentRecord],
    failed: &DeploymentRecord,
) -> Option<&'a DeploymentRecord> {
    history
        .iter()
        .filter(|d| {
            d.id < failed.id
                && d.status == DeploymentStatus::Finished
                && !d.is_preview()
                && !d.commit.is_empty()
                && d.commit != failed.commit
        })
        .max_by_key(|d| d.id)
}

fn inspect_command(container: &str) -> String {
    format!("docker inspect --format '{}' {}", INSPECT_HEALTH, container)
}

async fn sample(engine: &Engine, record: &DeploymentRecord, container: &str) -> Result<ContainerHealth, RemoteError> {
    let server = engine
        .store
        .server(record.server_id)
        .await
        .map_err(|e| RemoteError::Transport {
            server: record.server_id.to_string(),
            message: format!("{:#}", e),
        })?;
    let output = engine
        .executor
        .exec(&server, &inspect_command(container), &ExecOptions::default())
        .await?;
    if !output.success() {
        return Ok(ContainerHealth::missing());
    }
    Ok(ContainerHealth::parse(&output.stdout).unwrap_or_else(ContainerHealth::missing))
}

/// Records the restart baseline and schedules the first check.
pub async fn start(engine: &Engine, record: &DeploymentRecord, app: &Application) -> Result<()> {
    let Some(container) = record.container_name.as_deref() else {
        return Ok(());
    };
    let baseline = match sample(engine, record, container).await {
        Ok(health) => health.restart_count,
        Err(e) => {
            warn!("Could not read restart count of {}: {}", container, e);
            0
        }
    };
    let config = &app.settings.auto_rollback;
    DeploymentLog::new(engine.store.clone(), &record.deployment_uuid)
        .info(format!(
            "Watching {} for {}s (restart baseline {}).",
            container, config.validation_window, baseline
        ))
        .await;
    engine.scheduler.dispatch(
        Job::HealthCheck {
            deployment_uuid: record.deployment_uuid.clone(),
            round: 1,
            baseline_restarts: baseline,
            started_at: Utc::now(),
        },
        Duration::from_secs(config.check_interval),
    );
    Ok(())
}

fn reschedule(engine: &Engine, round: &Round, config: &AutoRollbackConfig) {
    engine.scheduler.dispatch(
        Job::HealthCheck {
            deployment_uuid: round.deployment_uuid.clone(),
            round: round.round + 1,
            baseline_restarts: round.baseline_restarts,
            started_at: round.started_at,
        },
        Duration::from_secs(config.check_interval),
    );
}

/// One round of the watchdog.
pub async fn check(engine: &Engine, round: Round) -> Result<()> {
    let record = engine.store.deployment(&round.deployment_uuid).await?;
    let app = engine.store.application(record.application_id).await?;
    let config = app.settings.auto_rollback.clone();
    let log = DeploymentLog::new(engine.store.clone(), &record.deployment_uuid);

    if !config.enabled {
        debug!("Auto rollback disabled for {}, monitor stops", app.name);
        return Ok(());
    }
    let superseded = engine
        .store
        .deployments_for_application(app.id)
        .await?
        .iter()
        .any(|d| {
            d.id > record.id
                && d.pull_request_id == record.pull_request_id
                && matches!(d.status, DeploymentStatus::InProgress | DeploymentStatus::Finished)
        });
    if superseded {
        log.info("A newer deployment took over; health monitor stopped.")
            .await;
        return Ok(());
    }
    let Some(container) = record.container_name.clone() else {
        return Ok(());
    };

    let health = match sample(engine, &record, &container).await {
        Ok(health) => health,
        Err(e) => {
            warn!("Health check of {} could not run: {}", container, e);
            if round.round < config.max_checks {
                reschedule(engine, &round, &config);
            }
            return Ok(());
        }
    };

    if let Some(reason) = classify(&health, round.baseline_restarts, &config, app.health_check.enabled) {
        let snapshot = MetricsSnapshot {
            container,
            status: health.status,
            health: health.health,
            restart_count: health.restart_count,
            baseline_restarts: round.baseline_restarts,
        };
        trigger_rollback(engine, &record, &app, reason, snapshot).await?;
        return Ok(());
    }

    let elapsed = Utc::now() - round.started_at;
    if elapsed.num_seconds() >= config.validation_window as i64 {
        log.info(format!(
            "Deployment validated: no problems for {}s.",
            config.validation_window
        ))
        .await;
        return Ok(());
    }
    if round.round >= config.max_checks {
        log.info(format!("Health monitor finished after {} checks.", round.round))
            .await;
        return Ok(());
    }
    reschedule(engine, &round, &config);
    Ok(())
}

/// Records the incident and queues a rollback deployment when there is
/// something to go back to.
pub async fn trigger_rollback(
    engine: &Engine,
    failed: &DeploymentRecord,
    app: &Application,
    reason: TriggerReason,
    snapshot: MetricsSnapshot,
) -> Result<RollbackEvent> {
    let log = DeploymentLog::new(engine.store.clone(), &failed.deployment_uuid);
    let event = engine
        .store
        .insert_rollback_event(NewRollbackEvent {
            application_id: app.id,
            failed_deployment_id: failed.id,
            trigger_reason: reason,
            trigger_type: TriggerType::Automatic,
            metrics_snapshot: snapshot,
            from_commit: failed.commit.clone(),
        })
        .await?;

    let history = engine.store.deployments_for_application(app.id).await?;
    let Some(target) = rollback_target(&history, failed) else {
        let event = engine
            .store
            .update_rollback_event(event.id, Box::new(|e| e.status = RollbackStatus::Skipped))
            .await?;
        log.warning(format!(
            "Detected {} but there is no earlier successful deployment to roll back to.",
            reason
        ))
        .await;
        engine.notifier.notify(
            app.team_id,
            Notification::AutoRollbackSkipped {
                application: app.name.clone(),
                failed_deployment_uuid: failed.deployment_uuid.clone(),
                reason: reason.to_string(),
            },
        );
        return Ok(event);
    };

    let to_commit = target.commit.clone();
    let rollback_uuid = engine
        .queue_deployment(DeploymentRequest {
            rollback: true,
            ..DeploymentRequest::new(app.id)
                .commit(to_commit.clone())
                .server(failed.server_id)
        })
        .await?;

    let (commit, uuid) = (to_commit.clone(), rollback_uuid.clone());
    let event = engine
        .store
        .update_rollback_event(
            event.id,
            Box::new(move |e| {
                e.status = RollbackStatus::InProgress;
                e.to_commit = Some(commit);
                e.rollback_deployment_uuid = Some(uuid);
            }),
        )
        .await?;

    info!(
        "Rolling {} back to {} after {}",
        app.name, to_commit, reason
    );
    log.warning(format!(
        "Detected {}; rolling back to {} (deployment {}).",
        reason, to_commit, rollback_uuid
    ))
    .await;
    engine.notifier.notify(
        app.team_id,
        Notification::AutoRollbackTriggered {
            application: app.name.clone(),
            failed_deployment_uuid: failed.deployment_uuid.clone(),
            reason: reason.to_string(),
            to_commit,
        },
    );
    Ok(event)
}
