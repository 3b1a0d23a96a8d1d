use chrono::Utc;
use tracing::{error, info};

use crate::deploy::context::DeployContext;
use crate::deploy::error::DeployError;
use crate::engine::Engine;
use crate::integrations::{Notification, PullRequestStatus};
use crate::model::{DeploymentStatus, LogStream, RollbackStatus};
use crate::remote::RemoteCommand;

use super::prepare::pull_request_status;

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Failed,
    Cancelled,
    /// Re-queued for another attempt
    Retrying,
}

/// Whether the half-started container of a failed run gets removed.
///
/// It stays when it may be the only copy serving (fixed names) or when the
/// build output itself is fine and only the push failed.
pub fn remove_failed_container(ctx: &DeployContext, err: &DeployError) -> bool {
    !(matches!(err, DeployError::RegistryPush { .. })
        || ctx.application.settings.consistent_container_name
        || ctx.application.settings.custom_internal_name.is_some()
        || ctx.record.is_preview())
}

async fn error_details(ctx: &DeployContext, err: &DeployError) {
    let stage = ctx
        .stage()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "startup".to_string());
    let mut lines = vec![
        "----- error details -----".to_string(),
        format!("Type: {}", err.kind()),
        format!("Code: {}", err.code()),
        format!("Stage: {}", stage),
        format!("Message: {}", err),
    ];
    for cause in err.causes() {
        lines.push(format!("Caused by: {}", cause));
    }
    let frames = err.frames(5);
    if !frames.is_empty() {
        lines.push("Trace:".to_string());
        lines.extend(frames.into_iter().map(|f| format!("  {}", f)));
    }
    for line in lines {
        ctx.log.debug(line).await;
    }
}

/// Marks the run failed and undoes what it started, keeping the old version serving.
pub async fn on_failure(engine: &Engine, ctx: &mut DeployContext, err: &DeployError) {
    error!("Deployment {} failed: {}", ctx.uuid(), err);
    if let Err(e) = engine
        .store
        .transition(ctx.uuid(), DeploymentStatus::Failed)
        .await
    {
        ctx.log
            .warning(format!("Could not mark the deployment failed: {:#}", e))
            .await;
    }

    error_details(ctx, err).await;
    ctx.log
        .line(format!("Deployment failed: {}", err), LogStream::Stderr, false, 0)
        .await;

    if remove_failed_container(ctx, err) {
        let containers = if ctx.started_containers.is_empty() {
            vec![ctx.container_name.clone()]
        } else {
            ctx.started_containers.clone()
        };
        ctx.log
            .info(format!(
                "Removing {}; the previous version keeps serving.",
                containers.join(", ")
            ))
            .await;
        let commands: Vec<RemoteCommand> = containers
            .iter()
            .map(|c| RemoteCommand::new(format!("docker rm -f {}", c)).ignore_errors())
            .collect();
        if let Err(e) = ctx.on_target(&commands).await {
            ctx.log
                .warning(format!("Could not remove the new container: {}", e))
                .await;
        }
    }

    pull_request_status(engine, ctx, PullRequestStatus::Failed, None).await;
    engine.notifier.notify(
        ctx.application.team_id,
        Notification::DeploymentFailed {
            application: ctx.application.name.clone(),
            deployment_uuid: ctx.uuid().to_string(),
            error: err.to_string(),
        },
    );
}

pub async fn on_cancelled(ctx: &mut DeployContext) {
    info!("Deployment {} stopped after cancellation", ctx.uuid());
    ctx.log.warning("Deployment stopped: cancelled by user.").await;
}

async fn settle_config_files(ctx: &mut DeployContext, outcome: Outcome) {
    let staging = ctx.staging_dir();
    let command = if outcome == Outcome::Finished {
        let live = ctx.config_dir();
        format!(
            "if [ -d {s} ]; then cp -a {s}/. {l}/ && rm -rf {s}; fi",
            s = staging,
            l = live
        )
    } else {
        format!("rm -rf {}", staging)
    };
    if let Err(e) = ctx
        .on_target(&[RemoteCommand::new(command).ignore_errors()])
        .await
    {
        ctx.log
            .warning(format!("Could not update configuration files: {}", e))
            .await;
    }
}

async fn stop_helper(ctx: &mut DeployContext) {
    let helper = ctx.helper().to_string();
    let timeout = ctx.settings.helper_stop_timeout;
    let result = ctx
        .on_builder(&[
            RemoteCommand::new(format!("docker stop -t {} {} >/dev/null 2>&1", timeout, helper))
                .ignore_errors(),
            RemoteCommand::new(format!("docker rm -f {} >/dev/null 2>&1", helper)).ignore_errors(),
        ])
        .await;
    if let Err(e) = result {
        ctx.log
            .warning(format!("Could not remove helper container: {}", e))
            .await;
    }
}

async fn settle_rollback_event(engine: &Engine, ctx: &DeployContext, outcome: Outcome) {
    if !ctx.record.rollback || outcome == Outcome::Retrying {
        return;
    }
    let event = match engine.store.rollback_event_for_deployment(ctx.uuid()).await {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(e) => {
            ctx.log.warning(format!("{:#}", e)).await;
            return;
        }
    };
    let status = if outcome == Outcome::Finished {
        RollbackStatus::Completed
    } else {
        RollbackStatus::Failed
    };
    if let Err(e) = engine
        .store
        .update_rollback_event(event.id, Box::new(move |e| e.status = status))
        .await
    {
        ctx.log.warning(format!("{:#}", e)).await;
    }
}

/// Runs after every pipeline run, whatever the outcome.
pub async fn finally(engine: &Engine, ctx: &mut DeployContext, outcome: Outcome) {
    if outcome != Outcome::Retrying {
        let finished_at = Utc::now();
        if let Err(e) = engine
            .store
            .update_deployment(
                ctx.uuid(),
                Box::new(move |d| {
                    if d.finished_at.is_none() {
                        d.finished_at = Some(finished_at);
                    }
                }),
            )
            .await
        {
            ctx.log.warning(format!("{:#}", e)).await;
        }
    }

    settle_config_files(ctx, outcome).await;
    stop_helper(ctx).await;

    if outcome != Outcome::Retrying {
        engine.notifier.notify(
            ctx.application.team_id,
            Notification::ServiceStatusChanged {
                application_id: ctx.application.id,
            },
        );
    }
    settle_rollback_event(engine, ctx, outcome).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::remote::RemoteError;
    use crate::testing::Harness;

    fn push_error() -> DeployError {
        DeployError::RegistryPush {
            image: "registry.example.com/shop:abc".to_string(),
            source: RemoteError::CommandFailed {
                server: "web-1".to_string(),
                command: "docker push".to_string(),
                exit_code: Some(1),
                output: "denied".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn removal_exemptions() {
        let h = Harness::new();
        let mut ctx = h.context("d1").await;
        let build = DeployError::Build("boom".to_string());

        assert!(remove_failed_container(&ctx, &build));
        assert!(!remove_failed_container(&ctx, &push_error()));

        ctx.application.settings.consistent_container_name = true;
        assert!(!remove_failed_container(&ctx, &build));
        ctx.application.settings.consistent_container_name = false;

        ctx.record.pull_request_id = 3;
        assert!(!remove_failed_container(&ctx, &build));
    }

    #[tokio::test]
    async fn failure_logs_hidden_details_and_a_visible_message() {
        let h = Harness::new();
        let mut ctx = h.context("d1").await;
        h.store
            .transition("d1", DeploymentStatus::InProgress)
            .await
            .unwrap();

        on_failure(&h.engine, &mut ctx, &DeployError::Build("exit 1".to_string())).await;

        let record = h.store.deployment("d1").await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        let lines = h.store.logs("d1", None).await.unwrap();
        assert!(lines
            .iter()
            .any(|l| l.hidden && l.text == "Code: build_failed"));
        assert!(lines
            .iter()
            .any(|l| !l.hidden && l.text == "Deployment failed: Build failed: exit 1"));
        assert_eq!(
            h.executor
                .count_matching(&format!("docker rm -f {}", ctx.container_name)),
            1
        );
    }

    #[tokio::test]
    async fn push_failure_and_fixed_names_issue_no_removal() {
        let h = Harness::new();
        let mut ctx = h.context("d1").await;
        on_failure(&h.engine, &mut ctx, &push_error()).await;

        ctx.application.settings.consistent_container_name = true;
        on_failure(&h.engine, &mut ctx, &DeployError::Build("exit 1".to_string())).await;

        assert_eq!(h.executor.count_matching("docker rm -f"), 0);
    }

    #[tokio::test]
    async fn every_started_container_is_removed() {
        let h = Harness::new();
        let mut ctx = h.context("d1").await;
        ctx.started_containers = vec!["app-1-web-1".to_string(), "app-1-worker-1".to_string()];

        on_failure(&h.engine, &mut ctx, &DeployError::Build("exit 1".to_string())).await;

        assert_eq!(h.executor.count_matching("docker rm -f app-1-web-1"), 1);
        assert_eq!(h.executor.count_matching("docker rm -f app-1-worker-1"), 1);
    }

    #[tokio::test]
    async fn finally_promotes_staging_only_on_success() {
        let h = Harness::new();
        let mut ctx = h.context("d1").await;
        finally(&h.engine, &mut ctx, Outcome::Failed).await;
        assert_eq!(
            h.executor
                .count_matching(&format!("rm -rf {}", ctx.staging_dir())),
            1
        );
        assert_eq!(h.executor.count_matching("cp -a"), 0);
        assert_eq!(h.executor.count_matching("docker rm -f d1"), 1);
        assert!(h.store.deployment("d1").await.unwrap().finished_at.is_some());
    }
}
