use anyhow::{Context, Result};

use crate::compose;
use crate::deploy::context::{DeployContext, Stage};
use crate::engine::Engine;
use crate::integrations::{Notification, PullRequestStatus};
use crate::model::{DeploymentRequest, DeploymentStatus};
use crate::monitor;
use crate::remote::{quote, RemoteCommand};
use crate::store::ContainerStatus;
use crate::traefik::Route;

use super::prepare::pull_request_status;

async fn refresh_container_status(engine: &Engine, ctx: &DeployContext) -> Result<()> {
    let command = format!(
        "docker ps -a {} --format '{{{{.Names}}}}|{{{{.State}}}}'",
        compose::container_filter(&ctx.application, ctx.pull_request_id())
    );
    let output = ctx.probe(&ctx.server, &command).await?;
    let statuses = output
        .stdout
        .lines()
        .filter_map(|line| line.trim().split_once('|'))
        .map(|(name, state)| ContainerStatus {
            name: name.to_string(),
            state: state.to_string(),
        })
        .collect();
    engine
        .store
        .save_container_status(ctx.application.id, statuses)
        .await
}

async fn post_deployment_command(ctx: &mut DeployContext) -> Result<()> {
    let Some(command) = ctx.application.post_deployment_command.clone() else {
        return Ok(());
    };
    let container = ctx.container_name.clone();
    ctx.log
        .info(format!("Running post-deployment command in {}.", container))
        .await;
    ctx.on_target(&[RemoteCommand::new(format!(
        "docker exec {} sh -c {}",
        container,
        quote(&command)
    ))])
    .await?;
    Ok(())
}

async fn save_config_hash(engine: &Engine, ctx: &DeployContext) -> Result<()> {
    if ctx.record.is_preview() {
        return Ok(());
    }
    let current = engine
        .store
        .application(ctx.application.id)
        .await?
        .configuration_hash(0);
    if current != ctx.config_hash {
        ctx.log
            .warning("Configuration changed while this deployment ran; redeploy to apply it.")
            .await;
    }
    engine
        .store
        .save_config_hash(ctx.application.id, &ctx.config_hash)
        .await
}

async fn resync_proxy(engine: &Engine, ctx: &DeployContext) -> Result<()> {
    if ctx.canary_handoff {
        return Ok(());
    }
    let Some(route) = Route::for_application(&ctx.application, ctx.pull_request_id()) else {
        return Ok(());
    };
    engine
        .proxy
        .resync(&ctx.server, &route, &ctx.container_name)
        .await
}

async fn queue_additional_servers(engine: &Engine, ctx: &DeployContext) -> Result<()> {
    if ctx.record.is_preview() || ctx.record.only_this_server {
        return Ok(());
    }
    for server_id in &ctx.application.additional_servers {
        let uuid = engine
            .queue_deployment(DeploymentRequest {
                only_this_server: true,
                rollback: ctx.record.rollback,
                force_rebuild: ctx.record.force_rebuild,
                ..DeploymentRequest::new(ctx.application.id)
                    .commit(ctx.commit.clone())
                    .server(*server_id)
            })
            .await
            .with_context(|| format!("Could not queue deployment to server {}", server_id))?;
        ctx.log
            .info(format!("Queued deployment {} to server {}.", uuid, server_id))
            .await;
    }
    Ok(())
}

async fn start_monitor(engine: &Engine, ctx: &DeployContext) -> Result<()> {
    let record = engine.store.deployment(ctx.uuid()).await?;
    if monitor::eligible(&record, &ctx.application) {
        monitor::start(engine, &record, &ctx.application).await?;
    }
    Ok(())
}

/// Marks the run finished, then performs side effects that never fail it.
///
/// Returns false when the record could not be finished, e.g. because the user
/// cancelled at the last moment.
pub async fn run(engine: &Engine, ctx: &mut DeployContext) -> bool {
    ctx.enter(Stage::PostDeploy).await;
    if let Err(e) = engine
        .store
        .transition(ctx.uuid(), DeploymentStatus::Finished)
        .await
    {
        ctx.log
            .warning(format!("Could not mark the deployment finished: {:#}", e))
            .await;
        return false;
    }
    ctx.log.info("Deployment finished.").await;

    if let Err(e) = refresh_container_status(engine, ctx).await {
        ctx.log
            .warning(format!("Could not refresh container status: {:#}", e))
            .await;
    }

    let preview_url = Route::for_application(&ctx.application, ctx.pull_request_id()).map(|r| r.url());
    pull_request_status(engine, ctx, PullRequestStatus::Finished, preview_url.as_deref()).await;

    if let Err(e) = post_deployment_command(ctx).await {
        ctx.log
            .warning(format!("Post-deployment command failed: {:#}", e))
            .await;
    }
    if let Err(e) = save_config_hash(engine, ctx).await {
        ctx.log
            .warning(format!("Could not save the configuration hash: {:#}", e))
            .await;
    }
    if let Err(e) = resync_proxy(engine, ctx).await {
        ctx.log
            .warning(format!("Proxy configuration check failed: {:#}", e))
            .await;
    }
    if let Err(e) = queue_additional_servers(engine, ctx).await {
        ctx.log.warning(format!("{:#}", e)).await;
    }
    if let Err(e) = start_monitor(engine, ctx).await {
        ctx.log
            .warning(format!("Could not start the health monitor: {:#}", e))
            .await;
    }

    engine.notifier.notify(
        ctx.application.team_id,
        Notification::DeploymentFinished {
            application: ctx.application.name.clone(),
            deployment_uuid: ctx.uuid().to_string(),
            commit: ctx.commit.clone(),
        },
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::engine::Job;
    use crate::remote::ExecOutput;
    use crate::testing::{fixtures, Harness};

    async fn in_progress(h: &Harness) -> DeployContext {
        let ctx = h.context("d1").await;
        h.store
            .transition("d1", DeploymentStatus::InProgress)
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn side_effect_failures_do_not_fail_the_deployment() {
        let h = Harness::new();
        let mut app = fixtures::application(1);
        app.post_deployment_command = Some("./notify.sh".to_string());
        h.store.put_application(app).await;
        h.executor
            .respond("./notify.sh", ExecOutput::failed(127, "not found"));
        let mut ctx = in_progress(&h).await;

        assert!(run(&h.engine, &mut ctx).await);

        let record = h.store.deployment("d1").await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Finished);
        let lines = h.store.logs("d1", None).await.unwrap();
        assert!(lines
            .iter()
            .any(|l| l.text.starts_with("Post-deployment command failed")));
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn additional_servers_get_their_own_deployments() {
        let h = Harness::new();
        h.store.put_server(fixtures::server(2)).await;
        let mut app = fixtures::application(1);
        app.additional_servers = vec![2];
        h.store.put_application(app).await;
        let mut ctx = in_progress(&h).await;

        assert!(run(&h.engine, &mut ctx).await);

        let jobs = h.scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        let Job::Deploy { deployment_uuid, .. } = &jobs[0].0 else {
            panic!("expected a deploy job");
        };
        let queued = h.store.deployment(deployment_uuid).await.unwrap();
        assert_eq!(queued.server_id, 2);
        assert!(queued.only_this_server);
        assert_eq!(queued.commit, ctx.commit);
    }

    #[tokio::test]
    async fn cancelled_record_is_not_finished() {
        let h = Harness::new();
        let mut ctx = in_progress(&h).await;
        h.engine.cancel_deployment("d1").await.unwrap();

        assert!(!run(&h.engine, &mut ctx).await);
        assert_eq!(
            h.store.deployment("d1").await.unwrap().status,
            DeploymentStatus::CancelledByUser
        );
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn configuration_hash_is_recorded() {
        let h = Harness::new();
        let mut ctx = in_progress(&h).await;
        run(&h.engine, &mut ctx).await;

        let app = h.store.application(1).await.unwrap();
        assert_eq!(app.config_hash.as_deref(), Some(ctx.config_hash.as_str()));
    }
}
