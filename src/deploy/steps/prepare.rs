use crate::compose;
use crate::deploy::context::{DeployContext, Stage};
use crate::deploy::error::DeployError;
use crate::engine::Engine;
use crate::integrations::PullRequestStatus;
use crate::remote::{quote, RemoteCommand};

/// `docker run` line for the helper container of this deployment.
pub fn helper_run_command(ctx: &DeployContext) -> String {
    let mut cmd = format!(
        "docker run -d --rm --network {} --name {} -v /var/run/docker.sock:/var/run/docker.sock",
        ctx.application.network,
        ctx.helper()
    );
    if ctx.application.registry.as_ref().is_some_and(|r| r.credentials) {
        cmd.push_str(" -v /root/.docker/config.json:/root/.config/docker/config.json:ro");
    }
    cmd.push(' ');
    cmd.push_str(&ctx.settings.helper_image);
    cmd
}

/// Reports the deployment to the pull request; failures only warn.
pub async fn pull_request_status(
    engine: &Engine,
    ctx: &DeployContext,
    status: PullRequestStatus,
    preview_url: Option<&str>,
) {
    if !ctx.record.is_preview() {
        return;
    }
    let Some(git) = &ctx.application.git else {
        return;
    };
    if let Err(e) = engine
        .git_host
        .update_pull_request_status(&git.repository, ctx.pull_request_id(), status, preview_url)
        .await
    {
        ctx.log
            .warning(format!("Could not update pull request status: {:#}", e))
            .await;
    }
}

async fn running_container(ctx: &DeployContext) -> Result<Option<String>, DeployError> {
    let command = format!(
        "docker ps {} --format '{{{{.Names}}}}'",
        compose::container_filter(&ctx.application, ctx.pull_request_id())
    );
    let output = ctx.probe(&ctx.server, &command).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string))
}

async fn pre_deployment_command(ctx: &mut DeployContext) -> Result<(), DeployError> {
    let Some(command) = ctx.application.pre_deployment_command.clone() else {
        return Ok(());
    };
    let Some(container) = running_container(ctx).await? else {
        ctx.log
            .info("No running container for the pre-deployment command; skipping it.")
            .await;
        return Ok(());
    };
    ctx.log
        .info(format!("Running pre-deployment command in {}.", container))
        .await;
    ctx.on_target(&[RemoteCommand::new(format!(
        "docker exec {} sh -c {}",
        container,
        quote(&command)
    ))])
    .await?;
    Ok(())
}

pub async fn run(engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    ctx.enter(Stage::Prepare).await;
    ctx.log
        .info(format!(
            "Deploying {} ({}) to {}.",
            ctx.application.name,
            ctx.record.short_commit(),
            ctx.server.name
        ))
        .await;
    if ctx.offloaded {
        ctx.log
            .info(format!("Building on {}.", ctx.builder.name))
            .await;
    }
    pull_request_status(engine, ctx, PullRequestStatus::InProgress, None).await;

    let builder = ctx.builder.clone();
    let buildkit = ctx.probe(&builder, "docker buildx version").await?;
    ctx.buildkit = buildkit.success();
    if !ctx.buildkit {
        ctx.log
            .info("BuildKit is not available; build secrets fall back to build arguments.")
            .await;
    }

    let network = ctx.application.network.clone();
    ctx.on_target(&[RemoteCommand::new(format!(
        "docker network inspect {n} >/dev/null 2>&1 || docker network create --attachable {n}",
        n = network
    ))])
    .await?;

    ctx.checkpoint().await?;

    let helper = ctx.helper().to_string();
    let stop_timeout = ctx.settings.helper_stop_timeout;
    ctx.on_builder(&[
        RemoteCommand::new(format!("docker stop -t {} {} >/dev/null 2>&1", stop_timeout, helper))
            .ignore_errors(),
        RemoteCommand::new(format!("docker rm -f {} >/dev/null 2>&1", helper)).ignore_errors(),
    ])
    .await?;

    let run_helper = helper_run_command(ctx);
    ctx.on_builder(&[RemoteCommand::new(run_helper)]).await?;
    ctx.helper_started = true;

    let workdir = ctx.workdir();
    ctx.in_helper(&[RemoteCommand::new(format!("mkdir -p {}", workdir))])
        .await?;

    pre_deployment_command(ctx).await
}
