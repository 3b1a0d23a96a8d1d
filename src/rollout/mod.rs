//! Starting the new container and moving traffic onto it.

pub mod canary;
pub mod health;

use crate::compose;
use crate::deploy::context::{DeployContext, Stage};
use crate::deploy::error::DeployError;
use crate::engine::Engine;
use crate::model::{BuildPack, DeploymentStatus};
use crate::remote::{self, RemoteCommand};
use crate::traefik::Route;

/// Graceful stop window for application containers, in seconds.
const STOP_TIMEOUT: u64 = 30;

/// Containers of this application line, other than `exclude`.
pub async fn existing_containers(ctx: &DeployContext, exclude: &str) -> Result<Vec<String>, DeployError> {
    let command = format!(
        "docker ps -a {} --format '{{{{.Names}}}}'",
        compose::container_filter(&ctx.application, ctx.pull_request_id())
    );
    let output = ctx.probe(&ctx.server, &command).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != exclude)
        .map(str::to_string)
        .collect())
}

pub async fn stop_containers(ctx: &mut DeployContext, containers: &[String]) -> Result<(), DeployError> {
    if containers.is_empty() {
        return Ok(());
    }
    let commands: Vec<RemoteCommand> = containers
        .iter()
        .flat_map(|c| {
            [
                RemoteCommand::new(format!("docker stop -t {} {}", STOP_TIMEOUT, c)).ignore_errors(),
                RemoteCommand::new(format!("docker rm -f {}", c)).ignore_errors(),
            ]
        })
        .collect();
    ctx.on_target(&commands).await?;
    Ok(())
}

async fn write_staging(ctx: &mut DeployContext) -> Result<(), DeployError> {
    let staging = ctx.staging_dir();
    let compose = ctx
        .compose
        .clone()
        .ok_or_else(|| DeployError::Configuration("no compose file was generated".to_string()))?;
    let env = ctx.runtime_env.clone().unwrap_or_default();
    ctx.on_target(&[
        RemoteCommand::new(remote::write_file(&format!("{}/docker-compose.yaml", staging), &compose)),
        RemoteCommand::new(remote::write_file(&format!("{}/.env", staging), &env)).hidden(),
    ])
    .await?;
    Ok(())
}

/// Containers the compose project is running after `up`.
async fn project_containers(ctx: &DeployContext) -> Result<Vec<String>, DeployError> {
    let command = format!(
        "docker ps {} --format '{{{{.Names}}}}'",
        compose::container_filter(&ctx.application, ctx.pull_request_id())
    );
    let output = ctx.probe(&ctx.server, &command).await?;
    let mut names: Vec<String> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    Ok(names)
}

/// Marks the run live unless a cancellation got there first.
async fn go_live(ctx: &DeployContext) -> Result<(), DeployError> {
    let record = ctx
        .store
        .update_deployment(
            ctx.uuid(),
            Box::new(|d| {
                if d.status == DeploymentStatus::InProgress {
                    d.went_live = true;
                }
            }),
        )
        .await?;
    if !record.went_live {
        return Err(DeployError::Cancelled);
    }
    Ok(())
}

pub async fn run(engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    ctx.enter(Stage::Rollout).await;
    ctx.checkpoint().await?;

    let image = ctx.image();
    let pull_request_id = ctx.pull_request_id();
    let rolling = ctx.application.supports_rolling_update(pull_request_id);
    let is_compose = ctx.application.build_pack == BuildPack::Compose;

    let current = ctx.container_name.clone();
    ctx.previous_containers = existing_containers(ctx, &current).await?;

    if ctx.offloaded {
        ctx.on_target(&[RemoteCommand::new(format!("docker pull {}", image))])
            .await?;
    } else if ctx.skip_build && ctx.application.registry.is_some() {
        ctx.on_target(&[RemoteCommand::new(format!("docker pull {}", image)).ignore_errors()])
            .await?;
    }

    write_staging(ctx).await?;

    let previous = ctx.previous_containers.clone();
    if !rolling && !previous.is_empty() {
        ctx.log
            .info("Rolling update is not possible for this application; stopping the old container first.")
            .await;
        stop_containers(ctx, &previous).await?;
    }

    let staging = ctx.staging_dir();
    let project = if is_compose {
        ctx.application.container_base_name(pull_request_id)
    } else {
        current.clone()
    };
    ctx.log.info(format!("Starting {}.", project)).await;
    ctx.on_target(&[RemoteCommand::new(format!(
        "docker compose --project-name {} -f {}/docker-compose.yaml up -d --no-build",
        project, staging
    ))])
    .await?;

    ctx.started_containers = if is_compose {
        project_containers(ctx).await?
    } else {
        vec![current]
    };
    let Some(primary) = ctx.started_containers.first().cloned() else {
        return Err(DeployError::HealthCheck {
            container: project,
            reason: "the compose project started no containers".to_string(),
        });
    };
    ctx.container_name = primary.clone();

    let recorded = primary.clone();
    ctx.store
        .update_deployment(
            ctx.uuid(),
            Box::new(move |d| d.container_name = Some(recorded)),
        )
        .await?;

    for container in ctx.started_containers.clone() {
        health::wait_until_healthy(ctx, &container).await?;
    }
    go_live(ctx).await?;

    let route = Route::for_application(&ctx.application, pull_request_id);
    if rolling && canary::eligible(ctx, route.as_ref()) {
        let mut stable = None;
        for candidate in &previous {
            if canary::is_running(ctx.executor.as_ref(), &ctx.server, candidate).await? {
                stable = Some(candidate.clone());
                break;
            }
        }
        if let (Some(route), Some(stable)) = (route.as_ref(), stable) {
            return canary::handoff(engine, ctx, route, &stable).await;
        }
        ctx.log
            .info("No running stable container to compare against; skipping the canary.")
            .await;
    }

    if let Some(route) = &route {
        engine
            .proxy
            .set_upstream(&ctx.server, route, &primary)
            .await?;
        ctx.log.info(format!("Traffic now goes to {}.", route.url())).await;
    }

    if rolling && !previous.is_empty() {
        ctx.log
            .info(format!("Removing {} old container(s).", previous.len()))
            .await;
        stop_containers(ctx, &previous).await?;
    }
    Ok(())
}
