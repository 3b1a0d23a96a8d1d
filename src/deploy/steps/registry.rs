use crate::deploy::context::{DeployContext, Stage};
use crate::deploy::error::DeployError;
use crate::engine::Engine;
use crate::model::{BuildPack, DeploymentStatus};
use crate::remote::RemoteCommand;

/// Why an existing image may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseReason {
    Rollback,
    RestartOnly,
    OnlyThisServer,
    UnchangedConfiguration,
}

async fn reuse_reason(ctx: &DeployContext) -> Result<Option<ReuseReason>, DeployError> {
    if ctx.record.rollback {
        return Ok(Some(ReuseReason::Rollback));
    }
    if ctx.record.restart_only {
        return Ok(Some(ReuseReason::RestartOnly));
    }
    if ctx.record.only_this_server {
        return Ok(Some(ReuseReason::OnlyThisServer));
    }
    if ctx.application.config_hash.as_deref() != Some(ctx.config_hash.as_str()) {
        return Ok(None);
    }
    let deployed_before = ctx
        .store
        .deployments_for_application(ctx.application.id)
        .await?
        .iter()
        .any(|d| {
            d.id != ctx.record.id
                && d.status == DeploymentStatus::Finished
                && d.server_id == ctx.server.id
                && d.pull_request_id == ctx.record.pull_request_id
        });
    Ok(deployed_before.then_some(ReuseReason::UnchangedConfiguration))
}

/// Whether the tagged image is already on the target or in the registry.
pub async fn image_available(ctx: &DeployContext) -> Result<bool, DeployError> {
    let image = ctx.image();
    let local = ctx
        .probe(&ctx.server, &format!("docker images -q {}", image))
        .await?;
    if local.success() && !local.stdout.trim().is_empty() {
        return Ok(true);
    }
    if ctx.application.registry.is_some() {
        let remote = ctx
            .probe(&ctx.server, &format!("docker manifest inspect {} >/dev/null 2>&1", image))
            .await?;
        return Ok(remote.success());
    }
    Ok(false)
}

/// Decides whether the build can be skipped for this run.
pub async fn skip_check(ctx: &mut DeployContext) -> Result<bool, DeployError> {
    if ctx.record.force_rebuild {
        return Ok(false);
    }
    if matches!(ctx.application.build_pack, BuildPack::Image | BuildPack::Compose) {
        return Ok(false);
    }
    let Some(reason) = reuse_reason(ctx).await? else {
        return Ok(false);
    };
    if !image_available(ctx).await? {
        if reason != ReuseReason::UnchangedConfiguration {
            ctx.log
                .info(format!("Image {} not found; building it.", ctx.image()))
                .await;
        }
        return Ok(false);
    }
    ctx.log
        .info(format!("Image {} already exists; skipping the build.", ctx.image()))
        .await;
    Ok(true)
}

/// Pushes the freshly built image when the application has a registry.
pub async fn push(_engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    if ctx.application.registry.is_none()
        || ctx.skip_build
        || matches!(ctx.application.build_pack, BuildPack::Image | BuildPack::Compose)
    {
        return Ok(());
    }
    ctx.enter(Stage::RegistryPush).await;
    ctx.checkpoint().await?;

    let image = ctx.image();
    ctx.log.info(format!("Pushing {}.", image)).await;
    match ctx
        .in_helper(&[RemoteCommand::new(format!("docker push {}", image))])
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_transport() => Err(e.into()),
        Err(e) => Err(DeployError::RegistryPush { image, source: e }),
    }
}
