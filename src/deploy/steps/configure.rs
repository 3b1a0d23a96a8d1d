use crate::compose::{self, env};
use crate::deploy::context::{DeployContext, Stage};
use crate::deploy::error::DeployError;
use crate::engine::Engine;
use crate::model::BuildPack;
use crate::remote::{self, RemoteCommand};

/// Dockerfile generated for static sites, relative to the source directory.
pub const STATIC_DOCKERFILE: &str = "/Dockerfile.berth";

pub async fn run(_engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    ctx.enter(Stage::ConfigGenerate).await;
    let app = ctx.application.clone();
    let pull_request_id = ctx.pull_request_id();

    let build_vars = env::build_time_vars(&app, pull_request_id);
    for warning in env::lint_build_env(&build_vars) {
        ctx.log.warning(warning).await;
    }

    if app.build_pack != BuildPack::Image && !ctx.skip_build {
        let contents = env::render_build_env(&build_vars);
        let path = ctx.build_env_path();
        ctx.in_helper(&[RemoteCommand::new(remote::write_file(&path, &contents)).hidden()])
            .await?;
    }

    if app.build_pack == BuildPack::Static && !ctx.skip_build {
        let path = format!("{}{}", ctx.source_dir(), STATIC_DOCKERFILE);
        let dockerfile = compose::static_dockerfile(&app.publish_directory);
        ctx.in_helper(&[RemoteCommand::new(remote::write_file(&path, &dockerfile))])
            .await?;
        ctx.dockerfile_location = STATIC_DOCKERFILE.to_string();
    }

    let image = ctx.image();
    let compose_file = if app.build_pack == BuildPack::Compose {
        let path = format!("{}{}", ctx.source_dir(), app.compose_location);
        ctx.in_helper(&[RemoteCommand::new(format!("cat {}", path)).hidden()])
            .await?
    } else {
        let service = compose::service_for(&app, &ctx.record, &image, &ctx.container_name);
        compose::render(&service, ctx.uuid())?
    };
    ctx.compose = Some(compose_file);

    let runtime = env::runtime_vars(&app, pull_request_id, &ctx.commit, &ctx.container_name);
    ctx.runtime_env = Some(env::render_runtime_env(&runtime));
    Ok(())
}
