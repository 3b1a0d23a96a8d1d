use crate::compose::env;
use crate::deploy::context::{DeployContext, Stage};
use crate::deploy::error::{build_failure, DeployError};
use crate::engine::Engine;
use crate::model::BuildPack;
use crate::remote::RemoteCommand;

/// Inputs of a `docker build` invocation.
#[derive(Debug, Clone)]
pub struct DockerBuild {
    pub image: String,
    pub context_dir: String,
    pub dockerfile: String,
    pub build_env: String,
    pub secret_keys: Vec<String>,
    pub secrets_hash: String,
    pub buildkit: bool,
    pub no_cache: bool,
}

impl DockerBuild {
    /// Build secrets go in as BuildKit secret mounts when available and as
    /// build arguments otherwise; either way the values come from the sourced
    /// env file, never from the command line.
    pub fn command(&self) -> String {
        let mut cmd = format!(
            "cd {} && set -a && . {} && set +a && ",
            self.context_dir, self.build_env
        );
        if self.buildkit {
            cmd.push_str("DOCKER_BUILDKIT=1 docker buildx build --load --progress plain");
            for key in &self.secret_keys {
                cmd.push_str(&format!(" --secret id={k},env={k}", k = key));
            }
        } else {
            cmd.push_str("docker build");
            for key in &self.secret_keys {
                cmd.push_str(&format!(" --build-arg {}", key));
            }
            if !self.secret_keys.is_empty() {
                cmd.push_str(&format!(
                    " --build-arg BERTH_BUILD_SECRETS_HASH={}",
                    self.secrets_hash
                ));
            }
        }
        if self.no_cache {
            cmd.push_str(" --no-cache");
        }
        cmd.push_str(&format!(
            " --network host -f {}{} -t {} {}",
            self.context_dir, self.dockerfile, self.image, self.context_dir
        ));
        cmd
    }
}

fn no_cache(ctx: &DeployContext) -> bool {
    !ctx.application.settings.build_cache || ctx.record.force_rebuild
}

fn docker_build(ctx: &DeployContext) -> DockerBuild {
    let vars = env::build_time_vars(&ctx.application, ctx.pull_request_id());
    DockerBuild {
        image: ctx.image(),
        context_dir: ctx.source_dir(),
        dockerfile: ctx.dockerfile_location.clone(),
        build_env: ctx.build_env_path(),
        secret_keys: vars.iter().map(|v| v.key.clone()).collect(),
        secrets_hash: env::secrets_hash(&vars),
        buildkit: ctx.buildkit,
        no_cache: no_cache(ctx),
    }
}

fn nixpacks_build(ctx: &DeployContext) -> String {
    let vars = env::build_time_vars(&ctx.application, ctx.pull_request_id());
    let mut cmd = format!(
        "cd {} && set -a && . {} && set +a && nixpacks build . --name {}",
        ctx.source_dir(),
        ctx.build_env_path(),
        ctx.image()
    );
    for var in vars {
        cmd.push_str(&format!(" --env \"{k}=${k}\"", k = var.key));
    }
    if no_cache(ctx) {
        cmd.push_str(" --no-cache");
    }
    cmd
}

fn compose_build(ctx: &DeployContext) -> String {
    let mut cmd = format!(
        "cd {dir} && docker compose --project-name {project} --env-file {env} -f {dir}{file} build",
        dir = ctx.source_dir(),
        project = ctx.application.container_base_name(ctx.pull_request_id()),
        env = ctx.build_env_path(),
        file = ctx.application.compose_location
    );
    if no_cache(ctx) {
        cmd.push_str(" --no-cache");
    }
    cmd
}

pub async fn run(_engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    if ctx.skip_build {
        return Ok(());
    }
    ctx.enter(Stage::Build).await;
    ctx.checkpoint().await?;

    let image = ctx.image();
    match ctx.application.build_pack {
        BuildPack::Image => {
            ctx.log.info(format!("Pulling {}.", image)).await;
            ctx.on_target(&[RemoteCommand::new(format!("docker pull {}", image))])
                .await
                .map_err(build_failure)?;
            return Ok(());
        }
        BuildPack::Dockerfile | BuildPack::Static => {
            let build = docker_build(ctx);
            ctx.log
                .info(format!(
                    "Building {} with {}.",
                    image,
                    if build.buildkit { "BuildKit" } else { "the classic builder" }
                ))
                .await;
            ctx.in_helper(&[RemoteCommand::new(build.command())])
                .await
                .map_err(build_failure)?;
        }
        BuildPack::Nixpacks => {
            ctx.log.info(format!("Building {} with Nixpacks.", image)).await;
            let cmd = nixpacks_build(ctx);
            ctx.in_helper(&[RemoteCommand::new(cmd)])
                .await
                .map_err(build_failure)?;
        }
        BuildPack::Compose => {
            ctx.log.info("Building compose services.").await;
            let cmd = compose_build(ctx);
            ctx.in_helper(&[RemoteCommand::new(cmd)])
                .await
                .map_err(build_failure)?;
        }
    }

    let build_env = ctx.build_env_path();
    ctx.in_helper(&[RemoteCommand::new(format!("rm -f {}", build_env)).ignore_errors()])
        .await?;
    Ok(())
}
