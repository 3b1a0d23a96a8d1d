use crate::deploy::context::{DeployContext, Stage};
use crate::deploy::error::DeployError;
use crate::engine::Engine;
use crate::remote::{quote, RemoteCommand};

const GIT_SSH: &str = "GIT_SSH_COMMAND=\"ssh -o StrictHostKeyChecking=accept-new\"";

/// Strips a base directory that was repeated in the Dockerfile location.
///
/// With base `/api`, `/api/Dockerfile` would resolve to `/api/api/Dockerfile`;
/// returns the corrected `/Dockerfile` in that case.
pub fn normalize_dockerfile_location(base_directory: &str, location: &str) -> Option<String> {
    let base = base_directory.trim_matches('/');
    if base.is_empty() {
        return None;
    }
    let prefix = format!("{}/", base);
    location
        .trim_start_matches('/')
        .strip_prefix(&prefix)
        .map(|rest| format!("/{}", rest))
}

/// Commit id from `git ls-remote` output for `reference`.
pub fn parse_ls_remote(output: &str, reference: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let sha = parts.next()?;
        (parts.next()? == reference).then(|| sha.to_string())
    })
}

pub async fn run(_engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    if !ctx.application.build_pack.uses_git() {
        return Ok(());
    }
    ctx.enter(Stage::SourceAcquire).await;

    let git = ctx
        .application
        .git
        .clone()
        .ok_or_else(|| DeployError::Configuration("application has no git repository".to_string()))?;
    let url = quote(&git.clone_url());
    let pull_request_id = ctx.pull_request_id();

    if ctx.commit.is_empty() || ctx.commit == "HEAD" {
        let reference = if pull_request_id > 0 {
            format!("refs/pull/{}/head", pull_request_id)
        } else {
            format!("refs/heads/{}", git.branch)
        };
        let output = ctx
            .in_helper(&[RemoteCommand::new(format!(
                "{} git ls-remote {} {}",
                GIT_SSH, url, reference
            ))])
            .await?;
        let commit = parse_ls_remote(&output, &reference).ok_or_else(|| {
            DeployError::Configuration(format!("{} not found in {}", reference, git.repository))
        })?;
        ctx.log
            .info(format!("Resolved {} to {}.", reference, commit))
            .await;
        ctx.commit = commit.clone();
        ctx.store
            .update_deployment(ctx.uuid(), Box::new(move |d| d.commit = commit))
            .await?;
    }

    ctx.checkpoint().await?;

    let workdir = ctx.workdir();
    let mut commands = vec![RemoteCommand::new(format!(
        "{} git clone -q -b {} {} {}",
        GIT_SSH,
        quote(&git.branch),
        url,
        workdir
    ))];
    if pull_request_id > 0 {
        commands.push(RemoteCommand::new(format!(
            "cd {} && {} git fetch -q origin pull/{}/head:pr-{}",
            workdir, GIT_SSH, pull_request_id, pull_request_id
        )));
    }
    commands.push(RemoteCommand::new(format!(
        "cd {} && git -c advice.detachedHead=false checkout -q {}",
        workdir, ctx.commit
    )));
    commands.push(RemoteCommand::new(format!(
        "cd {} && if [ -f .gitmodules ]; then {} git submodule update -q --init --recursive; fi",
        workdir, GIT_SSH
    )));
    ctx.log
        .info(format!("Cloning {} at {}.", git.repository, ctx.commit))
        .await;
    ctx.in_helper(&commands).await?;

    if let Some(fixed) =
        normalize_dockerfile_location(&ctx.application.base_directory, &ctx.dockerfile_location)
    {
        ctx.log
            .warning(format!(
                "Dockerfile location {} repeats the base directory {}; using {}.",
                ctx.dockerfile_location, ctx.application.base_directory, fixed
            ))
            .await;
        ctx.dockerfile_location = fixed;
    }
    Ok(())
}
