//! Readiness of a freshly started container.

use tokio::time::Instant;

use crate::deploy::context::DeployContext;
use crate::deploy::error::DeployError;
use crate::model::application::HealthCheckConfig;
use crate::remote::RemoteCommand;

const INSPECT_STATE: &str = "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";

/// Shell snippet the container runs as its health check.
///
/// Uses the first HTTP client present in the image and falls back to a bare
/// TCP connect when there is none.
pub fn probe_command(check: &HealthCheckConfig, port: u16) -> String {
    let url = format!(
        "{}://{}:{}{}",
        check.scheme, check.host, port, check.path
    );
    format!(
        "if command -v curl >/dev/null 2>&1; then curl -sf -o /dev/null {url}; \
         elif command -v wget >/dev/null 2>&1; then wget -q --spider {url}; \
         elif command -v nc >/dev/null 2>&1; then nc -z {host} {port}; \
         else bash -c ':> /dev/tcp/{host}/{port}'; fi",
        url = url,
        host = check.host,
        port = port
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    Failed(String),
}

/// Interprets one `docker inspect` sample.
pub fn readiness(health_check_enabled: bool, sample: &str) -> Readiness {
    let (state, health) = sample.trim().split_once('|').unwrap_or((sample.trim(), ""));
    match state {
        "exited" | "dead" => return Readiness::Failed(format!("container {}", state)),
        "" => return Readiness::Failed("container not found".to_string()),
        _ => {}
    }
    if health_check_enabled {
        match health {
            "healthy" => Readiness::Ready,
            "unhealthy" => Readiness::Failed("health check reported unhealthy".to_string()),
            _ => Readiness::Waiting,
        }
    } else if state == "running" {
        Readiness::Ready
    } else {
        Readiness::Waiting
    }
}

/// Polls the new container until it is ready, fails, or the timeout passes.
pub async fn wait_until_healthy(ctx: &mut DeployContext, container: &str) -> Result<(), DeployError> {
    let enabled = ctx.application.health_check.enabled;
    let interval = ctx.settings.health_poll_interval;
    let deadline = Instant::now() + ctx.settings.health_timeout;
    let command = format!("docker inspect --format '{}' {}", INSPECT_STATE, container);
    let server = ctx.server.clone();

    if enabled {
        ctx.log
            .info(format!("Waiting for {} to report healthy.", container))
            .await;
    } else {
        ctx.log
            .info(format!(
                "No health check configured; waiting for {} to be running.",
                container
            ))
            .await;
    }

    let mut last = String::new();
    loop {
        ctx.checkpoint().await?;
        let output = ctx.probe(&server, &command).await?;
        let sample = if output.success() {
            output.stdout.trim().to_string()
        } else {
            String::new()
        };
        if sample != last {
            ctx.log.debug(format!("{}: {}", container, sample)).await;
            last = sample.clone();
        }

        match readiness(enabled, &sample) {
            Readiness::Ready => {
                ctx.log.info(format!("{} is ready.", container)).await;
                return Ok(());
            }
            Readiness::Failed(reason) => return Err(unhealthy(ctx, container, reason).await),
            Readiness::Waiting => {}
        }

        if Instant::now() >= deadline {
            let reason = format!(
                "not ready after {}s",
                ctx.settings.health_timeout.as_secs()
            );
            return Err(unhealthy(ctx, container, reason).await);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn unhealthy(ctx: &mut DeployContext, container: &str, reason: String) -> DeployError {
    ctx.log
        .warning(format!("{} failed to become ready: {}. Last log lines:", container, reason))
        .await;
    let tail = RemoteCommand::new(format!("docker logs --tail 20 {} 2>&1", container)).ignore_errors();
    if let Err(e) = ctx.on_target(&[tail]).await {
        ctx.log
            .warning(format!("Could not read container logs: {}", e))
            .await;
    }
    DeployError::HealthCheck {
        container: container.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExecOutput;
    use crate::testing::{fixtures, FakeExecutor};

    #[test]
    fn health_command_prefers_http_clients_and_falls_back_to_tcp() {
        let check = HealthCheckConfig {
            path: "/up".to_string(),
            ..Default::default()
        };
        let cmd = probe_command(&check, 3000);
        let curl = cmd.find("curl -sf -o /dev/null http://localhost:3000/up").unwrap();
        let wget = cmd.find("wget -q --spider http://localhost:3000/up").unwrap();
        let nc = cmd.find("nc -z localhost 3000").unwrap();
        let tcp = cmd.find("/dev/tcp/localhost/3000").unwrap();
        assert!(curl < wget && wget < nc && nc < tcp);
    }

    #[test]
    fn readiness_depends_on_health_check() {
        assert_eq!(readiness(false, "running|"), Readiness::Ready);
        assert_eq!(readiness(false, "created|"), Readiness::Waiting);
        assert_eq!(readiness(true, "running|starting"), Readiness::Waiting);
        assert_eq!(readiness(true, "running|healthy"), Readiness::Ready);
        assert!(matches!(readiness(true, "running|unhealthy"), Readiness::Failed(_)));
        assert!(matches!(readiness(false, "exited|"), Readiness::Failed(_)));
        assert!(matches!(readiness(false, ""), Readiness::Failed(_)));
    }

    #[tokio::test]
    async fn waits_through_starting_until_healthy() {
        let executor = FakeExecutor::new();
        executor.respond_seq(
            "docker inspect --format '{{.State.Status}}",
            vec![
                ExecOutput::ok("running|starting\n"),
                ExecOutput::ok("running|starting\n"),
                ExecOutput::ok("running|healthy\n"),
            ],
        );
        let mut ctx = fixtures::context_with(executor.clone()).await;
        ctx.application.health_check.enabled = true;

        wait_until_healthy(&mut ctx, "shop-new").await.unwrap();
        assert_eq!(executor.count_matching("docker inspect"), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_timeout() {
        let executor = FakeExecutor::new();
        executor.respond(
            "docker inspect --format '{{.State.Status}}",
            ExecOutput::ok("running|starting\n"),
        );
        let mut ctx = fixtures::context_with(executor.clone()).await;
        ctx.application.health_check.enabled = true;
        ctx.settings.health_timeout = std::time::Duration::from_millis(20);

        let err = wait_until_healthy(&mut ctx, "shop-new").await.unwrap_err();
        assert_eq!(err.code(), "health_check_failed");
        assert_eq!(executor.count_matching("docker logs --tail 20 shop-new"), 1);
    }
}
