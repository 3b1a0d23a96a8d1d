//! Progressive traffic shifting from the stable container to a new one.
//!
//! After the handoff the deploy job is done; each step is a separate
//! [`Job::CanaryTick`] that re-reads the record, observes both containers,
//! and either advances, holds, promotes or rolls back.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::deploy::context::DeployContext;
use crate::deploy::error::DeployError;
use crate::deploy::log::DeploymentLog;
use crate::engine::{Engine, Job};
use crate::integrations::Notification;
use crate::model::application::CanaryConfig;
use crate::model::{DeploymentRecord, Server};
use crate::remote::{ExecOptions, RemoteError, RemoteExecutor};
use crate::traefik::Route;

/// Consecutive failing ticks that abort the canary.
pub const FAILURES_BEFORE_ROLLBACK: u32 = 2;

static SERVER_ERROR_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:HTTP/\d(?:\.\d)?"?\s+5\d{2}\b|"\s+5\d{2}\s|\bstatus"?\s*[=:]\s*"?5\d{2}\b)"#).ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    Running,
    Promoted,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryRollbackReason {
    ContainerUnhealthy,
    ErrorRateExceeded,
}

impl fmt::Display for CanaryRollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CanaryRollbackReason::ContainerUnhealthy => "container_unhealthy",
            CanaryRollbackReason::ErrorRateExceeded => "error_rate_exceeded",
        };
        f.write_str(s)
    }
}

/// Persisted on the deployment record between ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryState {
    pub stable: String,
    pub canary: String,
    /// Index into the configured steps
    pub current_step: usize,
    /// Percent of traffic on the canary
    pub current_weight: u8,
    pub consecutive_failures: u32,
    pub status: CanaryStatus,
    pub rollback_reason: Option<CanaryRollbackReason>,
}

impl CanaryState {
    pub fn start(stable: impl Into<String>, canary: impl Into<String>, weight: u8) -> Self {
        Self {
            stable: stable.into(),
            canary: canary.into(),
            current_step: 0,
            current_weight: weight,
            consecutive_failures: 0,
            status: CanaryStatus::Running,
            rollback_reason: None,
        }
    }

    pub fn upstreams(&self) -> Vec<(String, u8)> {
        vec![
            (self.stable.clone(), 100 - self.current_weight),
            (self.canary.clone(), self.current_weight),
        ]
    }
}

/// What one tick saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub stable_alive: bool,
    pub canary_alive: bool,
    pub error_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Advance { step: usize, weight: u8 },
    Promote,
    Hold { consecutive_failures: u32 },
    Rollback(CanaryRollbackReason),
}

/// Next move of the state machine. Weights only ever grow.
pub fn evaluate(state: &CanaryState, config: &CanaryConfig, observed: Observation) -> Decision {
    let failure = if !observed.stable_alive || !observed.canary_alive {
        Some(CanaryRollbackReason::ContainerUnhealthy)
    } else if observed.error_count >= config.error_threshold {
        Some(CanaryRollbackReason::ErrorRateExceeded)
    } else {
        None
    };

    if let Some(reason) = failure {
        let failures = state.consecutive_failures + 1;
        return if failures >= FAILURES_BEFORE_ROLLBACK {
            Decision::Rollback(reason)
        } else {
            Decision::Hold {
                consecutive_failures: failures,
            }
        };
    }

    let next = state.current_step + 1;
    match config.steps.get(next) {
        Some(&weight) if weight < 100 && weight > state.current_weight => Decision::Advance {
            step: next,
            weight,
        },
        _ => Decision::Promote,
    }
}

/// Lines of `logs` that look like a 5xx response.
pub fn count_server_errors(logs: &str) -> usize {
    let Some(re) = SERVER_ERROR_REGEX.as_ref() else {
        return 0;
    };
    logs.lines().filter(|line| re.is_match(line)).count()
}

/// Whether a deployment may hand its traffic over progressively.
pub fn eligible(ctx: &DeployContext, route: Option<&Route>) -> bool {
    let config = &ctx.application.settings.canary;
    config.enabled
        && route.is_some()
        && !ctx.record.rollback
        && ctx.application.supports_rolling_update(ctx.pull_request_id())
        && config.steps.first().is_some_and(|w| *w < 100)
}

pub async fn is_running(
    executor: &dyn RemoteExecutor,
    server: &Server,
    container: &str,
) -> Result<bool, RemoteError> {
    let output = executor
        .exec(
            server,
            &format!("docker inspect --format '{{{{.State.Running}}}}' {}", container),
            &ExecOptions::default(),
        )
        .await?;
    Ok(output.success() && output.stdout.trim() == "true")
}

/// Starts the canary at the first step and schedules the first tick.
pub async fn handoff(
    engine: &Engine,
    ctx: &mut DeployContext,
    route: &Route,
    stable: &str,
) -> Result<(), DeployError> {
    let config = ctx.application.settings.canary.clone();
    let weight = config.steps.first().copied().unwrap_or(100);
    let state = CanaryState::start(stable, ctx.container_name.clone(), weight);

    engine
        .proxy
        .set_weighted_upstream(&ctx.server, route, &state.upstreams())
        .await?;

    let saved = state.clone();
    ctx.store
        .update_deployment(ctx.uuid(), Box::new(move |d| d.canary = Some(saved)))
        .await?;
    ctx.canary_handoff = true;
    ctx.log
        .info(format!(
            "Canary started: {}% of traffic to {}, {}% stays on {}.",
            weight,
            state.canary,
            100 - weight,
            state.stable
        ))
        .await;

    engine.scheduler.dispatch(
        Job::CanaryTick {
            deployment_uuid: ctx.uuid().to_string(),
        },
        Duration::from_secs(config.step_duration),
    );
    Ok(())
}

async fn remove_container(engine: &Engine, server: &Server, container: &str, log: &DeploymentLog) {
    let command = format!("docker stop -t 30 {c} >/dev/null 2>&1; docker rm -f {c}", c = container);
    if let Err(e) = engine
        .executor
        .exec(server, &command, &ExecOptions::default())
        .await
    {
        log.warning(format!("Could not remove {}: {}", container, e))
            .await;
    }
}

async fn error_count(engine: &Engine, server: &Server, state: &CanaryState, window: u64, log: &DeploymentLog) -> usize {
    let command = format!("docker logs --since {}s {} 2>&1", window, state.canary);
    match engine
        .executor
        .exec(server, &command, &ExecOptions::default())
        .await
    {
        Ok(output) if output.success() => count_server_errors(&output.stdout),
        Ok(output) => {
            log.warning(format!(
                "Could not read canary logs ({}); counting zero errors.",
                output.stderr.trim()
            ))
            .await;
            0
        }
        Err(e) => {
            log.warning(format!("Could not read canary logs ({}); counting zero errors.", e))
                .await;
            0
        }
    }
}

fn next_tick(engine: &Engine, record: &DeploymentRecord, config: &CanaryConfig) {
    engine.scheduler.dispatch(
        Job::CanaryTick {
            deployment_uuid: record.deployment_uuid.clone(),
        },
        Duration::from_secs(config.step_duration),
    );
}

async fn save_state(engine: &Engine, uuid: &str, state: CanaryState, container: Option<String>) -> Result<()> {
    engine
        .store
        .update_deployment(
            uuid,
            Box::new(move |d| {
                d.canary = Some(state);
                if let Some(container) = container {
                    d.container_name = Some(container);
                }
            }),
        )
        .await?;
    Ok(())
}

/// One observation and step of a running canary.
pub async fn tick(engine: &Engine, uuid: &str) -> Result<()> {
    let record = engine.store.deployment(uuid).await?;
    let Some(mut state) = record.canary.clone() else {
        debug!("Deployment {} has no canary", uuid);
        return Ok(());
    };
    if state.status != CanaryStatus::Running {
        return Ok(());
    }

    let app = engine.store.application(record.application_id).await?;
    let server = engine.store.server(record.server_id).await?;
    let config = app.settings.canary.clone();
    let log = DeploymentLog::new(engine.store.clone(), uuid);
    let Some(route) = Route::for_application(&app, record.pull_request_id) else {
        log.warning("Application has no route anymore; stopping the canary.")
            .await;
        return Ok(());
    };

    let alive = async {
        let stable = is_running(engine.executor.as_ref(), &server, &state.stable).await?;
        let canary = is_running(engine.executor.as_ref(), &server, &state.canary).await?;
        Ok::<_, RemoteError>((stable, canary))
    };
    let (stable_alive, canary_alive) = match alive.await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Canary tick for {} could not reach {}: {}", uuid, server.name, e);
            log.warning(format!("Canary check could not reach the server ({}); retrying.", e))
                .await;
            next_tick(engine, &record, &config);
            return Ok(());
        }
    };
    let errors = if canary_alive {
        error_count(engine, &server, &state, config.log_window, &log).await
    } else {
        0
    };
    let observed = Observation {
        stable_alive,
        canary_alive,
        error_count: errors,
    };

    match evaluate(&state, &config, observed) {
        Decision::Advance { step, weight } => {
            let mut next = state.clone();
            next.current_step = step;
            next.current_weight = weight;
            next.consecutive_failures = 0;
            if let Err(e) = engine
                .proxy
                .set_weighted_upstream(&server, &route, &next.upstreams())
                .await
            {
                log.warning(format!("Could not shift traffic: {:#}; retrying.", e))
                    .await;
                next_tick(engine, &record, &config);
                return Ok(());
            }
            save_state(engine, uuid, next, None).await?;
            log.info(format!(
                "Canary healthy ({} errors); {}% of traffic to {}.",
                errors, weight, state.canary
            ))
            .await;
            next_tick(engine, &record, &config);
        }
        Decision::Hold {
            consecutive_failures,
        } => {
            state.consecutive_failures = consecutive_failures;
            save_state(engine, uuid, state.clone(), None).await?;
            log.warning(format!(
                "Canary check failed ({}/{}): stable alive {}, canary alive {}, {} errors. Holding at {}%.",
                consecutive_failures,
                FAILURES_BEFORE_ROLLBACK,
                stable_alive,
                canary_alive,
                errors,
                state.current_weight
            ))
            .await;
            next_tick(engine, &record, &config);
        }
        Decision::Promote => {
            if let Err(e) = engine.proxy.set_upstream(&server, &route, &state.canary).await {
                log.warning(format!("Could not promote canary: {:#}; retrying.", e))
                    .await;
                next_tick(engine, &record, &config);
                return Ok(());
            }
            remove_container(engine, &server, &state.stable, &log).await;
            state.current_step = config.steps.len().saturating_sub(1);
            state.current_weight = 100;
            state.consecutive_failures = 0;
            state.status = CanaryStatus::Promoted;
            let canary = state.canary.clone();
            save_state(engine, uuid, state, Some(canary.clone())).await?;
            log.info(format!("Canary promoted: {} serves all traffic.", canary))
                .await;
            engine.notifier.notify(
                app.team_id,
                Notification::CanaryPromoted {
                    application: app.name.clone(),
                    deployment_uuid: uuid.to_string(),
                },
            );
        }
        Decision::Rollback(reason) => {
            if let Err(e) = engine.proxy.set_upstream(&server, &route, &state.stable).await {
                log.warning(format!("Could not restore traffic to {}: {:#}; retrying.", state.stable, e))
                    .await;
                next_tick(engine, &record, &config);
                return Ok(());
            }
            remove_container(engine, &server, &state.canary, &log).await;
            state.status = CanaryStatus::RolledBack;
            state.rollback_reason = Some(reason);
            state.consecutive_failures += 1;
            let stable = state.stable.clone();
            save_state(engine, uuid, state, Some(stable.clone())).await?;
            log.warning(format!(
                "Canary rolled back ({}): all traffic is back on {}.",
                reason, stable
            ))
            .await;
            engine.notifier.notify(
                app.team_id,
                Notification::CanaryRolledBack {
                    application: app.name.clone(),
                    deployment_uuid: uuid.to_string(),
                    reason: reason.to_string(),
                },
            );
        }
    }
    Ok(())
}
