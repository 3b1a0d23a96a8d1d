pub mod context;
pub mod error;
pub mod log;
pub mod steps;


use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::{builder, gate, Engine, Job};
use crate::model::{DeploymentStatus, LogStream};
use crate::rollout;

use context::DeployContext;
use error::DeployError;
use log::DeploymentLog;
use steps::cleanup::{self, Outcome};

/// Runs one deployment job from claim to cleanup.
///
/// Only bookkeeping errors escape; everything that goes wrong in the
/// pipeline ends up on the record and in its log.
pub async fn run(engine: &Engine, uuid: &str, attempt: u32, worker: &str) -> Result<()> {
    let record = engine.store.deployment(uuid).await?;
    match record.status {
        DeploymentStatus::Queued => {}
        DeploymentStatus::CancelledByUser => {
            DeploymentLog::new(engine.store.clone(), uuid)
                .info("Deployment was cancelled before it started.")
                .await;
            return Ok(());
        }
        other => {
            debug!("Deployment {} is {}, nothing to run", uuid, other);
            return Ok(());
        }
    }
    if record.awaiting_approval() {
        info!("Deployment {} is waiting for approval", uuid);
        return Ok(());
    }

    let Some(record) = gate::acquire(engine, uuid, attempt, worker).await? else {
        return Ok(());
    };
    let log = DeploymentLog::new(engine.store.clone(), uuid);
    if attempt > 1 {
        log.info(format!("Attempt {} of {}.", attempt, engine.settings.max_attempts))
            .await;
    }

    let lookup = async {
        let application = engine.store.application(record.application_id).await?;
        let server = engine.store.server(record.server_id).await?;
        let choice = builder::select(engine, &record, &application, &server, &log).await?;
        Ok::<_, anyhow::Error>((application, server, choice))
    };
    let (application, server, choice) = match lookup.await {
        Ok(found) => found,
        Err(e) => {
            fail_before_start(engine, uuid, &log, &e).await;
            return Ok(());
        }
    };

    let mut ctx = DeployContext::new(
        engine.store.clone(),
        engine.executor.clone(),
        engine.settings.clone(),
        record,
        application,
        server,
        choice.server,
        choice.offloaded,
    );

    let limit = engine.settings.deployment_timeout;
    let result = match tokio::time::timeout(limit, pipeline(engine, &mut ctx)).await {
        Ok(result) => result,
        Err(_) => Err(DeployError::Timeout(limit)),
    };

    let outcome = match result {
        Ok(()) => {
            if steps::post_deploy::run(engine, &mut ctx).await {
                Outcome::Finished
            } else {
                Outcome::Cancelled
            }
        }
        Err(DeployError::Cancelled) => {
            cleanup::on_cancelled(&mut ctx).await;
            Outcome::Cancelled
        }
        Err(e) if e.is_retryable() && attempt < engine.settings.max_attempts => {
            if retry(engine, &mut ctx, attempt, &e).await {
                Outcome::Retrying
            } else {
                Outcome::Cancelled
            }
        }
        Err(e) => {
            if cancelled(engine, uuid).await {
                cleanup::on_cancelled(&mut ctx).await;
                Outcome::Cancelled
            } else {
                cleanup::on_failure(engine, &mut ctx, &e).await;
                Outcome::Failed
            }
        }
    };

    cleanup::finally(engine, &mut ctx, outcome).await;
    info!("Deployment {} ended: {:?}", uuid, outcome);
    Ok(())
}

async fn pipeline(engine: &Engine, ctx: &mut DeployContext) -> Result<(), DeployError> {
    ctx.checkpoint().await?;

    // Step 1: Helper container, network, pre-deployment command
    steps::prepare::run(engine, ctx).await?;

    // Step 2: Clone and check out the commit
    steps::source::run(engine, ctx).await?;

    // Step 3: Reuse an existing image when nothing changed
    ctx.skip_build = steps::registry::skip_check(ctx).await?;

    // Step 4: Environment files and compose definition
    steps::configure::run(engine, ctx).await?;

    // Step 5: Build the image
    steps::build::run(engine, ctx).await?;

    // Step 6: Push it to the registry
    steps::registry::push(engine, ctx).await?;

    // Step 7: Start the new container and move traffic
    rollout::run(engine, ctx).await
}

async fn cancelled(engine: &Engine, uuid: &str) -> bool {
    matches!(
        engine.store.deployment(uuid).await.map(|d| d.status),
        Ok(DeploymentStatus::CancelledByUser)
    )
}

/// Puts the record back in the queue for another attempt after a transport failure.
async fn retry(engine: &Engine, ctx: &mut DeployContext, attempt: u32, err: &DeployError) -> bool {
    let delay = engine.settings.backoff(attempt);
    warn!("Deployment {} attempt {} failed: {}", ctx.uuid(), attempt, err);
    if let Err(e) = engine
        .store
        .transition(ctx.uuid(), DeploymentStatus::Queued)
        .await
    {
        ctx.log
            .warning(format!("Could not re-queue the deployment: {:#}", e))
            .await;
        return false;
    }
    ctx.log
        .warning(format!(
            "Attempt {} of {} failed: {}. Retrying in {}s.",
            attempt,
            engine.settings.max_attempts,
            err,
            delay.as_secs()
        ))
        .await;
    engine.scheduler.dispatch(
        Job::Deploy {
            deployment_uuid: ctx.uuid().to_string(),
            attempt: attempt + 1,
        },
        delay,
    );
    true
}

async fn fail_before_start(engine: &Engine, uuid: &str, log: &DeploymentLog, err: &anyhow::Error) {
    warn!("Deployment {} could not start: {:#}", uuid, err);
    log.line(
        format!("Deployment failed: {:#}", err),
        LogStream::Stderr,
        false,
        0,
    )
    .await;
    if let Err(e) = engine.store.transition(uuid, DeploymentStatus::Failed).await {
        warn!("{:#}", e);
    }
    let finished_at = Utc::now();
    if let Err(e) = engine
        .store
        .update_deployment(uuid, Box::new(move |d| d.finished_at = Some(finished_at)))
        .await
    {
        warn!("{:#}", e);
    }
}
