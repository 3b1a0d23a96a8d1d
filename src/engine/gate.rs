//! One in-progress deployment per application.

use anyhow::Result;
use tracing::{debug, info};

use crate::deploy::log::DeploymentLog;
use crate::model::DeploymentRecord;
use crate::store::ClaimOutcome;

use super::{Engine, Job};

/// Claims the deployment for `worker`.
///
/// Returns `None` when the job should stop here: either another deployment of
/// the application holds the slot, in which case the job was re-dispatched,
/// or the record already left the queue.
pub async fn acquire(
    engine: &Engine,
    uuid: &str,
    attempt: u32,
    worker: &str,
) -> Result<Option<DeploymentRecord>> {
    match engine.store.claim_deployment(uuid, worker).await? {
        ClaimOutcome::Claimed(record) => {
            info!("{} claimed deployment {}", worker, uuid);
            Ok(Some(record))
        }
        ClaimOutcome::Busy { holder } => {
            let delay = engine.settings.lock_retry_delay;
            DeploymentLog::new(engine.store.clone(), uuid)
                .info(format!(
                    "Deployment waiting: {} is still in progress. Retrying in {}s.",
                    holder,
                    delay.as_secs()
                ))
                .await;
            engine.scheduler.dispatch(
                Job::Deploy {
                    deployment_uuid: uuid.to_string(),
                    attempt,
                },
                delay,
            );
            Ok(None)
        }
        ClaimOutcome::NotQueued(status) => {
            debug!("Deployment {} is {}, not starting it", uuid, status);
            Ok(None)
        }
    }
}
