use anyhow::Result;

use crate::config::BerthConfig;
use crate::model::DeploymentRequest;
use crate::output;
use crate::store::Store;

use super::deploy::{report, Runtime};

pub async fn run(config: BerthConfig, app_name: &str, commit: &str) -> Result<()> {
    let runtime = Runtime::start(&config);
    let app = runtime.engine.store.application_by_name(app_name).await?;
    output::header(&format!("Rolling back {} to {}", app.name, commit));

    let request = DeploymentRequest {
        rollback: true,
        ..DeploymentRequest::new(app.id).commit(commit)
    };
    let uuid = runtime.engine.queue_deployment(request).await?;
    output::info(&format!("Queued rollback {}", uuid));

    let status = runtime.follow(&uuid, false).await;
    runtime.stop();
    report(&uuid, status?)
}
