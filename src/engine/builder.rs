use anyhow::Result;
use rand::seq::IndexedRandom;

use crate::deploy::log::DeploymentLog;
use crate::model::{Application, BuildPack, DeploymentRecord, Server};

use super::Engine;

/// Where the image gets built.
#[derive(Debug, Clone)]
pub struct BuilderChoice {
    pub server: Server,
    /// True when the build runs somewhere other than the target
    pub offloaded: bool,
}

fn pick_random(candidates: &[Server]) -> Option<u64> {
    candidates.choose(&mut rand::rng()).map(|s| s.id)
}

/// Resolves the build server once per deployment; retries keep the first pick.
pub async fn select(
    engine: &Engine,
    record: &DeploymentRecord,
    app: &Application,
    target: &Server,
    log: &DeploymentLog,
) -> Result<BuilderChoice> {
    let local = BuilderChoice {
        server: target.clone(),
        offloaded: false,
    };
    if !app.settings.build_server_offload {
        return Ok(local);
    }
    if app.build_pack == BuildPack::Compose {
        log.warning("Compose services are built where they run; ignoring the build server setting.")
            .await;
        return Ok(local);
    }

    let assignment = engine
        .store
        .assign_build_server(&record.deployment_uuid, &pick_random)
        .await?;

    let Some(build_server_id) = assignment.record.build_server_id else {
        log.warning("No build server available, building on the deployment server.")
            .await;
        return Ok(local);
    };

    let server = engine.store.server(build_server_id).await?;
    if assignment.decided_now {
        log.info(format!(
            "Picked build server {} out of {}.",
            server.name, assignment.candidates
        ))
        .await;
    }
    Ok(BuilderChoice {
        server,
        offloaded: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{fixtures, Harness};

    #[tokio::test]
    async fn builds_locally_without_offload() {
        let h = Harness::new();
        let record = h.store.insert_deployment(fixtures::record(1, "d1")).await.unwrap();
        let app = fixtures::application(1);
        let target = fixtures::server(1);
        let log = DeploymentLog::new(h.store.clone(), "d1");

        let choice = select(&h.engine, &record, &app, &target, &log).await.unwrap();
        assert!(!choice.offloaded);
        assert_eq!(choice.server.id, 1);
    }

    #[tokio::test]
    async fn offload_falls_back_to_target_without_build_servers() {
        let h = Harness::new();
        let mut app = fixtures::application(1);
        app.settings.build_server_offload = true;
        h.store.put_application(app.clone()).await;
        let record = h.store.insert_deployment(fixtures::record(1, "d1")).await.unwrap();
        let log = DeploymentLog::new(h.store.clone(), "d1");

        let choice = select(&h.engine, &record, &app, &fixtures::server(1), &log)
            .await
            .unwrap();
        assert!(!choice.offloaded);
        let lines = h.store.logs("d1", None).await.unwrap();
        assert!(lines[0].text.starts_with("No build server available"));
    }

    #[tokio::test]
    async fn compose_always_builds_on_the_target() {
        let h = Harness::new();
        let mut builder = fixtures::server(2);
        builder.build_server = true;
        h.store.put_server(builder).await;
        let mut app = fixtures::application(1);
        app.build_pack = BuildPack::Compose;
        app.settings.build_server_offload = true;
        h.store.put_application(app.clone()).await;
        let record = h.store.insert_deployment(fixtures::record(1, "d1")).await.unwrap();
        let log = DeploymentLog::new(h.store.clone(), "d1");

        let choice = select(&h.engine, &record, &app, &fixtures::server(1), &log)
            .await
            .unwrap();
        assert!(!choice.offloaded);
        assert_eq!(choice.server.id, 1);
        let record = h.store.deployment("d1").await.unwrap();
        assert!(record.build_server_id.is_none());
    }

    #[tokio::test]
    async fn offload_picks_a_build_server_once() {
        let h = Harness::new();
        let mut builder = fixtures::server(2);
        builder.build_server = true;
        h.store.put_server(builder).await;
        let mut app = fixtures::application(1);
        app.settings.build_server_offload = true;
        h.store.put_application(app.clone()).await;
        let record = h.store.insert_deployment(fixtures::record(1, "d1")).await.unwrap();
        let log = DeploymentLog::new(h.store.clone(), "d1");

        let first = select(&h.engine, &record, &app, &fixtures::server(1), &log)
            .await
            .unwrap();
        let again = select(&h.engine, &record, &app, &fixtures::server(1), &log)
            .await
            .unwrap();
        assert!(first.offloaded);
        assert_eq!(first.server.id, 2);
        assert_eq!(again.server.id, 2);
        assert_eq!(h.store.logs("d1", None).await.unwrap().len(), 1);
    }
}
