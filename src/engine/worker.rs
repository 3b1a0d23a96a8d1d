use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ssh::MuxPool;
use crate::store::Store;

use super::scheduler::JobReceiver;
use super::{Engine, TokioScheduler};

/// Fixed set of tasks draining the job queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        engine: Arc<Engine>,
        scheduler: Arc<TokioScheduler>,
        receiver: JobReceiver,
        count: usize,
    ) -> Self {
        let handles = (1..=count)
            .map(|n| {
                let engine = engine.clone();
                let scheduler = scheduler.clone();
                let receiver = receiver.clone();
                let name = format!("worker-{}", n);
                tokio::spawn(async move {
                    debug!("{} started", name);
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        let kind = job.kind();
                        let uuid = job.deployment_uuid().to_string();
                        let run = AssertUnwindSafe(engine.handle(job, &name)).catch_unwind();
                        if run.await.is_err() {
                            error!("{} panicked while running {} for {}", name, kind, uuid);
                        }
                        scheduler.complete();
                    }
                    debug!("{} stopped", name);
                })
            })
            .collect();
        info!("Started {} workers", count);
        Self { handles }
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Periodically closes mux connections to servers that are gone, old or idle.
pub fn spawn_mux_sweeper(
    pool: Arc<MuxPool>,
    store: Arc<dyn Store>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let known: Vec<u64> = match store.servers().await {
                Ok(servers) => servers.iter().map(|s| s.id).collect(),
                Err(e) => {
                    warn!("Skipping mux sweep: {:#}", e);
                    continue;
                }
            };
            let report = pool.sweep(&known).await;
            if !report.closed.is_empty() {
                debug!(
                    "Mux sweep closed {} connections, kept {}",
                    report.closed.len(),
                    report.kept
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Job, Scheduler};
    use crate::model::DeploymentStatus;
    use crate::testing::{fixtures, Harness};

    #[tokio::test]
    async fn jobs_for_missing_deployments_do_not_stall_the_pool() {
        let h = Harness::new();
        let (scheduler, receiver) = TokioScheduler::new();
        let engine = Arc::new(h.engine_with_scheduler(scheduler.clone()));
        let pool = WorkerPool::start(engine, scheduler.clone(), receiver, 2);

        scheduler.dispatch(Job::deploy("missing"), Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .unwrap();
        assert_eq!(scheduler.outstanding(), 0);
        pool.shutdown();
    }

    #[tokio::test]
    async fn cancelled_deployment_runs_no_commands() {
        let h = Harness::new();
        h.store.insert_deployment(fixtures::record(1, "d1")).await.unwrap();
        h.engine.cancel_deployment("d1").await.unwrap();

        let (scheduler, receiver) = TokioScheduler::new();
        let engine = Arc::new(h.engine_with_scheduler(scheduler.clone()));
        let pool = WorkerPool::start(engine, scheduler.clone(), receiver, 1);
        scheduler.dispatch(Job::deploy("d1"), Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .unwrap();
        pool.shutdown();

        assert!(h.executor.commands().is_empty());
        let record = h.store.deployment("d1").await.unwrap();
        assert_eq!(record.status, DeploymentStatus::CancelledByUser);
    }
}
