use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

/// A unit of work for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Deploy {
        deployment_uuid: String,
        attempt: u32,
    },
    CanaryTick {
        deployment_uuid: String,
    },
    HealthCheck {
        deployment_uuid: String,
        round: u32,
        baseline_restarts: u32,
        started_at: DateTime<Utc>,
    },
}

impl Job {
    pub fn deploy(deployment_uuid: impl Into<String>) -> Self {
        Job::Deploy {
            deployment_uuid: deployment_uuid.into(),
            attempt: 1,
        }
    }

    pub fn deployment_uuid(&self) -> &str {
        match self {
            Job::Deploy { deployment_uuid, .. }
            | Job::CanaryTick { deployment_uuid }
            | Job::HealthCheck { deployment_uuid, .. } => deployment_uuid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Deploy { .. } => "deploy",
            Job::CanaryTick { .. } => "canary_tick",
            Job::HealthCheck { .. } => "health_check",
        }
    }
}

/// Timer abstraction handlers use to dispatch their successors.
pub trait Scheduler: Send + Sync {
    fn dispatch(&self, job: Job, delay: Duration);
}

pub type JobReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Delivers jobs to the worker pool through a channel once their delay has
/// elapsed.
///
/// A job counts as outstanding from `dispatch` until a worker reports it
/// complete, so `wait_idle` also covers jobs that are still sleeping.
pub struct TokioScheduler {
    sender: mpsc::UnboundedSender<Job>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TokioScheduler {
    pub fn new() -> (Arc<Self>, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            sender,
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        });
        (scheduler, Arc::new(Mutex::new(receiver)))
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Called by a worker once a job has run to completion.
    pub fn complete(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once no job is sleeping, queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Scheduler for TokioScheduler {
    fn dispatch(&self, job: Job, delay: Duration) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        debug!("Dispatching {} for {} in {:?}", job.kind(), job.deployment_uuid(), delay);

        let sender = self.sender.clone();
        let outstanding = self.outstanding.clone();
        let idle = self.idle.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = sender.send(job) {
                warn!("Worker pool is gone, dropping {}", e.0.kind());
                if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    idle.notify_waiters();
                }
            }
        });
    }
}
