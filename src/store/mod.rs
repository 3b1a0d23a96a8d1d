//! Persistence seam for the orchestration core.
//!
//! The relational schema lives outside this crate; the engine only needs the
//! handful of transactional operations below.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{
    Application, DeploymentRecord, DeploymentStatus, LogEntry, NewLogEntry, NewRollbackEvent,
    RollbackEvent, Server,
};

pub use memory::MemoryStore;

pub type DeploymentUpdate = Box<dyn FnOnce(&mut DeploymentRecord) + Send>;
pub type RollbackEventUpdate = Box<dyn FnOnce(&mut RollbackEvent) + Send>;

/// Picks a build server id out of the candidates, or none.
pub type BuildServerChooser = dyn Fn(&[Server]) -> Option<u64> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(DeploymentRecord),
    /// Another deployment of the same application is in progress
    Busy { holder: String },
    /// The record left the queue before it could be claimed
    NotQueued(DeploymentStatus),
}

#[derive(Debug, Clone)]
pub struct BuildServerAssignment {
    pub record: DeploymentRecord,
    /// Build-capable servers seen in the transaction
    pub candidates: usize,
    /// False when an earlier decision was kept
    pub decided_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn server(&self, id: u64) -> Result<Server>;
    async fn servers(&self) -> Result<Vec<Server>>;

    async fn application(&self, id: u64) -> Result<Application>;
    async fn application_by_name(&self, name: &str) -> Result<Application>;
    async fn save_config_hash(&self, application_id: u64, hash: &str) -> Result<()>;
    async fn save_container_status(
        &self,
        application_id: u64,
        statuses: Vec<ContainerStatus>,
    ) -> Result<()>;
    async fn container_status(&self, application_id: u64) -> Result<Vec<ContainerStatus>>;

    /// Persists a new record; the store assigns `id`.
    async fn insert_deployment(&self, record: DeploymentRecord) -> Result<DeploymentRecord>;
    async fn deployment(&self, uuid: &str) -> Result<DeploymentRecord>;
    /// Oldest first
    async fn deployments_for_application(&self, application_id: u64)
        -> Result<Vec<DeploymentRecord>>;
    async fn update_deployment(&self, uuid: &str, update: DeploymentUpdate)
        -> Result<DeploymentRecord>;
    /// Validated status change
    async fn transition(&self, uuid: &str, to: DeploymentStatus) -> Result<DeploymentRecord>;

    /// Row lock on the application, check for another in-progress record
    /// and mark this one in progress, as one atomic step.
    async fn claim_deployment(&self, uuid: &str, worker: &str) -> Result<ClaimOutcome>;

    /// Re-reads the record and records a build server chosen among the
    /// team's build-capable servers, in one critical section.
    async fn assign_build_server(
        &self,
        uuid: &str,
        choose: &BuildServerChooser,
    ) -> Result<BuildServerAssignment>;

    async fn append_log(&self, uuid: &str, entry: NewLogEntry) -> Result<u64>;
    /// Entries with `order > after`
    async fn logs(&self, uuid: &str, after: Option<u64>) -> Result<Vec<LogEntry>>;

    async fn insert_rollback_event(&self, event: NewRollbackEvent) -> Result<RollbackEvent>;
    async fn update_rollback_event(&self, id: u64, update: RollbackEventUpdate)
        -> Result<RollbackEvent>;
    async fn rollback_event_for_deployment(&self, rollback_uuid: &str)
        -> Result<Option<RollbackEvent>>;
    async fn rollback_events(&self, application_id: u64) -> Result<Vec<RollbackEvent>>;
}
