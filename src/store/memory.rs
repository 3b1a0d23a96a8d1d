use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{
    Application, DeploymentRecord, DeploymentStatus, LogEntry, NewLogEntry, NewRollbackEvent,
    RollbackEvent, RollbackStatus, Server,
};

use super::{
    BuildServerAssignment, BuildServerChooser, ClaimOutcome, ContainerStatus, DeploymentUpdate,
    RollbackEventUpdate, Store,
};

#[derive(Default)]
struct Tables {
    servers: BTreeMap<u64, Server>,
    applications: BTreeMap<u64, Application>,
    deployments: Vec<DeploymentRecord>,
    logs: HashMap<String, Vec<LogEntry>>,
    rollback_events: Vec<RollbackEvent>,
    container_status: HashMap<u64, Vec<ContainerStatus>>,
    next_deployment_id: u64,
    next_event_id: u64,
}

impl Tables {
    fn deployment_mut(&mut self, uuid: &str) -> Result<&mut DeploymentRecord> {
        self.deployments
            .iter_mut()
            .find(|d| d.deployment_uuid == uuid)
            .with_context(|| format!("Deployment '{}' not found", uuid))
    }
}

/// Process-local store.
///
/// Application rows have their own lock so the deployment claim behaves like
/// `SELECT ... FOR UPDATE` on the application followed by the in-progress
/// check, inside one transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fleet(servers: Vec<Server>, applications: Vec<Application>) -> Self {
        let tables = Tables {
            servers: servers.into_iter().map(|s| (s.id, s)).collect(),
            applications: applications.into_iter().map(|a| (a.id, a)).collect(),
            ..Default::default()
        };
        Self {
            tables: Mutex::new(tables),
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn put_server(&self, server: Server) {
        self.tables.lock().await.servers.insert(server.id, server);
    }

    pub async fn put_application(&self, application: Application) {
        self.tables
            .lock()
            .await
            .applications
            .insert(application.id, application);
    }

    async fn application_row(&self, application_id: u64) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        locks.entry(application_id).or_default().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn server(&self, id: u64) -> Result<Server> {
        self.tables
            .lock()
            .await
            .servers
            .get(&id)
            .cloned()
            .with_context(|| format!("Server {} not found", id))
    }

    async fn servers(&self) -> Result<Vec<Server>> {
        Ok(self.tables.lock().await.servers.values().cloned().collect())
    }

    async fn application(&self, id: u64) -> Result<Application> {
        self.tables
            .lock()
            .await
            .applications
            .get(&id)
            .cloned()
            .with_context(|| format!("Application {} not found", id))
    }

    async fn application_by_name(&self, name: &str) -> Result<Application> {
        self.tables
            .lock()
            .await
            .applications
            .values()
            .find(|a| a.name == name)
            .cloned()
            .with_context(|| format!("Application '{}' not found", name))
    }

    async fn save_config_hash(&self, application_id: u64, hash: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let app = tables
            .applications
            .get_mut(&application_id)
            .with_context(|| format!("Application {} not found", application_id))?;
        app.config_hash = Some(hash.to_string());
        Ok(())
    }

    async fn save_container_status(
        &self,
        application_id: u64,
        statuses: Vec<ContainerStatus>,
    ) -> Result<()> {
        self.tables
            .lock()
            .await
            .container_status
            .insert(application_id, statuses);
        Ok(())
    }

    async fn container_status(&self, application_id: u64) -> Result<Vec<ContainerStatus>> {
        Ok(self
            .tables
            .lock()
            .await
            .container_status
            .get(&application_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_deployment(&self, mut record: DeploymentRecord) -> Result<DeploymentRecord> {
        let mut tables = self.tables.lock().await;
        if tables
            .deployments
            .iter()
            .any(|d| d.deployment_uuid == record.deployment_uuid)
        {
            bail!("Deployment '{}' already exists", record.deployment_uuid);
        }
        tables.next_deployment_id += 1;
        record.id = tables.next_deployment_id;
        tables.deployments.push(record.clone());
        Ok(record)
    }

    async fn deployment(&self, uuid: &str) -> Result<DeploymentRecord> {
        let mut tables = self.tables.lock().await;
        Ok(tables.deployment_mut(uuid)?.clone())
    }

    async fn deployments_for_application(
        &self,
        application_id: u64,
    ) -> Result<Vec<DeploymentRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .deployments
            .iter()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect())
    }

    async fn update_deployment(
        &self,
        uuid: &str,
        update: DeploymentUpdate,
    ) -> Result<DeploymentRecord> {
        let mut tables = self.tables.lock().await;
        let record = tables.deployment_mut(uuid)?;
        update(record);
        Ok(record.clone())
    }

    async fn transition(&self, uuid: &str, to: DeploymentStatus) -> Result<DeploymentRecord> {
        let mut tables = self.tables.lock().await;
        let record = tables.deployment_mut(uuid)?;
        if !record.accepts(to) {
            bail!(
                "Deployment {} cannot move from {} to {}",
                uuid,
                record.status,
                to
            );
        }
        record.status = to;
        Ok(record.clone())
    }

    async fn claim_deployment(&self, uuid: &str, worker: &str) -> Result<ClaimOutcome> {
        let application_id = self.deployment(uuid).await?.application_id;

        let row = self.application_row(application_id).await;
        let _row_guard = row.lock().await;

        let mut tables = self.tables.lock().await;
        if let Some(holder) = tables.deployments.iter().find(|d| {
            d.application_id == application_id
                && d.status == DeploymentStatus::InProgress
                && d.deployment_uuid != uuid
        }) {
            return Ok(ClaimOutcome::Busy {
                holder: holder.deployment_uuid.clone(),
            });
        }

        let record = tables.deployment_mut(uuid)?;
        if record.status != DeploymentStatus::Queued {
            return Ok(ClaimOutcome::NotQueued(record.status));
        }

        record.status = DeploymentStatus::InProgress;
        record.started_at = Some(Utc::now());
        record.worker = Some(worker.to_string());
        debug!("Deployment {} claimed by {}", uuid, worker);
        Ok(ClaimOutcome::Claimed(record.clone()))
    }

    async fn assign_build_server(
        &self,
        uuid: &str,
        choose: &BuildServerChooser,
    ) -> Result<BuildServerAssignment> {
        let mut tables = self.tables.lock().await;

        let (server_id, application_id) = {
            let record = tables.deployment_mut(uuid)?;
            if record.build_server_id.is_some() {
                return Ok(BuildServerAssignment {
                    record: record.clone(),
                    candidates: 0,
                    decided_now: false,
                });
            }
            (record.server_id, record.application_id)
        };

        let team_id = tables
            .applications
            .get(&application_id)
            .map(|a| a.team_id)
            .with_context(|| format!("Application {} not found", application_id))?;

        let candidates: Vec<Server> = tables
            .servers
            .values()
            .filter(|s| s.build_server && s.team_id == team_id && s.id != server_id)
            .cloned()
            .collect();

        let chosen = choose(&candidates);
        let record = tables.deployment_mut(uuid)?;
        record.build_server_id = chosen;

        Ok(BuildServerAssignment {
            record: record.clone(),
            candidates: candidates.len(),
            decided_now: true,
        })
    }

    async fn append_log(&self, uuid: &str, entry: NewLogEntry) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let lines = tables.logs.entry(uuid.to_string()).or_default();
        let order = lines.last().map(|l| l.order + 1).unwrap_or(1);
        lines.push(LogEntry {
            order,
            timestamp: Utc::now(),
            text: entry.text,
            stream: entry.stream,
            hidden: entry.hidden,
            batch: entry.batch,
        });
        Ok(order)
    }

    async fn logs(&self, uuid: &str, after: Option<u64>) -> Result<Vec<LogEntry>> {
        let tables = self.tables.lock().await;
        let after = after.unwrap_or(0);
        Ok(tables
            .logs
            .get(uuid)
            .map(|lines| lines.iter().filter(|l| l.order > after).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_rollback_event(&self, event: NewRollbackEvent) -> Result<RollbackEvent> {
        let mut tables = self.tables.lock().await;
        tables.next_event_id += 1;
        let event = RollbackEvent {
            id: tables.next_event_id,
            application_id: event.application_id,
            failed_deployment_id: event.failed_deployment_id,
            trigger_reason: event.trigger_reason,
            trigger_type: event.trigger_type,
            metrics_snapshot: event.metrics_snapshot,
            status: RollbackStatus::Pending,
            from_commit: event.from_commit,
            to_commit: None,
            rollback_deployment_uuid: None,
            created_at: Utc::now(),
        };
        tables.rollback_events.push(event.clone());
        Ok(event)
    }

    async fn update_rollback_event(
        &self,
        id: u64,
        update: RollbackEventUpdate,
    ) -> Result<RollbackEvent> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .rollback_events
            .iter_mut()
            .find(|e| e.id == id)
            .with_context(|| format!("Rollback event {} not found", id))?;
        update(event);
        Ok(event.clone())
    }

    async fn rollback_event_for_deployment(
        &self,
        rollback_uuid: &str,
    ) -> Result<Option<RollbackEvent>> {
        Ok(self
            .tables
            .lock()
            .await
            .rollback_events
            .iter()
            .find(|e| e.rollback_deployment_uuid.as_deref() == Some(rollback_uuid))
            .cloned())
    }

    async fn rollback_events(&self, application_id: u64) -> Result<Vec<RollbackEvent>> {
        Ok(self
            .tables
            .lock()
            .await
            .rollback_events
            .iter()
            .filter(|e| e.application_id == application_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn second_claim_backs_off_while_first_is_in_progress() {
        let store = Arc::new(fixtures::store());
        let first = store.insert_deployment(fixtures::record(1, "first")).await.unwrap();
        let second = store.insert_deployment(fixtures::record(1, "second")).await.unwrap();

        let outcome = store.claim_deployment(&first.deployment_uuid, "w1").await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));

        let outcome = store.claim_deployment(&second.deployment_uuid, "w2").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Busy {
                holder: "first".to_string()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_never_both_win() {
        for _ in 0..50 {
            let store = Arc::new(fixtures::store());
            store.insert_deployment(fixtures::record(1, "a")).await.unwrap();
            store.insert_deployment(fixtures::record(1, "b")).await.unwrap();

            let (s1, s2) = (store.clone(), store.clone());
            let t1 = tokio::spawn(async move { s1.claim_deployment("a", "w1").await.unwrap() });
            let t2 = tokio::spawn(async move { s2.claim_deployment("b", "w2").await.unwrap() });
            let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());

            let won = [&r1, &r2]
                .iter()
                .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
                .count();
            assert_eq!(won, 1, "{:?} / {:?}", r1, r2);

            let in_progress = store
                .deployments_for_application(1)
                .await
                .unwrap()
                .iter()
                .filter(|d| d.status == DeploymentStatus::InProgress)
                .count();
            assert_eq!(in_progress, 1);
        }
    }

    #[tokio::test]
    async fn claims_for_different_applications_are_independent() {
        let store = fixtures::store();
        store.put_application(fixtures::application(2)).await;
        store.insert_deployment(fixtures::record(1, "a")).await.unwrap();
        store.insert_deployment(fixtures::record(2, "b")).await.unwrap();

        assert!(matches!(
            store.claim_deployment("a", "w1").await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            store.claim_deployment("b", "w2").await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn cancelled_record_is_not_claimed() {
        let store = fixtures::store();
        store.insert_deployment(fixtures::record(1, "a")).await.unwrap();
        store
            .transition("a", DeploymentStatus::CancelledByUser)
            .await
            .unwrap();

        assert_eq!(
            store.claim_deployment("a", "w1").await.unwrap(),
            ClaimOutcome::NotQueued(DeploymentStatus::CancelledByUser)
        );
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = fixtures::store();
        store.insert_deployment(fixtures::record(1, "a")).await.unwrap();
        assert!(store.transition("a", DeploymentStatus::Finished).await.is_err());
    }

    #[tokio::test]
    async fn existing_build_server_assignment_wins() {
        let store = fixtures::store();
        let mut record = fixtures::record(1, "a");
        record.build_server_id = Some(42);
        store.insert_deployment(record).await.unwrap();

        let assignment = store.assign_build_server("a", &|_| Some(7)).await.unwrap();
        assert!(!assignment.decided_now);
        assert_eq!(assignment.record.build_server_id, Some(42));
    }

    #[tokio::test]
    async fn logs_are_ordered_and_tailable() {
        let store = fixtures::store();
        for text in ["one", "two", "three"] {
            store
                .append_log(
                    "a",
                    NewLogEntry {
                        text: text.to_string(),
                        stream: crate::model::LogStream::Info,
                        hidden: false,
                        batch: 1,
                    },
                )
                .await
                .unwrap();
        }

        let all = store.logs("a", None).await.unwrap();
        assert_eq!(all.iter().map(|l| l.order).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = store.logs("a", Some(2)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].text, "three");
    }
}
