use super::ControlClient;
use crate::core::{BackupError, ReplicaId, ReplicationPosition, Result, TableList};
use crate::dispatch::{ExportJob, ExportLauncher};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A control call observed by [`InMemoryFleet`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCall {
    ListReplicas,
    ListTables,
    Freeze,
    Unfreeze,
    AppliedPosition(ReplicaId),
    ForceSync(ReplicaId, ReplicationPosition),
    Resume(ReplicaId),
    Launch(ReplicaId),
}

#[derive(Debug, Clone)]
struct SimulatedReplica {
    applied: ReplicationPosition,
    replicating: bool,
    unreachable: bool,
    position_failures: usize,
    fail_force_sync: bool,
    fail_resume: bool,
    fail_launch: bool,
}

#[derive(Debug, Default)]
struct FleetState {
    registry: Vec<ReplicaId>,
    replicas: BTreeMap<ReplicaId, SimulatedReplica>,
    tables: HashMap<String, Vec<String>>,
    frozen: bool,
    primary_unreachable: bool,
    fail_freeze: bool,
    fail_unfreeze: bool,
    calls: Vec<FleetCall>,
    launched: Vec<ExportJob>,
}

/// An in-memory primary with a set of replicas, implementing [`ControlClient`] and
/// [`ExportLauncher`].
///
/// Replicas can be made unreachable or made to fail individual operations, which is how
/// tests drive the coordinator through its failure branches.
#[derive(Clone, Default)]
pub struct InMemoryFleet {
    state: Arc<Mutex<FleetState>>,
}

impl InMemoryFleet {
    /// Creates a new, empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a replica that has applied up to `applied` and is replicating.
    pub async fn add_replica(&self, replica: &str, applied: ReplicationPosition) -> Result<()> {
        let id = ReplicaId::new(replica)?;
        let mut state = self.state.lock().await;
        state.registry.push(id.clone());
        state.replicas.insert(
            id,
            SimulatedReplica {
                applied,
                replicating: true,
                unreachable: false,
                position_failures: 0,
                fail_force_sync: false,
                fail_resume: false,
                fail_launch: false,
            },
        );
        Ok(())
    }

    /// Appends an identity to the primary's registry without a backing replica.
    ///
    /// Simulates registry rows for hosts that no longer answer, or duplicated rows.
    pub async fn add_registry_entry(&self, replica: &str) -> Result<()> {
        let id = ReplicaId::new(replica)?;
        self.state.lock().await.registry.push(id);
        Ok(())
    }

    pub async fn set_tables(&self, schema: &str, tables: Vec<String>) {
        self.state
            .lock()
            .await
            .tables
            .insert(schema.to_string(), tables);
    }

    pub async fn set_primary_unreachable(&self, unreachable: bool) {
        self.state.lock().await.primary_unreachable = unreachable;
    }

    pub async fn fail_freeze(&self, fail: bool) {
        self.state.lock().await.fail_freeze = fail;
    }

    pub async fn fail_unfreeze(&self, fail: bool) {
        self.state.lock().await.fail_unfreeze = fail;
    }

    pub async fn set_unreachable(&self, replica: &str, unreachable: bool) -> Result<()> {
        self.with_replica(replica, |r| r.unreachable = unreachable)
            .await
    }

    /// The next `count` position queries against `replica` fail.
    pub async fn fail_position_queries(&self, replica: &str, count: usize) -> Result<()> {
        self.with_replica(replica, |r| r.position_failures = count)
            .await
    }

    pub async fn fail_force_sync(&self, replica: &str, fail: bool) -> Result<()> {
        self.with_replica(replica, |r| r.fail_force_sync = fail)
            .await
    }

    pub async fn fail_resume(&self, replica: &str, fail: bool) -> Result<()> {
        self.with_replica(replica, |r| r.fail_resume = fail).await
    }

    pub async fn fail_launch(&self, replica: &str, fail: bool) -> Result<()> {
        self.with_replica(replica, |r| r.fail_launch = fail).await
    }

    pub async fn is_frozen(&self) -> bool {
        self.state.lock().await.frozen
    }

    pub async fn is_replicating(&self, replica: &str) -> Result<bool> {
        let id = ReplicaId::new(replica)?;
        let state = self.state.lock().await;
        state
            .replicas
            .get(&id)
            .map(|r| r.replicating)
            .ok_or_else(|| unknown_replica(&id))
    }

    /// Position a replica has applied, bypassing reachability.
    pub async fn position_of(&self, replica: &str) -> Result<ReplicationPosition> {
        let id = ReplicaId::new(replica)?;
        let state = self.state.lock().await;
        state
            .replicas
            .get(&id)
            .map(|r| r.applied.clone())
            .ok_or_else(|| unknown_replica(&id))
    }

    pub async fn calls(&self) -> Vec<FleetCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Export jobs accepted so far, in launch order.
    pub async fn launched(&self) -> Vec<ExportJob> {
        self.state.lock().await.launched.clone()
    }

    async fn with_replica(
        &self,
        replica: &str,
        update: impl FnOnce(&mut SimulatedReplica),
    ) -> Result<()> {
        let id = ReplicaId::new(replica)?;
        let mut state = self.state.lock().await;
        let entry = state
            .replicas
            .get_mut(&id)
            .ok_or_else(|| unknown_replica(&id))?;
        update(entry);
        Ok(())
    }
}

fn unknown_replica(replica: &ReplicaId) -> BackupError {
    BackupError::Client(format!("replica '{}' is not reachable", replica))
}

impl FleetState {
    fn check_primary(&self) -> Result<()> {
        if self.primary_unreachable {
            return Err(BackupError::Client("primary is not reachable".to_string()));
        }
        Ok(())
    }

    fn reachable_replica(&mut self, replica: &ReplicaId) -> Result<&mut SimulatedReplica> {
        match self.replicas.get_mut(replica) {
            Some(entry) if !entry.unreachable => Ok(entry),
            _ => Err(unknown_replica(replica)),
        }
    }
}

#[async_trait]
impl ControlClient for InMemoryFleet {
    async fn list_replicas(&self) -> Result<Vec<ReplicaId>> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::ListReplicas);
        state.check_primary()?;
        Ok(state.registry.clone())
    }

    async fn list_tables(&self, schema: &str) -> Result<TableList> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::ListTables);
        state.check_primary()?;
        let mut tables = state.tables.get(schema).cloned().unwrap_or_default();
        tables.sort();
        Ok(TableList::new(tables))
    }

    async fn freeze_log(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Freeze);
        state.check_primary()?;
        if state.fail_freeze {
            return Err(BackupError::Client("freeze statement rejected".to_string()));
        }
        state.frozen = true;
        Ok(())
    }

    async fn unfreeze_log(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Unfreeze);
        state.check_primary()?;
        if state.fail_unfreeze {
            return Err(BackupError::Client("unfreeze statement rejected".to_string()));
        }
        state.frozen = false;
        Ok(())
    }

    async fn applied_position(&self, replica: &ReplicaId) -> Result<ReplicationPosition> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::AppliedPosition(replica.clone()));
        let entry = state.reachable_replica(replica)?;
        if entry.position_failures > 0 {
            entry.position_failures -= 1;
            return Err(BackupError::Client(format!(
                "replica '{}' did not answer SHOW SLAVE STATUS",
                replica
            )));
        }
        Ok(entry.applied.clone())
    }

    async fn force_sync_to(
        &self,
        replica: &ReplicaId,
        position: &ReplicationPosition,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(FleetCall::ForceSync(replica.clone(), position.clone()));
        let entry = state.reachable_replica(replica)?;
        if entry.fail_force_sync {
            return Err(BackupError::Client(format!(
                "replica '{}' failed to replay until {}",
                replica, position
            )));
        }
        if entry.applied > *position {
            return Err(BackupError::Client(format!(
                "replica '{}' is already past {} (at {})",
                replica, position, entry.applied
            )));
        }
        entry.replicating = false;
        entry.applied = position.clone();
        Ok(())
    }

    async fn resume_replication(&self, replica: &ReplicaId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Resume(replica.clone()));
        let entry = state.reachable_replica(replica)?;
        if entry.fail_resume {
            return Err(BackupError::Client(format!(
                "replica '{}' rejected START SLAVE",
                replica
            )));
        }
        entry.replicating = true;
        Ok(())
    }

    fn primary_label(&self) -> String {
        "in-memory primary".to_string()
    }
}

#[async_trait]
impl ExportLauncher for InMemoryFleet {
    async fn launch(&self, job: ExportJob) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Launch(job.replica.clone()));
        let entry = state.reachable_replica(&job.replica)?;
        if entry.fail_launch {
            return Err(BackupError::Client(format!(
                "export for '{}' could not be started",
                job.replica
            )));
        }
        state.launched.push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_force_sync_stops_and_moves_replica() {
        let fleet = InMemoryFleet::new();
        fleet
            .add_replica("db2:3306", ReplicationPosition::new("log.3", 100))
            .await
            .unwrap();
        let target = ReplicationPosition::new("log.5", 50);
        let id = ReplicaId::new("db2:3306").unwrap();

        fleet.force_sync_to(&id, &target).await.unwrap();
        assert_eq!(fleet.applied_position(&id).await.unwrap(), target);
        assert!(!fleet.is_replicating("db2:3306").await.unwrap());

        fleet.resume_replication(&id).await.unwrap();
        assert!(fleet.is_replicating("db2:3306").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_sync_cannot_rewind() {
        let fleet = InMemoryFleet::new();
        fleet
            .add_replica("db2:3306", ReplicationPosition::new("log.5", 100))
            .await
            .unwrap();
        let id = ReplicaId::new("db2:3306").unwrap();
        let err = fleet
            .force_sync_to(&id, &ReplicationPosition::new("log.5", 50))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Client(_)));
    }

    #[tokio::test]
    async fn test_position_failures_are_counted() {
        let fleet = InMemoryFleet::new();
        fleet
            .add_replica("db2:3306", ReplicationPosition::new("log.1", 4))
            .await
            .unwrap();
        fleet.fail_position_queries("db2:3306", 1).await.unwrap();
        let id = ReplicaId::new("db2:3306").unwrap();

        assert!(fleet.applied_position(&id).await.is_err());
        assert!(fleet.applied_position(&id).await.is_ok());
    }
}
