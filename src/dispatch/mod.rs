//! Per-replica export dispatch.

use crate::core::{BackupError, ReplicaId, Result, TableList};
use crate::plan::PlanStore;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event};

pub mod mysqldump;

pub use mysqldump::MysqldumpLauncher;

/// One export of a table chunk from one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub replica: ReplicaId,
    pub schema: String,
    pub tables: Vec<String>,
    /// Dump file written by the job
    pub destination: PathBuf,
}

/// Starts export jobs.
///
/// `launch` returns once the job is running (or failed to start); it never waits for the
/// job to finish.
#[async_trait]
pub trait ExportLauncher: Send + Sync {
    async fn launch(&self, job: ExportJob) -> Result<()>;
}

/// Result of a dispatch round.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub launched: Vec<ExportJob>,
    /// Replicas whose chunk is empty
    pub skipped: Vec<ReplicaId>,
    pub errors: Vec<BackupError>,
}

/// Dump file for `replica`; distinct replicas always get distinct files.
pub fn destination_for(directory: &Path, schema: &str, replica: &ReplicaId) -> PathBuf {
    directory.join(format!("{}_{}.sql", schema, replica.file_stem()))
}

/// Resolves each replica's chunk from `store` and launches its export concurrently.
///
/// Only the launches are awaited. A replica without a stored chunk, or whose launch fails,
/// is recorded as a dispatch error; the other replicas are unaffected.
pub async fn dispatch_exports(
    store: &dyn PlanStore,
    launcher: Arc<dyn ExportLauncher>,
    replicas: &[ReplicaId],
    tables: &TableList,
    schema: &str,
    directory: &Path,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();

    if let Err(err) = tokio::fs::create_dir_all(directory).await {
        let message = format!("cannot create '{}': {}", directory.display(), err);
        event!(Level::ERROR, error = %message, "destination unavailable");
        outcome.errors = replicas
            .iter()
            .map(|replica| BackupError::dispatch(replica.as_str(), &message))
            .collect();
        return outcome;
    }

    let mut jobs = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let chunk = match store.lookup(replica).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                outcome
                    .errors
                    .push(BackupError::dispatch(replica.as_str(), "no chunk in plan"));
                continue;
            }
            Err(err) => {
                outcome
                    .errors
                    .push(BackupError::dispatch(replica.as_str(), err));
                continue;
            }
        };

        let chunk_tables = tables.chunk(&chunk);
        if chunk_tables.is_empty() {
            event!(Level::INFO, replica = %replica, "empty chunk, nothing to export");
            outcome.skipped.push(replica.clone());
            continue;
        }

        jobs.push(ExportJob {
            replica: replica.clone(),
            schema: schema.to_string(),
            tables: chunk_tables.to_vec(),
            destination: destination_for(directory, schema, replica),
        });
    }

    let launches = jobs.into_iter().map(|job| {
        let launcher = Arc::clone(&launcher);
        let summary = job.clone();
        let handle = tokio::spawn(async move { launcher.launch(job).await });
        async move { (summary, handle.await) }
    });

    for (job, joined) in join_all(launches).await {
        match joined {
            Ok(Ok(())) => {
                event!(
                    Level::INFO,
                    replica = %job.replica,
                    table_count = job.tables.len(),
                    destination = %job.destination.display(),
                    "export launched"
                );
                outcome.launched.push(job);
            }
            Ok(Err(err)) => {
                event!(Level::ERROR, replica = %job.replica, error = %err, "export launch failed");
                outcome
                    .errors
                    .push(BackupError::dispatch(job.replica.as_str(), err));
            }
            Err(err) => {
                outcome.errors.push(BackupError::dispatch(
                    job.replica.as_str(),
                    format!("launch task aborted: {}", err),
                ));
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryFleet;
    use crate::core::{ChunkAssignment, ReplicationPosition};
    use crate::plan::{InMemoryPlanStore, plan_chunks, replace_plan};
    use tempfile::tempdir;

    async fn fleet_of_three() -> (InMemoryFleet, Vec<ReplicaId>) {
        let fleet = InMemoryFleet::new();
        let mut replicas = Vec::new();
        for name in ["db2:3306", "db3:3306", "db4:3306"] {
            fleet
                .add_replica(name, ReplicationPosition::new("log.1", 4))
                .await
                .unwrap();
            replicas.push(ReplicaId::new(name).unwrap());
        }
        (fleet, replicas)
    }

    fn ten_tables() -> TableList {
        TableList::new((0..10).map(|i| format!("t{i:02}")).collect())
    }

    #[tokio::test]
    async fn test_each_replica_gets_its_clamped_slice() {
        let (fleet, replicas) = fleet_of_three().await;
        let tables = ten_tables();
        let store = InMemoryPlanStore::new();
        replace_plan(&store, &plan_chunks(tables.len(), &replicas).unwrap())
            .await
            .unwrap();
        let dir = tempdir().unwrap();

        let outcome = dispatch_exports(
            &store,
            Arc::new(fleet.clone()),
            &replicas,
            &tables,
            "shop",
            dir.path(),
        )
        .await;
        assert!(outcome.errors.is_empty());

        let mut launched = fleet.launched().await;
        launched.sort_by(|a, b| a.replica.cmp(&b.replica));
        let slices = launched
            .iter()
            .map(|job| job.tables.clone())
            .collect::<Vec<_>>();
        assert_eq!(slices[0], tables.names()[0..4].to_vec());
        assert_eq!(slices[1], tables.names()[4..8].to_vec());
        assert_eq!(slices[2], tables.names()[8..10].to_vec());
        assert_eq!(
            launched[2].destination,
            dir.path().join("shop_db4_c3306.sql")
        );
    }

    #[tokio::test]
    async fn test_launch_failure_does_not_stop_siblings() {
        let (fleet, replicas) = fleet_of_three().await;
        fleet.fail_launch("db3:3306", true).await.unwrap();
        let tables = ten_tables();
        let store = InMemoryPlanStore::new();
        replace_plan(&store, &plan_chunks(tables.len(), &replicas).unwrap())
            .await
            .unwrap();
        let dir = tempdir().unwrap();

        let outcome = dispatch_exports(
            &store,
            Arc::new(fleet.clone()),
            &replicas,
            &tables,
            "shop",
            dir.path(),
        )
        .await;
        assert_eq!(outcome.launched.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(!outcome.errors[0].is_fatal());
        assert!(outcome.errors[0].to_string().contains("db3:3306"));
    }

    #[tokio::test]
    async fn test_missing_chunk_and_empty_chunk() {
        let (fleet, replicas) = fleet_of_three().await;
        let tables = TableList::new(vec!["orders".to_string()]);
        let store = InMemoryPlanStore::new();
        store
            .persist(&[
                ChunkAssignment::new(replicas[0].clone(), 0, 1),
                ChunkAssignment::new(replicas[1].clone(), 1, 0),
            ])
            .await
            .unwrap();
        let dir = tempdir().unwrap();

        let outcome = dispatch_exports(
            &store,
            Arc::new(fleet.clone()),
            &replicas,
            &tables,
            "shop",
            dir.path(),
        )
        .await;
        assert_eq!(outcome.launched.len(), 1);
        assert_eq!(outcome.skipped, vec![replicas[1].clone()]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].to_string().contains("no chunk in plan"));
    }

    #[test]
    fn test_destinations_are_distinct() {
        let dir = Path::new("/backups");
        let a = destination_for(dir, "shop", &ReplicaId::new("db2:3306").unwrap());
        let b = destination_for(dir, "shop", &ReplicaId::new("db2:3307").unwrap());
        assert_ne!(a, b);

        let underscore = destination_for(dir, "shop", &ReplicaId::new("a_b:3306").unwrap());
        let colon = destination_for(dir, "shop", &ReplicaId::new("a:b:3306").unwrap());
        assert_eq!(underscore, Path::new("/backups/shop_a__b_c3306.sql"));
        assert_ne!(underscore, colon);
    }
}
