use crate::client::ControlClient;
use crate::core::{BackupError, ReplicaId};
use crate::cut::ConsistentCut;
use tracing::{Level, event};

/// Unfreezes the primary and resumes replication on every replica.
///
/// Requires the cut that froze the fleet. Every step is attempted; failures are returned
/// as release errors and never stop the remaining steps.
pub async fn release_fleet(
    client: &dyn ControlClient,
    replicas: &[ReplicaId],
    cut: &ConsistentCut,
) -> Vec<BackupError> {
    let mut failures = Vec::new();

    if let Err(err) = client.unfreeze_log().await {
        event!(Level::ERROR, error = %err, "primary unfreeze failed");
        failures.push(BackupError::release(client.primary_label(), err));
    }

    for replica in replicas {
        if let Err(err) = client.resume_replication(replica).await {
            event!(Level::ERROR, replica = %replica, error = %err, "replication resume failed");
            failures.push(BackupError::release(replica.as_str(), err));
        }
    }

    event!(
        Level::INFO,
        position = %cut.position(),
        failures = failures.len(),
        "fleet released"
    );
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryFleet;
    use crate::core::ReplicationPosition;
    use crate::cut::{CutTracker, establish_cut};

    #[tokio::test]
    async fn test_release_continues_past_failing_replica() {
        let fleet = InMemoryFleet::new();
        let mut replicas = Vec::new();
        for (name, offset) in [("db2:3306", 10), ("db3:3306", 20), ("db4:3306", 30)] {
            fleet
                .add_replica(name, ReplicationPosition::new("log.1", offset))
                .await
                .unwrap();
            replicas.push(ReplicaId::new(name).unwrap());
        }
        let cut = establish_cut(&fleet, &replicas, &CutTracker::new())
            .await
            .unwrap();
        fleet.fail_resume("db3:3306", true).await.unwrap();
        fleet.fail_unfreeze(true).await;

        let failures = release_fleet(&fleet, &replicas, &cut).await;
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| !f.is_fatal()));
        assert!(fleet.is_replicating("db2:3306").await.unwrap());
        assert!(!fleet.is_replicating("db3:3306").await.unwrap());
        assert!(fleet.is_replicating("db4:3306").await.unwrap());
    }
}
