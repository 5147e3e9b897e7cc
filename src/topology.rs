use crate::client::ControlClient;
use crate::core::{BackupError, ReplicaId, Result};
use tracing::{Level, event};

/// Enumerates the replicas registered with the primary.
///
/// Duplicate registry rows are collapsed and the result is sorted, so the index of each
/// replica (and therefore its chunk) is the same for every run against an unchanged fleet.
/// An unreachable primary or an empty registry is a topology error.
pub async fn discover_replicas(client: &dyn ControlClient) -> Result<Vec<ReplicaId>> {
    let mut replicas = client.list_replicas().await.map_err(|err| {
        BackupError::Topology(format!(
            "cannot list replicas on {}: {}",
            client.primary_label(),
            err
        ))
    })?;

    replicas.sort();
    replicas.dedup();

    if replicas.is_empty() {
        return Err(BackupError::Topology(format!(
            "{} reports no replicas",
            client.primary_label()
        )));
    }

    event!(
        Level::INFO,
        replica_count = replicas.len(),
        "replicas discovered"
    );
    Ok(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryFleet;
    use crate::core::ReplicationPosition;

    #[tokio::test]
    async fn test_discovery_is_sorted_and_deduplicated() {
        let fleet = InMemoryFleet::new();
        let pos = ReplicationPosition::new("log.1", 4);
        fleet.add_replica("db3:3306", pos.clone()).await.unwrap();
        fleet.add_replica("db2:3306", pos).await.unwrap();
        fleet.add_registry_entry("db3:3306").await.unwrap();

        let replicas = discover_replicas(&fleet).await.unwrap();
        assert_eq!(
            replicas,
            vec![
                ReplicaId::new("db2:3306").unwrap(),
                ReplicaId::new("db3:3306").unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_replicas_is_fatal() {
        let fleet = InMemoryFleet::new();
        let err = discover_replicas(&fleet).await.unwrap_err();
        assert!(matches!(err, BackupError::Topology(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unreachable_primary_is_topology_error() {
        let fleet = InMemoryFleet::new();
        fleet
            .add_replica("db2:3306", ReplicationPosition::new("log.1", 4))
            .await
            .unwrap();
        fleet.set_primary_unreachable(true).await;

        let err = discover_replicas(&fleet).await.unwrap_err();
        assert!(matches!(err, BackupError::Topology(ref msg) if msg.contains("cannot list")));
    }
}
