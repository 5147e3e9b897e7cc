//! Consistent cut across the replica fleet.
//!
//! Freeze the primary, elect the replica that has applied the furthest, replay every
//! replica to exactly that position and check that they all report it. Each phase is a
//! barrier for the whole fleet.

use crate::client::ControlClient;
use crate::core::{BackupError, ReplicaId, ReplicationPosition, Result};
use serde::Serialize;
use tracing::{Level, event};

pub mod tracker;

pub use tracker::CutTracker;

/// Proof that every replica was brought to the same replication position.
///
/// Only [`establish_cut`] produces one; releasing the fleet requires it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistentCut {
    position: ReplicationPosition,
    elected: ReplicaId,
    excluded_from_vote: Vec<ReplicaId>,
}

impl ConsistentCut {
    /// The agreed position.
    pub fn position(&self) -> &ReplicationPosition {
        &self.position
    }

    /// The replica whose applied position was elected.
    pub fn elected(&self) -> &ReplicaId {
        &self.elected
    }

    /// Replicas whose position could not be read during the election.
    pub fn excluded_from_vote(&self) -> &[ReplicaId] {
        &self.excluded_from_vote
    }
}

/// Outcome of the furthest-replica election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub replica: ReplicaId,
    pub position: ReplicationPosition,
    /// Replicas that did not answer, with the reason
    pub excluded: Vec<(ReplicaId, String)>,
}

/// Freezes binlog writes on the primary.
pub async fn freeze_primary(client: &dyn ControlClient, tracker: &CutTracker) -> Result<()> {
    client.freeze_log().await.map_err(|err| {
        BackupError::Sync(format!(
            "cannot freeze binlog on {}: {}",
            client.primary_label(),
            err
        ))
    })?;
    tracker.mark_frozen().await;
    event!(Level::INFO, "primary binlog frozen");
    Ok(())
}

/// Queries every replica's applied position and returns the maximum.
///
/// A replica that cannot be queried is left out of the vote rather than counted with a
/// default position. If no replica answers the election fails.
pub async fn elect_furthest(
    client: &dyn ControlClient,
    replicas: &[ReplicaId],
) -> Result<Election> {
    let mut best: Option<(ReplicaId, ReplicationPosition)> = None;
    let mut excluded = Vec::new();

    for replica in replicas {
        match client.applied_position(replica).await {
            Ok(position) => {
                event!(Level::DEBUG, replica = %replica, position = %position, "applied position");
                let is_further = best
                    .as_ref()
                    .is_none_or(|(_, current)| position > *current);
                if is_further {
                    best = Some((replica.clone(), position));
                }
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    replica = %replica,
                    error = %err,
                    "replica excluded from election"
                );
                excluded.push((replica.clone(), err.to_string()));
            }
        }
    }

    let Some((replica, position)) = best else {
        let reasons = excluded
            .iter()
            .map(|(replica, reason)| format!("{} ({})", replica, reason))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(BackupError::Sync(format!(
            "no replica reported its position: {}",
            reasons
        )));
    };

    event!(Level::INFO, replica = %replica, position = %position, "furthest replica elected");
    Ok(Election {
        replica,
        position,
        excluded,
    })
}

/// Replays every replica to `position`, blocking until each one is there.
///
/// Unlike the election, an unreachable replica here aborts the cut.
pub async fn force_sync_all(
    client: &dyn ControlClient,
    replicas: &[ReplicaId],
    position: &ReplicationPosition,
    tracker: &CutTracker,
) -> Result<()> {
    for replica in replicas {
        tracker.mark_stopped(replica).await;
        client
            .force_sync_to(replica, position)
            .await
            .map_err(|err| {
                BackupError::Sync(format!(
                    "cannot sync replica {} to {}: {}",
                    replica, position, err
                ))
            })?;
        event!(Level::DEBUG, replica = %replica, "replica synced");
    }
    event!(Level::INFO, replica_count = replicas.len(), position = %position, "fleet synced");
    Ok(())
}

/// Checks that every replica reports exactly `position`.
pub async fn verify_cut(
    client: &dyn ControlClient,
    replicas: &[ReplicaId],
    position: &ReplicationPosition,
) -> Result<()> {
    for replica in replicas {
        let applied = client.applied_position(replica).await.map_err(|err| {
            BackupError::Sync(format!("cannot verify replica {}: {}", replica, err))
        })?;
        if applied != *position {
            return Err(BackupError::Sync(format!(
                "replica {} is at {} instead of {}",
                replica, applied, position
            )));
        }
    }
    Ok(())
}

/// Runs freeze, election, force-sync and verification in order.
///
/// On failure everything this call touched is rolled back through `tracker` before the
/// error is returned: the primary is unfrozen and stopped replicas are restarted.
pub async fn establish_cut(
    client: &dyn ControlClient,
    replicas: &[ReplicaId],
    tracker: &CutTracker,
) -> Result<ConsistentCut> {
    match run_cut_phases(client, replicas, tracker).await {
        Ok(cut) => Ok(cut),
        Err(err) => {
            event!(Level::ERROR, error = %err, "consistent cut failed, rolling back");
            for failure in tracker.rollback(client).await {
                event!(Level::WARN, error = %failure, "rollback step failed");
            }
            Err(err)
        }
    }
}

async fn run_cut_phases(
    client: &dyn ControlClient,
    replicas: &[ReplicaId],
    tracker: &CutTracker,
) -> Result<ConsistentCut> {
    freeze_primary(client, tracker).await?;
    let election = elect_furthest(client, replicas).await?;
    force_sync_all(client, replicas, &election.position, tracker).await?;
    verify_cut(client, replicas, &election.position).await?;

    Ok(ConsistentCut {
        position: election.position,
        elected: election.replica,
        excluded_from_vote: election
            .excluded
            .into_iter()
            .map(|(replica, _)| replica)
            .collect(),
    })
}
