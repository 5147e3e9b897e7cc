use crate::client::ControlClient;
use crate::core::{BackupError, ReplicaId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

#[derive(Debug, Default)]
struct Touched {
    frozen: bool,
    stopped: Vec<ReplicaId>,
}

/// Records what a run has changed on the fleet so it can be undone.
///
/// Clones share state: the binary keeps one so an interrupt can still roll the fleet back
/// after the run future has been dropped.
#[derive(Debug, Clone, Default)]
pub struct CutTracker {
    touched: Arc<Mutex<Touched>>,
}

impl CutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn mark_frozen(&self) {
        self.touched.lock().await.frozen = true;
    }

    pub(crate) async fn mark_stopped(&self, replica: &ReplicaId) {
        let mut touched = self.touched.lock().await;
        if !touched.stopped.contains(replica) {
            touched.stopped.push(replica.clone());
        }
    }

    /// True when nothing is left to undo.
    pub async fn is_clear(&self) -> bool {
        let touched = self.touched.lock().await;
        !touched.frozen && touched.stopped.is_empty()
    }

    /// Forgets everything recorded, once the fleet has been released normally.
    pub async fn disarm(&self) {
        *self.touched.lock().await = Touched::default();
    }

    /// Best-effort undo: unfreeze the primary and restart every replica this run stopped.
    ///
    /// Every step is attempted; failures are returned as release errors. Calling it again
    /// afterwards does nothing.
    pub async fn rollback(&self, client: &dyn ControlClient) -> Vec<BackupError> {
        let touched = std::mem::take(&mut *self.touched.lock().await);
        let mut failures = Vec::new();

        for replica in &touched.stopped {
            if let Err(err) = client.resume_replication(replica).await {
                failures.push(BackupError::release(replica.as_str(), err));
            }
        }
        if touched.frozen {
            if let Err(err) = client.unfreeze_log().await {
                failures.push(BackupError::release(client.primary_label(), err));
            }
        }

        event!(
            Level::INFO,
            unfrozen = touched.frozen,
            restarted = touched.stopped.len(),
            failures = failures.len(),
            "fleet rolled back"
        );
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FleetCall, InMemoryFleet};
    use crate::core::ReplicationPosition;

    #[tokio::test]
    async fn test_rollback_runs_once() {
        let fleet = InMemoryFleet::new();
        fleet
            .add_replica("db2:3306", ReplicationPosition::new("log.1", 4))
            .await
            .unwrap();
        let tracker = CutTracker::new();
        tracker.mark_frozen().await;
        tracker
            .mark_stopped(&ReplicaId::new("db2:3306").unwrap())
            .await;
        assert!(!tracker.is_clear().await);

        assert!(tracker.rollback(&fleet).await.is_empty());
        assert!(tracker.is_clear().await);
        assert!(tracker.rollback(&fleet).await.is_empty());

        let calls = fleet.calls().await;
        assert_eq!(
            calls,
            vec![
                FleetCall::Resume(ReplicaId::new("db2:3306").unwrap()),
                FleetCall::Unfreeze
            ]
        );
    }

    #[tokio::test]
    async fn test_rollback_continues_past_failures() {
        let fleet = InMemoryFleet::new();
        fleet
            .add_replica("db2:3306", ReplicationPosition::new("log.1", 4))
            .await
            .unwrap();
        let tracker = CutTracker::new();
        tracker.mark_frozen().await;
        tracker
            .mark_stopped(&ReplicaId::new("gone:3306").unwrap())
            .await;

        let failures = tracker.rollback(&fleet).await;
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].is_fatal());
        assert!(fleet.calls().await.contains(&FleetCall::Unfreeze));
    }
}
