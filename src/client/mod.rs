use crate::core::{ReplicaId, ReplicationPosition, Result, TableList};
use async_trait::async_trait;

pub mod in_memory;
pub mod mysql_cli;

#[cfg(all(test, unix))]
pub(crate) mod fake_cli;

pub use in_memory::{FleetCall, InMemoryFleet};
pub use mysql_cli::MysqlCliClient;

/// Control operations against the primary and its replicas.
///
/// Every coordination phase is written against this trait; transports only have to
/// implement the individual statements.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Replica identities from the primary's replication registry, in registry order.
    async fn list_replicas(&self) -> Result<Vec<ReplicaId>>;

    /// Tables of `schema`, in a stable order.
    async fn list_tables(&self, schema: &str) -> Result<TableList>;

    /// Stops the primary from writing new binlog events.
    async fn freeze_log(&self) -> Result<()>;

    /// Undoes [`ControlClient::freeze_log`].
    async fn unfreeze_log(&self) -> Result<()>;

    /// Position up to which `replica` has applied the replication stream.
    async fn applied_position(&self, replica: &ReplicaId) -> Result<ReplicationPosition>;

    /// Stops replication on `replica` and blocks until it has applied exactly up to
    /// `position`.
    async fn force_sync_to(&self, replica: &ReplicaId, position: &ReplicationPosition)
    -> Result<()>;

    /// Restarts replication on `replica`.
    async fn resume_replication(&self, replica: &ReplicaId) -> Result<()>;

    /// Label used for the primary in logs and reports.
    fn primary_label(&self) -> String {
        "primary".to_string()
    }
}
