//! Workload partitioning: which slice of the table list each replica dumps.

use crate::core::{BackupError, ChunkAssignment, ReplicaId, Result};
use tracing::{Level, event};

pub mod sql_store;
pub mod store;

pub use sql_store::SqlPlanStore;
pub use store::{InMemoryPlanStore, JsonFilePlanStore, PlanStore};

/// Splits `table_count` tables over `replicas` in discovery order.
///
/// Every replica gets `ceil(table_count / replicas.len())` tables starting at
/// `index * chunk_size`; the tail is clamped so the chunks cover `[0, table_count)` exactly
/// once. When there are more replicas than tables the trailing replicas get empty chunks.
///
/// No tables yields an empty plan. No replicas is a [`BackupError::Partition`], checked first.
pub fn plan_chunks(table_count: usize, replicas: &[ReplicaId]) -> Result<Vec<ChunkAssignment>> {
    if replicas.is_empty() {
        return Err(BackupError::Partition(
            "cannot partition tables over zero replicas".to_string(),
        ));
    }
    if table_count == 0 {
        return Ok(Vec::new());
    }

    let chunk_size = table_count.div_ceil(replicas.len());
    let plan = replicas
        .iter()
        .enumerate()
        .map(|(index, replica)| {
            let chunk_start = index * chunk_size;
            let effective = chunk_size.min(table_count.saturating_sub(chunk_start));
            ChunkAssignment::new(replica.clone(), chunk_start, effective)
        })
        .collect::<Vec<_>>();

    event!(
        Level::DEBUG,
        table_count,
        replica_count = replicas.len(),
        chunk_size,
        "plan computed"
    );
    Ok(plan)
}

/// Clears whatever plan the store holds and writes `assignments` in its place.
pub async fn replace_plan(store: &dyn PlanStore, assignments: &[ChunkAssignment]) -> Result<()> {
    store.clear().await?;
    store.persist(assignments).await?;
    event!(
        Level::INFO,
        chunk_count = assignments.len(),
        "plan persisted"
    );
    Ok(())
}
