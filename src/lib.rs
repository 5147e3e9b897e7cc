// ============================================================================
// fleetdump Library
// ============================================================================

pub mod alert;
pub mod client;
pub mod config;
pub mod core;
pub mod cut;
pub mod dispatch;
pub mod plan;
pub mod release;
pub mod run;
pub mod topology;

// Re-export main types for convenience
pub use crate::core::{BackupError, ChunkAssignment, ReplicaId, ReplicationPosition, Result, TableList};

pub use alert::{Alerter, CommandAlerter, LogAlerter};
pub use client::{ControlClient, FleetCall, InMemoryFleet, MysqlCliClient};
pub use config::{BackupConfig, Endpoint, PlanStoreConfig};
pub use cut::{ConsistentCut, CutTracker, Election, establish_cut};
pub use dispatch::{
    DispatchOutcome, ExportJob, ExportLauncher, MysqldumpLauncher, destination_for,
    dispatch_exports,
};
pub use plan::{
    InMemoryPlanStore, JsonFilePlanStore, PlanStore, SqlPlanStore, plan_chunks, replace_plan,
};
pub use release::release_fleet;
pub use run::{BackupCoordinator, BackupRun, RunLease, RunReport, RunSettings};
pub use topology::discover_replicas;
