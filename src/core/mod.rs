pub mod error;
pub mod types;

pub use error::{BackupError, Result};
pub use types::{ChunkAssignment, ReplicaId, ReplicationPosition, TableList};
