use crate::core::{BackupError, ChunkAssignment, ReplicaId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;

/// Durable, shared storage for the chunk plan of the current run.
///
/// A store holds at most one plan. [`PlanStore::clear`] must run before
/// [`PlanStore::persist`] at the start of every run so that no row of an earlier run is
/// visible to the new run's dispatcher.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Removes every stored assignment.
    async fn clear(&self) -> Result<()>;

    /// Adds `assignments` to the store. A replica may appear only once.
    async fn persist(&self, assignments: &[ChunkAssignment]) -> Result<()>;

    /// The assignment stored for `replica`, if any.
    async fn lookup(&self, replica: &ReplicaId) -> Result<Option<ChunkAssignment>>;

    /// Every stored assignment, ordered by chunk start.
    async fn all(&self) -> Result<Vec<ChunkAssignment>>;
}

fn merge_assignments(
    existing: &mut Vec<ChunkAssignment>,
    assignments: &[ChunkAssignment],
) -> Result<()> {
    for assignment in assignments {
        if existing.iter().any(|a| a.replica == assignment.replica) {
            return Err(BackupError::Partition(format!(
                "plan already holds a chunk for replica '{}'",
                assignment.replica
            )));
        }
        existing.push(assignment.clone());
    }
    existing.sort_by(|a, b| {
        a.chunk_start
            .cmp(&b.chunk_start)
            .then_with(|| a.replica.cmp(&b.replica))
    });
    Ok(())
}

/// Plan store kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryPlanStore {
    assignments: Arc<Mutex<Vec<ChunkAssignment>>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn clear(&self) -> Result<()> {
        self.assignments.lock().await.clear();
        Ok(())
    }

    async fn persist(&self, assignments: &[ChunkAssignment]) -> Result<()> {
        let mut stored = self.assignments.lock().await;
        merge_assignments(&mut stored, assignments)
    }

    async fn lookup(&self, replica: &ReplicaId) -> Result<Option<ChunkAssignment>> {
        let stored = self.assignments.lock().await;
        Ok(stored.iter().find(|a| &a.replica == replica).cloned())
    }

    async fn all(&self) -> Result<Vec<ChunkAssignment>> {
        Ok(self.assignments.lock().await.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlanDocument {
    #[serde(default)]
    assignments: Vec<ChunkAssignment>,
}

/// Plan store backed by a single JSON document, typically on shared storage.
///
/// Each write goes to a fresh temp file next to the document, which is then persisted
/// over it.
#[derive(Debug)]
pub struct JsonFilePlanStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFilePlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<PlanDocument> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                BackupError::Json(format!(
                    "Failed to parse plan '{}': {}",
                    self.path.display(),
                    err
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PlanDocument::default()),
            Err(err) => Err(BackupError::Io(format!(
                "Failed to read plan '{}': {}",
                self.path.display(),
                err
            ))),
        }
    }

    async fn store(&self, document: &PlanDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        replace_file(self.path.clone(), bytes).await
    }
}

#[async_trait]
impl PlanStore for JsonFilePlanStore {
    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store(&PlanDocument::default()).await
    }

    async fn persist(&self, assignments: &[ChunkAssignment]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        merge_assignments(&mut document.assignments, assignments)?;
        self.store(&document).await
    }

    async fn lookup(&self, replica: &ReplicaId) -> Result<Option<ChunkAssignment>> {
        let document = self.load().await?;
        Ok(document
            .assignments
            .into_iter()
            .find(|a| &a.replica == replica))
    }

    async fn all(&self) -> Result<Vec<ChunkAssignment>> {
        Ok(self.load().await?.assignments)
    }
}

/// Replaces `path` with `bytes` through a uniquely named temp file in the same directory.
///
/// Readers see the old or the new document, never a partial one, and two writers never
/// share a temp file.
async fn replace_file(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|err| {
            BackupError::Io(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;

        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|err| {
            BackupError::Io(format!("Failed to replace '{}': {}", path.display(), err.error))
        })?;
        Ok(())
    })
    .await
    .map_err(|err| BackupError::Io(format!("Plan writer task failed: {}", err)))?
}
