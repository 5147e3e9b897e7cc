use crate::core::{BackupError, Result};
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

lazy_static! {
    static ref ACTIVE_LEASES: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Exclusive right to run a backup, keyed by lock file.
///
/// Held in-process through a registry of active lock paths and across processes through
/// the lock file itself, created with `create_new`. Both are released on drop.
#[derive(Debug)]
pub struct RunLease {
    lock_file: PathBuf,
}

impl RunLease {
    pub fn acquire(lock_file: &Path) -> Result<Self> {
        let lock_file = lock_file.to_path_buf();
        {
            let mut active = ACTIVE_LEASES.lock()?;
            if !active.insert(lock_file.clone()) {
                return Err(BackupError::Lock(format!(
                    "a backup run already holds '{}' in this process",
                    lock_file.display()
                )));
            }
        }

        match Self::create_lock_file(&lock_file) {
            Ok(()) => Ok(Self { lock_file }),
            Err(err) => {
                if let Ok(mut active) = ACTIVE_LEASES.lock() {
                    active.remove(&lock_file);
                }
                Err(err)
            }
        }
    }

    fn create_lock_file(path: &Path) -> Result<()> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                return Err(BackupError::Lock(format!(
                    "lock file '{}' exists (held by pid {})",
                    path.display(),
                    holder.trim()
                )));
            }
            Err(err) => {
                return Err(BackupError::Lock(format!(
                    "cannot create lock file '{}': {}",
                    path.display(),
                    err
                )));
            }
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(())
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_file);
        if let Ok(mut active) = ACTIVE_LEASES.lock() {
            active.remove(&self.lock_file);
        }
    }
}
