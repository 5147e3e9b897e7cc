use super::{ExportJob, ExportLauncher};
use crate::config::{BackupConfig, DEFAULT_PORT};
use crate::core::{BackupError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{Level, event};

/// Launches `mysqldump` against the replica that owns a chunk.
///
/// Dumps use `--single-transaction`, so each export reads one snapshot even after
/// replication on the replica resumes.
#[derive(Debug, Clone)]
pub struct MysqldumpLauncher {
    mysqldump_bin: PathBuf,
    defaults_file: Option<PathBuf>,
    user: Option<String>,
    extra_args: Vec<String>,
}

impl MysqldumpLauncher {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            mysqldump_bin: config.mysqldump_bin.clone(),
            defaults_file: config.defaults_file.clone(),
            user: config.primary.user.clone(),
            extra_args: config.dump_args.clone(),
        }
    }

    /// Command line (without the program) for `job`.
    pub fn args(&self, job: &ExportJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(defaults_file) = &self.defaults_file {
            args.push(format!("--defaults-extra-file={}", defaults_file.display()).into());
        }
        args.push("-h".into());
        args.push(job.replica.host().into());
        args.push("-P".into());
        args.push(job.replica.port().unwrap_or(DEFAULT_PORT).to_string().into());
        if let Some(user) = &self.user {
            args.push("-u".into());
            args.push(user.into());
        }
        args.push("--single-transaction".into());

        let mut result_file = OsString::from("--result-file=");
        result_file.push(&job.destination);
        args.push(result_file);

        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(job.schema.as_str().into());
        args.extend(job.tables.iter().map(OsString::from));
        args
    }
}

#[async_trait]
impl ExportLauncher for MysqldumpLauncher {
    async fn launch(&self, job: ExportJob) -> Result<()> {
        if job.tables.is_empty() {
            return Err(BackupError::Client(format!(
                "refusing to dump the whole schema from {} for an empty chunk",
                job.replica
            )));
        }

        let mut child = Command::new(&self.mysqldump_bin)
            .args(self.args(&job))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                BackupError::Client(format!(
                    "failed to start '{}' for {}: {}",
                    self.mysqldump_bin.display(),
                    job.replica,
                    err
                ))
            })?;

        // Completion is only logged; nobody waits on it.
        let replica = job.replica.clone();
        let destination = job.destination.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    event!(Level::INFO, replica = %replica, destination = %destination.display(), "export finished");
                }
                Ok(status) => {
                    event!(Level::ERROR, replica = %replica, status = %status, "export exited with failure");
                }
                Err(err) => {
                    event!(Level::ERROR, replica = %replica, error = %err, "export could not be awaited");
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::core::ReplicaId;

    fn job() -> ExportJob {
        ExportJob {
            replica: ReplicaId::new("db3.internal:3307").unwrap(),
            schema: "shop".to_string(),
            tables: vec!["orders".to_string(), "payments".to_string()],
            destination: PathBuf::from("/backups/shop_db3.internal_c3307.sql"),
        }
    }

    #[test]
    fn test_args_target_the_replica() {
        let mut config =
            BackupConfig::new(Endpoint::new("db1", 3306).user("backup"), "shop")
                .defaults_file("/etc/fleetdump/client.cnf");
        config.dump_args = vec!["--routines".to_string()];
        let launcher = MysqldumpLauncher::new(&config);

        let args = launcher
            .args(&job())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            args,
            vec![
                "--defaults-extra-file=/etc/fleetdump/client.cnf",
                "-h",
                "db3.internal",
                "-P",
                "3307",
                "-u",
                "backup",
                "--single-transaction",
                "--result-file=/backups/shop_db3.internal_c3307.sql",
                "--routines",
                "shop",
                "orders",
                "payments",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chunk_is_refused() {
        let config = BackupConfig::new(Endpoint::new("db1", 3306), "shop");
        let launcher = MysqldumpLauncher::new(&config);
        let mut empty = job();
        empty.tables.clear();
        assert!(launcher.launch(empty).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_launch_failure() {
        let mut config = BackupConfig::new(Endpoint::new("db1", 3306), "shop");
        config.mysqldump_bin = PathBuf::from("/nonexistent/fleetdump-mysqldump");
        let launcher = MysqldumpLauncher::new(&config);
        let err = launcher.launch(job()).await.unwrap_err();
        assert!(matches!(err, BackupError::Client(ref msg) if msg.contains("failed to start")));
    }
}
