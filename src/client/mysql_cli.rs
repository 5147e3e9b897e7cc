//! `mysql` command-line transport for [`ControlClient`].
//!
//! Each control statement runs as one `mysql -N -B -e <sql>` invocation. Output is parsed
//! from the batch (tab separated) or vertical (`\G`) formats.

use super::ControlClient;
use crate::config::{BackupConfig, DEFAULT_PORT, Endpoint, is_identifier};
use crate::core::{BackupError, ReplicaId, ReplicationPosition, Result, TableList};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Pause between `SHOW SLAVE STATUS` polls while a replica replays to its stop position.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Control client that shells out to the `mysql` binary.
#[derive(Debug, Clone)]
pub struct MysqlCliClient {
    mysql_bin: PathBuf,
    defaults_file: Option<PathBuf>,
    primary: Endpoint,
    freeze_statement: String,
    unfreeze_statement: String,
}

impl MysqlCliClient {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            mysql_bin: config.mysql_bin.clone(),
            defaults_file: config.defaults_file.clone(),
            primary: config.primary.clone(),
            freeze_statement: config.freeze_statement.clone(),
            unfreeze_statement: config.unfreeze_statement.clone(),
        }
    }

    /// Replicas are reached with the primary's login user.
    fn replica_endpoint(&self, replica: &ReplicaId) -> Endpoint {
        Endpoint {
            host: replica.host().to_string(),
            port: replica.port().unwrap_or(DEFAULT_PORT),
            user: self.primary.user.clone(),
        }
    }

    async fn run(&self, endpoint: &Endpoint, sql: &str) -> Result<String> {
        let mut command = Command::new(&self.mysql_bin);
        if let Some(defaults_file) = &self.defaults_file {
            command.arg(format!("--defaults-extra-file={}", defaults_file.display()));
        }
        command
            .arg("-h")
            .arg(&endpoint.host)
            .arg("-P")
            .arg(endpoint.port.to_string());
        if let Some(user) = &endpoint.user {
            command.arg("-u").arg(user);
        }
        command
            .arg("-N")
            .arg("-B")
            .arg("-e")
            .arg(sql)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("mysql {} <- {}", endpoint.address(), sql);
        let output = command.output().await.map_err(|err| {
            BackupError::Client(format!(
                "Failed to start '{}' for {}: {}",
                self.mysql_bin.display(),
                endpoint.address(),
                err
            ))
        })?;

        if !output.status.success() {
            return Err(BackupError::Client(format!(
                "{} rejected statement ({}): {}",
                endpoint.address(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs `sql` on the primary and returns its rows.
    pub async fn query_primary(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let stdout = self.run(&self.primary, sql).await?;
        Ok(parse_batch_rows(&stdout))
    }
}

#[async_trait]
impl ControlClient for MysqlCliClient {
    async fn list_replicas(&self) -> Result<Vec<ReplicaId>> {
        let stdout = self.run(&self.primary, "SHOW SLAVE HOSTS").await?;
        parse_slave_hosts(&parse_batch_rows(&stdout))
    }

    async fn list_tables(&self, schema: &str) -> Result<TableList> {
        if !is_identifier(schema) {
            return Err(BackupError::Client(format!(
                "Schema '{}' is not a plain identifier",
                schema
            )));
        }
        let sql = format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            schema
        );
        let stdout = self.run(&self.primary, &sql).await?;
        let tables = parse_batch_rows(&stdout)
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect::<Vec<_>>();
        Ok(TableList::new(tables))
    }

    async fn freeze_log(&self) -> Result<()> {
        self.run(&self.primary, &self.freeze_statement).await?;
        Ok(())
    }

    async fn unfreeze_log(&self) -> Result<()> {
        self.run(&self.primary, &self.unfreeze_statement).await?;
        Ok(())
    }

    async fn applied_position(&self, replica: &ReplicaId) -> Result<ReplicationPosition> {
        let endpoint = self.replica_endpoint(replica);
        let stdout = self.run(&endpoint, "SHOW SLAVE STATUS\\G").await?;
        parse_slave_status(&stdout)
    }

    /// Restarts the replica with `START SLAVE UNTIL` and polls its status until the SQL
    /// thread has stopped.
    ///
    /// The SQL thread stops by itself at the UNTIL position, immediately when it is
    /// already there, so the wait is on the thread state rather than `MASTER_POS_WAIT`.
    async fn force_sync_to(
        &self,
        replica: &ReplicaId,
        position: &ReplicationPosition,
    ) -> Result<()> {
        let endpoint = self.replica_endpoint(replica);
        self.run(&endpoint, &force_sync_sql(position)?).await?;

        loop {
            let stdout = self.run(&endpoint, "SHOW SLAVE STATUS\\G").await?;
            match sync_progress(&stdout, position)? {
                SyncProgress::Reached => return Ok(()),
                SyncProgress::Replaying(applied) => {
                    debug!("{} replaying, at {} of {}", replica, applied, position);
                    tokio::time::sleep(SYNC_POLL_INTERVAL).await;
                }
                SyncProgress::Stopped(reason) => {
                    return Err(BackupError::Client(format!(
                        "{} did not reach {}: {}",
                        replica, position, reason
                    )));
                }
            }
        }
    }

    async fn resume_replication(&self, replica: &ReplicaId) -> Result<()> {
        let endpoint = self.replica_endpoint(replica);
        self.run(&endpoint, "START SLAVE").await?;
        Ok(())
    }

    fn primary_label(&self) -> String {
        format!("primary {}", self.primary.address())
    }
}

/// Splits `mysql -N -B` output into rows of tab separated fields.
pub fn parse_batch_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect()
}

/// Parses the first record of vertical (`\G`) output into `column -> value`.
pub fn parse_vertical(stdout: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut seen_record = false;
    for line in stdout.lines() {
        if line.trim_start().starts_with('*') {
            if seen_record {
                break;
            }
            seen_record = true;
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    fields
}

/// Replica identities from `SHOW SLAVE HOSTS` rows (`Server_id, Host, Port, ...`).
pub fn parse_slave_hosts(rows: &[Vec<String>]) -> Result<Vec<ReplicaId>> {
    rows.iter()
        .map(|row| {
            let (Some(host), Some(port)) = (row.get(1), row.get(2)) else {
                return Err(BackupError::Client(format!(
                    "Malformed SHOW SLAVE HOSTS row: {:?}",
                    row
                )));
            };
            let port = port.trim().parse::<u16>().map_err(|_| {
                BackupError::Client(format!("Invalid replica port '{}' for {}", port, host))
            })?;
            ReplicaId::from_host_port(host, port)
        })
        .collect()
}

/// Applied position from `SHOW SLAVE STATUS\G`.
///
/// The executed coordinates (`Relay_Master_Log_File`, `Exec_Master_Log_Pos`) are used, not
/// the IO thread's read position.
pub fn parse_slave_status(stdout: &str) -> Result<ReplicationPosition> {
    executed_position(&parse_vertical(stdout))
}

fn executed_position(fields: &HashMap<String, String>) -> Result<ReplicationPosition> {
    let log_file = fields
        .get("Relay_Master_Log_File")
        .filter(|file| !file.is_empty())
        .ok_or_else(|| {
            BackupError::Client("SHOW SLAVE STATUS returned no replication source".to_string())
        })?;
    let log_offset = fields
        .get("Exec_Master_Log_Pos")
        .and_then(|pos| pos.parse::<u64>().ok())
        .ok_or_else(|| {
            BackupError::Client("SHOW SLAVE STATUS returned no Exec_Master_Log_Pos".to_string())
        })?;
    Ok(ReplicationPosition::new(log_file.clone(), log_offset))
}

/// Where a replica stands after `START SLAVE UNTIL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncProgress {
    /// SQL thread stopped exactly at the target
    Reached,
    /// SQL thread still applying; carries the current executed position
    Replaying(ReplicationPosition),
    /// SQL thread stopped anywhere else
    Stopped(String),
}

/// Classifies one `SHOW SLAVE STATUS\G` reading against the force-sync target.
pub fn sync_progress(stdout: &str, target: &ReplicationPosition) -> Result<SyncProgress> {
    let fields = parse_vertical(stdout);
    let applied = executed_position(&fields)?;

    if fields.get("Slave_SQL_Running").map(String::as_str) == Some("Yes") {
        return Ok(SyncProgress::Replaying(applied));
    }
    if applied == *target {
        return Ok(SyncProgress::Reached);
    }

    let reason = match fields.get("Last_SQL_Error").filter(|err| !err.is_empty()) {
        Some(err) => format!("SQL thread stopped at {}: {}", applied, err),
        None if applied > *target => format!("already past the target, at {}", applied),
        None => format!("SQL thread stopped early, at {}", applied),
    };
    Ok(SyncProgress::Stopped(reason))
}

/// Statement batch that stops a replica and restarts it to replay up to `position`.
pub fn force_sync_sql(position: &ReplicationPosition) -> Result<String> {
    let file = &position.log_file;
    let valid = !file.is_empty()
        && file
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid {
        return Err(BackupError::Client(format!(
            "Refusing to interpolate log file name '{}'",
            file
        )));
    }
    Ok(format!(
        "STOP SLAVE; \
         START SLAVE UNTIL MASTER_LOG_FILE = '{file}', MASTER_LOG_POS = {pos}",
        file = file,
        pos = position.log_offset
    ))
}
