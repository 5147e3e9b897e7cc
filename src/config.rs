use crate::core::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default MySQL port
pub const DEFAULT_PORT: u16 = 3306;

/// Address of a database node the control client talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user, forwarded to the client tools as-is
    #[serde(default)]
    pub user: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: None,
        }
    }

    /// Set the login user
    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Parse from an endpoint string
    ///
    /// Format: "mysql://user@host:port", "user@host:port" or "host[:port]"
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let primary = Endpoint::from_url("mysql://backup@db1.internal:3306")?;
    /// ```
    pub fn from_url(url: &str) -> std::result::Result<Self, String> {
        let rest = url.strip_prefix("mysql://").unwrap_or(url);
        let (user, host_port) = match rest.split_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user), host_port),
            Some(_) => return Err("Empty user before '@'".to_string()),
            None => (None, rest),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| format!("Invalid port '{}'", port))?,
            ),
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }

        let mut endpoint = Self::new(host, port);
        endpoint.user = user.map(str::to_string);
        Ok(endpoint)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where the chunk plan is kept between the partitioner and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStoreConfig {
    /// Process memory only; useful for dry runs
    Memory,
    /// A JSON document on shared storage
    JsonFile { path: PathBuf },
    /// A table on the primary, named `database.table`
    Sql { table: String },
}

impl Default for PlanStoreConfig {
    fn default() -> Self {
        Self::Sql {
            table: "fleetdump.backup_chunks".to_string(),
        }
    }
}

/// Backup run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Primary node; its replica registry drives discovery
    pub primary: Endpoint,

    /// Schema being backed up
    pub schema: String,

    /// Directory receiving one dump file per replica
    pub destination: PathBuf,

    /// Plan store backend
    pub plan_store: PlanStoreConfig,

    /// Lock file guarding against concurrent runs on this host
    pub lock_file: PathBuf,

    /// `mysql` client binary
    pub mysql_bin: PathBuf,

    /// `mysqldump` binary
    pub mysqldump_bin: PathBuf,

    /// Option file passed to both client tools via `--defaults-extra-file`
    pub defaults_file: Option<PathBuf>,

    /// Statement that stops the primary from writing new binlog events
    pub freeze_statement: String,

    /// Statement that undoes `freeze_statement`
    pub unfreeze_statement: String,

    /// Extra arguments appended to every `mysqldump` invocation
    pub dump_args: Vec<String>,

    /// Program receiving alert text on stdin, e.g. `["mail", "-s", "backup", "ops@example.com"]`
    pub alert_command: Option<Vec<String>>,
}

impl BackupConfig {
    /// Create a new configuration for `schema` on the given primary
    pub fn new(primary: Endpoint, schema: &str) -> Self {
        Self {
            primary,
            schema: schema.to_string(),
            destination: PathBuf::from("/var/backups/fleetdump"),
            plan_store: PlanStoreConfig::default(),
            lock_file: std::env::temp_dir().join("fleetdump.lock"),
            mysql_bin: PathBuf::from("mysql"),
            mysqldump_bin: PathBuf::from("mysqldump"),
            defaults_file: None,
            freeze_statement: "SET GLOBAL super_read_only = ON".to_string(),
            unfreeze_statement: "SET GLOBAL super_read_only = OFF".to_string(),
            dump_args: Vec::new(),
            alert_command: None,
        }
    }

    /// Set the dump destination directory
    pub fn destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Set the plan store backend
    pub fn plan_store(mut self, plan_store: PlanStoreConfig) -> Self {
        self.plan_store = plan_store;
        self
    }

    /// Set the lock file path
    pub fn lock_file(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.lock_file = lock_file.into();
        self
    }

    /// Set the client option file
    pub fn defaults_file(mut self, defaults_file: impl Into<PathBuf>) -> Self {
        self.defaults_file = Some(defaults_file.into());
        self
    }

    /// Set the freeze/unfreeze statement pair
    pub fn freeze_statements(mut self, freeze: &str, unfreeze: &str) -> Self {
        self.freeze_statement = freeze.to_string();
        self.unfreeze_statement = unfreeze.to_string();
        self
    }

    /// Set the alert program
    pub fn alert_command(mut self, command: Vec<String>) -> Self {
        self.alert_command = Some(command);
        self
    }

    /// Load a configuration from a JSON file
    ///
    /// Missing fields fall back to [`BackupConfig::default`].
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BackupError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                err
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            BackupError::Config(format!(
                "Failed to parse config '{}': {}",
                path.display(),
                err
            ))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.primary.host.trim().is_empty() {
            return Err("Primary host cannot be empty".to_string());
        }

        if self.schema.trim().is_empty() {
            return Err("Schema cannot be empty".to_string());
        }

        if !is_identifier(&self.schema) {
            return Err(format!("Schema '{}' is not a plain identifier", self.schema));
        }

        if let PlanStoreConfig::Sql { table } = &self.plan_store {
            let (database, _) = split_qualified(table)
                .ok_or_else(|| format!("Plan table '{}' must be named database.table", table))?;
            if database == self.schema {
                return Err(format!(
                    "Plan table '{}' cannot live in the schema being backed up",
                    table
                ));
            }
        }

        if self.destination.as_os_str().is_empty() {
            return Err("Destination cannot be empty".to_string());
        }

        if self.freeze_statement.trim().is_empty() || self.unfreeze_statement.trim().is_empty() {
            return Err("Freeze and unfreeze statements are required".to_string());
        }

        if matches!(&self.alert_command, Some(command) if command.is_empty()) {
            return Err("alert_command must name a program".to_string());
        }

        Ok(())
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self::new(Endpoint::new("localhost", DEFAULT_PORT), "")
    }
}

/// Names interpolated into control statements are restricted to `[A-Za-z0-9_$]`.
pub(crate) fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Splits `database.table`, both parts plain identifiers.
pub(crate) fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (database, table) = name.split_once('.')?;
    (is_identifier(database) && is_identifier(table)).then_some((database, table))
}
