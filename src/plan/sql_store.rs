use super::PlanStore;
use crate::client::MysqlCliClient;
use crate::config::split_qualified;
use crate::core::{BackupError, ChunkAssignment, ReplicaId, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Plan store kept in one global table on the primary.
///
/// The table replicates like any other, so after the consistent cut each replica also
/// holds the plan of the current run. The client connects without a default database, so
/// the table is always addressed as `database.table`.
pub struct SqlPlanStore {
    client: Arc<MysqlCliClient>,
    database: String,
    table: String,
}

impl SqlPlanStore {
    pub fn new(client: Arc<MysqlCliClient>, table: &str) -> Result<Self> {
        let (database, _) = split_qualified(table).ok_or_else(|| {
            BackupError::Config(format!(
                "Plan table '{}' must be named database.table",
                table
            ))
        })?;
        Ok(Self {
            client,
            database: database.to_string(),
            table: table.to_string(),
        })
    }

    fn clear_sql(&self) -> String {
        format!(
            "CREATE DATABASE IF NOT EXISTS {}; {}; DELETE FROM {}",
            self.database,
            self.create_sql(),
            self.table
        )
    }

    fn create_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             host VARCHAR(255) NOT NULL PRIMARY KEY, \
             chunk_start INT UNSIGNED NOT NULL, \
             chunk_size INT UNSIGNED NOT NULL)",
            self.table
        )
    }

    fn select_sql(&self, replica: Option<&ReplicaId>) -> String {
        let filter = replica
            .map(|r| format!(" WHERE host = {}", sql_quote(r.as_str())))
            .unwrap_or_default();
        format!(
            "SELECT host, chunk_start, chunk_size FROM {}{} ORDER BY chunk_start, host",
            self.table, filter
        )
    }

    fn insert_sql(&self, assignments: &[ChunkAssignment]) -> String {
        let values = assignments
            .iter()
            .map(|a| {
                format!(
                    "({}, {}, {})",
                    sql_quote(a.replica.as_str()),
                    a.chunk_start,
                    a.chunk_size
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} (host, chunk_start, chunk_size) VALUES {}",
            self.table, values
        )
    }

    async fn query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        self.client
            .query_primary(sql)
            .await
            .map_err(|err| BackupError::Partition(format!("plan table {}: {}", self.table, err)))
    }
}

#[async_trait]
impl PlanStore for SqlPlanStore {
    async fn clear(&self) -> Result<()> {
        self.query(&self.clear_sql()).await?;
        Ok(())
    }

    async fn persist(&self, assignments: &[ChunkAssignment]) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        self.query(&self.insert_sql(assignments)).await?;
        Ok(())
    }

    async fn lookup(&self, replica: &ReplicaId) -> Result<Option<ChunkAssignment>> {
        let rows = self.query(&self.select_sql(Some(replica))).await?;
        Ok(parse_plan_rows(&rows)?.into_iter().next())
    }

    async fn all(&self) -> Result<Vec<ChunkAssignment>> {
        let rows = self.query(&self.select_sql(None)).await?;
        parse_plan_rows(&rows)
    }
}

/// Quotes a string literal for MySQL.
fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Decodes `host, chunk_start, chunk_size` rows.
pub fn parse_plan_rows(rows: &[Vec<String>]) -> Result<Vec<ChunkAssignment>> {
    rows.iter()
        .map(|row| {
            let [host, start, size] = row.as_slice() else {
                return Err(BackupError::Partition(format!(
                    "Malformed plan row: {:?}",
                    row
                )));
            };
            let parse = |field: &str| {
                field.trim().parse::<usize>().map_err(|_| {
                    BackupError::Partition(format!("Invalid plan number '{}' for {}", field, host))
                })
            };
            Ok(ChunkAssignment::new(
                ReplicaId::new(host.as_str())?,
                parse(start)?,
                parse(size)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, Endpoint};

    fn store(table: &str) -> Result<SqlPlanStore> {
        let config = BackupConfig::new(Endpoint::new("db1", 3306), "shop");
        SqlPlanStore::new(Arc::new(MysqlCliClient::new(&config)), table)
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        assert!(store("ops.backup_chunks").is_ok());
        assert!(matches!(store("backup_chunks"), Err(BackupError::Config(_))));
        assert!(matches!(
            store("chunks; DROP TABLE users"),
            Err(BackupError::Config(_))
        ));
    }

    #[test]
    fn test_statements() {
        let store = store("ops.backup_chunks").unwrap();
        let replica = ReplicaId::new("db2:3306").unwrap();
        assert_eq!(
            store.select_sql(Some(&replica)),
            "SELECT host, chunk_start, chunk_size FROM ops.backup_chunks \
             WHERE host = 'db2:3306' ORDER BY chunk_start, host"
        );
        assert_eq!(
            store.insert_sql(&[
                ChunkAssignment::new(replica, 0, 4),
                ChunkAssignment::new(ReplicaId::new("db3:3306").unwrap(), 4, 2),
            ]),
            "INSERT INTO ops.backup_chunks (host, chunk_start, chunk_size) \
             VALUES ('db2:3306', 0, 4), ('db3:3306', 4, 2)"
        );
    }

    #[test]
    fn test_clear_creates_database_and_table() {
        let sql = store("ops.backup_chunks").unwrap().clear_sql();
        assert!(sql.starts_with("CREATE DATABASE IF NOT EXISTS ops; CREATE TABLE IF NOT EXISTS ops.backup_chunks ("));
        assert!(sql.ends_with("; DELETE FROM ops.backup_chunks"));
    }

    #[test]
    fn test_sql_quote_escapes() {
        assert_eq!(sql_quote("it's"), "'it''s'");
        assert_eq!(sql_quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_parse_plan_rows() {
        let rows = vec![
            vec!["db2:3306".to_string(), "0".to_string(), "4".to_string()],
            vec!["db3:3306".to_string(), "4".to_string(), "2".to_string()],
        ];
        let plan = parse_plan_rows(&rows).unwrap();
        assert_eq!(plan[1].replica.as_str(), "db3:3306");
        assert_eq!(plan[1].chunk_size, 2);

        let malformed = vec![vec!["db2:3306".to_string(), "x".to_string(), "4".to_string()]];
        assert!(parse_plan_rows(&malformed).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_default_table_is_created_with_its_database() {
        use crate::client::fake_cli::FakeMysql;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeMysql::install(dir.path(), &[]);
        let mut config = BackupConfig::new(Endpoint::new("db1", 3306), "shop");
        config.mysql_bin = fake.bin();
        let crate::config::PlanStoreConfig::Sql { table } = &config.plan_store else {
            panic!("default plan store is the SQL table");
        };
        let store = SqlPlanStore::new(Arc::new(MysqlCliClient::new(&config)), table).unwrap();

        store.clear().await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].iter().any(|arg| arg == "-D" || arg.starts_with("--database")));
        let sql = calls[0].last().unwrap();
        assert!(sql.starts_with("CREATE DATABASE IF NOT EXISTS fleetdump;"));
        assert!(sql.ends_with("DELETE FROM fleetdump.backup_chunks"));
    }
}
