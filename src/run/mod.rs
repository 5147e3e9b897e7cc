//! One backup run, from discovery to release.

use crate::alert::{Alerter, CommandAlerter, LogAlerter};
use crate::client::{ControlClient, MysqlCliClient};
use crate::config::{BackupConfig, PlanStoreConfig};
use crate::core::{BackupError, ChunkAssignment, ReplicaId, Result, TableList};
use crate::cut::{ConsistentCut, CutTracker, establish_cut};
use crate::dispatch::{ExportLauncher, MysqldumpLauncher, dispatch_exports};
use crate::plan::{
    InMemoryPlanStore, JsonFilePlanStore, PlanStore, SqlPlanStore, plan_chunks, replace_plan,
};
use crate::release::release_fleet;
use crate::topology::discover_replicas;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub mod lease;
pub mod report;

pub use lease::RunLease;
pub use report::RunReport;

/// State of the run in progress.
///
/// Constructing one requires the [`RunLease`], so two runs cannot share a lock file.
#[derive(Debug)]
pub struct BackupRun {
    id: Uuid,
    replicas: Vec<ReplicaId>,
    tables: TableList,
    plan: Vec<ChunkAssignment>,
    cut: Option<ConsistentCut>,
    lease: RunLease,
}

impl BackupRun {
    pub fn begin(id: Uuid, lease: RunLease) -> Self {
        Self {
            id,
            replicas: Vec::new(),
            tables: TableList::default(),
            plan: Vec::new(),
            cut: None,
            lease,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    pub fn tables(&self) -> &TableList {
        &self.tables
    }

    pub fn plan(&self) -> &[ChunkAssignment] {
        &self.plan
    }

    pub fn cut(&self) -> Option<&ConsistentCut> {
        self.cut.as_ref()
    }

    pub fn lease(&self) -> &RunLease {
        &self.lease
    }
}

/// Where a run writes and which lock it takes.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub schema: String,
    pub destination: PathBuf,
    pub lock_file: PathBuf,
}

/// Drives a [`BackupRun`] through discovery, partitioning, the consistent cut, dispatch and
/// release.
pub struct BackupCoordinator {
    client: Arc<dyn ControlClient>,
    store: Arc<dyn PlanStore>,
    launcher: Arc<dyn ExportLauncher>,
    alerter: Arc<dyn Alerter>,
    settings: RunSettings,
    tracker: CutTracker,
}

impl BackupCoordinator {
    pub fn new(
        client: Arc<dyn ControlClient>,
        store: Arc<dyn PlanStore>,
        launcher: Arc<dyn ExportLauncher>,
        settings: RunSettings,
    ) -> Self {
        Self {
            client,
            store,
            launcher,
            alerter: Arc::new(LogAlerter),
            settings,
            tracker: CutTracker::new(),
        }
    }

    /// Builds the production wiring: `mysql`/`mysqldump` transports and the configured
    /// plan store and alerter.
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        config.validate().map_err(BackupError::Config)?;

        let client = Arc::new(MysqlCliClient::new(config));
        let store: Arc<dyn PlanStore> = match &config.plan_store {
            PlanStoreConfig::Memory => Arc::new(InMemoryPlanStore::new()),
            PlanStoreConfig::JsonFile { path } => Arc::new(JsonFilePlanStore::new(path)),
            PlanStoreConfig::Sql { table } => {
                Arc::new(SqlPlanStore::new(Arc::clone(&client), table)?)
            }
        };
        let settings = RunSettings {
            schema: config.schema.clone(),
            destination: config.destination.clone(),
            lock_file: config.lock_file.clone(),
        };

        let mut coordinator = Self::new(
            client,
            store,
            Arc::new(MysqldumpLauncher::new(config)),
            settings,
        );
        if let Some(command) = &config.alert_command {
            coordinator = coordinator.with_alerter(Arc::new(CommandAlerter::new(command)?));
        }
        Ok(coordinator)
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Shared handle on what the current run has frozen or stopped.
    pub fn tracker(&self) -> CutTracker {
        self.tracker.clone()
    }

    pub fn client(&self) -> Arc<dyn ControlClient> {
        Arc::clone(&self.client)
    }

    pub fn store(&self) -> Arc<dyn PlanStore> {
        Arc::clone(&self.store)
    }

    /// Runs one backup and reports the outcome.
    ///
    /// Errors never escape: a fatal error ends the run and is carried in the report,
    /// together with every non-fatal dispatch and release error. Alerts go out for both.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("backup.run", run_id = %run_id, schema = %self.settings.schema);
        let mut report = RunReport::new(run_id.to_string(), &self.settings.schema);

        async {
            if let Err(err) = self.drive(run_id, &mut report).await {
                event!(Level::ERROR, error = %err, "backup run aborted");
                report.record(&err);
            }
            report.finish();
            self.send_alerts(&report).await;
        }
        .instrument(span)
        .await;

        report
    }

    async fn drive(&self, run_id: Uuid, report: &mut RunReport) -> Result<()> {
        let lease = RunLease::acquire(&self.settings.lock_file)?;
        let mut run = BackupRun::begin(run_id, lease);
        event!(Level::INFO, lock = %run.lease().lock_file().display(), "backup run started");

        run.replicas = discover_replicas(self.client.as_ref()).await?;
        report.replicas = run.replicas.clone();

        run.tables = self
            .client
            .list_tables(&self.settings.schema)
            .await
            .map_err(|err| {
                BackupError::Partition(format!(
                    "cannot list tables of '{}': {}",
                    self.settings.schema, err
                ))
            })?;
        report.table_count = run.tables.len();

        run.plan = plan_chunks(run.tables.len(), &run.replicas)?;
        if run.plan.is_empty() {
            replace_plan(self.store.as_ref(), &[]).await?;
            event!(Level::WARN, "schema has no tables, nothing to back up");
            return Ok(());
        }
        replace_plan(self.store.as_ref(), &run.plan).await?;
        report.plan = run.plan.clone();

        let cut = establish_cut(self.client.as_ref(), &run.replicas, &self.tracker).await?;
        report.cut_position = Some(cut.position().clone());
        report.elected_replica = Some(cut.elected().clone());
        report.excluded_from_vote = cut.excluded_from_vote().to_vec();
        run.cut = Some(cut);

        let outcome = dispatch_exports(
            self.store.as_ref(),
            Arc::clone(&self.launcher),
            &run.replicas,
            &run.tables,
            &self.settings.schema,
            &self.settings.destination,
        )
        .await;
        outcome.errors.iter().for_each(|err| report.record(err));
        report.launched = outcome.launched;
        report.skipped = outcome.skipped;

        if let Some(cut) = run.cut() {
            let failures = release_fleet(self.client.as_ref(), run.replicas(), cut).await;
            self.tracker.disarm().await;
            failures.iter().for_each(|err| report.record(err));
            report.released = true;
        }

        event!(
            Level::INFO,
            launched = report.launched.len(),
            errors = report.errors.len(),
            "backup run finished"
        );
        Ok(())
    }

    async fn send_alerts(&self, report: &RunReport) {
        let subject = if !report.succeeded() {
            format!("fleetdump: backup of '{}' failed", report.schema)
        } else if !report.errors.is_empty() {
            format!("fleetdump: backup of '{}' completed with errors", report.schema)
        } else {
            return;
        };

        let body = format!("run {}\n{}", report.run_id, report.error_summary());
        if let Err(err) = self.alerter.alert(&subject, &body).await {
            event!(Level::WARN, error = %err, "alert could not be delivered");
        }
    }
}
