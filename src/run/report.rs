use crate::core::{BackupError, ChunkAssignment, ReplicaId, ReplicationPosition};
use crate::dispatch::ExportJob;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Summary of one backup run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub schema: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub replicas: Vec<ReplicaId>,
    pub table_count: usize,
    pub plan: Vec<ChunkAssignment>,
    pub cut_position: Option<ReplicationPosition>,
    pub elected_replica: Option<ReplicaId>,
    pub excluded_from_vote: Vec<ReplicaId>,
    pub launched: Vec<ExportJob>,
    pub skipped: Vec<ReplicaId>,
    /// Dispatch and release failures
    pub errors: Vec<String>,
    /// The error that aborted the run
    pub fatal: Option<String>,
    /// True when the fleet was released through a consistent cut
    pub released: bool,
}

impl RunReport {
    pub fn new(run_id: String, schema: &str) -> Self {
        Self {
            run_id,
            schema: schema.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            replicas: Vec::new(),
            table_count: 0,
            plan: Vec::new(),
            cut_position: None,
            elected_replica: None,
            excluded_from_vote: Vec::new(),
            launched: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            fatal: None,
            released: false,
        }
    }

    /// Files an error under `fatal` or `errors` according to its kind.
    pub fn record(&mut self, error: &BackupError) {
        if error.is_fatal() && self.fatal.is_none() {
            self.fatal = Some(error.to_string());
        } else {
            self.errors.push(error.to_string());
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Non-fatal errors do not fail a run.
    pub fn succeeded(&self) -> bool {
        self.fatal.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }

    /// Operator-facing text: every error, one per line.
    pub fn error_summary(&self) -> String {
        self.fatal
            .iter()
            .map(|fatal| format!("FATAL: {}", fatal))
            .chain(self.errors.iter().map(|err| format!("error: {}", err)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_fatal_errors_keep_success() {
        let mut report = RunReport::new("run-1".to_string(), "shop");
        report.record(&BackupError::dispatch("db2:3306", "spawn failed"));
        assert!(report.succeeded());
        assert_eq!(report.exit_code(), 0);

        report.record(&BackupError::Sync("freeze failed".to_string()));
        assert!(!report.succeeded());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.error_summary(),
            "FATAL: Sync error: freeze failed\n\
             error: Dispatch error for replica 'db2:3306': spawn failed"
        );
    }

    #[test]
    fn test_report_serializes() {
        let mut report = RunReport::new("run-1".to_string(), "shop");
        report.finish();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["schema"], "shop");
        assert!(json["finished_at"].is_string());
        assert!(json["fatal"].is_null());
    }
}
