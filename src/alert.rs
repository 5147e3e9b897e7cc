use crate::core::{BackupError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{Level, event};

/// Sink for operator alerts.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, subject: &str, body: &str) -> Result<()>;
}

/// Emits alerts as error events on the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, subject: &str, body: &str) -> Result<()> {
        event!(Level::ERROR, subject, body, "alert");
        Ok(())
    }
}

/// Pipes the alert into an external program, e.g. `mail -s backup ops@example.com`.
///
/// The subject is the first line of the text written to the program's stdin.
#[derive(Debug, Clone)]
pub struct CommandAlerter {
    program: String,
    args: Vec<String>,
}

impl CommandAlerter {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| BackupError::Config("alert command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Alerter for CommandAlerter {
    async fn alert(&self, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| {
                BackupError::Io(format!("failed to start '{}': {}", self.program, err))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n\n{}\n", subject, body).as_bytes())
                .await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(BackupError::Io(format!(
                "'{}' exited with {}",
                self.program, status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            CommandAlerter::new(&[]),
            Err(BackupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_log_alerter_never_fails() {
        assert!(LogAlerter.alert("backup failed", "details").await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_alerter_writes_stdin() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("alert.txt");
        let alerter = CommandAlerter::new(&[
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > '{}'", out.display()),
        ])
        .unwrap();

        alerter.alert("backup failed", "sync error").await.unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "backup failed\n\nsync error\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_alerter_reports_exit_status() {
        let alerter =
            CommandAlerter::new(&["sh".to_string(), "-c".to_string(), "cat >/dev/null; exit 3".to_string()])
                .unwrap();
        assert!(alerter.alert("s", "b").await.is_err());
    }
}
