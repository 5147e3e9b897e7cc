use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Partition error: {0}")]
    Partition(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Dispatch error for replica '{replica}': {message}")]
    Dispatch { replica: String, message: String },

    #[error("Release error for '{target}': {message}")]
    Release { target: String, message: String },

    #[error("Client error: {0}")]
    Client(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl BackupError {
    /// Returns true when the error must abort the whole run.
    ///
    /// Dispatch and release failures are collected into the run report and never abort
    /// sibling operations.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Dispatch { .. } | Self::Release { .. })
    }

    pub(crate) fn dispatch(replica: impl Into<String>, message: impl ToString) -> Self {
        Self::Dispatch {
            replica: replica.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn release(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Release {
            target: target.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for BackupError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
