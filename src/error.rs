//! Error taxonomy for tenant provisioning.
//!
//! Callers match on the variant to decide whether a failed call can simply be
//! retried (`Connectivity`) or needs operator attention.

pub type Result<T> = std::result::Result<T, TenancyError>;

#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    /// The target database already exists. Informational: creation treats it as success.
    #[error("Database already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provisioning failed for {database}: {message}")]
    Provisioning { database: String, message: String },

    #[error("Migration failed for {database}: {message}")]
    Migration { database: String, message: String },

    #[error("Seeding failed for {database}: {message}")]
    Seeding { database: String, message: String },

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TenancyError {
    pub fn provisioning(database: &str, message: impl Into<String>) -> Self {
        Self::Provisioning {
            database: database.to_string(),
            message: message.into(),
        }
    }

    pub fn migration(database: &str, message: impl Into<String>) -> Self {
        Self::Migration {
            database: database.to_string(),
            message: message.into(),
        }
    }

    pub fn seeding(database: &str, message: impl Into<String>) -> Self {
        Self::Seeding {
            database: database.to_string(),
            message: message.into(),
        }
    }

    /// Every provisioning step is idempotent, so transient failures can be
    /// retried by re-running the whole workflow.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Maps a driver error onto the taxonomy. Transport-level failures become
    /// `Connectivity`; anything else is handed to `fatal`.
    pub fn from_sqlx(err: sqlx::Error, fatal: impl FnOnce(String) -> Self) -> Self {
        if is_connectivity(&err) {
            Self::Connectivity(err.to_string())
        } else {
            fatal(err.to_string())
        }
    }
}

pub(crate) fn is_connectivity(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Runs `fut` under `timeout`, reporting expiry as a connectivity failure.
pub(crate) async fn with_timeout<T, F>(
    timeout: std::time::Duration,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(TenancyError::Connectivity(format!(
            "{what} timed out after {}s",
            timeout.as_secs()
        ))),
    }
}
