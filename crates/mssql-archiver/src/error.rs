//! Error types for the archival engine.

use thiserror::Error;

/// Main error type for archival operations.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Configuration or job definition error. Never reaches the runner.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQL Server query, DDL or bulk-load error
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Catalog introspection returned something unusable
    #[error("Schema introspection failed: {0}")]
    Schema(String),

    /// Target table could not be created from the source structure
    #[error("Structure replication failed: {0}")]
    Replication(String),

    /// Pre-flight safety validation produced blocking issues
    #[error("Blocked by safety validation [{codes}]: {message}")]
    Blocked { codes: String, message: String },

    /// A batch failed for a specific job
    #[error("Execution failed for job {job}: {message}")]
    Execution { job: String, message: String },

    /// The external bcp process failed or produced unparseable output
    #[error("Bulk copy tool failed: {0}")]
    BulkTool(String),

    /// An operation exceeded its explicit timeout
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// No job with the given identifier or name
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A job with the same name already exists
    #[error("A job named '{0}' already exists")]
    DuplicateJob(String),

    /// A job state change the lifecycle does not allow
    #[error("Invalid job state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Job repository failure
    #[error("Job store error: {0}")]
    Store(String),

    /// Invocation was cancelled (SIGINT, SIGTERM, caller token)
    #[error("Archival cancelled")]
    Cancelled,

    /// IO error (export files, store files, child processes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cron expression could not be parsed
    #[error("Invalid cron expression '{expression}': {message}")]
    Cron { expression: String, message: String },
}

impl ArchiveError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        ArchiveError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an Execution error
    pub fn execution(job: impl Into<String>, message: impl Into<String>) -> Self {
        ArchiveError::Execution {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        ArchiveError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// True for errors that no amount of retrying will fix.
    pub fn is_blocking(&self) -> bool {
        matches!(self, ArchiveError::Blocked { .. } | ArchiveError::Config(_))
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ArchiveError::Config(_)
            | ArchiveError::Yaml(_)
            | ArchiveError::Cron { .. }
            | ArchiveError::DuplicateJob(_) => 2,
            ArchiveError::JobNotFound(_) => 3,
            ArchiveError::Blocked { .. } => 4,
            ArchiveError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for archival operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;
