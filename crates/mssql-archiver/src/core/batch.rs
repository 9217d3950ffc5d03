//! Results reported by the move strategies and the runner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::job::JobStatus;

/// Outcome of one bounded batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub rows_moved: i64,
    pub duration: Duration,
    pub error: Option<String>,
    /// Failure caused by a safety violation rather than a transient fault.
    pub blocking: bool,
    /// Statements and commands actually issued, in order.
    pub audit: Option<String>,
}

impl BatchResult {
    pub fn moved(rows_moved: i64, duration: Duration, audit: AuditLog) -> Self {
        Self {
            success: true,
            rows_moved,
            duration,
            error: None,
            blocking: false,
            audit: audit.into_text(),
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration, audit: AuditLog) -> Self {
        Self {
            success: false,
            rows_moved: 0,
            duration,
            error: Some(error.into()),
            blocking: false,
            audit: audit.into_text(),
        }
    }

    pub fn blocked(error: impl Into<String>, duration: Duration, audit: AuditLog) -> Self {
        Self {
            blocking: true,
            ..Self::failed(error, duration, audit)
        }
    }

    /// Throughput of the batch; 0 when nothing moved or no time elapsed.
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if self.rows_moved <= 0 || secs <= 0.0 {
            0.0
        } else {
            self.rows_moved as f64 / secs
        }
    }
}

/// Accumulates the audit text of a batch.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<String>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        tracing::debug!(target: "mssql_archiver::audit", "{}", entry);
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_text(self) -> Option<String> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.join("\n"))
        }
    }
}

/// Aggregate result of one invocation of a job.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub job_id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub rows_moved: i64,
    pub batches: Vec<BatchResult>,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// True when the job was disabled by this invocation.
    pub disabled: bool,
}

impl ExecutionSummary {
    pub fn skipped(
        job_id: Uuid,
        job_name: impl Into<String>,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            status: JobStatus::Skipped,
            rows_moved: 0,
            batches: Vec::new(),
            skip_reason: Some(reason.into()),
            error: None,
            started_at,
            duration: Duration::ZERO,
            disabled: false,
        }
    }

    /// Audit text of every batch, separated by a batch header.
    pub fn audit_trail(&self) -> String {
        let mut out = String::new();
        for (i, batch) in self.batches.iter().enumerate() {
            if let Some(audit) = &batch.audit {
                out.push_str(&format!("-- batch {} ({} rows)\n", i + 1, batch.rows_moved));
                out.push_str(audit);
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_audit_is_none() {
        let result = BatchResult::moved(0, Duration::from_secs(1), AuditLog::new());
        assert!(result.success);
        assert!(result.audit.is_none());
        assert_eq!(result.rows_per_second(), 0.0);
    }

    #[test]
    fn test_blocked_result() {
        let mut audit = AuditLog::new();
        audit.push("SELECT 1");
        let result = BatchResult::blocked("TargetTableNotEmpty", Duration::ZERO, audit);
        assert!(!result.success);
        assert!(result.blocking);
        assert_eq!(result.audit.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_throughput() {
        let result = BatchResult::moved(500, Duration::from_secs(2), AuditLog::new());
        assert_eq!(result.rows_per_second(), 250.0);
    }
}
