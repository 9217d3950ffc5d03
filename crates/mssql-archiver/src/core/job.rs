//! The archival job aggregate and its execution state machine.
//!
//! An [`ArchivalJob`] is built from a validated [`JobDefinition`] and only
//! changes through its own methods. Runtime statistics live in [`JobRuntime`]
//! and are advanced by [`ArchivalJob::update_execution_result`], which is the
//! single place the post-invocation transition rules are applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identifier::{validate_identifier, validate_predicate};
use super::schedule::Trigger;
use crate::error::{ArchiveError, Result};

/// How rows get from the source table to the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMethod {
    /// Metadata-only `ALTER TABLE ... SWITCH PARTITION`.
    PartitionSwitch,
    /// Export with bcp to a file, then bcp the file into the target.
    FileBulkLoad,
    /// Stream rows over TDS bulk insert without an intermediate file.
    StreamingBulkCopy,
}

impl ArchiveMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveMethod::PartitionSwitch => "partition_switch",
            ArchiveMethod::FileBulkLoad => "file_bulk_load",
            ArchiveMethod::StreamingBulkCopy => "streaming_bulk_copy",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "partition_switch" => Ok(ArchiveMethod::PartitionSwitch),
            "file_bulk_load" => Ok(ArchiveMethod::FileBulkLoad),
            "streaming_bulk_copy" => Ok(ArchiveMethod::StreamingBulkCopy),
            other => Err(ArchiveError::Config(format!("Invalid archive method: {}", other))),
        }
    }
}

/// Last observed outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Running,
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(JobStatus::NotStarted),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(ArchiveError::Config(format!("Invalid job status: {}", other))),
        }
    }

    /// Transition table.
    ///
    /// | from \ to   | Running | Success | Failed | Skipped |
    /// |-------------|---------|---------|--------|---------|
    /// | NotStarted  | yes     | -       | yes    | yes     |
    /// | Running     | -       | yes     | yes    | yes     |
    /// | Success     | yes     | -       | yes    | yes     |
    /// | Failed      | yes     | -       | yes    | yes     |
    /// | Skipped     | yes     | -       | yes    | yes     |
    ///
    /// Failed is reachable from anywhere so the catastrophic path and the
    /// stale-run recovery sweep can always record a failure. Skipped from a
    /// settled state is the "disabled" short-circuit.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (_, NotStarted) => false,
            (Running, Running) => false,
            (_, Running) => true,
            (Running, Success) => true,
            (_, Success) => false,
            (_, Failed) => true,
            (_, Skipped) => true,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job knobs for the move strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Timeout applied to each batch (seconds).
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    /// bcp native format (`-n`) instead of character format (`-c`).
    #[serde(default = "default_true")]
    pub native_format: bool,

    /// bcp `-m` maximum tolerated errors.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Keep the intermediate export file after a load (debugging).
    #[serde(default)]
    pub keep_export_file: bool,

    /// Log streaming progress every N rows (0 disables).
    #[serde(default = "default_notify_after")]
    pub notify_after: u64,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            batch_timeout_secs: default_batch_timeout_secs(),
            native_format: true,
            max_errors: default_max_errors(),
            keep_export_file: false,
            notify_after: default_notify_after(),
        }
    }
}

/// Operator-supplied configuration of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,

    /// Named connection (see `connections:` in the config) holding the source table.
    pub source_connection: String,

    /// Named connection for the target; defaults to the source connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_connection: Option<String>,

    #[serde(default = "default_dbo")]
    pub source_schema: String,
    pub source_table: String,

    #[serde(default = "default_dbo")]
    pub target_schema: String,
    pub target_table: String,

    /// Column the predicate applies to; batches are ordered by it.
    pub filter_column: String,

    /// Raw predicate fragment, e.g. `< now - 10m`.
    pub filter_predicate: String,

    /// Structured editor state; stored and returned, never evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_definition: Option<serde_json::Value>,

    pub method: ArchiveMethod,

    /// Remove copied rows from the source (copy strategies only).
    #[serde(default)]
    pub delete_after_copy: bool,

    /// Rows per low-level operation.
    pub batch_size: i64,

    /// Row cap per scheduled invocation.
    pub max_rows_per_execution: i64,

    #[serde(flatten)]
    pub trigger: Trigger,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub options: ExecutionOptions,
}

impl JobDefinition {
    /// Effective target connection name.
    pub fn target_connection(&self) -> &str {
        self.target_connection
            .as_deref()
            .unwrap_or(&self.source_connection)
    }

    pub fn source_full_name(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    pub fn target_full_name(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }

    /// Enforce every construction-time invariant.
    pub fn validate(&self) -> Result<()> {
        self.check(true)
    }

    /// Like [`validate`](Self::validate), but a cron that has no future
    /// occurrence left is accepted; the job simply never becomes due.
    pub fn validate_stored(&self) -> Result<()> {
        self.check(false)
    }

    fn check(&self, require_future_run: bool) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ArchiveError::Config("job name is required".into()));
        }
        if self.source_connection.trim().is_empty() {
            return Err(ArchiveError::Config(format!(
                "job '{}': source_connection is required",
                self.name
            )));
        }
        if let Some(target) = &self.target_connection {
            if target.trim().is_empty() {
                return Err(ArchiveError::Config(format!(
                    "job '{}': target_connection must not be blank",
                    self.name
                )));
            }
        }

        for (field, value) in [
            ("source_schema", &self.source_schema),
            ("source_table", &self.source_table),
            ("target_schema", &self.target_schema),
            ("target_table", &self.target_table),
            ("filter_column", &self.filter_column),
        ] {
            validate_identifier(value)
                .map_err(|e| ArchiveError::Config(format!("job '{}': {}: {}", self.name, field, e)))?;
        }
        validate_predicate(&self.filter_predicate)?;

        if self.batch_size <= 0 {
            return Err(ArchiveError::Config(format!(
                "job '{}': batch_size must be at least 1",
                self.name
            )));
        }
        if self.max_rows_per_execution <= 0 {
            return Err(ArchiveError::Config(format!(
                "job '{}': max_rows_per_execution must be at least 1",
                self.name
            )));
        }
        if self.max_rows_per_execution < self.batch_size {
            return Err(ArchiveError::Config(format!(
                "job '{}': max_rows_per_execution ({}) must be >= batch_size ({})",
                self.name, self.max_rows_per_execution, self.batch_size
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ArchiveError::Config(format!(
                "job '{}': max_consecutive_failures must be at least 1",
                self.name
            )));
        }
        if self.options.batch_timeout_secs == 0 {
            return Err(ArchiveError::Config(format!(
                "job '{}': options.batch_timeout_secs must be at least 1",
                self.name
            )));
        }

        let trigger = if require_future_run {
            self.trigger.validate()
        } else {
            self.trigger.validate_syntax()
        };
        trigger.map_err(|e| ArchiveError::Config(format!("job '{}': {}", self.name, e)))?;

        if self.method == ArchiveMethod::PartitionSwitch && self.delete_after_copy {
            return Err(ArchiveError::Config(format!(
                "job '{}': delete_after_copy does not apply to partition_switch",
                self.name
            )));
        }

        if self.method == ArchiveMethod::PartitionSwitch
            && self.target_connection() != self.source_connection
        {
            return Err(ArchiveError::Config(format!(
                "job '{}': partition_switch requires source and target in the same database",
                self.name
            )));
        }

        if self.source_connection == self.target_connection()
            && self.source_schema.eq_ignore_ascii_case(&self.target_schema)
            && self.source_table.eq_ignore_ascii_case(&self.target_table)
        {
            return Err(ArchiveError::Config(format!(
                "job '{}': source and target cannot be the same table",
                self.name
            )));
        }

        Ok(())
    }
}

/// Runtime state and statistics of a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobRuntime {
    pub is_enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: JobStatus,
    pub last_error: Option<String>,
    /// Why the last invocation was skipped ("disabled", "no qualifying rows").
    pub last_skip_reason: Option<String>,
    pub last_rows_moved: i64,
    pub total_runs: i64,
    pub total_rows_moved: i64,
    pub consecutive_failures: u32,
}

/// What one invocation achieved, fed into [`ArchivalJob::update_execution_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The job was disabled when the trigger fired.
    Disabled,
    /// Every batch succeeded and at least one row moved.
    Moved { rows: i64 },
    /// Nothing qualified; not an error.
    NothingToMove,
    /// A batch failed. `rows` counts what earlier batches already moved;
    /// `blocking` marks a safety violation that retrying will not fix.
    Failed {
        error: String,
        rows: i64,
        blocking: bool,
    },
}

pub const SKIP_REASON_DISABLED: &str = "disabled";
pub const SKIP_REASON_NO_ROWS: &str = "no qualifying rows";

/// Aggregate root: a persisted archival job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalJob {
    id: Uuid,
    definition: JobDefinition,
    runtime: JobRuntime,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ArchivalJob {
    /// Create a job from a definition, rejecting invalid configuration.
    pub fn new(definition: JobDefinition) -> Result<Self> {
        definition.validate()?;
        let now = Utc::now();
        let runtime = JobRuntime {
            is_enabled: definition.enabled,
            ..JobRuntime::default()
        };
        Ok(Self {
            id: Uuid::new_v4(),
            definition,
            runtime,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild a persisted job. The definition is re-validated.
    pub fn restore(
        id: Uuid,
        definition: JobDefinition,
        runtime: JobRuntime,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self> {
        definition.validate_stored()?;
        Ok(Self {
            id,
            definition,
            runtime,
            created_at,
            updated_at,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn runtime(&self) -> &JobRuntime {
        &self.runtime
    }

    pub fn is_enabled(&self) -> bool {
        self.runtime.is_enabled
    }

    pub fn status(&self) -> JobStatus {
        self.runtime.last_status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Enabled and either never scheduled or scheduled at/before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.runtime.is_enabled
            && self
                .runtime
                .next_run_at
                .map(|next| next <= now)
                .unwrap_or(true)
    }

    /// Number of batch iterations one invocation may run.
    ///
    /// `ceil(max_rows_per_execution / batch_size)` for the copy strategies; a
    /// partition switch hands off one whole partition and runs once.
    pub fn max_batches(&self) -> i64 {
        match self.definition.method {
            ArchiveMethod::PartitionSwitch => 1,
            _ => {
                let batch = self.definition.batch_size;
                (self.definition.max_rows_per_execution + batch - 1) / batch
            }
        }
    }

    /// Row limit for the next batch given what this invocation already moved.
    pub fn next_batch_limit(&self, moved_so_far: i64) -> i64 {
        let remaining = self.definition.max_rows_per_execution - moved_so_far;
        remaining.min(self.definition.batch_size).max(0)
    }

    /// Replace the configuration. Runtime statistics are kept.
    pub fn update(&mut self, definition: JobDefinition) -> Result<()> {
        definition.validate()?;
        let enabled_changed = definition.enabled != self.definition.enabled;
        let enabled = definition.enabled;
        self.definition = definition;
        if enabled_changed {
            if enabled {
                self.enable();
            } else {
                self.disable();
            }
        }
        self.touch();
        Ok(())
    }

    /// Re-enable the job and clear the failure streak.
    pub fn enable(&mut self) {
        self.runtime.is_enabled = true;
        self.runtime.consecutive_failures = 0;
        self.definition.enabled = true;
        self.touch();
    }

    /// Disable the job; a disabled job has no next run.
    pub fn disable(&mut self) {
        self.runtime.is_enabled = false;
        self.runtime.next_run_at = None;
        self.definition.enabled = false;
        self.touch();
    }

    pub fn set_next_run_time(&mut self, next: Option<DateTime<Utc>>) {
        self.runtime.next_run_at = next;
        self.touch();
    }

    /// Compute and store the next run from the trigger.
    pub fn schedule_next(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.definition.trigger.next_after(now)?;
        self.set_next_run_time(Some(next));
        Ok(())
    }

    pub fn reset_statistics(&mut self) {
        let is_enabled = self.runtime.is_enabled;
        let next_run_at = self.runtime.next_run_at;
        self.runtime = JobRuntime {
            is_enabled,
            next_run_at,
            ..JobRuntime::default()
        };
        self.touch();
    }

    /// Enter Running at the start of an invocation.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.runtime.last_run_at = Some(now);
        self.runtime.last_skip_reason = None;
        self.touch();
        Ok(())
    }

    /// Apply the outcome of one invocation and return the resulting status.
    ///
    /// The next run is computed before anything changes. A trigger with no
    /// further occurrence turns the outcome into a blocking failure, so the
    /// job is disabled rather than left without a schedule.
    pub fn update_execution_result(
        &mut self,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let (outcome, next_run) = match outcome {
            ExecutionOutcome::Disabled => (ExecutionOutcome::Disabled, None),
            outcome => match self.definition.trigger.next_after(now) {
                Ok(next) => (outcome, Some(next)),
                Err(e) => (unschedulable(outcome, &e), None),
            },
        };
        let next_status = match &outcome {
            ExecutionOutcome::Disabled | ExecutionOutcome::NothingToMove => JobStatus::Skipped,
            ExecutionOutcome::Moved { .. } => JobStatus::Success,
            ExecutionOutcome::Failed { .. } => JobStatus::Failed,
        };
        self.transition(next_status)?;

        match outcome {
            ExecutionOutcome::Disabled => {
                self.runtime.consecutive_failures = 0;
                self.runtime.last_rows_moved = 0;
                self.runtime.last_error = None;
                self.runtime.last_skip_reason = Some(SKIP_REASON_DISABLED.into());
            }
            ExecutionOutcome::NothingToMove => {
                self.runtime.consecutive_failures = 0;
                self.runtime.last_rows_moved = 0;
                self.runtime.last_error = None;
                self.runtime.last_skip_reason = Some(SKIP_REASON_NO_ROWS.into());
                self.runtime.next_run_at = next_run;
            }
            ExecutionOutcome::Moved { rows } => {
                self.runtime.consecutive_failures = 0;
                self.runtime.total_runs += 1;
                self.runtime.total_rows_moved += rows;
                self.runtime.last_rows_moved = rows;
                self.runtime.last_error = None;
                self.runtime.next_run_at = next_run;
            }
            ExecutionOutcome::Failed {
                error,
                rows,
                blocking,
            } => {
                self.runtime.consecutive_failures += 1;
                self.runtime.last_rows_moved = rows;
                self.runtime.total_rows_moved += rows;
                self.runtime.last_error = Some(error);

                let exhausted =
                    self.runtime.consecutive_failures >= self.definition.max_consecutive_failures;
                if blocking || exhausted {
                    self.runtime.is_enabled = false;
                    self.runtime.next_run_at = None;
                    self.definition.enabled = false;
                } else {
                    self.runtime.next_run_at = next_run;
                }
            }
        }
        self.touch();
        Ok(self.runtime.last_status)
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        let current = self.runtime.last_status;
        if !current.can_transition_to(next) {
            return Err(ArchiveError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.runtime.last_status = next;
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Fold a scheduling error into the invocation's outcome.
fn unschedulable(outcome: ExecutionOutcome, error: &ArchiveError) -> ExecutionOutcome {
    let (rows, earlier) = match outcome {
        ExecutionOutcome::Moved { rows } => (rows, None),
        ExecutionOutcome::Failed { rows, error, .. } => (rows, Some(error)),
        _ => (0, None),
    };
    let error = match earlier {
        Some(earlier) => format!("{}; cannot schedule next run: {}", earlier, error),
        None => format!("cannot schedule next run: {}", error),
    };
    ExecutionOutcome::Failed {
        error,
        rows,
        blocking: true,
    }
}

fn default_dbo() -> String {
    "dbo".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_timeout_secs() -> u64 {
    600
}

fn default_max_errors() -> u32 {
    10
}

fn default_notify_after() -> u64 {
    1_000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn definition() -> JobDefinition {
        JobDefinition {
            name: "orders-archive".into(),
            source_connection: "live".into(),
            target_connection: Some("archive".into()),
            source_schema: "dbo".into(),
            source_table: "Orders".into(),
            target_schema: "archive".into(),
            target_table: "Orders".into(),
            filter_column: "CreatedAt".into(),
            filter_predicate: "< now - 10m".into(),
            filter_definition: None,
            method: ArchiveMethod::StreamingBulkCopy,
            delete_after_copy: true,
            batch_size: 100,
            max_rows_per_execution: 250,
            trigger: Trigger::interval(10),
            max_consecutive_failures: 5,
            enabled: true,
            options: ExecutionOptions::default(),
        }
    }

    fn failed(message: &str) -> ExecutionOutcome {
        ExecutionOutcome::Failed {
            error: message.into(),
            rows: 0,
            blocking: false,
        }
    }

    #[test]
    fn test_rejects_max_rows_below_batch_size() {
        let mut def = definition();
        def.max_rows_per_execution = 50;
        assert!(ArchivalJob::new(def).is_err());
    }

    #[test]
    fn test_rejects_missing_trigger() {
        let mut def = definition();
        def.trigger = Trigger::default();
        assert!(ArchivalJob::new(def).is_err());
    }

    #[test]
    fn test_accepts_both_triggers() {
        let mut def = definition();
        def.trigger = Trigger {
            interval_minutes: Some(5),
            cron_expression: Some("0 2 * * *".into()),
        };
        assert!(ArchivalJob::new(def).is_ok());
    }

    #[test]
    fn test_rejects_bad_sizes_and_names() {
        let mut def = definition();
        def.name = "  ".into();
        assert!(ArchivalJob::new(def).is_err());

        let mut def = definition();
        def.batch_size = 0;
        assert!(ArchivalJob::new(def).is_err());

        let mut def = definition();
        def.max_consecutive_failures = 0;
        assert!(ArchivalJob::new(def).is_err());

        let mut def = definition();
        def.source_table = String::new();
        assert!(ArchivalJob::new(def).is_err());
    }

    #[test]
    fn test_rejects_switch_with_delete() {
        let mut def = definition();
        def.method = ArchiveMethod::PartitionSwitch;
        def.delete_after_copy = true;
        assert!(ArchivalJob::new(def).is_err());
    }

    #[test]
    fn test_rejects_switch_across_connections() {
        let mut def = definition();
        def.method = ArchiveMethod::PartitionSwitch;
        def.delete_after_copy = false;
        assert!(ArchivalJob::new(def.clone()).is_err());
        def.target_connection = None;
        assert!(ArchivalJob::new(def).is_ok());
    }

    #[test]
    fn test_rejects_same_source_and_target() {
        let mut def = definition();
        def.target_connection = None;
        def.target_schema = "DBO".into();
        assert!(ArchivalJob::new(def).is_err());
    }

    #[test]
    fn test_update_rejects_invalid_definition() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let mut def = definition();
        def.max_rows_per_execution = 10;
        assert!(job.update(def).is_err());
        assert_eq!(job.definition().max_rows_per_execution, 250);
    }

    #[test]
    fn test_batch_plan() {
        let job = ArchivalJob::new(definition()).unwrap();
        assert_eq!(job.max_batches(), 3);
        assert_eq!(job.next_batch_limit(0), 100);
        assert_eq!(job.next_batch_limit(200), 50);
        assert_eq!(job.next_batch_limit(250), 0);

        let mut def = definition();
        def.method = ArchiveMethod::PartitionSwitch;
        def.delete_after_copy = false;
        def.target_connection = None;
        assert_eq!(ArchivalJob::new(def).unwrap().max_batches(), 1);
    }

    #[test]
    fn test_success_updates_statistics() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        job.mark_running(now).unwrap();
        let status = job
            .update_execution_result(ExecutionOutcome::Moved { rows: 250 }, now)
            .unwrap();

        assert_eq!(status, JobStatus::Success);
        assert_eq!(job.runtime().last_rows_moved, 250);
        assert_eq!(job.runtime().total_runs, 1);
        assert_eq!(job.runtime().total_rows_moved, 250);
        assert_eq!(
            job.runtime().next_run_at,
            Some(now + chrono::Duration::minutes(10))
        );
    }

    #[test]
    fn test_failures_auto_disable_at_threshold() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        for i in 1..=5 {
            job.mark_running(now).unwrap();
            job.update_execution_result(failed("timeout"), now).unwrap();
            assert_eq!(job.runtime().consecutive_failures, i);
            assert_eq!(job.is_enabled(), i < 5);
        }
        assert!(job.runtime().next_run_at.is_none());
        assert_eq!(job.runtime().last_error.as_deref(), Some("timeout"));
        assert_eq!(job.runtime().total_runs, 0);
    }

    #[test]
    fn test_success_or_skip_resets_failure_streak() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        for _ in 0..3 {
            job.mark_running(now).unwrap();
            job.update_execution_result(failed("x"), now).unwrap();
        }
        job.mark_running(now).unwrap();
        job.update_execution_result(ExecutionOutcome::NothingToMove, now)
            .unwrap();
        assert_eq!(job.runtime().consecutive_failures, 0);
        assert_eq!(job.status(), JobStatus::Skipped);

        job.mark_running(now).unwrap();
        job.update_execution_result(failed("x"), now).unwrap();
        job.mark_running(now).unwrap();
        job.update_execution_result(ExecutionOutcome::Moved { rows: 1 }, now)
            .unwrap();
        assert_eq!(job.runtime().consecutive_failures, 0);
    }

    #[test]
    fn test_blocking_failure_disables_immediately() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        job.mark_running(now).unwrap();
        job.update_execution_result(
            ExecutionOutcome::Failed {
                error: "TargetTableNotEmpty".into(),
                rows: 0,
                blocking: true,
            },
            now,
        )
        .unwrap();
        assert!(!job.is_enabled());
        assert_eq!(job.runtime().consecutive_failures, 1);
    }

    fn last_cron(year: i32) -> JobDefinition {
        JobDefinition {
            trigger: Trigger::cron(format!("0 0 0 1 1 * {}", year)),
            ..definition()
        }
    }

    #[test]
    fn test_unschedulable_success_is_recorded_and_disables() {
        let mut job = ArchivalJob::new(last_cron(2090)).unwrap();
        let after_last = Utc.with_ymd_and_hms(2091, 6, 1, 0, 0, 0).unwrap();
        job.mark_running(after_last).unwrap();

        let status = job
            .update_execution_result(ExecutionOutcome::Moved { rows: 40 }, after_last)
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(!job.is_enabled());
        assert_eq!(job.runtime().next_run_at, None);
        assert_eq!(job.runtime().total_rows_moved, 40);
        assert_eq!(job.runtime().total_runs, 0);
        assert!(job
            .runtime()
            .last_error
            .as_deref()
            .unwrap()
            .contains("cannot schedule next run"));
    }

    #[test]
    fn test_expired_cron_rejected_on_create_but_restorable() {
        assert!(ArchivalJob::new(last_cron(2020)).is_err());

        let now = Utc::now();
        let restored = ArchivalJob::restore(
            Uuid::new_v4(),
            last_cron(2020),
            JobRuntime::default(),
            now,
            now,
        )
        .unwrap();
        assert_eq!(restored.definition().trigger.cron_expression.as_deref(), Some("0 0 0 1 1 * 2020"));
    }

    #[test]
    fn test_disabled_skip_resets_counter() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        job.mark_running(now).unwrap();
        job.update_execution_result(failed("x"), now).unwrap();
        job.disable();
        let status = job
            .update_execution_result(ExecutionOutcome::Disabled, now)
            .unwrap();
        assert_eq!(status, JobStatus::Skipped);
        assert_eq!(job.runtime().consecutive_failures, 0);
        assert_eq!(job.runtime().last_skip_reason.as_deref(), Some("disabled"));
        assert!(job.runtime().next_run_at.is_none());
    }

    #[test]
    fn test_transition_table() {
        assert!(JobStatus::NotStarted.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Skipped.can_transition_to(JobStatus::Success));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Success));
        assert!(JobStatus::Success.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::NotStarted));

        let mut job = ArchivalJob::new(definition()).unwrap();
        assert!(job
            .update_execution_result(ExecutionOutcome::Moved { rows: 1 }, Utc::now())
            .is_err());
    }

    #[test]
    fn test_enable_clears_failures() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        job.mark_running(now).unwrap();
        job.update_execution_result(failed("x"), now).unwrap();
        job.disable();
        job.enable();
        assert!(job.is_enabled());
        assert_eq!(job.runtime().consecutive_failures, 0);
    }

    #[test]
    fn test_is_due() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        assert!(job.is_due(now));
        job.set_next_run_time(Some(now + chrono::Duration::minutes(1)));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::minutes(2)));
        job.disable();
        assert!(!job.is_due(now + chrono::Duration::minutes(2)));
    }

    #[test]
    fn test_reset_statistics() {
        let mut job = ArchivalJob::new(definition()).unwrap();
        let now = Utc::now();
        job.mark_running(now).unwrap();
        job.update_execution_result(ExecutionOutcome::Moved { rows: 7 }, now)
            .unwrap();
        job.reset_statistics();
        assert_eq!(job.runtime().total_rows_moved, 0);
        assert_eq!(job.status(), JobStatus::NotStarted);
        assert!(job.is_enabled());
    }

    #[test]
    fn test_definition_yaml_round_trip_fields() {
        let yaml = r#"
name: events
source_connection: live
source_table: Events
target_table: EventsArchive
filter_column: OccurredAt
filter_predicate: "< now - 7d"
method: file_bulk_load
batch_size: 5000
max_rows_per_execution: 50000
cron_expression: "0 1 * * *"
"#;
        let def: JobDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.source_schema, "dbo");
        assert_eq!(def.target_connection(), "live");
        assert_eq!(def.trigger.cron_expression.as_deref(), Some("0 1 * * *"));
        assert_eq!(def.options.batch_timeout_secs, 600);
        assert!(def.enabled);
        assert!(ArchivalJob::new(def).is_ok());
    }
}
