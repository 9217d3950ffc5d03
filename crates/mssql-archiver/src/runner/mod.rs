//! Job runner: one scheduled firing of one job.
//!
//! An invocation loads the job, persists `Running`, runs the pre-flight
//! verdict and then up to `max_batches()` sequential batches, and finally
//! persists the outcome. The final write happens on every path:
//! cancellation, a failed batch, a panic inside the loop.
//!
//! Overlapping invocations of the same job inside this process are refused
//! by an advisory lock keyed by job id. Runs interrupted by a crash stay
//! `Running` in the store until [`JobRunner::recover_stale`] reconciles them.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::core::batch::{BatchResult, ExecutionSummary};
use crate::core::job::{ArchivalJob, ExecutionOutcome, JobStatus, SKIP_REASON_DISABLED};
use crate::core::traits::{ArchiveExecutor, JobRepository};
use crate::error::{ArchiveError, Result};

/// Skip reason when another invocation of the same job is in flight.
pub const SKIP_REASON_OVERLAP: &str = "already running";

/// Error recorded by the recovery sweep.
pub const REASON_INTERRUPTED: &str = "interrupted";

pub struct JobRunner {
    repo: Arc<dyn JobRepository>,
    executor: Arc<dyn ArchiveExecutor>,
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Releases the advisory lock on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

impl JobRunner {
    pub fn new(repo: Arc<dyn JobRepository>, executor: Arc<dyn ArchiveExecutor>) -> Self {
        Self {
            repo,
            executor,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    fn try_lock(&self, id: Uuid) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(id) {
            Some(InFlight {
                set: &self.in_flight,
                id,
            })
        } else {
            None
        }
    }

    fn is_locked(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    /// Run one invocation of the job.
    ///
    /// Returns `Err` only when the job does not exist or its state could not
    /// be persisted; batch failures are reported through the summary.
    pub async fn execute(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ExecutionSummary> {
        let started_at = Utc::now();
        let job = self
            .repo
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| ArchiveError::JobNotFound(job_id.to_string()))?;

        let span = info_span!("archive_job", job = %job.name(), id = %job_id);
        let Some(_lock) = self.try_lock(job_id) else {
            warn!("{}: invocation overlaps a running one, skipping", job.name());
            return Ok(ExecutionSummary::skipped(
                job_id,
                job.name(),
                SKIP_REASON_OVERLAP,
                started_at,
            ));
        };

        self.execute_locked(job, cancel, started_at)
            .instrument(span)
            .await
    }

    async fn execute_locked(
        &self,
        mut job: ArchivalJob,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionSummary> {
        if !job.is_enabled() {
            info!("{}: disabled, skipping", job.name());
            job.update_execution_result(ExecutionOutcome::Disabled, Utc::now())?;
            self.repo.update(&job).await?;
            return Ok(ExecutionSummary::skipped(
                job.id(),
                job.name(),
                SKIP_REASON_DISABLED,
                started_at,
            ));
        }

        if job.status() == JobStatus::Running {
            warn!(
                "{}: store still shows a run in progress since {:?}; run recovery to reconcile",
                job.name(),
                job.runtime().last_run_at
            );
            return Ok(ExecutionSummary::skipped(
                job.id(),
                job.name(),
                SKIP_REASON_OVERLAP,
                started_at,
            ));
        }

        job.mark_running(started_at)?;
        self.repo.update(&job).await?;
        info!(
            "{}: starting {} of {} -> {}",
            job.name(),
            job.definition().method.as_str(),
            job.definition().source_full_name(),
            job.definition().target_full_name()
        );

        let clock = Instant::now();
        let mut batches = Vec::new();
        let result = AssertUnwindSafe(self.run_batches(&job, cancel, &mut batches))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                let moved = batches.iter().map(|b: &BatchResult| b.rows_moved).sum();
                ExecutionOutcome::Failed {
                    error: format!("archive loop panicked: {}", panic_message(panic.as_ref())),
                    rows: moved,
                    blocking: false,
                }
            }
        };

        let was_enabled = job.is_enabled();
        let status = job.update_execution_result(outcome, Utc::now())?;
        self.persist_final(&job).await?;

        let runtime = job.runtime();
        let disabled = was_enabled && !job.is_enabled();
        match status {
            JobStatus::Success => info!(
                "{}: archived {} rows in {} batches ({:.1}s)",
                job.name(),
                runtime.last_rows_moved,
                batches.len(),
                clock.elapsed().as_secs_f64()
            ),
            JobStatus::Failed => error!(
                "{}: failed after {} rows: {}",
                job.name(),
                runtime.last_rows_moved,
                runtime.last_error.as_deref().unwrap_or("unknown error")
            ),
            _ => info!(
                "{}: skipped ({})",
                job.name(),
                runtime.last_skip_reason.as_deref().unwrap_or("-")
            ),
        }
        if disabled {
            warn!(
                "{}: disabled after {} consecutive failure(s)",
                job.name(),
                runtime.consecutive_failures
            );
        }

        Ok(ExecutionSummary {
            job_id: job.id(),
            job_name: job.name().to_string(),
            status,
            rows_moved: runtime.last_rows_moved,
            batches,
            skip_reason: runtime.last_skip_reason.clone(),
            error: runtime.last_error.clone(),
            started_at,
            duration: clock.elapsed(),
            disabled,
        })
    }

    /// Pre-flight plus the batch loop. Never returns early without an outcome.
    async fn run_batches(
        &self,
        job: &ArchivalJob,
        cancel: &CancellationToken,
        batches: &mut Vec<BatchResult>,
    ) -> ExecutionOutcome {
        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(0),
            verdict = self.executor.preflight(job) => verdict,
        };
        match verdict {
            Ok(v) if !v.can_proceed => {
                return ExecutionOutcome::Failed {
                    error: format!("blocked [{}]: {}", v.codes(), v.describe()),
                    rows: 0,
                    blocking: true,
                }
            }
            Ok(_) => {}
            Err(e) => {
                return ExecutionOutcome::Failed {
                    error: e.to_string(),
                    rows: 0,
                    blocking: e.is_blocking(),
                }
            }
        }

        let max_batches = job.max_batches();
        let mut moved = 0i64;
        for n in 1..=max_batches {
            let limit = job.next_batch_limit(moved);
            if limit <= 0 {
                break;
            }

            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(moved),
                batch = self.executor.run_batch(job, limit, cancel) => batch,
            };
            debug!(
                "{}: batch {}/{} limit {} -> {} rows in {:?}",
                job.name(),
                n,
                max_batches,
                limit,
                batch.rows_moved,
                batch.duration
            );

            let rows = batch.rows_moved;
            if !batch.success {
                let error = batch
                    .error
                    .clone()
                    .unwrap_or_else(|| "batch failed".to_string());
                let blocking = batch.blocking;
                batches.push(batch);
                return ExecutionOutcome::Failed {
                    error,
                    rows: moved + rows,
                    blocking,
                };
            }
            batches.push(batch);

            if rows == 0 {
                break;
            }
            moved += rows;
        }

        if moved == 0 {
            ExecutionOutcome::NothingToMove
        } else {
            ExecutionOutcome::Moved { rows: moved }
        }
    }

    /// Persist the final state, retrying once before giving up.
    async fn persist_final(&self, job: &ArchivalJob) -> Result<()> {
        let Err(first) = self.repo.update(job).await else {
            return Ok(());
        };
        warn!("{}: failed to persist final state, retrying: {}", job.name(), first);
        if let Err(second) = self.repo.update(job).await {
            error!(
                "{}: final state ({}) was not persisted: {}",
                job.name(),
                job.status(),
                second.format_detailed()
            );
            return Err(second);
        }
        Ok(())
    }

    /// Run every due job sequentially. Errors are logged and do not stop
    /// the remaining jobs.
    pub async fn run_due(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecutionSummary>> {
        let due = self.repo.get_due(now).await?;
        info!("{} job(s) due", due.len());

        let mut summaries = Vec::with_capacity(due.len());
        for job in due {
            if cancel.is_cancelled() {
                info!("Cancellation requested, not starting further jobs");
                break;
            }
            match self.execute(job.id(), cancel).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!("{}: {}", job.name(), e.format_detailed()),
            }
        }
        Ok(summaries)
    }

    /// Mark jobs left `Running` for longer than `older_than` as Failed.
    ///
    /// Counts as a consecutive failure, so a job that keeps crashing the
    /// process is eventually disabled. Returns the recovered jobs' names.
    pub async fn recover_stale(&self, older_than: chrono::Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut recovered = Vec::new();

        for mut job in self.repo.get_all().await? {
            if job.status() != JobStatus::Running || self.is_locked(job.id()) {
                continue;
            }
            let stale = job
                .runtime()
                .last_run_at
                .map(|at| now - at >= older_than)
                .unwrap_or(true);
            if !stale {
                continue;
            }

            job.update_execution_result(
                ExecutionOutcome::Failed {
                    error: REASON_INTERRUPTED.to_string(),
                    rows: 0,
                    blocking: false,
                },
                now,
            )?;
            self.repo.update(&job).await?;
            warn!(
                "{}: recovered interrupted run (consecutive failures: {})",
                job.name(),
                job.runtime().consecutive_failures
            );
            recovered.push(job.name().to_string());
        }
        Ok(recovered)
    }
}

fn cancelled(rows: i64) -> ExecutionOutcome {
    ExecutionOutcome::Failed {
        error: ArchiveError::Cancelled.to_string(),
        rows,
        blocking: false,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::AuditLog;
    use crate::core::job::tests::definition;
    use crate::core::job::SKIP_REASON_NO_ROWS;
    use crate::store::MemoryJobStore;
    use crate::validate::{Issue, IssueCode, Verdict};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Normal,
        FailBatch,
        Blocked,
        Panic,
        Hang,
    }

    /// Moves rows out of an in-memory pile of `available` qualifying rows.
    struct FakeExecutor {
        available: AtomicI64,
        mode: Mode,
        limits: Mutex<Vec<i64>>,
    }

    impl FakeExecutor {
        fn new(available: i64, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                available: AtomicI64::new(available),
                mode,
                limits: Mutex::new(Vec::new()),
            })
        }

        fn limits(&self) -> Vec<i64> {
            self.limits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArchiveExecutor for FakeExecutor {
        async fn preflight(&self, _job: &ArchivalJob) -> Result<Verdict> {
            if self.mode == Mode::Blocked {
                let verdict = Verdict {
                    can_proceed: false,
                    blocking_issues: vec![Issue {
                        code: IssueCode::TargetTableNotEmpty,
                        message: "archive.Orders has rows".into(),
                    }],
                    warnings: Vec::new(),
                };
                return Ok(verdict);
            }
            Ok(Verdict {
                can_proceed: true,
                ..Verdict::default()
            })
        }

        async fn run_batch(
            &self,
            _job: &ArchivalJob,
            limit: i64,
            _cancel: &CancellationToken,
        ) -> BatchResult {
            self.limits.lock().unwrap().push(limit);
            match self.mode {
                Mode::FailBatch => {
                    BatchResult::failed("connection reset", Duration::ZERO, AuditLog::new())
                }
                Mode::Panic => panic!("boom"),
                Mode::Hang => std::future::pending().await,
                _ => {
                    let left = self.available.load(Ordering::SeqCst);
                    let rows = left.min(limit);
                    self.available.fetch_sub(rows, Ordering::SeqCst);
                    BatchResult::moved(rows, Duration::from_millis(5), AuditLog::new())
                }
            }
        }
    }

    async fn setup(available: i64, mode: Mode) -> (JobRunner, Arc<FakeExecutor>, Uuid) {
        let store = Arc::new(MemoryJobStore::new());
        let job = ArchivalJob::new(definition()).unwrap();
        store.create(&job).await.unwrap();
        let executor = FakeExecutor::new(available, mode);
        let runner = JobRunner::new(store, executor.clone());
        (runner, executor, job.id())
    }

    async fn load(runner: &JobRunner, id: Uuid) -> ArchivalJob {
        runner.repository().get_by_id(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_caps_rows_per_invocation() {
        let (runner, executor, id) = setup(600, Mode::Normal).await;
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.status, JobStatus::Success);
        assert_eq!(summary.rows_moved, 250);
        assert_eq!(executor.limits(), vec![100, 100, 50]);

        let job = load(&runner, id).await;
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.runtime().last_rows_moved, 250);
        assert_eq!(job.runtime().total_rows_moved, 250);
        assert_eq!(job.runtime().total_runs, 1);
        assert!(job.runtime().next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_nothing_qualifies_is_skipped() {
        let (runner, executor, id) = setup(0, Mode::Normal).await;
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.status, JobStatus::Skipped);
        assert_eq!(summary.skip_reason.as_deref(), Some(SKIP_REASON_NO_ROWS));
        assert_eq!(executor.limits().len(), 1);

        let job = load(&runner, id).await;
        assert_eq!(job.runtime().last_rows_moved, 0);
        assert_eq!(job.runtime().consecutive_failures, 0);
        assert_eq!(job.runtime().total_runs, 0);
    }

    #[tokio::test]
    async fn test_expired_schedule_still_persists_final_state() {
        let store = Arc::new(MemoryJobStore::new());
        let now = Utc::now();
        let definition = crate::core::job::JobDefinition {
            trigger: crate::core::schedule::Trigger::cron("0 0 0 1 1 * 2020"),
            ..definition()
        };
        let job = ArchivalJob::restore(
            Uuid::new_v4(),
            definition,
            crate::core::job::JobRuntime {
                is_enabled: true,
                ..Default::default()
            },
            now,
            now,
        )
        .unwrap();
        store.create(&job).await.unwrap();
        let runner = JobRunner::new(store, FakeExecutor::new(60, Mode::Normal));
        let cancel = CancellationToken::new();

        let summary = runner.execute(job.id(), &cancel).await.unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.rows_moved, 60);
        assert!(summary.disabled);

        let stored = load(&runner, job.id()).await;
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.runtime().total_rows_moved, 60);

        let next = runner.execute(job.id(), &cancel).await.unwrap();
        assert_eq!(next.skip_reason.as_deref(), Some(SKIP_REASON_DISABLED));
    }

    #[tokio::test]
    async fn test_short_batch_ends_loop() {
        let (runner, executor, id) = setup(130, Mode::Normal).await;
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.rows_moved, 130);
        // 100, 30, then an empty batch confirms exhaustion
        assert_eq!(executor.limits(), vec![100, 100, 100]);
        assert_eq!(summary.batches.len(), 3);
    }

    #[tokio::test]
    async fn test_auto_disable_after_consecutive_failures() {
        let (runner, executor, id) = setup(600, Mode::FailBatch).await;
        let cancel = CancellationToken::new();

        for i in 1..=5u32 {
            let summary = runner.execute(id, &cancel).await.unwrap();
            assert_eq!(summary.status, JobStatus::Failed);
            assert_eq!(summary.disabled, i == 5);
            // a failed batch stops the loop
            assert_eq!(executor.limits().len(), i as usize);
        }

        let job = load(&runner, id).await;
        assert!(!job.is_enabled());
        assert!(job.runtime().next_run_at.is_none());
        assert_eq!(job.runtime().consecutive_failures, 5);

        let sixth = runner.execute(id, &cancel).await.unwrap();
        assert_eq!(sixth.status, JobStatus::Skipped);
        assert_eq!(sixth.skip_reason.as_deref(), Some(SKIP_REASON_DISABLED));
        assert_eq!(executor.limits().len(), 5);

        let job = load(&runner, id).await;
        assert_eq!(job.runtime().consecutive_failures, 0);
        assert!(!job.is_enabled());
    }

    #[tokio::test]
    async fn test_blocking_verdict_disables_immediately() {
        let (runner, executor, id) = setup(600, Mode::Blocked).await;
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert!(summary.disabled);
        assert!(summary.error.unwrap().contains("TargetTableNotEmpty"));
        assert!(executor.limits().is_empty());

        let job = load(&runner, id).await;
        assert!(!job.is_enabled());
        assert_eq!(job.runtime().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failed() {
        let (runner, _executor, id) = setup(600, Mode::Panic).await;
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert!(summary.error.unwrap().contains("boom"));
        assert_eq!(load(&runner, id).await.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_pre_cancelled_never_runs_a_batch() {
        let (runner, executor, id) = setup(600, Mode::Normal).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = runner.execute(id, &cancel).await.unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert!(summary.error.unwrap().contains("cancelled"));
        assert!(executor.limits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_batch_does_not_leave_running() {
        let (runner, _executor, id) = setup(600, Mode::Hang).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let summary = runner.execute(id, &cancel).await.unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(load(&runner, id).await.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_overlapping_invocation_skipped() {
        let (runner, executor, id) = setup(600, Mode::Normal).await;
        let before = load(&runner, id).await;

        let _held = runner.try_lock(id).unwrap();
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.status, JobStatus::Skipped);
        assert_eq!(summary.skip_reason.as_deref(), Some(SKIP_REASON_OVERLAP));
        assert!(executor.limits().is_empty());
        assert_eq!(load(&runner, id).await, before);
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let (runner, _executor, id) = setup(600, Mode::Normal).await;
        runner.execute(id, &CancellationToken::new()).await.unwrap();
        assert!(!runner.is_locked(id));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (runner, _executor, _id) = setup(0, Mode::Normal).await;
        let err = runner
            .execute(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_recover_stale_running_job() {
        let (runner, executor, id) = setup(600, Mode::Normal).await;

        let mut job = load(&runner, id).await;
        job.mark_running(Utc::now() - chrono::Duration::hours(2)).unwrap();
        runner.repository().update(&job).await.unwrap();

        // a crashed run blocks new invocations until reconciled
        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.skip_reason.as_deref(), Some(SKIP_REASON_OVERLAP));
        assert!(executor.limits().is_empty());

        let recovered = runner
            .recover_stale(chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(recovered, vec!["orders-archive".to_string()]);

        let job = load(&runner, id).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.runtime().last_error.as_deref(), Some(REASON_INTERRUPTED));
        assert_eq!(job.runtime().consecutive_failures, 1);

        let summary = runner.execute(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_recover_ignores_recent_runs() {
        let (runner, _executor, id) = setup(600, Mode::Normal).await;
        let mut job = load(&runner, id).await;
        job.mark_running(Utc::now()).unwrap();
        runner.repository().update(&job).await.unwrap();

        let recovered = runner
            .recover_stale(chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn test_run_due_executes_due_jobs_only() {
        let (runner, executor, id) = setup(50, Mode::Normal).await;

        let mut later_def = definition();
        later_def.name = "later".into();
        let mut later = ArchivalJob::new(later_def).unwrap();
        later.set_next_run_time(Some(Utc::now() + chrono::Duration::hours(1)));
        runner.repository().create(&later).await.unwrap();

        let summaries = runner
            .run_due(Utc::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].job_id, id);
        assert_eq!(summaries[0].rows_moved, 50);
        assert_eq!(executor.limits(), vec![100, 100]);
    }
}
