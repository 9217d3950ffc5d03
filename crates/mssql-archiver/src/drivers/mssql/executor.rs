//! [`ArchiveExecutor`] for SQL Server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::bulk_file::FileBulkLoad;
use super::introspector::MssqlIntrospector;
use super::partition_switch::PartitionSwitch;
use super::plan::CopyPlan;
use super::pool::{ConnectionRegistry, MssqlPool};
use super::streaming::StreamingCopy;
use crate::config::BulkFileConfig;
use crate::core::batch::{AuditLog, BatchResult};
use crate::core::job::{ArchivalJob, ArchiveMethod};
use crate::core::traits::{ArchiveExecutor, SchemaIntrospector};
use crate::error::{ArchiveError, Result};
use crate::stats::StatisticsPolicy;
use crate::validate::{SafetyValidator, Verdict};

/// Runs every job's strategy against pools from a shared registry.
pub struct MssqlArchiveExecutor {
    registry: Arc<ConnectionRegistry>,
    policy: StatisticsPolicy,
    bulk: BulkFileConfig,
}

struct Sides {
    source: Arc<MssqlPool>,
    target: Arc<MssqlPool>,
    source_introspector: MssqlIntrospector,
    target_introspector: MssqlIntrospector,
}

impl MssqlArchiveExecutor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        policy: StatisticsPolicy,
        bulk: BulkFileConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            bulk,
        }
    }

    async fn sides(&self, job: &ArchivalJob) -> Result<Sides> {
        let def = job.definition();
        let source = self.registry.pool(&def.source_connection).await?;
        let target = self.registry.pool(def.target_connection()).await?;
        Ok(Sides {
            source_introspector: MssqlIntrospector::new(Arc::clone(&source), self.policy.clone()),
            target_introspector: MssqlIntrospector::new(Arc::clone(&target), self.policy.clone()),
            source,
            target,
        })
    }

    async fn dispatch(
        &self,
        job: &ArchivalJob,
        limit: i64,
        cancel: &CancellationToken,
        audit: &mut AuditLog,
    ) -> Result<i64> {
        let def = job.definition();
        let sides = self.sides(job).await?;

        match def.method {
            ArchiveMethod::PartitionSwitch => {
                PartitionSwitch {
                    source: &sides.source,
                    introspector: &sides.source_introspector,
                    target_introspector: &sides.target_introspector,
                    job: def,
                }
                .run(audit)
                .await
            }
            ArchiveMethod::StreamingBulkCopy | ArchiveMethod::FileBulkLoad => {
                let columns = sides
                    .source_introspector
                    .get_columns(&def.source_schema, &def.source_table)
                    .await?;
                let target_columns = sides
                    .target_introspector
                    .get_columns(&def.target_schema, &def.target_table)
                    .await?;
                let plan = CopyPlan::new(def, columns, &target_columns)?;

                if def.method == ArchiveMethod::StreamingBulkCopy {
                    StreamingCopy {
                        source: &sides.source,
                        target: &sides.target,
                        plan: &plan,
                        delete_after_copy: def.delete_after_copy,
                        notify_after: def.options.notify_after,
                    }
                    .run(limit, cancel, audit)
                    .await
                } else {
                    FileBulkLoad {
                        source: &sides.source,
                        target: &sides.target,
                        plan: &plan,
                        job: def,
                        bulk: &self.bulk,
                    }
                    .run(limit, cancel, audit)
                    .await
                }
            }
        }
    }
}

#[async_trait]
impl ArchiveExecutor for MssqlArchiveExecutor {
    async fn preflight(&self, job: &ArchivalJob) -> Result<Verdict> {
        let sides = self.sides(job).await?;
        let facts = SafetyValidator::gather(
            &sides.source_introspector,
            &sides.target_introspector,
            job.definition(),
        )
        .await?;
        let verdict = SafetyValidator::check(job.definition().method, &facts);
        for warning in &verdict.warnings {
            warn!("{}: {}", job.name(), warning);
        }
        Ok(verdict)
    }

    async fn run_batch(
        &self,
        job: &ArchivalJob,
        limit: i64,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let started = Instant::now();
        let mut audit = AuditLog::new();
        let timeout_secs = job.definition().options.batch_timeout_secs;

        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.dispatch(job, limit, cancel, &mut audit),
        )
        .await
        .unwrap_or_else(|_| Err(ArchiveError::timeout("archive batch", timeout_secs)));

        let elapsed = started.elapsed();
        match outcome {
            Ok(rows) => {
                let result = BatchResult::moved(rows, elapsed, audit);
                if rows > 0 {
                    info!(
                        "{}: batch moved {} rows in {:.2}s ({:.0} rows/s)",
                        job.name(),
                        rows,
                        elapsed.as_secs_f64(),
                        result.rows_per_second()
                    );
                }
                result
            }
            Err(e) if e.is_blocking() => BatchResult::blocked(e.to_string(), elapsed, audit),
            Err(e) => BatchResult::failed(e.to_string(), elapsed, audit),
        }
    }
}
