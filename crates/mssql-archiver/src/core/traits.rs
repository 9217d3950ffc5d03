//! Seams between the engine and the database it drives.
//!
//! - [`SchemaIntrospector`]: read-only catalog queries against one connection
//! - [`ArchiveExecutor`]: the move strategies, one bounded batch at a time
//! - [`JobRepository`]: persistence of [`ArchivalJob`] records
//!
//! The runner and validator only see these traits, so every state machine
//! path is testable against in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::batch::BatchResult;
use super::job::ArchivalJob;
use super::schema::{
    ColumnDefinition, ColumnStatistics, ForeignKeyReference, IndexDefinition, PartitionDetail,
    PartitionInfo,
};
use crate::error::Result;
use crate::validate::Verdict;

/// Read-only catalog access for one database.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// True iff the table's heap or clustered index sits on a partition scheme.
    async fn is_partitioned(&self, schema: &str, table: &str) -> Result<bool>;

    /// `None` when the table is not partitioned.
    async fn get_partition_info(&self, schema: &str, table: &str)
        -> Result<Option<PartitionInfo>>;

    /// One entry per partition ordered by partition number.
    ///
    /// Missing space-usage permissions degrade to zero sizes, never an error.
    async fn get_partition_details(&self, schema: &str, table: &str)
        -> Result<Vec<PartitionDetail>>;

    /// Columns in ordinal order. Empty when the table does not exist.
    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDefinition>>;

    async fn get_indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDefinition>>;

    /// Foreign keys declared on *other* tables that reference this one.
    async fn get_referencing_foreign_keys(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ForeignKeyReference>>;

    /// Row estimate from catalog partition statistics; never a live count.
    async fn estimated_row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Exact existence probe (`TOP 1`), cheap on any table size.
    async fn has_rows(&self, schema: &str, table: &str) -> Result<bool>;

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Tiered min/max/count statistics; see [`crate::stats`].
    async fn get_column_statistics(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<ColumnStatistics>;
}

/// Performs a job's configured move strategy.
#[async_trait]
pub trait ArchiveExecutor: Send + Sync {
    /// Pre-flight safety verdict for the job's strategy.
    ///
    /// An `Err` is a transient fault (connectivity, timeout); a verdict with
    /// blocking issues is a safety violation.
    async fn preflight(&self, job: &ArchivalJob) -> Result<Verdict>;

    /// Move at most `limit` qualifying rows.
    ///
    /// Zero rows moved with `success` set means nothing currently qualifies.
    /// Must be safe to re-invoke when the outcome of a previous call is
    /// unknown.
    async fn run_batch(
        &self,
        job: &ArchivalJob,
        limit: i64,
        cancel: &CancellationToken,
    ) -> BatchResult;
}

/// Persistence of archival jobs.
///
/// Implementations must be `Send + Sync`; the runner shares one repository
/// across concurrent invocations of different jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create backing storage if needed. Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ArchivalJob>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<ArchivalJob>>;

    async fn get_all(&self) -> Result<Vec<ArchivalJob>>;

    async fn get_enabled(&self) -> Result<Vec<ArchivalJob>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|job| job.is_enabled())
            .collect())
    }

    /// Enabled jobs whose next run is unset or at/before `now`.
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ArchivalJob>> {
        Ok(self
            .get_enabled()
            .await?
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect())
    }

    /// Insert a new job. Fails with `DuplicateJob` when the name is taken.
    async fn create(&self, job: &ArchivalJob) -> Result<()>;

    /// Replace a stored job. Fails with `JobNotFound` when absent.
    async fn update(&self, job: &ArchivalJob) -> Result<()>;

    /// Returns false when no job had this id.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}
