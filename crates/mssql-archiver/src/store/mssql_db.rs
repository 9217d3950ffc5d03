//! SQL Server job repository.
//!
//! One row per job in `[<schema>].[archive_jobs]`. The definition is stored
//! as JSON; runtime fields get their own columns so operators can query
//! status directly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tiberius::{Row, ToSql};
use uuid::Uuid;

use crate::core::identifier::{escape_literal, quote_mssql};
use crate::core::job::{ArchivalJob, JobDefinition, JobRuntime, JobStatus};
use crate::core::traits::JobRepository;
use crate::drivers::mssql::MssqlPool;
use crate::error::{ArchiveError, Result};

const JOB_COLUMNS: &str = "id, definition, is_enabled, next_run_at, last_run_at, last_status, \
     last_error, last_skip_reason, last_rows_moved, total_runs, total_rows_moved, \
     consecutive_failures, created_at, updated_at";

pub struct MssqlJobStore {
    pool: Arc<MssqlPool>,
    schema: String,
}

impl MssqlJobStore {
    pub fn new(pool: Arc<MssqlPool>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self) -> Result<String> {
        Ok(format!("{}.[archive_jobs]", quote_mssql(&self.schema)?))
    }

    async fn select(&self, filter: &str, param: Option<&dyn ToSql>) -> Result<Vec<ArchivalJob>> {
        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY name",
            JOB_COLUMNS,
            self.table()?,
            filter
        );
        let mut conn = self.pool.get().await?;
        let params: Vec<&dyn ToSql> = param.into_iter().collect();
        let rows = conn
            .query(sql, &params)
            .await?
            .into_first_result()
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn name_taken(&self, job: &ArchivalJob) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE name = @P1 AND id <> @P2",
            self.table()?
        );
        let id = job.id();
        let mut conn = self.pool.get().await?;
        let row = conn
            .query(sql, &[&job.name(), &id])
            .await?
            .into_row()
            .await?;
        let count: i32 = row.and_then(|r| r.get(0)).unwrap_or(0);
        Ok(count > 0)
    }

    async fn upsert(&self, job: &ArchivalJob, insert_only: bool) -> Result<u64> {
        let runtime = job.runtime();
        let definition = serde_json::to_string(job.definition())?;
        let consecutive = i32::try_from(runtime.consecutive_failures).unwrap_or(i32::MAX);
        let id = job.id();
        let created_at = job.created_at();
        let updated_at = job.updated_at();
        let matched = if insert_only {
            ""
        } else {
            "WHEN MATCHED THEN
                 UPDATE SET
                     name = @P2,
                     definition = @P3,
                     is_enabled = @P4,
                     next_run_at = @P5,
                     last_run_at = @P6,
                     last_status = @P7,
                     last_error = @P8,
                     last_skip_reason = @P9,
                     last_rows_moved = @P10,
                     total_runs = @P11,
                     total_rows_moved = @P12,
                     consecutive_failures = @P13,
                     updated_at = @P15"
        };
        let sql = format!(
            "MERGE {} AS target
             USING (SELECT @P1 AS id) AS source
             ON target.id = source.id
             {}
             WHEN NOT MATCHED BY TARGET AND @P16 = 1 THEN
                 INSERT (id, name, definition, is_enabled, next_run_at, last_run_at, last_status,
                         last_error, last_skip_reason, last_rows_moved, total_runs,
                         total_rows_moved, consecutive_failures, created_at, updated_at)
                 VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8, @P9, @P10, @P11, @P12, @P13,
                         @P14, @P15);",
            self.table()?,
            matched
        );

        let mut conn = self.pool.get().await?;
        let result = conn
            .execute(
                sql,
                &[
                    &id,
                    &job.name(),
                    &definition,
                    &runtime.is_enabled,
                    &runtime.next_run_at,
                    &runtime.last_run_at,
                    &runtime.last_status.as_str(),
                    &runtime.last_error,
                    &runtime.last_skip_reason,
                    &runtime.last_rows_moved,
                    &runtime.total_runs,
                    &runtime.total_rows_moved,
                    &consecutive,
                    &created_at,
                    &updated_at,
                    &insert_only,
                ],
            )
            .await?;
        Ok(result.total())
    }
}

fn row_to_job(row: &Row) -> Result<ArchivalJob> {
    let missing = |col: &str| ArchiveError::Store(format!("archive_jobs.{} is NULL", col));

    let id: Uuid = row.try_get("id")?.ok_or_else(|| missing("id"))?;
    let definition: &str = row
        .try_get("definition")?
        .ok_or_else(|| missing("definition"))?;
    let definition: JobDefinition = serde_json::from_str(definition)?;
    let status: &str = row
        .try_get("last_status")?
        .ok_or_else(|| missing("last_status"))?;
    let consecutive: i32 = row.try_get("consecutive_failures")?.unwrap_or(0);

    let runtime = JobRuntime {
        is_enabled: row.try_get("is_enabled")?.unwrap_or(false),
        next_run_at: row.try_get::<DateTime<Utc>, _>("next_run_at")?,
        last_run_at: row.try_get::<DateTime<Utc>, _>("last_run_at")?,
        last_status: JobStatus::parse(status)?,
        last_error: row.try_get::<&str, _>("last_error")?.map(str::to_string),
        last_skip_reason: row
            .try_get::<&str, _>("last_skip_reason")?
            .map(str::to_string),
        last_rows_moved: row.try_get("last_rows_moved")?.unwrap_or(0),
        total_runs: row.try_get("total_runs")?.unwrap_or(0),
        total_rows_moved: row.try_get("total_rows_moved")?.unwrap_or(0),
        consecutive_failures: u32::try_from(consecutive).unwrap_or(0),
    };
    let created_at: DateTime<Utc> = row
        .try_get("created_at")?
        .ok_or_else(|| missing("created_at"))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")?
        .ok_or_else(|| missing("updated_at"))?;

    ArchivalJob::restore(id, definition, runtime, created_at, updated_at)
}

/// DDL creating the control schema and job table if absent.
fn init_statements(schema: &str) -> Result<Vec<String>> {
    let quoted = quote_mssql(schema)?;
    let literal = escape_literal(schema);
    Ok(vec![
        format!(
            "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = '{}')
             BEGIN
                 EXEC('CREATE SCHEMA {}')
             END",
            literal,
            quoted.replace('\'', "''")
        ),
        format!(
            "IF NOT EXISTS (SELECT * FROM sys.tables WHERE name = 'archive_jobs' AND schema_id = SCHEMA_ID('{}'))
             BEGIN
                 CREATE TABLE {}.[archive_jobs] (
                     id UNIQUEIDENTIFIER NOT NULL PRIMARY KEY,
                     name NVARCHAR(128) NOT NULL,
                     definition NVARCHAR(MAX) NOT NULL,
                     is_enabled BIT NOT NULL,
                     next_run_at DATETIMEOFFSET,
                     last_run_at DATETIMEOFFSET,
                     last_status NVARCHAR(20) NOT NULL CHECK (last_status IN ('not_started', 'running', 'success', 'failed', 'skipped')),
                     last_error NVARCHAR(MAX),
                     last_skip_reason NVARCHAR(200),
                     last_rows_moved BIGINT NOT NULL DEFAULT 0,
                     total_runs BIGINT NOT NULL DEFAULT 0,
                     total_rows_moved BIGINT NOT NULL DEFAULT 0,
                     consecutive_failures INT NOT NULL DEFAULT 0,
                     created_at DATETIMEOFFSET NOT NULL,
                     updated_at DATETIMEOFFSET NOT NULL
                 )
             END",
            literal, quoted
        ),
        format!(
            "IF NOT EXISTS (SELECT * FROM sys.indexes WHERE name = 'ux_archive_jobs_name' AND object_id = OBJECT_ID('{}.[archive_jobs]'))
             BEGIN
                 CREATE UNIQUE INDEX ux_archive_jobs_name ON {}.[archive_jobs](name)
             END",
            quoted.replace('\'', "''"),
            quoted
        ),
    ])
}

#[async_trait]
impl JobRepository for MssqlJobStore {
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        for sql in init_statements(&self.schema)? {
            conn.execute(sql, &[]).await?;
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ArchivalJob>> {
        Ok(self
            .select("WHERE id = @P1", Some(&id as &dyn ToSql))
            .await?
            .into_iter()
            .next())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ArchivalJob>> {
        Ok(self
            .select("WHERE name = @P1", Some(&name as &dyn ToSql))
            .await?
            .into_iter()
            .next())
    }

    async fn get_all(&self) -> Result<Vec<ArchivalJob>> {
        self.select("", None).await
    }

    async fn get_enabled(&self) -> Result<Vec<ArchivalJob>> {
        self.select("WHERE is_enabled = 1", None).await
    }

    async fn create(&self, job: &ArchivalJob) -> Result<()> {
        if self.name_taken(job).await? {
            return Err(ArchiveError::DuplicateJob(job.name().to_string()));
        }
        match self.upsert(job, true).await? {
            0 => Err(ArchiveError::DuplicateJob(job.name().to_string())),
            _ => Ok(()),
        }
    }

    async fn update(&self, job: &ArchivalJob) -> Result<()> {
        if self.name_taken(job).await? {
            return Err(ArchiveError::DuplicateJob(job.name().to_string()));
        }
        match self.upsert(job, false).await? {
            0 => Err(ArchiveError::JobNotFound(job.id().to_string())),
            _ => Ok(()),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = @P1", self.table()?);
        let mut conn = self.pool.get().await?;
        let result = conn.execute(sql, &[&id]).await?;
        Ok(result.total() > 0)
    }

    fn backend_type(&self) -> &'static str {
        "mssql"
    }
}
