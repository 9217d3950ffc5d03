//! Metadata-only partition hand-off.
//!
//! At most one partition moves per batch: the lowest-numbered partition in
//! which every row satisfies the job's filter. A partition that only
//! partly qualifies is never switched.

use tracing::{debug, info};

use super::introspector::MssqlIntrospector;
use super::pool::MssqlPool;
use crate::core::batch::AuditLog;
use crate::core::identifier::{filter_condition, qualify_mssql, quote_mssql};
use crate::core::job::JobDefinition;
use crate::core::schema::PartitionInfo;
use crate::core::traits::SchemaIntrospector;
use crate::error::{ArchiveError, Result};

/// A partition whose rows all qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchCandidate {
    pub partition_number: i32,
    pub rows: i64,
}

/// Find the lowest fully qualifying, non-empty partition.
pub fn candidate_sql(job: &JobDefinition, info: &PartitionInfo) -> Result<String> {
    let source = qualify_mssql(&job.source_schema, &job.source_table)?;
    let partition_of = format!(
        "$PARTITION.{}({})",
        quote_mssql(&info.function_name)?,
        quote_mssql(&info.column_name)?
    );
    Ok(format!(
        "WITH qualifying AS (
             SELECT {p} AS partition_number, COUNT_BIG(*) AS row_count
             FROM {src} WHERE {filter} GROUP BY {p}
         ), totals AS (
             SELECT {p} AS partition_number, COUNT_BIG(*) AS row_count
             FROM {src} WHERE {p} IN (SELECT partition_number FROM qualifying) GROUP BY {p}
         )
         SELECT TOP (1) CAST(q.partition_number AS INT), q.row_count
         FROM qualifying q JOIN totals t ON t.partition_number = q.partition_number
         WHERE q.row_count = t.row_count
         ORDER BY q.partition_number",
        p = partition_of,
        src = source,
        filter = filter_condition(&job.filter_column, &job.filter_predicate)?
    ))
}

pub fn switch_sql(job: &JobDefinition, partition_number: i32) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} SWITCH PARTITION {} TO {}",
        qualify_mssql(&job.source_schema, &job.source_table)?,
        partition_number,
        qualify_mssql(&job.target_schema, &job.target_table)?
    ))
}

pub struct PartitionSwitch<'a> {
    pub source: &'a MssqlPool,
    pub introspector: &'a MssqlIntrospector,
    pub target_introspector: &'a MssqlIntrospector,
    pub job: &'a JobDefinition,
}

impl PartitionSwitch<'_> {
    pub async fn run(&self, audit: &mut AuditLog) -> Result<i64> {
        let job = self.job;
        let info = self
            .introspector
            .get_partition_info(&job.source_schema, &job.source_table)
            .await?
            .ok_or_else(|| ArchiveError::Blocked {
                codes: "SourceNotPartitioned".into(),
                message: format!("{} is not partitioned", job.source_full_name()),
            })?;

        let find = candidate_sql(job, &info)?;
        audit.push(find.clone());
        let candidate = {
            let mut conn = self.source.get().await?;
            let row = conn.simple_query(find).await?.into_row().await?;
            match row {
                Some(row) => Some(SwitchCandidate {
                    partition_number: row.try_get::<i32, _>(0)?.unwrap_or(0),
                    rows: row.try_get::<i64, _>(1)?.unwrap_or(0),
                }),
                None => None,
            }
        };

        let Some(candidate) = candidate else {
            debug!("{}: no partition fully satisfies the filter", job.name);
            return Ok(0);
        };

        // the target may have been written since pre-flight
        if self
            .target_introspector
            .has_rows(&job.target_schema, &job.target_table)
            .await?
        {
            return Err(ArchiveError::Blocked {
                codes: "TargetTableNotEmpty".into(),
                message: format!("{} is not empty", job.target_full_name()),
            });
        }

        let switch = switch_sql(job, candidate.partition_number)?;
        audit.push(switch.clone());
        let mut conn = self.source.get().await?;
        conn.execute(switch.as_str(), &[]).await?;

        info!(
            "{}: switched partition {} ({} rows) of {} to {}",
            job.name,
            candidate.partition_number,
            candidate.rows,
            job.source_full_name(),
            job.target_full_name()
        );
        Ok(candidate.rows)
    }
}
