//! Streaming bulk copy: source rows go straight into a TDS bulk insert on
//! the target, with no intermediate file.

use tiberius::ColumnData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::plan::{
    delete_keys, drop_if_exists_sql, execute_counted, resume_position, CopyPlan, INCOMING_TABLE,
};
use super::pool::MssqlPool;
use crate::core::batch::AuditLog;
use crate::error::{ArchiveError, Result};

pub struct StreamingCopy<'a> {
    pub source: &'a MssqlPool,
    pub target: &'a MssqlPool,
    pub plan: &'a CopyPlan,
    pub delete_after_copy: bool,
    /// Log progress every N rows (0 disables).
    pub notify_after: u64,
}

impl StreamingCopy<'_> {
    /// Copy one batch of at most `limit` rows.
    ///
    /// Returns the rows deleted from the source when deleting, otherwise the
    /// rows newly inserted into the target.
    pub async fn run(
        &self,
        limit: i64,
        cancel: &CancellationToken,
        audit: &mut AuditLog,
    ) -> Result<i64> {
        let after = if self.delete_after_copy {
            None
        } else {
            let mut conn = self.target.get().await?;
            audit.push(format!(
                "-- target '{}'\n{}",
                self.target.name(),
                self.plan.high_water_sql()?
            ));
            resume_position(&mut conn, self.plan).await?
        };

        let select = self.plan.select_sql(limit, after.as_deref())?;
        audit.push(format!("-- source '{}'\n{}", self.source.name(), select));

        let mut conn = self.source.get().await?;
        let rows = conn
            .simple_query(select.as_str())
            .await?
            .into_first_result()
            .await?;
        drop(conn);
        if rows.is_empty() {
            debug!("No qualifying rows in {}", self.plan.source);
            return Ok(0);
        }
        let selected = rows.len() as i64;

        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let mut keys: Vec<Vec<ColumnData<'static>>> = Vec::with_capacity(rows.len());
        let inserted = {
            let mut conn = self.target.get().await?;
            let create = self.plan.create_staging_sql(INCOMING_TABLE)?;
            audit.push(format!("-- target '{}'\n{}", self.target.name(), create));
            conn.simple_query(create).await?.into_results().await?;

            audit.push(format!("BULK INSERT {} ({} rows)", INCOMING_TABLE, selected));
            let mut bulk = conn.bulk_insert(INCOMING_TABLE).await?;
            let mut sent: u64 = 0;
            for row in rows {
                let (token_row, key) = self.plan.split_row(row);
                bulk.send(token_row).await?;
                keys.push(key);
                sent += 1;
                if self.notify_after > 0 && sent % self.notify_after == 0 {
                    info!("{}: {} of {} rows copied", self.plan.target, sent, selected);
                }
            }
            bulk.finalize().await?;

            let insert = self.plan.insert_missing_sql(INCOMING_TABLE)?;
            audit.push(insert.clone());
            let inserted = execute_counted(&mut conn, &insert).await?;
            if (inserted as i64) < selected {
                info!(
                    "{}: {} of {} rows were already present",
                    self.plan.target,
                    selected - inserted as i64,
                    selected
                );
            }
            conn.simple_query(drop_if_exists_sql(INCOMING_TABLE))
                .await?
                .into_results()
                .await?;
            inserted as i64
        };

        if !self.delete_after_copy {
            return Ok(inserted);
        }
        // copied and not yet deleted; the next run re-checks target keys
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut conn = self.source.get().await?;
        audit.push(format!(
            "-- source '{}'\n{}",
            self.source.name(),
            self.plan.delete_keyed_sql()?
        ));
        let deleted = delete_keys(&mut conn, self.plan, keys).await?;
        debug!("Deleted {} rows from {}", deleted, self.plan.source);

        Ok(deleted as i64)
    }
}
