//! File bulk load: `bcp queryout` to a file, `bcp in` to a staging table on
//! the target, then the same keyed insert and delete as the streaming path.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tiberius::ColumnData;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::plan::{delete_keys, drop_if_exists_sql, execute_counted, resume_position, CopyPlan};
use super::pool::{MssqlClient, MssqlPool};
use crate::config::{BulkFileConfig, ConnectionConfig};
use crate::core::batch::AuditLog;
use crate::core::identifier::qualify_mssql;
use crate::core::job::{ExecutionOptions, JobDefinition};
use crate::error::{ArchiveError, Result};

const MASK: &str = "********";

/// One bcp invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BcpCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl BcpCommand {
    fn new(
        config: &BulkFileConfig,
        object: &str,
        direction: &str,
        file: &Path,
        conn: &ConnectionConfig,
        options: &ExecutionOptions,
        batch_size: i64,
    ) -> Self {
        let mut args = vec![
            object.to_string(),
            direction.to_string(),
            file.display().to_string(),
            "-S".into(),
            conn.bcp_server(),
            "-d".into(),
            conn.database.clone(),
            "-U".into(),
            conn.user.clone(),
            "-P".into(),
            conn.password.clone(),
            if options.native_format { "-n" } else { "-c" }.into(),
            "-b".into(),
            batch_size.to_string(),
            "-m".into(),
            options.max_errors.to_string(),
        ];
        if conn.trust_server_cert {
            args.push("-u".into());
        }
        args.extend(config.extra_args.iter().cloned());
        Self {
            program: config.bcp_path.clone(),
            args,
        }
    }

    /// Command line with the password replaced.
    pub fn masked(&self) -> String {
        let mut out = vec![self.program.clone()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                out.push(MASK.to_string());
                mask_next = false;
                continue;
            }
            mask_next = arg == "-P";
            if arg.contains(' ') {
                out.push(format!("\"{}\"", arg));
            } else {
                out.push(arg.clone());
            }
        }
        out.join(" ")
    }

    /// Run the tool, killing it if `limit` elapses; returns rows copied.
    pub async fn run(&self, limit: Duration) -> Result<i64> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ArchiveError::BulkTool(format!("failed to start {}: {}", self.program, e)))?;

        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ArchiveError::timeout("bcp", limit.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("bcp output: {}", stdout.trim());

        if !output.status.success() {
            return Err(ArchiveError::BulkTool(format!(
                "bcp exited with {}: {}",
                output.status,
                tail(&format!("{}\n{}", stdout, stderr))
            )));
        }

        parse_rows_copied(&stdout).ok_or_else(|| {
            ArchiveError::BulkTool(format!(
                "could not find a row count in bcp output: {}",
                tail(&stdout)
            ))
        })
    }
}

/// Parse the `N rows copied.` line bcp prints on completion.
pub fn parse_rows_copied(output: &str) -> Option<i64> {
    output
        .lines()
        .find(|line| line.contains("rows copied") || line.contains("row copied"))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|n| n.replace(',', "").parse().ok())
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

/// Permanent staging table: bcp runs in its own session, so a temp table
/// is not visible to it.
pub fn staging_table_name(job: &JobDefinition) -> Result<String> {
    qualify_mssql(
        &job.target_schema,
        &format!("_archive_staging_{}", job.target_table),
    )
}

pub struct FileBulkLoad<'a> {
    pub source: &'a MssqlPool,
    pub target: &'a MssqlPool,
    pub plan: &'a CopyPlan,
    pub job: &'a JobDefinition,
    pub bulk: &'a BulkFileConfig,
}

impl FileBulkLoad<'_> {
    pub async fn run(
        &self,
        limit: i64,
        cancel: &CancellationToken,
        audit: &mut AuditLog,
    ) -> Result<i64> {
        let file = self
            .bulk
            .work_dir()
            .join(format!("{}_{}.bcp", sanitize(&self.job.name), Uuid::new_v4()));

        let result = self.run_with_file(&file, limit, cancel, audit).await;

        if self.job.options.keep_export_file {
            info!("Keeping export file {}", file.display());
        } else if let Err(e) = tokio::fs::remove_file(&file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove export file {}: {}", file.display(), e);
            }
        }

        result
    }

    async fn run_with_file(
        &self,
        file: &Path,
        limit: i64,
        cancel: &CancellationToken,
        audit: &mut AuditLog,
    ) -> Result<i64> {
        let options = &self.job.options;
        let timeout = Duration::from_secs(options.batch_timeout_secs);
        let batch_size = self.job.batch_size.min(limit).max(1);

        let after = if self.job.delete_after_copy {
            None
        } else {
            let mut conn = self.target.get().await?;
            audit.push(self.plan.high_water_sql()?);
            resume_position(&mut conn, self.plan).await?
        };

        let export = BcpCommand::new(
            self.bulk,
            &self.plan.select_sql(limit, after.as_deref())?,
            "queryout",
            file,
            self.source.config(),
            options,
            batch_size,
        );
        audit.push(export.masked());
        let exported = export.run(timeout).await?;
        if exported == 0 {
            return Ok(0);
        }

        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let staging = staging_table_name(self.job)?;
        let mut conn = self.target.get().await?;
        let create = self.plan.create_staging_sql(&staging)?;
        audit.push(create.clone());
        conn.simple_query(create).await?.into_results().await?;

        let load = BcpCommand::new(
            self.bulk,
            &staging,
            "in",
            file,
            self.target.config(),
            options,
            batch_size,
        );
        audit.push(load.masked());
        let loaded = match load.run(timeout).await {
            Ok(loaded) => loaded,
            Err(e) => {
                drop_staging(&mut conn, &staging).await;
                return Err(e);
            }
        };
        if let Err(e) = check_load(exported, loaded, self.job.delete_after_copy) {
            drop_staging(&mut conn, &staging).await;
            return Err(e);
        }
        if loaded < exported {
            warn!(
                "{}: bcp loaded {} of {} exported rows (max_errors={}); the rest stay in the source",
                self.job.name, loaded, exported, options.max_errors
            );
        }

        let insert = self.plan.insert_missing_sql(&staging)?;
        audit.push(insert.clone());
        let inserted = execute_counted(&mut conn, &insert).await? as i64;

        let keys: Vec<Vec<ColumnData<'static>>> = if self.job.delete_after_copy {
            conn.simple_query(self.plan.select_keys_sql(&staging)?)
                .await?
                .into_first_result()
                .await?
                .into_iter()
                .map(|row| row.into_iter().collect())
                .collect()
        } else {
            Vec::new()
        };

        let drop_sql = drop_if_exists_sql(&staging);
        audit.push(drop_sql.clone());
        conn.simple_query(drop_sql).await?.into_results().await?;
        drop(conn);

        if !self.job.delete_after_copy {
            return Ok(inserted);
        }
        if keys.is_empty() {
            return Ok(0);
        }
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut source = self.source.get().await?;
        audit.push(self.plan.delete_keyed_sql()?);
        let deleted = delete_keys(&mut source, self.plan, keys).await?;
        debug!("Deleted {} rows from {}", deleted, self.plan.source);

        Ok(deleted as i64)
    }
}

/// Reject loads that lost rows the batch would otherwise count as done.
///
/// Nothing loaded out of a non-empty export is a failure, not exhaustion.
/// A partial load is tolerated only when deleting: the rejected rows stay in
/// the source and are selected again, whereas without deletion the next
/// batch resumes past them.
fn check_load(exported: i64, loaded: i64, delete_after_copy: bool) -> Result<()> {
    if exported > 0 && loaded == 0 {
        return Err(ArchiveError::BulkTool(format!(
            "bcp loaded none of {} exported rows",
            exported
        )));
    }
    if loaded < exported && !delete_after_copy {
        return Err(ArchiveError::BulkTool(format!(
            "bcp loaded {} of {} exported rows",
            loaded, exported
        )));
    }
    Ok(())
}

async fn drop_staging(conn: &mut MssqlClient, staging: &str) {
    let result = match conn.simple_query(drop_if_exists_sql(staging)).await {
        Ok(stream) => stream.into_results().await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!("Failed to drop staging table {}: {}", staging, e);
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
