//! Statement builders shared by the two copy strategies.
//!
//! A batch is a fixed selection: `TOP (limit)` qualifying rows in filter
//! column then key order. The selection is staged on the target, inserted
//! where its key is not already present, and (optionally) deleted from the
//! source by key. Re-running a batch whose outcome is unknown therefore
//! neither duplicates target rows nor deletes rows that were never copied.
//!
//! Without deletion the source keeps its rows, so each batch resumes after
//! the target's high-water mark: the greatest `(filter column, key)` already
//! archived. Batches page forward within an invocation and later invocations
//! continue where the last one stopped.

use tiberius::{ColumnData, Row, TokenRow};

use super::dialect::{column_list, column_sql, is_row_version, sql_literal};
use super::pool::MssqlClient;
use crate::core::identifier::{filter_condition, qualify_mssql, quote_mssql};
use crate::core::job::JobDefinition;
use crate::core::schema::{primary_key_columns, ColumnDefinition};
use crate::error::{ArchiveError, Result};
use crate::validate::IssueCode;

/// Session temp table receiving a batch on the target.
pub const INCOMING_TABLE: &str = "#archive_incoming";

/// Session temp table holding the keys to delete on the source.
pub const KEYS_TABLE: &str = "#archive_keys";

/// Everything needed to build a copy batch's statements.
#[derive(Debug, Clone)]
pub struct CopyPlan {
    pub source: String,
    pub target: String,
    /// Copied source columns in ordinal order; row versions are left out.
    pub columns: Vec<ColumnDefinition>,
    /// Indexes into `columns` of the primary key, in key order.
    pub key_indexes: Vec<usize>,
    /// Indexes into `columns` of the batch order: filter column, then key.
    pub order_indexes: Vec<usize>,
    /// Whether the target has an identity column among the copied columns.
    pub target_identity: bool,
    pub filter: String,
    pub order_by: String,
}

impl CopyPlan {
    pub fn new(
        job: &JobDefinition,
        mut columns: Vec<ColumnDefinition>,
        target_columns: &[ColumnDefinition],
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(ArchiveError::Schema(format!(
                "source table {} not found or has no columns",
                job.source_full_name()
            )));
        }
        columns.retain(|c| !is_row_version(c));

        let key_indexes: Vec<usize> = primary_key_columns(&columns)
            .iter()
            .filter_map(|pk| columns.iter().position(|c| c.name == pk.name))
            .collect();
        if key_indexes.is_empty() {
            return Err(ArchiveError::Blocked {
                codes: IssueCode::MissingPrimaryKey.to_string(),
                message: format!("{} has no primary key", job.source_full_name()),
            });
        }

        let filter_index = columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(&job.filter_column))
            .ok_or_else(|| {
                ArchiveError::Schema(format!(
                    "filter column {} is not a copyable column of {}",
                    job.filter_column,
                    job.source_full_name()
                ))
            })?;
        let mut order_indexes = vec![filter_index];
        order_indexes.extend(key_indexes.iter().copied().filter(|&i| i != filter_index));

        let target_identity = target_columns.iter().any(|t| {
            t.is_identity && columns.iter().any(|c| c.name.eq_ignore_ascii_case(&t.name))
        });

        let order_by = order_indexes
            .iter()
            .map(|&i| quote_mssql(&columns[i].name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        Ok(Self {
            source: qualify_mssql(&job.source_schema, &job.source_table)?,
            target: qualify_mssql(&job.target_schema, &job.target_table)?,
            filter: filter_condition(&job.filter_column, &job.filter_predicate)?,
            order_by,
            columns,
            key_indexes,
            order_indexes,
            target_identity,
        })
    }

    fn column_refs(&self) -> Vec<&ColumnDefinition> {
        self.columns.iter().collect()
    }

    fn key_columns(&self) -> Vec<&ColumnDefinition> {
        self.key_indexes.iter().map(|&i| &self.columns[i]).collect()
    }

    fn order_columns(&self) -> Vec<&ColumnDefinition> {
        self.order_indexes.iter().map(|&i| &self.columns[i]).collect()
    }

    /// The batch selection, optionally resuming after a known position.
    pub fn select_sql(&self, limit: i64, after: Option<&[String]>) -> Result<String> {
        let mut condition = self.filter.clone();
        if let Some(position) = after {
            condition = format!("({}) AND {}", condition, self.after_sql(position)?);
        }
        Ok(format!(
            "SELECT TOP ({}) {} FROM {} WHERE {} ORDER BY {}",
            limit,
            column_list(&self.column_refs())?,
            self.source,
            condition,
            self.order_by
        ))
    }

    /// The last archived position on the target, in batch order.
    pub fn high_water_sql(&self) -> Result<String> {
        let order = self.order_columns();
        let descending = order
            .iter()
            .map(|c| Ok(format!("{} DESC", quote_mssql(&c.name)?)))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        Ok(format!(
            "SELECT TOP (1) {} FROM {} WHERE {} IS NOT NULL ORDER BY {}",
            column_list(&order)?,
            self.target,
            quote_mssql(&order[0].name)?,
            descending
        ))
    }

    /// Row-value comparison `(c1, c2, ..) > (v1, v2, ..)` spelled out.
    pub fn after_sql(&self, position: &[String]) -> Result<String> {
        let order = self.order_columns();
        if position.len() != order.len() {
            return Err(ArchiveError::Schema(format!(
                "resume position has {} values for {} order columns",
                position.len(),
                order.len()
            )));
        }
        let mut pairs = Vec::with_capacity(order.len());
        for (col, value) in order.iter().zip(position) {
            pairs.push((quote_mssql(&col.name)?, value));
        }

        let mut pairs = pairs.into_iter().rev();
        let Some((last, value)) = pairs.next() else {
            return Err(ArchiveError::Schema("batch order has no columns".into()));
        };
        let mut expr = format!("{} > {}", last, value);
        for (col, value) in pairs {
            expr = format!("{c} > {v} OR ({c} = {v} AND ({e}))", c = col, v = value, e = expr);
        }
        Ok(format!("({})", expr))
    }

    /// A high-water row as literals, in batch order.
    pub fn position_of(&self, row: Row) -> Result<Vec<String>> {
        self.order_columns()
            .into_iter()
            .zip(row.into_iter())
            .map(|(col, value)| sql_literal(col, &value))
            .collect()
    }

    /// `CREATE TABLE` for a staging table with the copied columns and no identity.
    pub fn create_staging_sql(&self, table: &str) -> Result<String> {
        let defs = self
            .columns
            .iter()
            .map(|c| column_sql(c, false))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "{}; CREATE TABLE {} ({})",
            drop_if_exists_sql(table),
            table,
            defs.join(", ")
        ))
    }

    /// Insert staged rows whose key is not yet in the target.
    pub fn insert_missing_sql(&self, staging: &str) -> Result<String> {
        let cols = column_list(&self.column_refs())?;
        let source_cols = self
            .columns
            .iter()
            .map(|c| Ok(format!("s.{}", quote_mssql(&c.name)?)))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let insert = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} s WHERE NOT EXISTS (SELECT 1 FROM {} t WHERE {})",
            self.target,
            cols,
            source_cols,
            staging,
            self.target,
            self.key_join("t", "s")?
        );

        if self.target_identity {
            Ok(format!(
                "SET IDENTITY_INSERT {t} ON; {i}; SET IDENTITY_INSERT {t} OFF;",
                t = self.target,
                i = insert
            ))
        } else {
            Ok(insert)
        }
    }

    /// `CREATE TABLE` for the key table on the source.
    pub fn create_keys_sql(&self) -> Result<String> {
        let mut defs = Vec::new();
        for c in self.key_columns() {
            let mut key = c.clone();
            key.is_nullable = false;
            defs.push(column_sql(&key, false)?);
        }
        Ok(format!(
            "{}; CREATE TABLE {} ({}, PRIMARY KEY ({}))",
            drop_if_exists_sql(KEYS_TABLE),
            KEYS_TABLE,
            defs.join(", "),
            column_list(&self.key_columns())?
        ))
    }

    /// Delete the staged keys from the source, still subject to the filter.
    pub fn delete_keyed_sql(&self) -> Result<String> {
        Ok(format!(
            "DELETE FROM {src} WHERE EXISTS (SELECT 1 FROM {keys} k WHERE {join}) AND {filter}",
            src = self.source,
            keys = KEYS_TABLE,
            join = self.key_join("k", &self.source)?,
            filter = self.filter
        ))
    }

    /// `SELECT` of the key columns from a staging table.
    pub fn select_keys_sql(&self, staging: &str) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM {}",
            column_list(&self.key_columns())?,
            staging
        ))
    }

    fn key_join(&self, left: &str, right: &str) -> Result<String> {
        Ok(self
            .key_columns()
            .iter()
            .map(|c| {
                let q = quote_mssql(&c.name)?;
                Ok(format!("{l}.{q} = {r}.{q}", l = left, r = right, q = q))
            })
            .collect::<Result<Vec<_>>>()?
            .join(" AND "))
    }

    /// Split a selected row into its bulk insert row and its key cells.
    pub fn split_row(&self, row: Row) -> (TokenRow<'static>, Vec<ColumnData<'static>>) {
        let cells: Vec<ColumnData<'static>> = row.into_iter().collect();
        let key = self.key_indexes.iter().map(|&i| cells[i].clone()).collect();
        let mut token_row = TokenRow::new();
        for cell in cells {
            token_row.push(cell);
        }
        (token_row, key)
    }
}

pub fn drop_if_exists_sql(table: &str) -> String {
    if let Some(temp) = table.strip_prefix('#') {
        format!(
            "IF OBJECT_ID(N'tempdb..#{}') IS NOT NULL DROP TABLE #{}",
            temp, temp
        )
    } else {
        format!("IF OBJECT_ID(N'{}', 'U') IS NOT NULL DROP TABLE {}", table.replace('\'', "''"), table)
    }
}

/// Resume position for a batch that leaves source rows in place.
pub async fn resume_position(conn: &mut MssqlClient, plan: &CopyPlan) -> Result<Option<Vec<String>>> {
    let row = conn
        .simple_query(plan.high_water_sql()?)
        .await?
        .into_row()
        .await?;
    row.map(|row| plan.position_of(row)).transpose()
}

/// Run a statement and total its affected-row counts.
pub async fn execute_counted(conn: &mut MssqlClient, sql: &str) -> Result<u64> {
    let result = conn.execute(sql, &[]).await?;
    Ok(result.rows_affected().iter().sum())
}

/// Bulk insert key rows into [`KEYS_TABLE`] and delete those keys from the source.
pub async fn delete_keys(
    conn: &mut MssqlClient,
    plan: &CopyPlan,
    keys: Vec<Vec<ColumnData<'static>>>,
) -> Result<u64> {
    conn.simple_query(plan.create_keys_sql()?)
        .await?
        .into_results()
        .await?;

    let mut bulk = conn.bulk_insert(KEYS_TABLE).await?;
    for key in keys {
        let mut token_row = TokenRow::new();
        for cell in key {
            token_row.push(cell);
        }
        bulk.send(token_row).await?;
    }
    bulk.finalize().await?;

    let deleted = execute_counted(conn, &plan.delete_keyed_sql()?).await?;
    conn.simple_query(drop_if_exists_sql(KEYS_TABLE))
        .await?
        .into_results()
        .await?;
    Ok(deleted)
}
