//! Catalog introspection for SQL Server.
//!
//! All catalog SQL lives here. Each query result is mapped into the typed
//! records of [`crate::core::schema`] right where it is read.

use std::sync::Arc;

use async_trait::async_trait;
use tiberius::Row;
use tracing::{debug, warn};

use super::dialect::{is_orderable, text_expr};
use super::pool::{MssqlClient, MssqlPool};
use crate::core::identifier::{qualify_mssql, quote_mssql};
use crate::core::schema::{
    ColumnDefinition, ColumnStatistics, ForeignKeyReference, IndexDefinition, PartitionDetail,
    PartitionInfo, RangeDirection, StatisticsMethod,
};
use crate::core::traits::SchemaIntrospector;
use crate::error::{ArchiveError, Result};
use crate::stats::{collect_statistics, StatisticsPolicy, StatisticsProbe};

const COLUMNS_SQL: &str = r#"
    SELECT
        c.name,
        ty.name,
        CAST(CASE
            WHEN c.max_length = -1 THEN -1
            WHEN ty.name IN ('nchar', 'nvarchar') THEN c.max_length / 2
            WHEN ty.name IN ('char', 'varchar', 'binary', 'varbinary') THEN c.max_length
            ELSE 0 END AS INT),
        CAST(c.precision AS INT),
        CAST(c.scale AS INT),
        CAST(c.is_nullable AS INT),
        CAST(c.is_identity AS INT),
        CAST(ISNULL(ic.seed_value, 0) AS BIGINT),
        CAST(ISNULL(ic.increment_value, 0) AS BIGINT),
        CAST(pk.key_ordinal AS INT),
        dc.definition,
        CAST(c.column_id AS INT)
    FROM sys.columns c
    JOIN sys.types ty ON ty.user_type_id = c.system_type_id
    LEFT JOIN sys.identity_columns ic
        ON ic.object_id = c.object_id AND ic.column_id = c.column_id
    LEFT JOIN sys.default_constraints dc ON dc.object_id = c.default_object_id
    LEFT JOIN (
        SELECT ixc.column_id, ixc.key_ordinal
        FROM sys.indexes ix
        JOIN sys.index_columns ixc
            ON ixc.object_id = ix.object_id AND ixc.index_id = ix.index_id
        WHERE ix.object_id = OBJECT_ID(@P1) AND ix.is_primary_key = 1
    ) pk ON pk.column_id = c.column_id
    WHERE c.object_id = OBJECT_ID(@P1) AND c.is_computed = 0
    ORDER BY c.column_id
"#;

const PARTITION_INFO_SQL: &str = r#"
    SELECT
        pf.name,
        ps.name,
        c.name,
        TYPE_NAME(c.system_type_id),
        CAST(pf.boundary_value_on_right AS INT),
        COUNT(p.partition_number)
    FROM sys.indexes i
    JOIN sys.partition_schemes ps ON ps.data_space_id = i.data_space_id
    JOIN sys.partition_functions pf ON pf.function_id = ps.function_id
    JOIN sys.index_columns ic
        ON ic.object_id = i.object_id AND ic.index_id = i.index_id AND ic.partition_ordinal = 1
    JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
    JOIN sys.partitions p ON p.object_id = i.object_id AND p.index_id = i.index_id
    WHERE i.object_id = OBJECT_ID(@P1) AND i.index_id IN (0, 1)
    GROUP BY pf.name, ps.name, c.name, c.system_type_id, pf.boundary_value_on_right
"#;

/// Boundary of partition n: RANGE LEFT uses boundary n (upper edge), RANGE
/// RIGHT uses boundary n-1 (lower edge).
const PARTITION_BOUNDARY_SELECT: &str = r#"
    CAST(p.partition_number AS INT),
    CASE
        WHEN prv.value IS NULL THEN NULL
        WHEN CAST(SQL_VARIANT_PROPERTY(prv.value, 'BaseType') AS sysname)
             IN ('date', 'datetime', 'datetime2', 'smalldatetime', 'datetimeoffset')
            THEN CONVERT(nvarchar(4000), CAST(prv.value AS datetime2), 126)
        ELSE CAST(prv.value AS nvarchar(4000))
    END,
    CAST(p.rows AS BIGINT)"#;

const PARTITION_DETAIL_FROM: &str = r#"
    FROM sys.partitions p
    JOIN sys.indexes i ON i.object_id = p.object_id AND i.index_id = p.index_id
    JOIN sys.partition_schemes sch ON sch.data_space_id = i.data_space_id
    JOIN sys.partition_functions pf ON pf.function_id = sch.function_id
    JOIN sys.destination_data_spaces dds
        ON dds.partition_scheme_id = sch.data_space_id AND dds.destination_id = p.partition_number
    JOIN sys.filegroups fg ON fg.data_space_id = dds.data_space_id
    LEFT JOIN sys.partition_range_values prv
        ON prv.function_id = pf.function_id
        AND prv.boundary_id = p.partition_number - CAST(pf.boundary_value_on_right AS INT)"#;

const INDEXES_SQL: &str = r#"
    SELECT
        i.name,
        CAST(CASE WHEN i.type = 1 THEN 1 ELSE 0 END AS INT),
        CAST(i.is_unique AS INT),
        CAST(i.is_primary_key AS INT),
        STUFF((
            SELECT ',' + c2.name
            FROM sys.index_columns ic2
            JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
            WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 0
            ORDER BY ic2.key_ordinal
            FOR XML PATH('')
        ), 1, 1, ''),
        ISNULL(STUFF((
            SELECT ',' + c2.name
            FROM sys.index_columns ic2
            JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
            WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 1
            ORDER BY ic2.index_column_id
            FOR XML PATH('')
        ), 1, 1, ''), ''),
        CAST(CASE WHEN ds.type = 'PS' THEN 1 ELSE 0 END AS INT)
    FROM sys.indexes i
    JOIN sys.data_spaces ds ON ds.data_space_id = i.data_space_id
    WHERE i.object_id = OBJECT_ID(@P1) AND i.type > 0 AND i.is_hypothetical = 0
    ORDER BY i.index_id
"#;

const REFERENCING_FKS_SQL: &str = r#"
    SELECT fk.name, OBJECT_SCHEMA_NAME(fk.parent_object_id), OBJECT_NAME(fk.parent_object_id)
    FROM sys.foreign_keys fk
    WHERE fk.referenced_object_id = OBJECT_ID(@P1)
      AND fk.parent_object_id <> fk.referenced_object_id
    ORDER BY fk.name
"#;

const ROW_ESTIMATE_SQL: &str = r#"
    SELECT CAST(ISNULL(SUM(p.rows), 0) AS BIGINT)
    FROM sys.partitions p
    WHERE p.object_id = OBJECT_ID(@P1) AND p.index_id IN (0, 1)
"#;

/// Introspector bound to one pooled connection.
#[derive(Clone)]
pub struct MssqlIntrospector {
    pool: Arc<MssqlPool>,
    policy: StatisticsPolicy,
}

impl MssqlIntrospector {
    pub fn new(pool: Arc<MssqlPool>, policy: StatisticsPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<MssqlPool> {
        &self.pool
    }

    async fn scalar_i32(&self, sql: &str, object: &str) -> Result<i32> {
        let mut conn = self.pool.get().await?;
        let row = conn.query(sql, &[&object]).await?.into_row().await?;
        match row {
            Some(row) => Ok(row.try_get::<i32, _>(0)?.unwrap_or(0)),
            None => Ok(0),
        }
    }
}

/// The partition detail query, with or without space usage.
#[async_trait]
pub(crate) trait PartitionDetailQuery: Send + Sync {
    async fn partition_details(
        &self,
        object: &str,
        with_space: bool,
    ) -> Result<Vec<PartitionDetail>>;
}

/// Space usage needs `VIEW DATABASE STATE`; when that read fails the
/// details are fetched again with every size reported as 0.
pub(crate) async fn details_with_fallback(
    query: &dyn PartitionDetailQuery,
    object: &str,
) -> Result<Vec<PartitionDetail>> {
    match query.partition_details(object, true).await {
        Ok(details) => Ok(details),
        Err(e) => {
            warn!(
                "Partition space usage unavailable for {} ({}); reporting sizes as 0",
                object, e
            );
            query.partition_details(object, false).await
        }
    }
}

#[async_trait]
impl PartitionDetailQuery for MssqlIntrospector {
    async fn partition_details(
        &self,
        object: &str,
        with_space: bool,
    ) -> Result<Vec<PartitionDetail>> {
        let sql = if with_space {
            format!(
                "SELECT {}, CAST(ISNULL(st.used_page_count, 0) * 8 AS BIGINT), fg.name {}
                 LEFT JOIN sys.dm_db_partition_stats st ON st.partition_id = p.partition_id
                 WHERE p.object_id = OBJECT_ID(@P1) AND p.index_id IN (0, 1)
                 ORDER BY p.partition_number",
                PARTITION_BOUNDARY_SELECT, PARTITION_DETAIL_FROM
            )
        } else {
            format!(
                "SELECT {}, CAST(0 AS BIGINT), fg.name {}
                 WHERE p.object_id = OBJECT_ID(@P1) AND p.index_id IN (0, 1)
                 ORDER BY p.partition_number",
                PARTITION_BOUNDARY_SELECT, PARTITION_DETAIL_FROM
            )
        };

        let mut conn = self.pool.get().await?;
        let rows = conn.query(sql, &[&object]).await?.into_first_result().await?;
        rows.iter().map(map_partition_detail).collect()
    }
}

/// Fetch column definitions over an existing connection.
pub(crate) async fn load_columns(
    conn: &mut MssqlClient,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnDefinition>> {
    let object = qualify_mssql(schema, table)?;
    let rows = conn
        .query(COLUMNS_SQL, &[&object])
        .await?
        .into_first_result()
        .await?;
    let columns = rows.iter().map(map_column).collect::<Result<Vec<_>>>()?;
    debug!("Loaded {} columns for {}", columns.len(), object);
    Ok(columns)
}

fn map_column(row: &Row) -> Result<ColumnDefinition> {
    Ok(ColumnDefinition {
        name: row.try_get::<&str, _>(0)?.unwrap_or_default().to_string(),
        data_type: row.try_get::<&str, _>(1)?.unwrap_or_default().to_string(),
        max_length: row.try_get::<i32, _>(2)?.unwrap_or(0),
        precision: row.try_get::<i32, _>(3)?.unwrap_or(0),
        scale: row.try_get::<i32, _>(4)?.unwrap_or(0),
        is_nullable: row.try_get::<i32, _>(5)?.unwrap_or(0) == 1,
        is_identity: row.try_get::<i32, _>(6)?.unwrap_or(0) == 1,
        identity_seed: row.try_get::<i64, _>(7)?.unwrap_or(0),
        identity_increment: row.try_get::<i64, _>(8)?.unwrap_or(0),
        primary_key_ordinal: row.try_get::<i32, _>(9)?,
        default_definition: row.try_get::<&str, _>(10)?.map(str::to_string),
        ordinal: row.try_get::<i32, _>(11)?.unwrap_or(0),
    })
}

fn map_partition_detail(row: &Row) -> Result<PartitionDetail> {
    Ok(PartitionDetail {
        partition_number: row.try_get::<i32, _>(0)?.unwrap_or(0),
        boundary_value: row.try_get::<&str, _>(1)?.map(str::to_string),
        row_count: row.try_get::<i64, _>(2)?.unwrap_or(0),
        size_kb: row.try_get::<i64, _>(3)?.unwrap_or(0),
        filegroup: row.try_get::<&str, _>(4)?.unwrap_or_default().to_string(),
    })
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl SchemaIntrospector for MssqlIntrospector {
    async fn is_partitioned(&self, schema: &str, table: &str) -> Result<bool> {
        let object = qualify_mssql(schema, table)?;
        let sql = r#"
            SELECT CAST(CASE WHEN EXISTS (
                SELECT 1
                FROM sys.indexes i
                JOIN sys.partition_schemes ps ON ps.data_space_id = i.data_space_id
                WHERE i.object_id = OBJECT_ID(@P1) AND i.index_id IN (0, 1)
            ) THEN 1 ELSE 0 END AS INT)
        "#;
        Ok(self.scalar_i32(sql, &object).await? == 1)
    }

    async fn get_partition_info(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<PartitionInfo>> {
        let object = qualify_mssql(schema, table)?;
        let mut conn = self.pool.get().await?;
        let row = conn
            .query(PARTITION_INFO_SQL, &[&object])
            .await?
            .into_row()
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let info = PartitionInfo {
            function_name: row.try_get::<&str, _>(0)?.unwrap_or_default().to_string(),
            scheme_name: row.try_get::<&str, _>(1)?.unwrap_or_default().to_string(),
            column_name: row.try_get::<&str, _>(2)?.unwrap_or_default().to_string(),
            column_type: row.try_get::<&str, _>(3)?.unwrap_or_default().to_string(),
            direction: RangeDirection::from_boundary_on_right(
                row.try_get::<i32, _>(4)?.unwrap_or(0) == 1,
            ),
            partition_count: row.try_get::<i32, _>(5)?.unwrap_or(0),
        };
        debug!(
            "{} is partitioned by {}({}) on {}, {} partitions",
            object, info.function_name, info.column_name, info.scheme_name, info.partition_count
        );
        Ok(Some(info))
    }

    async fn get_partition_details(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<PartitionDetail>> {
        let object = qualify_mssql(schema, table)?;
        details_with_fallback(self, &object).await
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDefinition>> {
        let mut conn = self.pool.get().await?;
        load_columns(&mut conn, schema, table).await
    }

    async fn get_indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDefinition>> {
        let object = qualify_mssql(schema, table)?;
        let mut conn = self.pool.get().await?;
        let rows = conn
            .query(INDEXES_SQL, &[&object])
            .await?
            .into_first_result()
            .await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in &rows {
            indexes.push(IndexDefinition {
                name: row.try_get::<&str, _>(0)?.unwrap_or_default().to_string(),
                is_clustered: row.try_get::<i32, _>(1)?.unwrap_or(0) == 1,
                is_unique: row.try_get::<i32, _>(2)?.unwrap_or(0) == 1,
                is_primary_key: row.try_get::<i32, _>(3)?.unwrap_or(0) == 1,
                key_columns: split_list(row.try_get::<&str, _>(4)?),
                included_columns: split_list(row.try_get::<&str, _>(5)?),
                is_partitioned: row.try_get::<i32, _>(6)?.unwrap_or(0) == 1,
            });
        }
        debug!("Loaded {} indexes for {}", indexes.len(), object);
        Ok(indexes)
    }

    async fn get_referencing_foreign_keys(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ForeignKeyReference>> {
        let object = qualify_mssql(schema, table)?;
        let mut conn = self.pool.get().await?;
        let rows = conn
            .query(REFERENCING_FKS_SQL, &[&object])
            .await?
            .into_first_result()
            .await?;

        rows.iter()
            .map(|row| -> Result<ForeignKeyReference> {
                Ok(ForeignKeyReference {
                    name: row.try_get::<&str, _>(0)?.unwrap_or_default().to_string(),
                    referencing_schema: row.try_get::<&str, _>(1)?.unwrap_or_default().to_string(),
                    referencing_table: row.try_get::<&str, _>(2)?.unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    async fn estimated_row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let object = qualify_mssql(schema, table)?;
        let mut conn = self.pool.get().await?;
        let row = conn
            .query(ROW_ESTIMATE_SQL, &[&object])
            .await?
            .into_row()
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<i64, _>(0)?.unwrap_or(0),
            None => 0,
        })
    }

    async fn has_rows(&self, schema: &str, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT CAST(CASE WHEN EXISTS (SELECT TOP (1) 1 FROM {}) THEN 1 ELSE 0 END AS INT)",
            qualify_mssql(schema, table)?
        );
        let mut conn = self.pool.get().await?;
        let row = conn.simple_query(sql).await?.into_row().await?;
        Ok(match row {
            Some(row) => row.try_get::<i32, _>(0)?.unwrap_or(0) == 1,
            None => false,
        })
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let object = qualify_mssql(schema, table)?;
        let sql = "SELECT CAST(CASE WHEN OBJECT_ID(@P1, 'U') IS NULL THEN 0 ELSE 1 END AS INT)";
        Ok(self.scalar_i32(sql, &object).await? == 1)
    }

    async fn get_column_statistics(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<ColumnStatistics> {
        let columns = self.get_columns(schema, table).await?;
        let col = columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| {
                ArchiveError::Schema(format!("column {} not found on {}.{}", column, schema, table))
            })?;

        let estimated_rows = self.estimated_row_count(schema, table).await?;
        if !is_orderable(&col.data_type) {
            warn!(
                "Column {} has type {}; min/max statistics are not available",
                col.name, col.data_type
            );
            return Ok(ColumnStatistics::unavailable(estimated_rows));
        }

        let probe = MssqlStatisticsProbe {
            pool: Arc::clone(&self.pool),
            table: qualify_mssql(schema, table)?,
            column: quote_mssql(&col.name)?,
            data_type: col.data_type.clone(),
        };
        Ok(collect_statistics(&probe, estimated_rows, &self.policy).await)
    }
}

/// Statistics queries for one column, each on its own dedicated connection.
struct MssqlStatisticsProbe {
    pool: Arc<MssqlPool>,
    table: String,
    column: String,
    data_type: String,
}

impl MssqlStatisticsProbe {
    async fn single_row(&self, sql: String) -> Result<Row> {
        let mut conn = self.pool.dedicated().await?;
        debug!("Statistics query: {}", sql);
        let row = conn.simple_query(sql).await?.into_row().await?;
        row.ok_or_else(|| ArchiveError::Schema("statistics query returned no row".into()))
    }
}

#[async_trait]
impl StatisticsProbe for MssqlStatisticsProbe {
    async fn exact(&self) -> Result<ColumnStatistics> {
        let sql = format!(
            "SELECT {}, {}, COUNT_BIG(*), COUNT_BIG(DISTINCT {}) FROM {}",
            text_expr(&format!("MIN({})", self.column), &self.data_type),
            text_expr(&format!("MAX({})", self.column), &self.data_type),
            self.column,
            self.table
        );
        let row = self.single_row(sql).await?;
        Ok(ColumnStatistics {
            min: row.try_get::<&str, _>(0)?.map(str::to_string),
            max: row.try_get::<&str, _>(1)?.map(str::to_string),
            total_rows: row.try_get::<i64, _>(2)?.unwrap_or(0),
            distinct_rows: row.try_get::<i64, _>(3)?,
            method: StatisticsMethod::Exact,
            is_approximate: false,
        })
    }

    async fn index_probe(&self, estimated_rows: i64) -> Result<ColumnStatistics> {
        let value = text_expr(&self.column, &self.data_type);
        let sql = format!(
            "SELECT
                (SELECT TOP (1) {v} FROM {t} WHERE {c} IS NOT NULL ORDER BY {c} ASC),
                (SELECT TOP (1) {v} FROM {t} WHERE {c} IS NOT NULL ORDER BY {c} DESC)",
            v = value,
            t = self.table,
            c = self.column
        );
        let row = self.single_row(sql).await?;
        Ok(ColumnStatistics {
            min: row.try_get::<&str, _>(0)?.map(str::to_string),
            max: row.try_get::<&str, _>(1)?.map(str::to_string),
            total_rows: estimated_rows,
            distinct_rows: None,
            method: StatisticsMethod::IndexProbe,
            is_approximate: true,
        })
    }

    async fn sample(&self, percent: f64, estimated_rows: i64) -> Result<ColumnStatistics> {
        let sql = format!(
            "SELECT {}, {} FROM {} TABLESAMPLE ({} PERCENT)",
            text_expr(&format!("MIN({})", self.column), &self.data_type),
            text_expr(&format!("MAX({})", self.column), &self.data_type),
            self.table,
            percent
        );
        let row = self.single_row(sql).await?;
        Ok(ColumnStatistics {
            min: row.try_get::<&str, _>(0)?.map(str::to_string),
            max: row.try_get::<&str, _>(1)?.map(str::to_string),
            total_rows: estimated_rows,
            distinct_rows: None,
            method: StatisticsMethod::Sampled,
            is_approximate: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers the detail query, optionally refusing the space usage join.
    struct FakeDetails {
        deny_space: bool,
        fail_all: bool,
        calls: Mutex<Vec<bool>>,
    }

    impl FakeDetails {
        fn new(deny_space: bool, fail_all: bool) -> Self {
            Self {
                deny_space,
                fail_all,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PartitionDetailQuery for FakeDetails {
        async fn partition_details(
            &self,
            _object: &str,
            with_space: bool,
        ) -> Result<Vec<PartitionDetail>> {
            self.calls.lock().unwrap().push(with_space);
            if self.fail_all || (with_space && self.deny_space) {
                return Err(ArchiveError::Schema(
                    "VIEW DATABASE STATE permission denied".into(),
                ));
            }
            Ok(vec![PartitionDetail {
                partition_number: 1,
                boundary_value: Some("2024-01-01".into()),
                row_count: 1200,
                size_kb: if with_space { 640 } else { 0 },
                filegroup: "PRIMARY".into(),
            }])
        }
    }

    #[tokio::test]
    async fn test_partition_details_with_space_usage() {
        let query = FakeDetails::new(false, false);
        let details = details_with_fallback(&query, "[dbo].[Orders]").await.unwrap();
        assert_eq!(details[0].size_kb, 640);
        assert_eq!(*query.calls.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_partition_details_degrade_without_permission() {
        let query = FakeDetails::new(true, false);
        let details = details_with_fallback(&query, "[dbo].[Orders]").await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].size_kb, 0);
        assert_eq!(details[0].row_count, 1200);
        assert_eq!(*query.calls.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_partition_details_error_when_both_fail() {
        let query = FakeDetails::new(true, true);
        assert!(details_with_fallback(&query, "[dbo].[Orders]").await.is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(Some("A,B")), vec!["A", "B"]);
        assert!(split_list(Some("")).is_empty());
        assert!(split_list(None).is_empty());
    }

    #[test]
    fn test_partition_queries_share_boundary_mapping() {
        assert!(PARTITION_DETAIL_FROM.contains("boundary_value_on_right"));
        assert!(PARTITION_INFO_SQL.contains("GROUP BY"));
        assert!(COLUMNS_SQL.contains("is_computed = 0"));
    }
}
