//! Target table creation mirroring a source table's structure.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::introspector::load_columns;
use super::pool::MssqlPool;
use crate::core::identifier::{escape_literal, qualify_mssql, quote_mssql};
use crate::core::schema::{primary_key_columns, ColumnDefinition};
use crate::error::Result;

use super::dialect::{column_list, column_sql};

/// Result of [`StructureReplicator::create_target_table`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplicationOutcome {
    Created { script: String, column_count: usize },
    Failed { reason: String },
}

impl ReplicationOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, ReplicationOutcome::Created { .. })
    }
}

/// Creates target tables from source metadata.
pub struct StructureReplicator {
    source: Arc<MssqlPool>,
    target: Arc<MssqlPool>,
    filegroup: Option<String>,
}

impl StructureReplicator {
    pub fn new(source: Arc<MssqlPool>, target: Arc<MssqlPool>) -> Self {
        Self {
            source,
            target,
            filegroup: None,
        }
    }

    /// Place created tables on `filegroup` (a switch target must share the
    /// filegroup of the partition it receives).
    pub fn with_filegroup(mut self, filegroup: impl Into<String>) -> Self {
        self.filegroup = Some(filegroup.into());
        self
    }

    pub async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let object = qualify_mssql(schema, table)?;
        let mut conn = self.target.get().await?;
        let row = conn
            .query(
                "SELECT CAST(CASE WHEN OBJECT_ID(@P1, 'U') IS NULL THEN 0 ELSE 1 END AS INT)",
                &[&object],
            )
            .await?
            .into_row()
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<i32, _>(0)?.unwrap_or(0) == 1,
            None => false,
        })
    }

    pub async fn create_target_table(
        &self,
        source_schema: &str,
        source_table: &str,
        target_schema: &str,
        target_table: &str,
    ) -> Result<ReplicationOutcome> {
        let columns = {
            let mut conn = self.source.get().await?;
            load_columns(&mut conn, source_schema, source_table).await?
        };
        if columns.is_empty() {
            return Ok(ReplicationOutcome::Failed {
                reason: format!(
                    "source table {}.{} not found or has no columns",
                    source_schema, source_table
                ),
            });
        }

        if self.table_exists(target_schema, target_table).await? {
            return Ok(ReplicationOutcome::Failed {
                reason: format!(
                    "target table {}.{} already exists",
                    target_schema, target_table
                ),
            });
        }

        let schema_sql = ensure_schema_sql(target_schema)?;
        let table_sql = build_create_table_script(
            target_schema,
            target_table,
            &columns,
            self.filegroup.as_deref(),
        )?;

        let mut conn = self.target.get().await?;
        if let Some(sql) = &schema_sql {
            conn.execute(sql.as_str(), &[]).await?;
        }
        if let Err(e) = conn.execute(table_sql.as_str(), &[]).await {
            warn!(
                "Creating {}.{} failed: {}",
                target_schema, target_table, e
            );
            return Ok(ReplicationOutcome::Failed {
                reason: e.to_string(),
            });
        }

        info!(
            "Created {}.{} on '{}' from {}.{} ({} columns)",
            target_schema,
            target_table,
            self.target.name(),
            source_schema,
            source_table,
            columns.len()
        );

        let script = match schema_sql {
            Some(schema_sql) => format!("{};\n{}", schema_sql, table_sql),
            None => table_sql,
        };
        Ok(ReplicationOutcome::Created {
            script,
            column_count: columns.len(),
        })
    }
}

/// Idempotent schema creation, `None` for the default schema.
pub fn ensure_schema_sql(schema: &str) -> Result<Option<String>> {
    if schema.eq_ignore_ascii_case("dbo") {
        return Ok(None);
    }
    let quoted = quote_mssql(schema)?;
    Ok(Some(format!(
        "IF SCHEMA_ID(N'{}') IS NULL EXEC(N'CREATE SCHEMA {}')",
        escape_literal(schema),
        escape_literal(&quoted)
    )))
}

/// `CREATE TABLE` mirroring `columns`, with a clustered primary key on the
/// source key columns.
pub fn build_create_table_script(
    schema: &str,
    table: &str,
    columns: &[ColumnDefinition],
    filegroup: Option<&str>,
) -> Result<String> {
    let mut defs = columns
        .iter()
        .map(|c| column_sql(c, true))
        .collect::<Result<Vec<_>>>()?;

    let pk = primary_key_columns(columns);
    if !pk.is_empty() {
        defs.push(format!(
            "CONSTRAINT {} PRIMARY KEY CLUSTERED ({})",
            quote_mssql(&format!("PK_{}", table))?,
            column_list(&pk)?
        ));
    }

    let mut sql = format!(
        "CREATE TABLE {} (\n    {}\n)",
        qualify_mssql(schema, table)?,
        defs.join(",\n    ")
    );
    if let Some(fg) = filegroup {
        sql.push_str(&format!(" ON {}", quote_mssql(fg)?));
    }
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<ColumnDefinition> {
        let mut id = ColumnDefinition::new("OrderId", "bigint");
        id.is_nullable = false;
        id.is_identity = true;
        id.identity_seed = 1;
        id.identity_increment = 1;
        id.primary_key_ordinal = Some(1);

        let mut created = ColumnDefinition::new("CreatedAt", "datetime2");
        created.is_nullable = false;
        created.scale = 7;
        created.primary_key_ordinal = Some(2);

        let mut note = ColumnDefinition::new("Note", "nvarchar");
        note.max_length = -1;

        let mut total = ColumnDefinition::new("Total", "decimal");
        total.precision = 19;
        total.scale = 4;
        total.default_definition = Some("((0))".into());

        vec![id, created, note, total]
    }

    #[test]
    fn test_create_table_script() {
        let sql = build_create_table_script("archive", "Orders", &columns(), None).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE [archive].[Orders] (\n    \
             [OrderId] bigint IDENTITY(1, 1) NOT NULL,\n    \
             [CreatedAt] datetime2(7) NOT NULL,\n    \
             [Note] nvarchar(max) NULL,\n    \
             [Total] decimal(19, 4) NULL DEFAULT ((0)),\n    \
             CONSTRAINT [PK_Orders] PRIMARY KEY CLUSTERED ([OrderId], [CreatedAt])\n)"
        );
    }

    #[test]
    fn test_create_table_on_filegroup_without_pk() {
        let cols = vec![ColumnDefinition::new("Payload", "varbinary")];
        let sql = build_create_table_script("dbo", "Blob", &cols, Some("FG_2024")).unwrap();
        assert!(!sql.contains("PRIMARY KEY"));
        assert!(sql.ends_with(") ON [FG_2024]"));
    }

    #[test]
    fn test_ensure_schema_sql() {
        assert!(ensure_schema_sql("dbo").unwrap().is_none());
        assert_eq!(
            ensure_schema_sql("archive").unwrap().unwrap(),
            "IF SCHEMA_ID(N'archive') IS NULL EXEC(N'CREATE SCHEMA [archive]')"
        );
    }

    /// Read a column line of a generated script back into catalog terms.
    fn reparse(line: &str) -> ColumnDefinition {
        let line = line.trim().trim_end_matches(',');
        let (name, rest) = line.trim_start_matches('[').split_once("] ").unwrap();
        let space = rest.find(' ').unwrap_or(rest.len());
        let type_end = match rest.find('(') {
            Some(open) if open < space => open + rest[open..].find(')').unwrap() + 1,
            _ => space,
        };
        let declared = &rest[..type_end];
        let (data_type, args) = match declared.split_once('(') {
            Some((ty, args)) => (ty, args.trim_end_matches(')')),
            None => (declared, ""),
        };
        let args: Vec<&str> = args.split(',').map(str::trim).filter(|a| !a.is_empty()).collect();

        let mut col = ColumnDefinition::new(name, data_type);
        col.is_nullable = !rest[type_end..].contains("NOT NULL");
        match data_type {
            "decimal" | "numeric" => {
                col.precision = args[0].parse().unwrap();
                col.scale = args[1].parse().unwrap();
            }
            "float" => col.precision = args.first().map(|p| p.parse().unwrap()).unwrap_or(53),
            "datetime2" | "time" | "datetimeoffset" => col.scale = args[0].parse().unwrap(),
            "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => {
                col.max_length = if args[0] == "max" { -1 } else { args[0].parse().unwrap() };
            }
            _ => {}
        }
        col
    }

    fn typed(name: &str, ty: &str, len: i32, precision: i32, scale: i32, nullable: bool) -> ColumnDefinition {
        let mut col = ColumnDefinition::new(name, ty);
        col.max_length = len;
        col.precision = precision;
        col.scale = scale;
        col.is_nullable = nullable;
        col
    }

    #[test]
    fn test_script_reparses_to_source_types() {
        let source = vec![
            typed("A", "bigint", 0, 0, 0, false),
            typed("B", "int", 0, 0, 0, true),
            typed("C", "smallint", 0, 0, 0, true),
            typed("D", "tinyint", 0, 0, 0, true),
            typed("E", "bit", 0, 0, 0, false),
            typed("F", "decimal", 0, 18, 4, true),
            typed("G", "numeric", 0, 5, 0, false),
            typed("H", "money", 0, 0, 0, true),
            typed("I", "float", 0, 53, 0, true),
            typed("J", "float", 0, 24, 0, true),
            typed("K", "real", 0, 0, 0, true),
            typed("L", "date", 0, 0, 0, true),
            typed("M", "datetime", 0, 0, 0, false),
            typed("N", "smalldatetime", 0, 0, 0, true),
            typed("O", "datetime2", 0, 0, 3, false),
            typed("P", "datetime2", 0, 0, 0, true),
            typed("Q", "time", 0, 0, 7, true),
            typed("R", "datetimeoffset", 0, 0, 2, true),
            typed("S", "char", 10, 0, 0, true),
            typed("T", "varchar", -1, 0, 0, true),
            typed("U", "nchar", 2, 0, 0, false),
            typed("V", "nvarchar", 200, 0, 0, true),
            typed("W", "binary", 16, 0, 0, true),
            typed("X", "varbinary", -1, 0, 0, true),
            typed("Y", "uniqueidentifier", 0, 0, 0, false),
            typed("Z", "xml", 0, 0, 0, true),
        ];

        let sql = build_create_table_script("archive", "AllTypes", &source, None).unwrap();
        let lines: Vec<&str> = sql.lines().skip(1).filter(|l| l.trim_start().starts_with('[')).collect();
        assert_eq!(lines.len(), source.len());

        for (original, line) in source.iter().zip(lines) {
            let back = reparse(line);
            assert_eq!(
                (
                    &back.name,
                    &back.data_type,
                    back.max_length,
                    back.precision,
                    back.scale,
                    back.is_nullable
                ),
                (
                    &original.name,
                    &original.data_type,
                    original.max_length,
                    original.precision,
                    original.scale,
                    original.is_nullable
                ),
                "column line: {}",
                line
            );
        }
    }
}
