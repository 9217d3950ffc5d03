//! T-SQL fragments derived from catalog metadata.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::{ColumnData, FromSql};

use crate::core::identifier::{escape_literal, quote_mssql};
use crate::core::schema::ColumnDefinition;
use crate::error::{ArchiveError, Result};

/// Declared type of a column, reproduced exactly.
///
/// `max_length` is in characters for text types and bytes for binary types,
/// `-1` meaning `max`.
pub fn format_column_type(col: &ColumnDefinition) -> String {
    let data_type = col.data_type.as_str();
    let lower = data_type.to_lowercase();
    match lower.as_str() {
        "decimal" | "numeric" => {
            if col.precision > 0 {
                format!("{}({}, {})", data_type, col.precision, col.scale)
            } else {
                format!("{}(18, 0)", data_type)
            }
        }
        "float" => {
            if col.precision > 0 && col.precision != 53 {
                format!("float({})", col.precision)
            } else {
                "float".to_string()
            }
        }
        "datetime2" | "time" | "datetimeoffset" => {
            // 7 is the engine default and is written out so round-trips compare equal
            format!("{}({})", data_type, col.scale)
        }
        "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => {
            if col.max_length == -1 {
                format!("{}(max)", data_type)
            } else if col.max_length > 0 {
                format!("{}({})", data_type, col.max_length)
            } else {
                format!("{}(1)", data_type)
            }
        }
        _ => data_type.to_string(),
    }
}

/// One column of a `CREATE TABLE` list.
///
/// `with_identity` is false for staging tables, which receive explicit values.
pub fn column_sql(col: &ColumnDefinition, with_identity: bool) -> Result<String> {
    let mut sql = format!("{} {}", quote_mssql(&col.name)?, format_column_type(col));
    if with_identity && col.is_identity {
        sql.push_str(&format!(
            " IDENTITY({}, {})",
            col.identity_seed, col.identity_increment
        ));
    }
    sql.push_str(if col.is_nullable { " NULL" } else { " NOT NULL" });
    if with_identity {
        if let Some(default) = &col.default_definition {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
    }
    Ok(sql)
}

/// Quoted, comma-separated column list.
pub fn column_list(columns: &[&ColumnDefinition]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_mssql(&c.name))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

/// Engine-maintained row versions; they cannot be inserted explicitly.
pub fn is_row_version(col: &ColumnDefinition) -> bool {
    matches!(
        col.data_type.to_lowercase().as_str(),
        "timestamp" | "rowversion"
    )
}

/// A value read from `col` as a T-SQL literal of the column's own type.
///
/// Used to resume a selection after a known row, including inside `bcp`
/// query text where parameters are unavailable.
pub fn sql_literal(col: &ColumnDefinition, value: &ColumnData<'static>) -> Result<String> {
    let ty = format_column_type(col);
    let unsupported = || {
        ArchiveError::Schema(format!(
            "column {} ({}) cannot be used to resume a selection",
            col.name, ty
        ))
    };
    let null = || ArchiveError::Schema(format!("column {} is NULL in a resume position", col.name));

    let literal = match value {
        ColumnData::U8(v) => v.as_ref().ok_or_else(null)?.to_string(),
        ColumnData::I16(v) => v.as_ref().ok_or_else(null)?.to_string(),
        ColumnData::I32(v) => v.as_ref().ok_or_else(null)?.to_string(),
        ColumnData::I64(v) => v.as_ref().ok_or_else(null)?.to_string(),
        ColumnData::F32(v) => format!("CAST({:e} AS {})", v.as_ref().ok_or_else(null)?, ty),
        ColumnData::F64(v) => format!("CAST({:e} AS {})", v.as_ref().ok_or_else(null)?, ty),
        ColumnData::Bit(v) => if *v.as_ref().ok_or_else(null)? { "1" } else { "0" }.to_string(),
        ColumnData::Numeric(v) => format!("CAST({} AS {})", v.as_ref().ok_or_else(null)?, ty),
        ColumnData::Guid(v) => {
            format!("CAST('{}' AS uniqueidentifier)", v.as_ref().ok_or_else(null)?)
        }
        ColumnData::String(v) => {
            let text = v.as_deref().ok_or_else(null)?;
            format!("CAST(N'{}' AS {})", escape_literal(text), ty)
        }
        ColumnData::Binary(v) => {
            let bytes = v.as_deref().ok_or_else(null)?;
            let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
            format!("CAST(0x{} AS {})", hex, ty)
        }
        ColumnData::Date(_) => {
            let date = NaiveDate::from_sql(value)?.ok_or_else(null)?;
            format!("CAST('{}' AS date)", date.format("%Y-%m-%d"))
        }
        ColumnData::Time(_) => {
            let time = NaiveTime::from_sql(value)?.ok_or_else(null)?;
            format!("CAST('{}' AS {})", time.format("%H:%M:%S%.7f"), ty)
        }
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            let at = NaiveDateTime::from_sql(value)?.ok_or_else(null)?;
            // datetime2 text first: legacy types reject seven fractional digits
            format!(
                "CAST(CAST('{}' AS datetime2(7)) AS {})",
                at.format("%Y-%m-%dT%H:%M:%S%.7f"),
                ty
            )
        }
        ColumnData::DateTimeOffset(_) => {
            let at = DateTime::<FixedOffset>::from_sql(value)?.ok_or_else(null)?;
            format!("CAST('{}' AS {})", at.format("%Y-%m-%dT%H:%M:%S%.7f%:z"), ty)
        }
        _ => return Err(unsupported()),
    };
    Ok(literal)
}

/// Render a value expression as text for display (min/max, boundaries).
pub fn text_expr(expr: &str, data_type: &str) -> String {
    match data_type.to_lowercase().as_str() {
        "date" | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" | "time" => {
            format!("CONVERT(nvarchar(4000), {}, 126)", expr)
        }
        "binary" | "varbinary" | "timestamp" | "rowversion" => {
            format!("CONVERT(nvarchar(4000), {}, 1)", expr)
        }
        _ => format!("CAST({} AS nvarchar(4000))", expr),
    }
}

/// Types the engine cannot compare with MIN/MAX.
pub fn is_orderable(data_type: &str) -> bool {
    !matches!(
        data_type.to_lowercase().as_str(),
        "text" | "ntext" | "image" | "xml" | "geography" | "geometry" | "hierarchyid" | "sql_variant" | "bit"
    )
}
