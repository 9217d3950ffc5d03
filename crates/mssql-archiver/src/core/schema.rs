//! Strongly typed catalog metadata.
//!
//! Every catalog query result is mapped into one of these records at the
//! query boundary; nothing above the driver layer sees raw rows.

use serde::{Deserialize, Serialize};

/// Column metadata for a source or target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,

    /// Engine data type (e.g. "int", "nvarchar", "datetime2").
    pub data_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Maximum length in characters for text types, bytes for binary types,
    /// -1 for `max`, 0 when not applicable.
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric or fractional-seconds scale.
    pub scale: i32,

    /// Whether the column is an identity column.
    pub is_identity: bool,

    /// Identity seed (meaningful only when `is_identity`).
    pub identity_seed: i64,

    /// Identity increment (meaningful only when `is_identity`).
    pub identity_increment: i64,

    /// Position within the primary key (1-based), `None` when not a key column.
    pub primary_key_ordinal: Option<i32>,

    /// Default constraint definition, e.g. `(getdate())`.
    pub default_definition: Option<String>,

    /// Ordinal position (1-based).
    pub ordinal: i32,
}

impl ColumnDefinition {
    /// True if the column participates in the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }

    /// A minimal nullable column, used where only name and type matter.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            max_length: 0,
            precision: 0,
            scale: 0,
            is_identity: false,
            identity_seed: 0,
            identity_increment: 0,
            primary_key_ordinal: None,
            default_definition: None,
            ordinal: 0,
        }
    }
}

/// Primary key columns in key order.
pub fn primary_key_columns(columns: &[ColumnDefinition]) -> Vec<&ColumnDefinition> {
    let mut pk: Vec<&ColumnDefinition> = columns.iter().filter(|c| c.is_primary_key()).collect();
    pk.sort_by_key(|c| c.primary_key_ordinal);
    pk
}

/// Which side of a boundary value belongs to the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeDirection {
    /// `RANGE LEFT`: the boundary is the upper (inclusive) edge of its partition.
    Left,
    /// `RANGE RIGHT`: the boundary is the lower (inclusive) edge of its partition.
    Right,
}

impl RangeDirection {
    pub fn from_boundary_on_right(on_right: bool) -> Self {
        if on_right {
            RangeDirection::Right
        } else {
            RangeDirection::Left
        }
    }
}

/// Partitioning summary for a table whose primary index sits on a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub function_name: String,
    pub scheme_name: String,
    pub column_name: String,
    pub column_type: String,
    pub direction: RangeDirection,
    pub partition_count: i32,
}

/// One partition of a partitioned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDetail {
    /// Partition number (1-based).
    pub partition_number: i32,

    /// Boundary value owning this partition, rendered as text. `None` for the
    /// open-ended partition.
    pub boundary_value: Option<String>,

    /// Row count from catalog statistics.
    pub row_count: i64,

    /// Used space in KB; 0 when space usage could not be read.
    pub size_kb: i64,

    /// Filegroup the partition lives on.
    pub filegroup: String,
}

/// Index metadata used for partition-alignment checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub is_clustered: bool,
    pub is_unique: bool,
    pub is_primary_key: bool,
    pub key_columns: Vec<String>,
    pub included_columns: Vec<String>,
    /// True when the index is stored on a partition scheme.
    pub is_partitioned: bool,
}

impl IndexDefinition {
    /// Whether the column is part of the index key or include list.
    pub fn contains_column(&self, column: &str) -> bool {
        self.key_columns
            .iter()
            .chain(self.included_columns.iter())
            .any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// A foreign key in another table that references the inspected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyReference {
    pub name: String,
    pub referencing_schema: String,
    pub referencing_table: String,
}

impl ForeignKeyReference {
    pub fn referencing_full_name(&self) -> String {
        format!("{}.{}", self.referencing_schema, self.referencing_table)
    }
}

/// How a [`ColumnStatistics`] value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsMethod {
    /// Full aggregate over the table.
    Exact,
    /// TOP 1 ascending/descending probe along an index.
    IndexProbe,
    /// TABLESAMPLE estimate.
    Sampled,
    /// Every permitted tier failed or timed out.
    Unavailable,
}

/// Min/max/count summary for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub min: Option<String>,
    pub max: Option<String>,
    pub total_rows: i64,
    pub distinct_rows: Option<i64>,
    pub method: StatisticsMethod,
    pub is_approximate: bool,
}

impl ColumnStatistics {
    /// Result reported when no tier could produce figures in time.
    pub fn unavailable(estimated_rows: i64) -> Self {
        Self {
            min: None,
            max: None,
            total_rows: estimated_rows,
            distinct_rows: None,
            method: StatisticsMethod::Unavailable,
            is_approximate: true,
        }
    }

    pub fn is_available(&self) -> bool {
        self.method != StatisticsMethod::Unavailable
    }
}
