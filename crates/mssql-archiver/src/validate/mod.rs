//! Pre-flight safety validation.
//!
//! [`SafetyValidator`] holds no state of its own. [`SafetyValidator::gather`]
//! collects [`SafetyFacts`] from the source and target introspectors, and
//! the `validate*` functions turn those facts into a [`Verdict`]. Keeping
//! the two halves apart lets every rule be checked without a database.

use serde::Serialize;
use tracing::debug;

use crate::core::job::{ArchiveMethod, JobDefinition};
use crate::core::schema::{
    primary_key_columns, ColumnDefinition, ForeignKeyReference, IndexDefinition, PartitionInfo,
};
use crate::core::traits::SchemaIntrospector;
use crate::error::{ArchiveError, Result};

/// Machine-readable reason a move must not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueCode {
    TargetTableNotEmpty,
    ColumnTypeMismatch,
    MissingTargetTable,
    IndexNotAligned,
    ExternalForeignKeyReference,
    MissingPrimaryKey,
    SourceNotPartitioned,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::TargetTableNotEmpty => "TargetTableNotEmpty",
            IssueCode::ColumnTypeMismatch => "ColumnTypeMismatch",
            IssueCode::MissingTargetTable => "MissingTargetTable",
            IssueCode::IndexNotAligned => "IndexNotAligned",
            IssueCode::ExternalForeignKeyReference => "ExternalForeignKeyReference",
            IssueCode::MissingPrimaryKey => "MissingPrimaryKey",
            IssueCode::SourceNotPartitioned => "SourceNotPartitioned",
        }
    }
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub code: IssueCode,
    pub message: String,
}

/// Pass/fail decision with itemized reasons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub can_proceed: bool,
    pub blocking_issues: Vec<Issue>,
    pub warnings: Vec<String>,
}

impl Verdict {
    fn from_parts(blocking_issues: Vec<Issue>, warnings: Vec<String>) -> Self {
        Self {
            can_proceed: blocking_issues.is_empty(),
            blocking_issues,
            warnings,
        }
    }

    pub fn has_code(&self, code: IssueCode) -> bool {
        self.blocking_issues.iter().any(|i| i.code == code)
    }

    /// Comma-separated blocking codes.
    pub fn codes(&self) -> String {
        self.blocking_issues
            .iter()
            .map(|i| i.code.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// One line per blocking issue: `Code: message`.
    pub fn describe(&self) -> String {
        self.blocking_issues
            .iter()
            .map(|i| format!("{}: {}", i.code, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `Err(Blocked)` when any blocking issue is present.
    pub fn into_result(self) -> Result<Self> {
        if self.can_proceed {
            Ok(self)
        } else {
            Err(ArchiveError::Blocked {
                codes: self.codes(),
                message: self.describe(),
            })
        }
    }
}

/// Everything the rules look at, gathered up front.
#[derive(Debug, Clone, Default)]
pub struct SafetyFacts {
    pub source_columns: Vec<ColumnDefinition>,
    pub source_indexes: Vec<IndexDefinition>,
    pub source_partition: Option<PartitionInfo>,
    pub referencing_foreign_keys: Vec<ForeignKeyReference>,
    pub target_exists: bool,
    pub target_columns: Vec<ColumnDefinition>,
    pub target_has_rows: bool,
    pub delete_after_copy: bool,
}

pub struct SafetyValidator;

impl SafetyValidator {
    /// Collect the facts needed for `job` from both sides.
    pub async fn gather(
        source: &dyn SchemaIntrospector,
        target: &dyn SchemaIntrospector,
        job: &JobDefinition,
    ) -> Result<SafetyFacts> {
        let (ss, st) = (&job.source_schema, &job.source_table);
        let (ts, tt) = (&job.target_schema, &job.target_table);

        let source_columns = source.get_columns(ss, st).await?;
        if source_columns.is_empty() {
            return Err(ArchiveError::Schema(format!(
                "source table {} not found or has no columns",
                job.source_full_name()
            )));
        }

        let source_indexes = source.get_indexes(ss, st).await?;
        let source_partition = if job.method == ArchiveMethod::PartitionSwitch {
            source.get_partition_info(ss, st).await?
        } else {
            None
        };
        let referencing_foreign_keys = source.get_referencing_foreign_keys(ss, st).await?;

        let target_exists = target.table_exists(ts, tt).await?;
        let (target_columns, target_has_rows) = if target_exists {
            (target.get_columns(ts, tt).await?, target.has_rows(ts, tt).await?)
        } else {
            (Vec::new(), false)
        };

        debug!(
            "Safety facts for {}: {} source columns, {} indexes, target_exists={}, target_has_rows={}",
            job.name,
            source_columns.len(),
            source_indexes.len(),
            target_exists,
            target_has_rows
        );

        Ok(SafetyFacts {
            source_columns,
            source_indexes,
            source_partition,
            referencing_foreign_keys,
            target_exists,
            target_columns,
            target_has_rows,
            delete_after_copy: job.delete_after_copy,
        })
    }

    /// Verdict for the job's method.
    pub fn check(method: ArchiveMethod, facts: &SafetyFacts) -> Verdict {
        match method {
            ArchiveMethod::PartitionSwitch => Self::validate(facts),
            ArchiveMethod::FileBulkLoad | ArchiveMethod::StreamingBulkCopy => {
                Self::validate_append(facts)
            }
        }
    }

    /// Partition switch verdict. A non-empty target always blocks.
    pub fn validate(facts: &SafetyFacts) -> Verdict {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !facts.target_exists {
            issues.push(Issue {
                code: IssueCode::MissingTargetTable,
                message: "target table does not exist".into(),
            });
        } else {
            if facts.target_has_rows {
                issues.push(Issue {
                    code: IssueCode::TargetTableNotEmpty,
                    message: "target table must be empty for a partition switch".into(),
                });
            }
            if let Some(message) = strict_mismatch(&facts.source_columns, &facts.target_columns) {
                issues.push(Issue {
                    code: IssueCode::ColumnTypeMismatch,
                    message,
                });
            }
        }

        match &facts.source_partition {
            None => issues.push(Issue {
                code: IssueCode::SourceNotPartitioned,
                message: "source table is not partitioned".into(),
            }),
            Some(partition) => {
                for index in facts.source_indexes.iter().filter(|i| !i.is_partitioned) {
                    if index.contains_column(&partition.column_name) {
                        warnings.push(format!(
                            "index {} is not aligned with {} but can be rebuilt on it",
                            index.name, partition.scheme_name
                        ));
                    } else {
                        issues.push(Issue {
                            code: IssueCode::IndexNotAligned,
                            message: format!(
                                "index {} lacks partition column {} and cannot be aligned",
                                index.name, partition.column_name
                            ),
                        });
                    }
                }
            }
        }

        for fk in &facts.referencing_foreign_keys {
            issues.push(Issue {
                code: IssueCode::ExternalForeignKeyReference,
                message: format!(
                    "foreign key {} on {} references the source table",
                    fk.name,
                    fk.referencing_full_name()
                ),
            });
        }

        Verdict::from_parts(issues, warnings)
    }

    /// Verdict for the copy strategies, which append into an existing target.
    pub fn validate_append(facts: &SafetyFacts) -> Verdict {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !facts.target_exists {
            issues.push(Issue {
                code: IssueCode::MissingTargetTable,
                message: "target table does not exist".into(),
            });
        } else {
            for message in append_mismatches(&facts.source_columns, &facts.target_columns) {
                issues.push(Issue {
                    code: IssueCode::ColumnTypeMismatch,
                    message,
                });
            }
        }

        // batches are selected, re-checked on the target and deleted by key
        if primary_key_columns(&facts.source_columns).is_empty() {
            issues.push(Issue {
                code: IssueCode::MissingPrimaryKey,
                message: "copy strategies track rows by primary key; the source table has none"
                    .into(),
            });
        }
        if facts.delete_after_copy {
            for fk in &facts.referencing_foreign_keys {
                issues.push(Issue {
                    code: IssueCode::ExternalForeignKeyReference,
                    message: format!(
                        "foreign key {} on {} references rows that would be deleted",
                        fk.name,
                        fk.referencing_full_name()
                    ),
                });
            }
        } else if !facts.referencing_foreign_keys.is_empty() {
            warnings.push(format!(
                "{} foreign key(s) reference the source table; rows are copied, not deleted",
                facts.referencing_foreign_keys.len()
            ));
        }

        Verdict::from_parts(issues, warnings)
    }
}

/// Column lists that must match exactly by ordinal (partition switch).
fn strict_mismatch(source: &[ColumnDefinition], target: &[ColumnDefinition]) -> Option<String> {
    if source.len() != target.len() {
        return Some(format!(
            "source has {} columns, target has {}",
            source.len(),
            target.len()
        ));
    }
    for (s, t) in source.iter().zip(target) {
        let same = s.name.eq_ignore_ascii_case(&t.name)
            && s.data_type.eq_ignore_ascii_case(&t.data_type)
            && s.max_length == t.max_length
            && s.precision == t.precision
            && s.scale == t.scale
            && s.is_nullable == t.is_nullable;
        if !same {
            return Some(format!(
                "column {} ({}) differs from target column {} ({})",
                s.name,
                describe_type(s),
                t.name,
                describe_type(t)
            ));
        }
    }
    None
}

/// Every source column must land in a target column that can hold it.
fn append_mismatches(source: &[ColumnDefinition], target: &[ColumnDefinition]) -> Vec<String> {
    let mut problems = Vec::new();

    for s in source {
        match target.iter().find(|t| t.name.eq_ignore_ascii_case(&s.name)) {
            None => problems.push(format!("target has no column {}", s.name)),
            Some(t) => {
                if !can_hold(s, t) {
                    problems.push(format!(
                        "column {}: target type {} cannot hold source type {}",
                        s.name,
                        describe_type(t),
                        describe_type(s)
                    ));
                } else if s.is_nullable && !t.is_nullable {
                    problems.push(format!(
                        "column {} is nullable in the source but NOT NULL in the target",
                        s.name
                    ));
                }
            }
        }
    }

    for t in target {
        let mapped = source.iter().any(|s| s.name.eq_ignore_ascii_case(&t.name));
        if !mapped && !t.is_nullable && !t.is_identity && t.default_definition.is_none() {
            problems.push(format!(
                "target column {} is NOT NULL without a default and has no source column",
                t.name
            ));
        }
    }

    problems
}

fn describe_type(c: &ColumnDefinition) -> String {
    format!(
        "{} len={} prec={} scale={}{}",
        c.data_type,
        c.max_length,
        c.precision,
        c.scale,
        if c.is_nullable { " null" } else { " not null" }
    )
}

fn integer_rank(t: &str) -> Option<u8> {
    match t {
        "bit" => Some(0),
        "tinyint" => Some(1),
        "smallint" => Some(2),
        "int" => Some(3),
        "bigint" => Some(4),
        _ => None,
    }
}

/// A `max` length (-1) holds anything; otherwise the target must be at least as long.
fn length_fits(source: i32, target: i32) -> bool {
    target == -1 || (source != -1 && target >= source)
}

/// Same type family and not narrower.
fn can_hold(source: &ColumnDefinition, target: &ColumnDefinition) -> bool {
    let s = source.data_type.to_lowercase();
    let t = target.data_type.to_lowercase();

    if let (Some(sr), Some(tr)) = (integer_rank(&s), integer_rank(&t)) {
        return tr >= sr;
    }

    match (s.as_str(), t.as_str()) {
        ("char" | "varchar", "char" | "varchar" | "nchar" | "nvarchar")
        | ("nchar" | "nvarchar", "nchar" | "nvarchar")
        | ("binary" | "varbinary", "binary" | "varbinary") => {
            if t.starts_with("var") || t.starts_with("nvar") {
                length_fits(source.max_length, target.max_length)
            } else {
                // fixed-length targets pad, so lengths must agree
                source.max_length == target.max_length && !s.starts_with("var") && !s.starts_with("nvar")
            }
        }
        ("decimal" | "numeric", "decimal" | "numeric") => {
            target.scale >= source.scale
                && (target.precision - target.scale) >= (source.precision - source.scale)
        }
        ("datetime2", "datetime2")
        | ("time", "time")
        | ("datetimeoffset", "datetimeoffset") => target.scale >= source.scale,
        ("datetime" | "smalldatetime", "datetime2") => true,
        ("smalldatetime", "datetime") => true,
        ("real", "float") => true,
        ("float", "float") => target.precision == 0 || target.precision >= source.precision,
        ("smallmoney", "money") => true,
        _ => s == t,
    }
}
