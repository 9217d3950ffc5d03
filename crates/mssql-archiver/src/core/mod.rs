//! Domain types and the traits the engine is written against.

pub mod batch;
pub mod identifier;
pub mod job;
pub mod schedule;
pub mod schema;
pub mod traits;

pub use batch::{AuditLog, BatchResult, ExecutionSummary};
pub use identifier::{
    escape_literal, filter_condition, qualify_mssql, quote_mssql, render_predicate,
    validate_identifier, validate_predicate,
};
pub use job::{
    ArchivalJob, ArchiveMethod, ExecutionOptions, ExecutionOutcome, JobDefinition, JobRuntime,
    JobStatus,
};
pub use schedule::{interval_to_cron, parse_cron, Trigger};
pub use schema::{
    primary_key_columns, ColumnDefinition, ColumnStatistics, ForeignKeyReference,
    IndexDefinition, PartitionDetail, PartitionInfo, RangeDirection, StatisticsMethod,
};
pub use traits::{ArchiveExecutor, JobRepository, SchemaIntrospector};
