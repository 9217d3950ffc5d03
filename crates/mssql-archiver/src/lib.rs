//! # mssql-archiver
//!
//! Unattended archival of aging rows between SQL Server tables.
//!
//! Each [`ArchivalJob`] names a source table, a target table, a filter
//! predicate that selects "old" rows and a move strategy:
//!
//! - **Partition switch**: metadata-only hand-off of one whole partition
//! - **File bulk load**: `bcp queryout` to a file, then `bcp in`
//! - **Streaming bulk copy**: TDS bulk insert straight from the source
//!   result set, optionally deleting copied rows from the source
//!
//! The [`JobRunner`] executes one scheduled firing of a job: bounded,
//! strictly sequential batches, persisted status, auto-disable after
//! repeated failures.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mssql_archiver::{
//!     store::open_store, Config, ConnectionRegistry, JobRunner, MssqlArchiveExecutor,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_archiver::Result<()> {
//!     let config = Config::load("archiver.yaml")?;
//!     let registry = Arc::new(ConnectionRegistry::new(config.connections.clone()));
//!     let store = open_store(&config, &registry).await?;
//!     let executor = Arc::new(MssqlArchiveExecutor::new(
//!         registry,
//!         config.statistics.clone(),
//!         config.bulk_file.clone(),
//!     ));
//!     let runner = JobRunner::new(store, executor);
//!     for summary in runner.run_due(chrono::Utc::now(), &CancellationToken::new()).await? {
//!         println!("{}: {} rows", summary.job_name, summary.rows_moved);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod runner;
pub mod stats;
pub mod store;
pub mod validate;

// Re-exports for convenient access
pub use crate::config::{BulkFileConfig, Config, ConnectionConfig, StoreBackend, StoreConfig};
pub use crate::core::{
    ArchivalJob, ArchiveExecutor, ArchiveMethod, BatchResult, ExecutionSummary, JobDefinition,
    JobRepository, JobStatus, SchemaIntrospector, Trigger,
};
pub use crate::drivers::mssql::{
    ConnectionRegistry, MssqlArchiveExecutor, MssqlIntrospector, MssqlPool, StructureReplicator,
};
pub use crate::error::{ArchiveError, Result};
pub use crate::runner::JobRunner;
pub use crate::stats::StatisticsPolicy;
pub use crate::validate::{IssueCode, SafetyValidator, Verdict};
