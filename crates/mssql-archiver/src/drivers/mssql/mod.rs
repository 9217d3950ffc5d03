//! Microsoft SQL Server driver.
//!
//! - [`MssqlPool`] / [`ConnectionRegistry`]: bb8 pools of Tiberius clients
//! - [`MssqlIntrospector`]: catalog queries behind [`SchemaIntrospector`](crate::core::SchemaIntrospector)
//! - [`StructureReplicator`]: target table creation
//! - [`MssqlArchiveExecutor`]: the three move strategies

mod bulk_file;
mod dialect;
mod executor;
mod introspector;
mod partition_switch;
mod plan;
mod pool;
mod replicator;
mod streaming;

pub use bulk_file::{parse_rows_copied, BcpCommand};
pub use dialect::format_column_type;
pub use executor::MssqlArchiveExecutor;
pub use introspector::MssqlIntrospector;
pub use pool::{ConnectionRegistry, MssqlPool, TiberiusConnectionManager};
pub use replicator::{build_create_table_script, ReplicationOutcome, StructureReplicator};
