//! Job repositories.
//!
//! - **Memory**: [`MemoryJobStore`], process-local, for tests and embedding
//! - **File**: [`FileJobStore`], one JSON document rewritten atomically
//! - **MSSQL**: [`MssqlJobStore`], a table in a control schema
//!
//! The runner only sees `Arc<dyn JobRepository>`; [`open_store`] picks the
//! implementation from configuration.

mod file;
mod memory;
mod mssql_db;

use std::sync::Arc;

pub use file::FileJobStore;
pub use memory::MemoryJobStore;
pub use mssql_db::MssqlJobStore;

use crate::config::{Config, StoreBackend};
use crate::core::job::ArchivalJob;
use crate::core::traits::JobRepository;
use crate::drivers::mssql::ConnectionRegistry;
use crate::error::{ArchiveError, Result};

/// Build and initialize the configured job repository.
pub async fn open_store(
    config: &Config,
    registry: &ConnectionRegistry,
) -> Result<Arc<dyn JobRepository>> {
    let store: Arc<dyn JobRepository> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryJobStore::new()),
        StoreBackend::File => Arc::new(FileJobStore::new(&config.store.path)),
        StoreBackend::Mssql => {
            let name = config.store.connection.as_deref().ok_or_else(|| {
                ArchiveError::Config("store.connection is required for the mssql backend".into())
            })?;
            let pool = registry.pool(name).await?;
            Arc::new(MssqlJobStore::new(pool, config.store.schema.clone()))
        }
    };
    store.init().await?;
    Ok(store)
}

/// Reject a second job with the same name (case-insensitive).
pub(crate) fn ensure_unique_name<'a>(
    existing: impl IntoIterator<Item = &'a ArchivalJob>,
    candidate: &ArchivalJob,
) -> Result<()> {
    let clash = existing.into_iter().any(|j| {
        j.id() != candidate.id() && j.name().eq_ignore_ascii_case(candidate.name())
    });
    if clash {
        Err(ArchiveError::DuplicateJob(candidate.name().to_string()))
    } else {
        Ok(())
    }
}
