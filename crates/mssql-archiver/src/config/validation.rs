//! Configuration validation.

use std::collections::HashSet;

use super::{Config, StoreBackend};
use crate::core::identifier::validate_identifier;
use crate::error::{ArchiveError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.connections.is_empty() {
        return Err(ArchiveError::Config(
            "at least one connection is required".into(),
        ));
    }

    for (name, conn) in &config.connections {
        if conn.host.is_empty() {
            return Err(ArchiveError::Config(format!(
                "connections.{}.host is required",
                name
            )));
        }
        if conn.database.is_empty() {
            return Err(ArchiveError::Config(format!(
                "connections.{}.database is required",
                name
            )));
        }
        if conn.user.is_empty() {
            return Err(ArchiveError::Config(format!(
                "connections.{}.user is required",
                name
            )));
        }
        if conn.max_connections == 0 {
            return Err(ArchiveError::Config(format!(
                "connections.{}.max_connections must be at least 1",
                name
            )));
        }
    }

    match config.store.backend {
        StoreBackend::Mssql => {
            let conn = config.store.connection.as_deref().ok_or_else(|| {
                ArchiveError::Config("store.connection is required for the mssql backend".into())
            })?;
            if !config.connections.contains_key(conn) {
                return Err(ArchiveError::Config(format!(
                    "store.connection '{}' is not a configured connection",
                    conn
                )));
            }
            validate_identifier(&config.store.schema)
                .map_err(|e| ArchiveError::Config(format!("store.schema: {}", e)))?;
        }
        StoreBackend::File => {
            if config.store.path.as_os_str().is_empty() {
                return Err(ArchiveError::Config(
                    "store.path is required for the file backend".into(),
                ));
            }
        }
        StoreBackend::Memory => {}
    }

    config.statistics.validate()?;

    if config.bulk_file.bcp_path.trim().is_empty() {
        return Err(ArchiveError::Config("bulk_file.bcp_path must not be empty".into()));
    }

    let mut names = HashSet::new();
    for job in &config.jobs {
        job.validate()?;
        if !names.insert(job.name.to_lowercase()) {
            return Err(ArchiveError::Config(format!(
                "duplicate job name '{}'",
                job.name
            )));
        }
        for conn in [job.source_connection.as_str(), job.target_connection()] {
            if !config.connections.contains_key(conn) {
                return Err(ArchiveError::Config(format!(
                    "job '{}': connection '{}' is not configured",
                    job.name, conn
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
connections:
  live:
    host: sql01
    database: Sales
    user: archiver
    password: hunter2
  archive:
    host: sql02
    database: SalesArchive
    user: archiver
    password: hunter2
jobs:
  - name: orders
    source_connection: live
    target_connection: archive
    source_table: Orders
    target_table: Orders
    filter_column: CreatedAt
    filter_predicate: "< now - 90d"
    method: streaming_bulk_copy
    delete_after_copy: true
    batch_size: 1000
    max_rows_per_execution: 10000
    interval_minutes: 15
"#;

    fn valid_config() -> Config {
        serde_yaml::from_str(VALID).unwrap()
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
        assert_eq!(config.connections["live"].port, 1433);
        assert!(config.connections["live"].encrypt);
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.statistics.exact_row_limit, 1_000_000);
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_config();
        config.connections.get_mut("live").unwrap().host = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_job_connection() {
        let mut config = valid_config();
        config.jobs[0].target_connection = Some("nowhere".into());
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_duplicate_job_names() {
        let mut config = valid_config();
        let mut copy = config.jobs[0].clone();
        copy.name = "ORDERS".into();
        config.jobs.push(copy);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_mssql_store_requires_connection() {
        let mut config = valid_config();
        config.store.backend = StoreBackend::Mssql;
        assert!(validate(&config).is_err());
        config.store.connection = Some("archive".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_job_rejected() {
        let mut config = valid_config();
        config.jobs[0].batch_size = 50_000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_connection_debug_redacts_password() {
        let config = valid_config();
        let debug_output = format!("{:?}", config.connections["live"]);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }
}
