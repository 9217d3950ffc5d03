//! Configuration type definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::job::JobDefinition;
use crate::stats::StatisticsPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named SQL Server connections referenced by jobs and the store.
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Where job definitions and runtime state are persisted.
    #[serde(default)]
    pub store: StoreConfig,

    /// Adaptive column-statistics thresholds and timeouts.
    #[serde(default)]
    pub statistics: StatisticsPolicy,

    /// External bulk-copy tool settings (file_bulk_load jobs).
    #[serde(default)]
    pub bulk_file: BulkFileConfig,

    /// Job definitions imported by `jobs import`.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl Config {
    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }
}

/// SQL Server connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Require TLS (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust the server certificate without validation (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Pool size (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl ConnectionConfig {
    /// `host:port/database`, for logs.
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Server argument for the bcp tool.
    pub fn bcp_server(&self) -> String {
        format!("tcp:{},{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Job store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// JSON file (default).
    #[default]
    File,
    /// Table in a control schema on a configured connection.
    Mssql,
    /// Process memory only; state is lost on exit.
    Memory,
}

/// Job store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// JSON file path for the file backend.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Connection name for the mssql backend.
    #[serde(default)]
    pub connection: Option<String>,

    /// Control schema for the mssql backend.
    #[serde(default = "default_store_schema")]
    pub schema: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            connection: None,
            schema: default_store_schema(),
        }
    }
}

/// bcp tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFileConfig {
    /// Executable name or path (default: "bcp").
    #[serde(default = "default_bcp_path")]
    pub bcp_path: String,

    /// Directory for intermediate export files (default: system temp dir).
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Extra arguments appended to every bcp invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BulkFileConfig {
    fn default() -> Self {
        Self {
            bcp_path: default_bcp_path(),
            work_dir: None,
            extra_args: Vec::new(),
        }
    }
}

impl BulkFileConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    4
}

fn default_store_path() -> PathBuf {
    PathBuf::from("archiver-jobs.json")
}

fn default_store_schema() -> String {
    "_archiver".to_string()
}

fn default_bcp_path() -> String {
    "bcp".to_string()
}
