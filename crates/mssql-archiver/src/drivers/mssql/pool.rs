//! Tiberius connections pooled with bb8, plus the registry of named pools.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ArchiveError, Result};

/// Connection pool timeouts.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub type MssqlClient = Client<Compat<TcpStream>>;
pub type PooledClient<'a> = PooledConnection<'a, TiberiusConnectionManager>;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: ConnectionConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.application_name("mssql-archiver");
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        if self.config.trust_server_cert {
            config.trust_cert();
        }
        config
    }

    async fn open_tcp(addr: String) -> std::result::Result<TcpStream, tiberius::error::Error> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        let std_tcp = match tcp.into_std() {
            Ok(std_tcp) => std_tcp,
            Err(e) => {
                return Err(tiberius::error::Error::Io {
                    kind: e.kind(),
                    message: format!("Failed to detach socket: {}", e),
                })
            }
        };

        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }

        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        TcpStream::from_std(std_tcp).map_err(|e| tiberius::error::Error::Io {
            kind: e.kind(),
            message: format!("Failed to convert socket: {}", e),
        })
    }
}

#[async_trait]
impl ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = Self::open_tcp(config.get_addr()).await?;
        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// A named pool of connections to one database.
pub struct MssqlPool {
    name: String,
    config: ConnectionConfig,
    manager: TiberiusConnectionManager,
    pool: Pool<TiberiusConnectionManager>,
}

impl std::fmt::Debug for MssqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlPool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MssqlPool {
    pub async fn connect(name: impl Into<String>, config: ConnectionConfig) -> Result<Self> {
        let name = name.into();
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager.clone())
            .await
            .map_err(|e| ArchiveError::pool(e, format!("creating pool '{}'", name)))?;

        info!(
            "Connected to MSSQL '{}': {} (pool_size={})",
            name,
            config.display_target(),
            config.max_connections
        );

        Ok(Self {
            name,
            config,
            manager,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn get(&self) -> Result<PooledClient<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| ArchiveError::pool(e, format!("getting connection from '{}'", self.name)))
    }

    /// A fresh connection outside the pool.
    ///
    /// Used for work that may be abandoned mid-query by a timeout; dropping
    /// the client closes the socket instead of returning a busy session.
    pub async fn dedicated(&self) -> Result<MssqlClient> {
        self.manager
            .connect()
            .await
            .map_err(|e| ArchiveError::pool(e, format!("opening dedicated connection to '{}'", self.name)))
    }

    pub async fn test_connection(&self) -> Result<()> {
        let mut conn = self.get().await?;
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }
}

/// Lazily opened pools, keyed by connection name.
///
/// Each name has its own cell, so a slow or unreachable server only holds
/// up callers that need that connection.
pub struct ConnectionRegistry {
    configs: BTreeMap<String, ConnectionConfig>,
    pools: HashMap<String, OnceCell<Arc<MssqlPool>>>,
}

impl ConnectionRegistry {
    pub fn new(configs: BTreeMap<String, ConnectionConfig>) -> Self {
        let pools = configs
            .keys()
            .map(|name| (name.clone(), OnceCell::new()))
            .collect();
        Self { configs, pools }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn config(&self, name: &str) -> Result<&ConnectionConfig> {
        self.configs
            .get(name)
            .ok_or_else(|| ArchiveError::Config(format!("connection '{}' is not configured", name)))
    }

    /// The pool for `name`, opened on first use.
    ///
    /// A failed open leaves the cell empty; the next call tries again.
    pub async fn pool(&self, name: &str) -> Result<Arc<MssqlPool>> {
        let config = self.config(name)?;
        let cell = self
            .pools
            .get(name)
            .ok_or_else(|| ArchiveError::Config(format!("connection '{}' is not configured", name)))?;
        let pool = cell
            .get_or_try_init(|| async {
                MssqlPool::connect(name, config.clone()).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(pool))
    }

    /// Pools opened so far.
    pub fn opened(&self) -> usize {
        self.pools.values().filter(|cell| cell.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        let config: ConnectionConfig = serde_yaml::from_str(
            "host: sql01\ndatabase: Sales\nuser: archiver\npassword: s3cret\n",
        )
        .unwrap();
        let mut configs = BTreeMap::new();
        configs.insert("live".to_string(), config);
        ConnectionRegistry::new(configs)
    }

    #[test]
    fn test_registry_opens_nothing_up_front() {
        let registry = registry();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["live"]);
        assert_eq!(registry.opened(), 0);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_config_error() {
        let registry = registry();
        let err = registry.pool("warehouse").await.unwrap_err();
        assert!(matches!(err, ArchiveError::Config(_)));
        assert!(err.to_string().contains("warehouse"));
    }
}
