//! Backend drivers
//!
//! [`Connector`] is the seam between the registry and the actual backends.
//! [`DriverConnector`] opens sqlx pools for the relational dialects and
//! RocksDB instances for the embedded store.

use async_trait::async_trait;
use rocksdb::{Options, DB};
use serde_json::json;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::ConnectOptions;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::backend::{BackendConfig, EmbeddedStoreConfig, PoolSettings, RelationalConfig, RelationalDialect};
use crate::error::RegistryError;

const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Opens and closes backend handles on behalf of the registry
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Handle stored in the registry
    type Handle: Send + Sync + 'static;

    /// Open a new handle for `name`
    async fn connect(&self, name: &str, backend: &BackendConfig) -> Result<Self::Handle, RegistryError>;

    /// Release the resources held by `handle`
    async fn close(&self, name: &str, handle: &Self::Handle) -> Result<(), RegistryError>;
}

/// Open embedded key-value store
///
/// The database lives behind a lock so [`EmbeddedStore::close`] can release
/// it, and the directory lock with it, while other parts of the program still
/// hold the handle.
#[derive(Debug)]
pub struct EmbeddedStore {
    db: RwLock<Option<DB>>,
    path: PathBuf,
}

impl EmbeddedStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self, rocksdb::Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db: RwLock::new(Some(db)),
            path: path.to_path_buf(),
        })
    }

    /// The database, or `None` once the store has been closed
    pub fn db(&self) -> Option<MappedRwLockReadGuard<'_, DB>> {
        RwLockReadGuard::try_map(self.db.read(), Option::as_ref).ok()
    }

    pub fn is_closed(&self) -> bool {
        self.db.read().is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and release the database. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), rocksdb::Error> {
        let Some(db) = self.db.write().take() else {
            return Ok(());
        };
        db.flush()
    }
}

/// Handle produced by [`DriverConnector`]
#[derive(Debug)]
pub enum Client {
    MySql { pool: MySqlPool, limits: PoolSettings },
    Postgres { pool: PgPool, limits: PoolSettings },
    Embedded(EmbeddedStore),
}

impl Client {
    pub fn kind(&self) -> &'static str {
        match self {
            Client::MySql { .. } => "Mysql",
            Client::Postgres { .. } => "Postgresql",
            Client::Embedded(_) => "Embedded",
        }
    }

    /// Pool limits the handle was built with; `None` for the embedded store
    pub fn pool_limits(&self) -> Option<&PoolSettings> {
        match self {
            Client::MySql { limits, .. } | Client::Postgres { limits, .. } => Some(limits),
            Client::Embedded(_) => None,
        }
    }

    pub fn as_mysql(&self) -> Option<&MySqlPool> {
        match self {
            Client::MySql { pool, .. } => Some(pool),
            _ => None,
        }
    }

    pub fn as_postgres(&self) -> Option<&PgPool> {
        match self {
            Client::Postgres { pool, .. } => Some(pool),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&EmbeddedStore> {
        match self {
            Client::Embedded(store) => Some(store),
            _ => None,
        }
    }

    /// Summary suitable for diagnostics endpoints
    pub fn describe(&self) -> serde_json::Value {
        match self {
            Client::MySql { limits, .. } | Client::Postgres { limits, .. } => json!({
                "kind": self.kind(),
                "max_idle": limits.max_idle,
                "max_open": limits.max_open,
                "max_lifetime_secs": limits.max_lifetime.as_secs(),
            }),
            Client::Embedded(store) => json!({
                "kind": self.kind(),
                "path": store.path().display().to_string(),
            }),
        }
    }
}

/// Production connector backed by sqlx and RocksDB
#[derive(Debug, Clone, Default)]
pub struct DriverConnector {
    lazy: bool,
}

impl DriverConnector {
    /// Connector that establishes the first relational connection eagerly,
    /// so bad credentials or unreachable hosts fail the lookup.
    pub fn new() -> Self {
        Self { lazy: false }
    }

    /// Connector that defers relational connections until first use
    pub fn lazy() -> Self {
        Self { lazy: true }
    }

    async fn connect_mysql(&self, name: &str, cfg: &RelationalConfig) -> Result<Client, RegistryError> {
        let (host, port) = split_host_port(&cfg.address, DEFAULT_MYSQL_PORT)
            .ok_or_else(|| RegistryError::connection(name, format!("invalid address '{}'", cfg.address)))?;

        let mut options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&cfg.credentials.user)
            .password(&cfg.credentials.password)
            .database(&cfg.database)
            .charset(&cfg.charset);
        if !cfg.log_statements {
            options = options.disable_statement_logging();
        }

        let pool_options = MySqlPoolOptions::new()
            .max_connections(cfg.pool.max_open)
            .max_lifetime(cfg.pool.max_lifetime)
            .acquire_timeout(cfg.timeout);

        let pool = if self.lazy {
            pool_options.connect_lazy_with(options)
        } else {
            pool_options
                .connect_with(options)
                .await
                .map_err(|e| RegistryError::connection(name, e))?
        };

        Ok(Client::MySql {
            pool,
            limits: cfg.pool,
        })
    }

    async fn connect_postgres(&self, name: &str, cfg: &RelationalConfig) -> Result<Client, RegistryError> {
        let mut options = PgConnectOptions::new()
            .host(&cfg.address)
            .port(cfg.port)
            .username(&cfg.credentials.user)
            .password(&cfg.credentials.password)
            .database(&cfg.database)
            .ssl_mode(PgSslMode::Disable)
            .options([("timezone", cfg.timezone())]);
        if !cfg.log_statements {
            options = options.disable_statement_logging();
        }

        let pool_options = PgPoolOptions::new()
            .max_connections(cfg.pool.max_open)
            .max_lifetime(cfg.pool.max_lifetime);

        let pool = if self.lazy {
            pool_options.connect_lazy_with(options)
        } else {
            pool_options
                .connect_with(options)
                .await
                .map_err(|e| RegistryError::connection(name, e))?
        };

        Ok(Client::Postgres {
            pool,
            limits: cfg.pool,
        })
    }

    async fn open_embedded(&self, name: &str, cfg: &EmbeddedStoreConfig) -> Result<Client, RegistryError> {
        let path = cfg.path(name);
        let store = tokio::task::spawn_blocking(move || -> Result<EmbeddedStore, String> {
            std::fs::create_dir_all(&path).map_err(|e| e.to_string())?;
            EmbeddedStore::open(&path).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| RegistryError::connection(name, e))?
        .map_err(|e| RegistryError::connection(name, e))?;

        Ok(Client::Embedded(store))
    }
}

#[async_trait]
impl Connector for DriverConnector {
    type Handle = Client;

    async fn connect(&self, name: &str, backend: &BackendConfig) -> Result<Client, RegistryError> {
        match backend {
            BackendConfig::Relational(cfg) => {
                info!("Opening {} client '{}': {}", backend.dialect(), name, cfg.redacted_dsn());
                match cfg.dialect {
                    RelationalDialect::Mysql => self.connect_mysql(name, cfg).await,
                    RelationalDialect::Postgresql => self.connect_postgres(name, cfg).await,
                }
            }
            BackendConfig::Embedded(cfg) => {
                info!("Opening embedded store '{}' at {:?}", name, cfg.path(name));
                self.open_embedded(name, cfg).await
            }
        }
    }

    async fn close(&self, name: &str, handle: &Client) -> Result<(), RegistryError> {
        match handle {
            Client::MySql { pool, .. } => pool.close().await,
            Client::Postgres { pool, .. } => pool.close().await,
            Client::Embedded(store) => store.close().map_err(|e| RegistryError::close(name, e))?,
        }
        debug!("Closed {} client '{}'", handle.kind(), name);
        Ok(())
    }
}

/// Split `host:port`, falling back to `default_port` when no port is given
fn split_host_port(address: &str, default_port: u16) -> Option<(&str, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => port.parse().ok().map(|port| (host, port)),
        Some(_) => None,
        None if !address.is_empty() => Some((address, default_port)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db.local:3306", 1), Some(("db.local", 3306)));
        assert_eq!(split_host_port("db.local", 3306), Some(("db.local", 3306)));
        assert_eq!(split_host_port("db.local:abc", 3306), None);
        assert_eq!(split_host_port(":3306", 3306), None);
        assert_eq!(split_host_port("", 3306), None);
    }

    #[test]
    fn test_embedded_store_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv");
        let store = EmbeddedStore::open(&path).unwrap();
        store.db().unwrap().put(b"k", b"v").unwrap();
        assert_eq!(store.db().unwrap().get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        assert!(path.is_dir());
    }

    #[test]
    fn test_embedded_store_close_releases_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv");
        let store = EmbeddedStore::open(&path).unwrap();
        store.db().unwrap().put(b"k", b"v").unwrap();

        store.close().unwrap();
        assert!(store.is_closed());
        assert!(store.db().is_none());
        store.close().unwrap();

        // The directory lock is gone while the old handle is still alive.
        let reopened = EmbeddedStore::open(&path).unwrap();
        assert_eq!(reopened.db().unwrap().get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
