//! Typed backend configuration and dialect resolution
//!
//! Each client is declared as a sub-table of the registry prefix
//! (`db_client` by default) and selects its driver with a `dialect` tag:
//!
//! ```toml
//! [db_client]
//! max_open = 50            # shared pool defaults
//!
//! [db_client.orders]
//! dialect = "Mysql"
//! addr = "db.local:3306"
//! user = "svc"
//! passwd = "secret"
//! db_name = "orders_db"
//!
//! [db_client.cache1]
//! dialect = "Embedded"
//! root_dir = "data"
//! ```
//!
//! Pool settings are taken from the client's own section first, then from
//! the prefix table, then from [`PoolSettings::default`].

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::RegistryError;

/// Configuration key under which clients are declared
pub const DEFAULT_PREFIX: &str = "db_client";

const DEFAULT_CHARSET: &str = "utf8mb4";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_ROOT_DIR: &str = "data";
const PG_TIMEZONE: &str = "Asia/Shanghai";

/// Dialect tags accepted in the `dialect` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    Mysql,
    Postgresql,
    Embedded,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Mysql => "Mysql",
            Dialect::Postgresql => "Postgresql",
            Dialect::Embedded => "Embedded",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let tag = tag.trim();
        [Dialect::Mysql, Dialect::Postgresql, Dialect::Embedded]
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(tag))
            .ok_or_else(|| tag.to_string())
    }
}

/// Connection pool limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    /// Maximum number of idle connections kept in the pool
    pub max_idle: u32,
    /// Maximum number of open connections
    pub max_open: u32,
    /// Maximum time a connection may be reused
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_open: 100,
            max_lifetime: Duration::from_secs(60 * 60),
        }
    }
}

/// User name and password for a relational backend
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Which SQL driver a relational client uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationalDialect {
    Mysql,
    Postgresql,
}

/// Resolved parameters of a MySQL or PostgreSQL client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalConfig {
    pub dialect: RelationalDialect,
    /// `host:port` for MySQL, host for PostgreSQL
    pub address: String,
    /// PostgreSQL port
    pub port: u16,
    pub credentials: Credentials,
    pub database: String,
    /// MySQL character set
    pub charset: String,
    /// MySQL connect timeout
    pub timeout: Duration,
    pub pool: PoolSettings,
    /// Log every executed statement
    pub log_statements: bool,
}

impl RelationalConfig {
    /// Driver connection string in the dialect's native format
    pub fn dsn(&self) -> String {
        self.render(&self.credentials.password)
    }

    /// Connection string with the password masked, for logs
    pub fn redacted_dsn(&self) -> String {
        self.render("***")
    }

    fn render(&self, password: &str) -> String {
        let user = &self.credentials.user;
        match self.dialect {
            RelationalDialect::Mysql => format!(
                "{}:{}@tcp({})/{}?charset={}&parseTime=true&loc=Local&timeout={}s",
                user,
                password,
                self.address,
                self.database,
                self.charset,
                self.timeout.as_secs()
            ),
            RelationalDialect::Postgresql => format!(
                "host={} user={} password={} dbname={} port={} sslmode=disable TimeZone={}",
                self.address, user, password, self.database, self.port, PG_TIMEZONE
            ),
        }
    }

    /// Time zone every PostgreSQL session is pinned to
    pub fn timezone(&self) -> &'static str {
        PG_TIMEZONE
    }
}

/// Resolved parameters of an embedded key-value store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedStoreConfig {
    pub root_dir: PathBuf,
}

impl EmbeddedStoreConfig {
    /// Directory holding the store for `name`
    pub fn path(&self, name: &str) -> PathBuf {
        self.root_dir.join(name)
    }
}

/// Construction parameters for one named client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Relational(RelationalConfig),
    Embedded(EmbeddedStoreConfig),
}

impl BackendConfig {
    pub fn dialect(&self) -> Dialect {
        match self {
            BackendConfig::Relational(cfg) => match cfg.dialect {
                RelationalDialect::Mysql => Dialect::Mysql,
                RelationalDialect::Postgresql => Dialect::Postgresql,
            },
            BackendConfig::Embedded(_) => Dialect::Embedded,
        }
    }
}

/// Pool keys shared by the prefix table and the client sections
#[derive(Debug, Default, Deserialize)]
struct RawPool {
    max_idle: Option<u32>,
    max_open: Option<u32>,
    conn_max_lifetime_secs: Option<u64>,
    log_statements: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSection {
    dialect: Option<String>,
    addr: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    passwd: Option<String>,
    db_name: Option<String>,
    charset: Option<String>,
    timeout_secs: Option<u64>,
    root_dir: Option<PathBuf>,
    max_idle: Option<u32>,
    max_open: Option<u32>,
    conn_max_lifetime_secs: Option<u64>,
    log_statements: Option<bool>,
}

/// Reject names that are empty or would be read as a nested config path
pub fn check_name(name: &str) -> Result<(), RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::missing(name, "client name is empty"));
    }
    if name.contains(['.', '[', ']']) {
        return Err(RegistryError::missing(
            name,
            "client name must not contain '.', '[' or ']'",
        ));
    }
    Ok(())
}

/// Resolve the construction parameters of `name` from `<prefix>.<name>`.
pub fn resolve(source: &Config, prefix: &str, name: &str) -> Result<BackendConfig, RegistryError> {
    check_name(name)?;

    let key = format!("{}.{}", prefix, name);
    let raw: RawSection = match source.get(&key) {
        Ok(raw) => raw,
        Err(ConfigError::NotFound(_)) => {
            return Err(RegistryError::missing(name, format!("section '{}' not found", key)))
        }
        Err(e) => {
            return Err(RegistryError::missing(
                name,
                format!("section '{}' is malformed: {}", key, e),
            ))
        }
    };

    let tag = raw
        .dialect
        .as_deref()
        .ok_or_else(|| RegistryError::missing(name, format!("'{}.dialect' is not set", key)))?;
    let dialect = Dialect::from_str(tag).map_err(|dialect| RegistryError::UnsupportedDialect {
        name: name.to_string(),
        dialect,
    })?;

    match dialect {
        Dialect::Mysql => relational(source, prefix, name, RelationalDialect::Mysql, raw),
        Dialect::Postgresql => relational(source, prefix, name, RelationalDialect::Postgresql, raw),
        Dialect::Embedded => Ok(BackendConfig::Embedded(EmbeddedStoreConfig {
            root_dir: raw.root_dir.unwrap_or_else(|| Path::new(DEFAULT_ROOT_DIR).to_path_buf()),
        })),
    }
}

fn relational(
    source: &Config,
    prefix: &str,
    name: &str,
    dialect: RelationalDialect,
    raw: RawSection,
) -> Result<BackendConfig, RegistryError> {
    let required = |value: Option<String>, field: &str| {
        value
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| RegistryError::missing(name, format!("'{}' is required", field)))
    };

    // Prefix-level pool keys are optional; a table holding only clients is fine.
    let shared: RawPool = source.get(prefix).unwrap_or_default();
    let defaults = PoolSettings::default();
    let pool = PoolSettings {
        max_idle: raw.max_idle.or(shared.max_idle).unwrap_or(defaults.max_idle),
        max_open: raw.max_open.or(shared.max_open).unwrap_or(defaults.max_open),
        max_lifetime: raw
            .conn_max_lifetime_secs
            .or(shared.conn_max_lifetime_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_lifetime),
    };

    Ok(BackendConfig::Relational(RelationalConfig {
        dialect,
        address: required(raw.addr, "addr")?,
        port: raw.port.unwrap_or(DEFAULT_PG_PORT),
        credentials: Credentials {
            user: required(raw.user, "user")?,
            password: raw.passwd.unwrap_or_default(),
        },
        database: required(raw.db_name, "db_name")?,
        charset: raw.charset.unwrap_or_else(|| DEFAULT_CHARSET.to_string()),
        timeout: Duration::from_secs(raw.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        pool,
        log_statements: raw.log_statements.or(shared.log_statements).unwrap_or(false),
    }))
}
