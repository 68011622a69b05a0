//! Configuration management for sailkit services.
//!
//! Settings are layered with the `config` crate, later sources overriding
//! earlier ones:
//! 1. Built-in defaults
//! 2. An optional configuration file (TOML, YAML or JSON, chosen by extension)
//! 3. Environment variables prefixed with `SAILKIT`, using `__` as the
//!    nesting separator (e.g. `SAILKIT__APP__ADDR=127.0.0.1:9000`)
//!
//! The raw [`Config`] is kept alongside the typed [`AppConfig`] so the client
//! registry can resolve `db_client.<name>` sections on demand. With
//! `app.config_hot_reload` the file is watched by [`watch_file`] and rebuilt
//! configurations are handed to the registry.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::backend::{self, DEFAULT_PREFIX};

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "SAILKIT";

/// Quiet period after a file event before the configuration is rebuilt
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Router mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Adds per-request tracing spans
    Debug,
    #[default]
    Release,
    Test,
}

/// HTTP application settings (`app`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listen address in host:port format
    pub addr: String,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Register `GET /ping`
    #[serde(default)]
    pub heartbeat: bool,
    /// Log every request and response
    #[serde(default = "default_true")]
    pub request_log: bool,
    /// Paths whose request bodies are not logged
    #[serde(default)]
    pub skip_request_body: Vec<String>,
    /// Paths whose response bodies are not logged
    #[serde(default)]
    pub skip_response_body: Vec<String>,
    /// Seconds to wait for in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Watch the configuration file and hand new client sections to the registry
    #[serde(default)]
    pub config_hot_reload: bool,
    #[serde(default)]
    pub log: LogConfig,
}

/// Log sink settings (`app.log`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding log files
    #[serde(default = "default_log_path")]
    pub file_path: PathBuf,
    /// Log file name prefix
    #[serde(default = "default_log_name")]
    pub file_name: String,
    /// Size in megabytes at which the file is rotated
    #[serde(default = "default_max_size")]
    pub max_size_mb: usize,
    /// Rotated files to keep
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// Days before a rotated file is pruned
    #[serde(default = "default_max_age")]
    pub max_age_days: u64,
    /// Emit JSON lines instead of tab-separated text
    #[serde(default)]
    pub json: bool,
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_path: default_log_path(),
            file_name: default_log_name(),
            max_size_mb: default_max_size(),
            max_backups: default_max_backups(),
            max_age_days: default_max_age(),
            json: false,
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_log_path() -> PathBuf {
    PathBuf::from("log")
}

fn default_log_name() -> String {
    "app".to_string()
}

fn default_max_size() -> usize {
    2
}

fn default_max_backups() -> usize {
    10
}

fn default_max_age() -> u64 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loaded settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub app: AppConfig,
    source: Config,
}

impl Settings {
    /// Create a configuration builder with sailkit defaults, the optional
    /// file at `path` and environment overrides.
    ///
    /// Callers may add `.set_override()` calls (e.g. from CLI flags) before
    /// building.
    pub fn builder(path: Option<&Path>) -> Result<ConfigBuilder<DefaultState>> {
        let mut builder = Config::builder()
            .set_default("app.addr", "0.0.0.0:8080")?
            .set_default("app.run_mode", "release")?
            .set_default("app.heartbeat", false)?
            .set_default("app.request_log", true)?
            .set_default("app.shutdown_grace_secs", default_shutdown_grace())?
            .set_default("app.config_hot_reload", false)?
            .set_default("app.log.file_path", "log")?
            .set_default("app.log.file_name", default_log_name())?
            .set_default("app.log.max_size_mb", default_max_size() as u64)?
            .set_default("app.log.max_backups", default_max_backups() as u64)?
            .set_default("app.log.max_age_days", default_max_age())?
            .set_default("app.log.json", false)?
            .set_default("app.log.level", default_log_level())?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        Ok(builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("app.skip_request_body")
                .with_list_parse_key("app.skip_response_body")
                .ignore_empty(true),
        ))
    }

    /// Load settings from defaults, `path` and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_config(Self::builder(path)?.build()?)
    }

    /// Wrap an already built configuration
    pub fn from_config(source: Config) -> Result<Self> {
        let app: AppConfig = source.get("app")?;
        let settings = Self { app, source };
        tracing::debug!(
            "Loaded settings: addr = {}, run_mode = {:?}, clients = {:?}",
            settings.app.addr,
            settings.app.run_mode,
            settings.client_names()
        );
        Ok(settings)
    }

    /// The layered configuration the registry resolves clients from
    pub fn source(&self) -> &Config {
        &self.source
    }

    /// Names of the clients declared under `db_client`, sorted
    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .source
            .get_table(DEFAULT_PREFIX)
            .map(|table| {
                table
                    .into_iter()
                    .filter(|(_, value)| value.clone().into_table().is_ok())
                    .map(|(name, _)| name)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Check the settings before anything is started.
    ///
    /// Every declared client is resolved so a bad dialect or a missing
    /// required field is reported at load time instead of on first use.
    pub fn validate(&self) -> Result<()> {
        self.app
            .addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::Validation(format!("app.addr '{}': {}", self.app.addr, e)))?;

        if self.app.log.file_name.trim().is_empty() {
            return Err(Error::Validation("app.log.file_name must not be empty".into()));
        }
        if self.app.log.max_size_mb == 0 {
            return Err(Error::Validation("app.log.max_size_mb must be at least 1".into()));
        }

        for name in self.client_names() {
            backend::resolve(&self.source, DEFAULT_PREFIX, &name)?;
        }
        Ok(())
    }
}

/// Keeps a configuration file watch alive; dropping it stops watching
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `path` and pass a configuration built by `rebuild` to `apply`
/// after every change.
///
/// The parent directory is watched so editors that replace the file by
/// renaming are picked up. Bursts of events are debounced. If `rebuild`
/// fails the previous configuration stays in effect. Must be called from
/// within a tokio runtime.
pub fn watch_file<B, A>(path: &Path, rebuild: B, apply: A) -> Result<ConfigWatcher>
where
    B: Fn() -> Result<Config> + Send + 'static,
    A: Fn(Config) + Send + 'static,
{
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| Error::Validation(format!("config path {} has no file name", path.display())))?;
    let watch_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::channel::<()>(16);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                && event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                let _ = tx.try_send(());
            }
        }
    })?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for configuration changes", path.display());

    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            match rebuild() {
                Ok(source) => apply(source),
                Err(e) => warn!("Configuration reload failed, keeping the previous one: {}", e),
            }
        }
    });

    Ok(ConfigWatcher {
        _watcher: watcher,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use std::fs;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard};

    // Settings read the process environment; tests that load them take turns.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let _env = env_lock();
        let settings = Settings::from_config(Settings::builder(None).unwrap().build().unwrap()).unwrap();
        assert_eq!(settings.app.addr, "0.0.0.0:8080");
        assert_eq!(settings.app.run_mode, RunMode::Release);
        assert!(!settings.app.heartbeat);
        assert!(settings.app.request_log);
        assert_eq!(settings.app.shutdown_grace_secs, 5);
        assert_eq!(settings.app.log.file_path, PathBuf::from("log"));
        assert_eq!(settings.app.log.file_name, "app");
        assert_eq!(settings.app.log.max_backups, 10);
        assert_eq!(settings.app.log.max_age_days, 7);
        assert!(settings.client_names().is_empty());
        settings.validate().unwrap();
    }

    #[test]
    fn test_file_values_and_overrides() {
        let _env = env_lock();
        let file = write_config(
            r#"
            [app]
            addr = "127.0.0.1:9000"
            run_mode = "debug"
            heartbeat = true
            skip_request_body = ["/upload"]

            [app.log]
            json = true

            [db_client.orders]
            dialect = "Mysql"
            addr = "db.local:3306"
            user = "svc"
            db_name = "orders_db"

            [db_client.cache1]
            dialect = "Embedded"
            "#,
        );

        let source = Settings::builder(Some(file.path()))
            .unwrap()
            .set_override("app.shutdown_grace_secs", 1u64)
            .unwrap()
            .build()
            .unwrap();
        let settings = Settings::from_config(source).unwrap();

        assert_eq!(settings.app.addr, "127.0.0.1:9000");
        assert_eq!(settings.app.run_mode, RunMode::Debug);
        assert!(settings.app.heartbeat);
        assert_eq!(settings.app.skip_request_body, vec!["/upload".to_string()]);
        assert!(settings.app.log.json);
        assert_eq!(settings.app.log.file_name, "app");
        assert_eq!(settings.app.shutdown_grace_secs, 1);
        assert_eq!(settings.client_names(), vec!["cache1".to_string(), "orders".to_string()]);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_dialect() {
        let _env = env_lock();
        let file = write_config("[db_client.legacy]\ndialect = \"Oracle\"\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::UnsupportedDialect { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_addr() {
        let _env = env_lock();
        let file = write_config("[app]\naddr = \"not an address\"\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        assert!(matches!(settings.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let _env = env_lock();
        assert!(Settings::load(Some(Path::new("/nonexistent/sailkit.toml"))).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let _env = env_lock();
        let file = write_config("[app]\naddr = \"127.0.0.1:9000\"\n");
        std::env::set_var("SAILKIT__APP__ADDR", "127.0.0.1:9100");
        std::env::set_var("SAILKIT__APP__SKIP_RESPONSE_BODY", "/export,/download");

        let loaded = Settings::load(Some(file.path()));
        std::env::remove_var("SAILKIT__APP__ADDR");
        std::env::remove_var("SAILKIT__APP__SKIP_RESPONSE_BODY");

        let settings = loaded.unwrap();
        assert_eq!(settings.app.addr, "127.0.0.1:9100");
        assert_eq!(
            settings.app.skip_response_body,
            vec!["/export".to_string(), "/download".to_string()]
        );
    }

    #[test]
    fn test_validate_rejects_zero_log_size() {
        let _env = env_lock();
        let file = write_config("[app.log]\nmax_size_mb = 0\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        assert!(matches!(settings.validate(), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_watch_file_applies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sailkit.toml");
        fs::write(&path, "[db_client.a]\ndialect = \"Embedded\"\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let rebuild_path = path.clone();
        let _watcher = watch_file(
            &path,
            move || Ok(Config::builder().add_source(File::from(rebuild_path.as_path())).build()?),
            move |source| {
                let _ = tx.send(source);
            },
        )
        .unwrap();

        fs::write(
            &path,
            "[db_client.a]\ndialect = \"Embedded\"\n\n[db_client.b]\ndialect = \"Mysql\"\n",
        )
        .unwrap();

        let source = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no reload within 10s")
            .unwrap();
        let dialect: String = source.get("db_client.b.dialect").unwrap();
        assert_eq!(dialect, "Mysql");
    }

    #[tokio::test]
    async fn test_watch_file_keeps_previous_config_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sailkit.toml");
        fs::write(&path, "[app]\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<Config>();
        let rebuild_path = path.clone();
        let _watcher = watch_file(
            &path,
            move || Ok(Config::builder().add_source(File::from(rebuild_path.as_path())).build()?),
            move |source| {
                let _ = tx.send(source);
            },
        )
        .unwrap();

        fs::write(&path, "[app\n").unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(waited.is_err());
    }
}
