//! Lazily-initialized client registry
//!
//! A [`ClientRegistry`] maps logical client names to open backend handles.
//! The first lookup of a name resolves its configuration, opens the backend
//! and stores the handle; later lookups return the same handle. Concurrent
//! first lookups of one name share a single construction attempt and its
//! outcome, so at most one live handle exists per name.
//!
//! ```rust,no_run
//! use sailkit_core::registry::{ClientRegistry, DriverConnector};
//!
//! # async fn example(source: config::Config) -> Result<(), sailkit_core::RegistryError> {
//! let registry = ClientRegistry::new(source, DriverConnector::new());
//! let orders = registry.get("orders").await?;
//! assert!(orders.as_mysql().is_some());
//! registry.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod driver;

use config::Config;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::RegistryError;

pub use backend::{
    BackendConfig, Credentials, Dialect, EmbeddedStoreConfig, PoolSettings, RelationalConfig,
    RelationalDialect, DEFAULT_PREFIX,
};
pub use driver::{Client, Connector, DriverConnector, EmbeddedStore};

/// Result of a construction attempt, `None` while it is running
type Outcome<H> = Option<Result<Arc<H>, RegistryError>>;

enum Slot<H> {
    Ready(Arc<H>),
    /// Construction in flight. Waiters subscribe to `outcome`.
    Pending {
        attempt: u64,
        outcome: watch::Receiver<Outcome<H>>,
    },
}

enum Role<H> {
    Hit(Arc<H>),
    Waiter(watch::Receiver<Outcome<H>>),
    Leader(u64, watch::Sender<Outcome<H>>),
}

/// Drops a pending slot left behind by a failed or cancelled attempt
struct AttemptGuard<'a, H> {
    entries: &'a DashMap<String, Slot<H>>,
    name: &'a str,
    attempt: u64,
}

impl<H> Drop for AttemptGuard<'_, H> {
    fn drop(&mut self) {
        self.entries.remove_if(self.name, |_, slot| {
            matches!(slot, Slot::Pending { attempt, .. } if *attempt == self.attempt)
        });
    }
}

/// Name-keyed cache of backend handles
pub struct ClientRegistry<C: Connector = DriverConnector> {
    source: RwLock<Config>,
    prefix: String,
    connector: C,
    entries: DashMap<String, Slot<C::Handle>>,
    attempts: AtomicU64,
}

impl<C: Connector> ClientRegistry<C> {
    /// Create a registry resolving clients under [`DEFAULT_PREFIX`]
    pub fn new(source: Config, connector: C) -> Self {
        Self {
            source: RwLock::new(source),
            prefix: DEFAULT_PREFIX.to_string(),
            connector,
            entries: DashMap::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Resolve clients under `prefix` instead of the default
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Resolve the construction parameters for `name` without opening anything
    pub fn resolve(&self, name: &str) -> Result<BackendConfig, RegistryError> {
        backend::resolve(&self.source.read(), &self.prefix, name)
    }

    /// Replace the configuration source.
    ///
    /// Only names resolved after the swap see the new values; open handles
    /// keep the parameters they were built with.
    pub fn reload(&self, source: Config) {
        *self.source.write() = source;
        info!("Client configuration reloaded");
    }

    /// Return the handle for `name`, opening it on first use.
    ///
    /// Hits return the stored handle without any validation. On a miss the
    /// first caller constructs the handle and concurrent callers for the same
    /// name wait for that attempt and share its result, success or error.
    /// A failed construction stores nothing. If the constructing caller is
    /// cancelled, one of the waiters starts a new attempt.
    pub async fn get(&self, name: &str) -> Result<Arc<C::Handle>, RegistryError> {
        loop {
            let mut outcome = match self.join_or_lead(name)? {
                Role::Hit(handle) => return Ok(handle),
                Role::Leader(attempt, tx) => return self.lead(name, attempt, tx).await,
                Role::Waiter(outcome) => outcome,
            };

            trace!("Waiting on in-flight construction of '{}'", name);
            let shared = match outcome.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            };
            match shared {
                Some(result) => return result,
                None => debug!("Construction of '{}' was abandoned, retrying", name),
            }
        }
    }

    fn join_or_lead(&self, name: &str) -> Result<Role<C::Handle>, RegistryError> {
        if let Some(slot) = self.entries.get(name) {
            if let Slot::Ready(handle) = slot.value() {
                trace!("Client cache hit for '{}'", name);
                return Ok(Role::Hit(Arc::clone(handle)));
            }
        }

        backend::check_name(name)?;

        match self.entries.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(match entry.get() {
                Slot::Ready(handle) => Role::Hit(Arc::clone(handle)),
                Slot::Pending { outcome, .. } => Role::Waiter(outcome.clone()),
            }),
            Entry::Vacant(entry) => {
                trace!("Client cache miss for '{}'", name);
                let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                entry.insert(Slot::Pending { attempt, outcome: rx });
                Ok(Role::Leader(attempt, tx))
            }
        }
    }

    async fn lead(
        &self,
        name: &str,
        attempt: u64,
        tx: watch::Sender<Outcome<C::Handle>>,
    ) -> Result<Arc<C::Handle>, RegistryError> {
        let guard = AttemptGuard {
            entries: &self.entries,
            name,
            attempt,
        };

        let result = self.construct(name).await;
        if let Ok(handle) = &result {
            self.entries.insert(name.to_string(), Slot::Ready(Arc::clone(handle)));
        }
        // Clears the slot on failure before waiters wake up.
        drop(guard);

        tx.send_replace(Some(result.clone()));
        result
    }

    async fn construct(&self, name: &str) -> Result<Arc<C::Handle>, RegistryError> {
        let backend = self.resolve(name)?;
        let handle = self.connector.connect(name, &backend).await?;
        info!("Client '{}' ({}) initialized", name, backend.dialect());
        Ok(Arc::new(handle))
    }

    /// Close every handle and remove the ones that closed cleanly.
    ///
    /// Handles whose close fails stay registered and are reported in the log
    /// only. Meant to run once, after request handling has stopped.
    pub async fn close_all(&self) {
        let ready: Vec<(String, Arc<C::Handle>)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(handle) => Some((entry.key().clone(), Arc::clone(handle))),
                Slot::Pending { .. } => None,
            })
            .collect();

        for (name, handle) in ready {
            match self.connector.close(&name, &handle).await {
                Ok(()) => {
                    self.entries.remove_if(&name, |_, slot| {
                        matches!(slot, Slot::Ready(current) if Arc::ptr_eq(current, &handle))
                    });
                    info!("Client '{}' closed", name);
                }
                Err(e) => warn!("{}", e),
            }
        }

        if !self.entries.is_empty() {
            debug!("{} client(s) left open after drain", self.entries.len());
        }
    }

    /// Number of initialized clients
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `name` has an initialized handle
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|slot| matches!(slot.value(), Slot::Ready(_)))
            .unwrap_or(false)
    }

    /// Sorted names of initialized clients
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use config::{File, FileFormat};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const CLIENTS: &str = r#"
        [db_client.orders]
        dialect = "Mysql"
        addr = "db.local:3306"
        user = "svc"
        db_name = "orders_db"

        [db_client.reports]
        dialect = "Postgresql"
        addr = "pg.local"
        user = "svc"
        db_name = "reports"

        [db_client.legacy]
        dialect = "Oracle"
    "#;

    fn source(toml: &str) -> Config {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
    }

    #[derive(Debug)]
    struct FakeHandle {
        name: String,
        backend: BackendConfig,
    }

    #[derive(Default)]
    struct FakeConnector {
        opened: AtomicUsize,
        closed: AtomicUsize,
        delay: Option<Duration>,
        fail_open: Mutex<HashSet<String>>,
        fail_close: HashSet<String>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Handle = FakeHandle;

        async fn connect(&self, name: &str, backend: &BackendConfig) -> Result<FakeHandle, RegistryError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_open.lock().unwrap().contains(name) {
                return Err(RegistryError::connection(name, "connection refused"));
            }
            Ok(FakeHandle {
                name: name.to_string(),
                backend: backend.clone(),
            })
        }

        async fn close(&self, name: &str, _handle: &FakeHandle) -> Result<(), RegistryError> {
            if self.fail_close.contains(name) {
                return Err(RegistryError::close(name, "busy"));
            }
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_second_get_is_cache_hit() {
        let registry = ClientRegistry::new(source(CLIENTS), FakeConnector::default());

        let first = registry.get("orders").await.unwrap();
        let second = registry.get("orders").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 1);
        assert_eq!(first.name, "orders");
        assert_eq!(registry.names(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_configuration_stores_nothing() {
        let registry = ClientRegistry::new(source(CLIENTS), FakeConnector::default());

        let err = registry.get("missing").await.unwrap_err();
        assert!(matches!(err, RegistryError::ConfigurationMissing { .. }));
        assert!(registry.is_empty());
        assert!(!registry.contains("missing"));
        assert!(registry.entries.is_empty());
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_dialect_stores_nothing() {
        let registry = ClientRegistry::new(source(CLIENTS), FakeConnector::default());

        let err = registry.get("legacy").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedDialect { .. }));
        assert_eq!(err.name(), "legacy");
        assert!(registry.entries.is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried_on_next_get() {
        let connector = FakeConnector::default();
        connector.fail_open.lock().unwrap().insert("orders".into());
        let registry = ClientRegistry::new(source(CLIENTS), connector);

        let err = registry.get("orders").await.unwrap_err();
        assert!(matches!(err, RegistryError::ConnectionFailed { .. }));
        assert!(registry.entries.is_empty());

        registry.connector().fail_open.lock().unwrap().clear();
        let handle = registry.get("orders").await.unwrap();
        assert_eq!(handle.name, "orders");
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_gets_construct_once() {
        let connector = FakeConnector {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let registry = Arc::new(ClientRegistry::new(source(CLIENTS), connector));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.get("orders").await.unwrap() }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_drains_and_reconstructs() {
        let registry = ClientRegistry::new(source(CLIENTS), FakeConnector::default());

        let before = registry.get("orders").await.unwrap();
        registry.get("reports").await.unwrap();
        assert_eq!(registry.len(), 2);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(registry.connector().closed.load(Ordering::SeqCst), 2);

        let after = registry.get("orders").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_failure_keeps_entry() {
        let connector = FakeConnector {
            fail_close: HashSet::from(["reports".to_string()]),
            ..Default::default()
        };
        let registry = ClientRegistry::new(source(CLIENTS), connector);
        registry.get("orders").await.unwrap();
        registry.get("reports").await.unwrap();

        registry.close_all().await;

        assert_eq!(registry.names(), vec!["reports".to_string()]);
    }

    #[tokio::test]
    async fn test_pool_defaults_reach_connector() {
        let registry = ClientRegistry::new(source(CLIENTS), FakeConnector::default());
        let handle = registry.get("reports").await.unwrap();
        let BackendConfig::Relational(cfg) = &handle.backend else {
            panic!("expected relational backend");
        };
        assert_eq!(cfg.pool.max_idle, 10);
        assert_eq!(cfg.pool.max_open, 100);
        assert_eq!(cfg.pool.max_lifetime, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let src = source("[stores.kv]\ndialect = \"Embedded\"\n");
        let registry = ClientRegistry::new(src, FakeConnector::default()).with_prefix("stores");
        assert_eq!(registry.prefix(), "stores");
        let handle = registry.get("kv").await.unwrap();
        assert_eq!(handle.backend.dialect(), Dialect::Embedded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_gets_share_one_failure() {
        let connector = FakeConnector {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        connector.fail_open.lock().unwrap().insert("orders".into());
        let registry = Arc::new(ClientRegistry::new(source(CLIENTS), connector));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.get("orders").await }));
        }

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, RegistryError::ConnectionFailed { .. }));
        }
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 1);
        assert!(registry.entries.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_construction_is_taken_over() {
        let connector = FakeConnector {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let registry = Arc::new(ClientRegistry::new(source(CLIENTS), connector));

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get("orders").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get("orders").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let handle = second.await.unwrap().unwrap();
        assert_eq!(handle.name, "orders");
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 2);
        assert!(registry.contains("orders"));
    }

    #[tokio::test]
    async fn test_reload_affects_only_unresolved_names() {
        let registry = ClientRegistry::new(source(CLIENTS), FakeConnector::default());
        let orders = registry.get("orders").await.unwrap();
        assert!(matches!(
            registry.get("late").await,
            Err(RegistryError::ConfigurationMissing { .. })
        ));

        registry.reload(source(
            r#"
            [db_client.orders]
            dialect = "Mysql"
            addr = "moved.local:3306"
            user = "svc"
            db_name = "orders_db"

            [db_client.late]
            dialect = "Embedded"
            "#,
        ));

        let late = registry.get("late").await.unwrap();
        assert_eq!(late.backend.dialect(), Dialect::Embedded);

        let again = registry.get("orders").await.unwrap();
        assert!(Arc::ptr_eq(&orders, &again));
        let BackendConfig::Relational(cfg) = &again.backend else {
            panic!("expected relational backend");
        };
        assert_eq!(cfg.address, "db.local:3306");
    }

    #[tokio::test]
    async fn test_path_like_names_are_rejected() {
        let src = source(
            r#"
            [db_client.orders]
            dialect = "Mysql"
            addr = "db.local:3306"
            user = "svc"
            db_name = "orders_db"

            [db_client.orders.pool]
            dialect = "Embedded"
            "#,
        );
        let registry = ClientRegistry::new(src, FakeConnector::default());

        for name in ["orders.pool", "orders[0]", "orders]"] {
            let err = registry.get(name).await.unwrap_err();
            assert!(matches!(err, RegistryError::ConfigurationMissing { .. }), "{}", name);
        }
        assert!(registry.entries.is_empty());
        assert_eq!(registry.connector().opened.load(Ordering::SeqCst), 0);
    }
}
