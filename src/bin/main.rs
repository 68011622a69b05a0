//! sailkit binary
//!
//! Loads settings, starts logging, and serves the client registry endpoints
//! plus the heartbeat until SIGINT or SIGTERM. With `app.config_hot_reload`
//! the config file is watched and clients not yet opened pick up changes.

use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use sailkit_core::config::{self, ConfigWatcher};
use sailkit_core::server::routes;
use sailkit_core::{logging, App, ClientRegistry, DriverConnector, Settings};

#[derive(Parser, Clone)]
#[command(name = "sailkit", version, about = "HTTP service bootstrap with lazily opened database clients", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML, YAML or JSON)
    #[arg(long, env = "SAILKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides `app.addr`
    #[arg(long)]
    addr: Option<String>,

    /// Log filter directive, overrides `app.log.level`
    #[arg(long)]
    log_level: Option<String>,
}

/// Layer file, environment and command line overrides
fn build_source(cli: &Cli) -> sailkit_core::Result<::config::Config> {
    let mut builder = Settings::builder(cli.config.as_deref())?;
    if let Some(addr) = &cli.addr {
        builder = builder.set_override("app.addr", addr.as_str())?;
    }
    if let Some(level) = &cli.log_level {
        builder = builder.set_override("app.log.level", level.as_str())?;
    }
    Ok(builder.build()?)
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let source = match &cli.config {
        Some(path) => build_source(cli).with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => build_source(cli).context("Failed to load config")?,
    };
    let settings = Settings::from_config(source)?;
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

/// Hand validated reloads of the config file to the registry
fn watch_config(cli: &Cli, registry: &Arc<ClientRegistry>) -> Result<Option<ConfigWatcher>> {
    let Some(path) = cli.config.clone() else {
        warn!("app.config_hot_reload is set but no config file was given");
        return Ok(None);
    };

    let rebuild_cli = cli.clone();
    let target = Arc::clone(registry);
    let watcher = config::watch_file(
        &path,
        move || build_source(&rebuild_cli),
        move |source| match Settings::from_config(source).and_then(|s| s.validate().map(|()| s)) {
            Ok(settings) => target.reload(settings.source().clone()),
            Err(e) => warn!("Ignoring reloaded configuration: {}", e),
        },
    )
    .with_context(|| format!("Failed to watch {}", path.display()))?;
    Ok(Some(watcher))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    // Dropping the guard flushes the file writer; keep it until exit.
    let _log_guard = logging::init(&settings.app.log).context("Failed to initialize logging")?;
    info!("sailkit {} starting up", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(ClientRegistry::new(settings.source().clone(), DriverConnector::new()));
    info!("Declared clients: {:?}", settings.client_names());

    let _config_watch = if settings.app.config_hot_reload {
        watch_config(&cli, &registry)?
    } else {
        None
    };

    let mut config = settings.app.clone();
    config.heartbeat = true;

    let drain = Arc::clone(&registry);
    let mut app = App::new(config)
        .routes(move |router| router.merge(routes::create_router(registry)))
        .exit_after(move || async move { drain.close_all().await });
    app.init();

    app.run().await?;
    Ok(())
}
