//! HTTP application bootstrap
//!
//! [`App`] assembles the router in a fixed order (user routes, heartbeat,
//! middleware), serves it, and on SIGINT/SIGTERM shuts down gracefully within
//! the configured grace period before running the exit hook. A second signal
//! during the grace period stops the server at once.
//!
//! ```rust,no_run
//! use sailkit_core::config::Settings;
//! use sailkit_core::server::{response, App};
//! use axum::routing::get;
//!
//! # async fn example() -> sailkit_core::Result<()> {
//! let settings = Settings::load(None)?;
//! let mut app = App::new(settings.app.clone())
//!     .routes(|router| router.route("/hello", get(|| async { response::ok_json("hi") })))
//!     .exit_after(|| async { tracing::info!("bye") });
//! app.init();
//! app.run().await
//! # }
//! ```

pub mod middleware;
pub mod response;
pub mod routes;

use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{AppConfig, RunMode};
use crate::error::{Error, Result};
use middleware::RequestLogConfig;

/// Text returned by the heartbeat route
pub const HEARTBEAT_REPLY: &str = "success! This service is normal.";

type RouteHook = Box<dyn FnOnce(Router) -> Router + Send>;
type ExitHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Service bootstrap
pub struct App {
    config: AppConfig,
    routes: Option<RouteHook>,
    exit_after: Option<ExitHook>,
    router: Option<Router>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            routes: None,
            exit_after: None,
            router: None,
        }
    }

    /// Register application routes
    pub fn routes<F>(mut self, register: F) -> Self
    where
        F: FnOnce(Router) -> Router + Send + 'static,
    {
        self.routes = Some(Box::new(register));
        self
    }

    /// Run `hook` after the server has stopped, e.g. to drain the client registry
    pub fn exit_after<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.exit_after = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Build the router. Calling it again keeps the first router.
    pub fn init(&mut self) {
        if self.router.is_some() {
            return;
        }

        let mut router = Router::new();
        if let Some(register) = self.routes.take() {
            router = register(router);
        }
        if self.config.heartbeat {
            router = router.route("/ping", get(heartbeat));
        }

        router = router.layer(middleware::exception_layer());
        if self.config.request_log {
            let log_config = RequestLogConfig::new(
                self.config.skip_request_body.clone(),
                self.config.skip_response_body.clone(),
            );
            router = router.layer(axum::middleware::from_fn_with_state(log_config, middleware::log_requests));
        }
        if self.config.run_mode == RunMode::Debug {
            router = router.layer(TraceLayer::new_for_http());
        }

        info!("Router initialized (run mode {:?})", self.config.run_mode);
        self.router = Some(router);
    }

    /// The initialized router, if [`App::init`] has run
    pub fn router(&self) -> Option<Router> {
        self.router.clone()
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal(), shutdown_signal()).await
    }

    /// Serve until `shutdown` completes
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown, std::future::pending()).await
    }

    async fn bind(&self) -> Result<TcpListener> {
        if self.router.is_none() {
            return Err(not_initialized());
        }
        Ok(TcpListener::bind(&self.config.addr).await?)
    }

    /// Serve on a bound listener until `shutdown` completes, then wait up to
    /// `shutdown_grace_secs` for in-flight requests. If `force` completes
    /// first the server is stopped without waiting further.
    pub async fn serve<S, F>(mut self, listener: TcpListener, shutdown: S, force: F) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router.take().ok_or_else(not_initialized)?;
        info!("Listening on {}", listener.local_addr()?);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        shutdown.await;
        info!("Shutting down gracefully, signal again to force");
        let _ = stop_tx.send(());

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        tokio::select! {
            joined = &mut server => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Server error during shutdown: {}", e),
                Err(e) => warn!("Server task failed: {}", e),
            },
            _ = tokio::time::sleep(grace) => {
                warn!("Server forced to shut down after {:?}", grace);
                server.abort();
            }
            _ = force => {
                warn!("Second signal received, forcing shutdown");
                server.abort();
            }
        }

        if let Some(hook) = self.exit_after.take() {
            hook().await;
        }

        info!("Server exiting");
        Ok(())
    }
}

fn not_initialized() -> Error {
    Error::Server("server start refused: App::init was not called".into())
}

async fn heartbeat() -> &'static str {
    HEARTBEAT_REPLY
}

/// Completes on SIGTERM or SIGINT
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to register signal handlers, falling back to Ctrl+C: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

/// Fallback for non-Unix systems
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
    }
}
