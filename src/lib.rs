//! sailkit: bootstrap for HTTP services
//!
//! Wires layered configuration, structured logging with file rotation,
//! response envelopes and a lazily-initialized registry of database clients
//! around an axum router.

pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod server;

pub use crate::config::Settings;
pub use error::{Error, RegistryError, Result};
pub use registry::{ClientRegistry, DriverConnector};
pub use server::App;
