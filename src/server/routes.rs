//! Client registry endpoints
//!
//! `GET /clients` lists initialized clients, `POST /clients/{name}` opens a
//! client ahead of its first use and reports what was opened.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use super::response::{ok_json, ApiError};
use crate::registry::ClientRegistry;

/// Router for client management, nested wherever the service wants it
pub fn create_router(registry: Arc<ClientRegistry>) -> Router {
    Router::new()
        .route("/clients", get(list_clients))
        .route("/clients/{name}", post(warm_client))
        .with_state(registry)
}

async fn list_clients(State(registry): State<Arc<ClientRegistry>>) -> Response {
    ok_json(registry.names())
}

async fn warm_client(
    State(registry): State<Arc<ClientRegistry>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let client = registry.get(&name).await?;
    Ok(ok_json(client.describe()))
}
