//! HTTP API server

use axum::routing::{delete, get, post};
use axum::Router;

pub mod handlers;
pub mod state;

pub use state::AppState;

/// Build the API router using the provided application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/initialize", post(handlers::initialize))
        .route("/add_embedding", post(handlers::add_embedding))
        .route("/search", post(handlers::search))
        .route("/embeddings/:embedding_id", delete(handlers::delete_embedding))
        .route("/stats/:client_id", get(handlers::stats))
        .route("/clients/:client_id", delete(handlers::deactivate_client))
        .with_state(state)
}
