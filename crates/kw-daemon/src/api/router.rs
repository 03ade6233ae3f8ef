//! HTTP route definitions

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};

use super::handlers::{connections, keys, repositories};
use crate::lifecycle::LifecycleManager;

/// Create the API router with all routes
pub fn create_router(manager: Arc<LifecycleManager>) -> Router {
    Router::new()
        // System key
        .route("/system-key", get(keys::get_key))
        .route("/system-key/generate", post(keys::generate))
        .route("/system-key/import", post(keys::import))
        .route("/system-key/impact", get(keys::impact))
        .route("/system-key/:id", delete(keys::delete))
        // Connections
        .route("/connections", get(connections::list))
        .route("/connections/stats", get(connections::stats))
        .route("/connections/deploy", post(connections::deploy))
        .route("/connections/test", post(connections::test_manual))
        .route(
            "/connections/refresh-storage",
            post(connections::refresh_missing),
        )
        .route(
            "/connections/:id",
            delete(connections::delete).put(connections::update),
        )
        .route("/connections/:id/impact", get(connections::impact))
        .route("/connections/:id/test", post(connections::test_existing))
        .route("/connections/:id/redeploy", post(connections::redeploy))
        .route(
            "/connections/:id/refresh-storage",
            post(connections::refresh_storage),
        )
        // Repositories
        .route(
            "/repositories",
            get(repositories::list).post(repositories::create),
        )
        .route("/repositories/:id", delete(repositories::delete))
        .with_state(manager)
}
