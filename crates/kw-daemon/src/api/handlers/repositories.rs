//! Repository reference handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use kw_core::api::CreateRepositoryRequest;
use kw_core::types::RepositoryRef;
use kw_core::RepositoryId;

use crate::api::{failure, ApiFailure, ApiResult};
use crate::lifecycle::LifecycleManager;

/// GET /repositories - List repository references.
pub async fn list(State(manager): State<Arc<LifecycleManager>>) -> Json<Vec<RepositoryRef>> {
    Json(manager.list_repositories().await)
}

/// POST /repositories - Register a repository bound to the current key.
pub async fn create(
    State(manager): State<Arc<LifecycleManager>>,
    Json(req): Json<CreateRepositoryRequest>,
) -> ApiResult<RepositoryRef> {
    manager.create_repository(req).await.map(Json).map_err(failure)
}

/// DELETE /repositories/:id - Remove a repository reference.
pub async fn delete(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<RepositoryId>,
) -> Result<StatusCode, ApiFailure> {
    manager
        .delete_repository(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure)
}
