//! Connection handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use kw_core::api::{
    ApiError, ConnectionImpact, ConnectionStats, ConnectionView, DeployRequest, RedeployRequest,
    RedeployResponse, RefreshStorageResponse, ScheduledResponse, TestConnectionRequest,
    TestConnectionResponse, TestExistingResponse,
};
use kw_core::types::{ConnectionFields, SshConnection};
use kw_core::{ConnectionId, ConnectionStatus};

use crate::api::error::status_of;
use crate::api::{failure, ApiFailure, ApiResult};
use crate::lifecycle::LifecycleManager;

/// GET /connections - List connections with their key names.
pub async fn list(State(manager): State<Arc<LifecycleManager>>) -> Json<Vec<ConnectionView>> {
    Json(manager.list_connections().await)
}

/// GET /connections/stats - Status counts.
pub async fn stats(State(manager): State<Arc<LifecycleManager>>) -> Json<ConnectionStats> {
    Json(manager.connection_stats().await)
}

/// POST /connections/deploy - Install the system key with a password.
pub async fn deploy(
    State(manager): State<Arc<LifecycleManager>>,
    Json(req): Json<DeployRequest>,
) -> ApiResult<SshConnection> {
    manager.deploy(req).await.map(Json).map_err(failure)
}

/// POST /connections/test - Probe an unregistered target with the system key.
pub async fn test_manual(
    State(manager): State<Arc<LifecycleManager>>,
    Json(req): Json<TestConnectionRequest>,
) -> ApiResult<TestConnectionResponse> {
    manager.test_manual(req).await.map(Json).map_err(failure)
}

/// POST /connections/refresh-storage - Schedule refreshes for connections without telemetry.
pub async fn refresh_missing(
    State(manager): State<Arc<LifecycleManager>>,
) -> Json<ScheduledResponse> {
    Json(ScheduledResponse {
        scheduled: manager.schedule_missing_storage(),
    })
}

/// PUT /connections/:id - Edit metadata and re-probe.
pub async fn update(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<ConnectionId>,
    Json(fields): Json<ConnectionFields>,
) -> ApiResult<SshConnection> {
    manager
        .update_connection(id, fields)
        .await
        .map(Json)
        .map_err(failure)
}

/// DELETE /connections/:id - Remove a connection.
pub async fn delete(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<ConnectionId>,
) -> Result<StatusCode, ApiFailure> {
    manager
        .delete_connection(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure)
}

/// GET /connections/:id/impact - Dependents of a connection.
pub async fn impact(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<ConnectionId>,
) -> ApiResult<ConnectionImpact> {
    manager.connection_impact(id).map(Json).map_err(failure)
}

/// POST /connections/:id/test - Re-probe a registered connection.
pub async fn test_existing(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<ConnectionId>,
) -> ApiResult<TestExistingResponse> {
    let conn = manager.test_existing(id).await.map_err(failure)?;
    Ok(Json(TestExistingResponse {
        success: conn.status == ConnectionStatus::Connected,
        status: conn.status,
        error_message: conn.error_message,
    }))
}

/// POST /connections/:id/redeploy - Re-install the current key with a password.
pub async fn redeploy(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<ConnectionId>,
    Json(req): Json<RedeployRequest>,
) -> Result<Json<RedeployResponse>, (StatusCode, Json<RedeployResponse>)> {
    match manager.redeploy(id, &req.password).await {
        Ok(conn) => Ok(Json(RedeployResponse {
            success: true,
            connection: Some(conn),
            error: None,
        })),
        Err(e) => Err((
            status_of(&e),
            Json(RedeployResponse {
                success: false,
                connection: None,
                error: Some(ApiError::from(&e)),
            }),
        )),
    }
}

/// POST /connections/:id/refresh-storage - Query remote capacity.
pub async fn refresh_storage(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<ConnectionId>,
) -> ApiResult<RefreshStorageResponse> {
    manager.refresh_storage(id).await.map(Json).map_err(failure)
}
