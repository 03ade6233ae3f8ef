//! System key handlers

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use kw_core::api::{
    GenerateKeyRequest, ImportKeyRequest, KeyDeletedResponse, KeyImpact, SystemKeyResponse,
};
use kw_core::types::SystemSshKey;
use kw_core::KeyId;

use crate::api::{failure, ApiResult};
use crate::lifecycle::LifecycleManager;

/// GET /system-key - Public projection of the system key.
pub async fn get_key(State(manager): State<Arc<LifecycleManager>>) -> Json<SystemKeyResponse> {
    let key = manager.system_key().await;
    Json(SystemKeyResponse {
        exists: key.is_some(),
        key,
    })
}

/// POST /system-key/generate - Generate a new system key.
pub async fn generate(
    State(manager): State<Arc<LifecycleManager>>,
    Json(req): Json<GenerateKeyRequest>,
) -> ApiResult<SystemSshKey> {
    manager
        .generate_key(&req.key_type, req.name, req.description)
        .await
        .map(Json)
        .map_err(failure)
}

/// POST /system-key/import - Import a keypair from disk.
pub async fn import(
    State(manager): State<Arc<LifecycleManager>>,
    Json(req): Json<ImportKeyRequest>,
) -> ApiResult<SystemSshKey> {
    manager
        .import_key(
            FsPath::new(&req.private_key_path),
            req.public_key_path.as_deref().map(FsPath::new),
            req.name,
            req.description,
        )
        .await
        .map(Json)
        .map_err(failure)
}

/// DELETE /system-key/:id - Delete the key and revoke it everywhere.
pub async fn delete(
    State(manager): State<Arc<LifecycleManager>>,
    Path(id): Path<KeyId>,
) -> ApiResult<KeyDeletedResponse> {
    manager.delete_key(id).await.map(Json).map_err(failure)
}

/// GET /system-key/impact - Dependents of the current key.
pub async fn impact(State(manager): State<Arc<LifecycleManager>>) -> ApiResult<KeyImpact> {
    manager.key_impact().await.map(Json).map_err(failure)
}
