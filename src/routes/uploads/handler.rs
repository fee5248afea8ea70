use axum::{
    Json,
    extract::{Extension, State},
    http::StatusCode,
};

use crate::{
    AppState,
    error::{AppError, AppResult},
    session::{FamilyScope, Identity},
    storage::{UploadRequest, UploadResult, UploadTarget},
};

type UploadResponse = AppResult<(StatusCode, Json<UploadResult>)>;

async fn store(state: &AppState, scope: &FamilyScope, target: UploadTarget, req: &UploadRequest) -> UploadResponse {
    let uploader = state
        .uploader
        .as_ref()
        .ok_or_else(|| AppError::internal("Хранилище файлов не настроено"))?;
    let result = uploader.upload(scope, target, req).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

#[axum::debug_handler]
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UploadRequest>,
) -> UploadResponse {
    let scope = identity.family()?;
    let target = UploadTarget::General {
        folder: req.folder.clone().unwrap_or_default(),
    };
    store(&state, &scope, target, &req).await
}

#[axum::debug_handler]
pub async fn upload_medical(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UploadRequest>,
) -> UploadResponse {
    let scope = identity.family()?;
    let child_id = req
        .child_id
        .ok_or_else(|| AppError::bad_request("child_id обязателен"))?;
    let target = UploadTarget::Medical {
        child_id,
        doc_type: req.doc_type.clone().unwrap_or_default(),
    };
    store(&state, &scope, target, &req).await
}

#[axum::debug_handler]
pub async fn upload_trip_photo(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UploadRequest>,
) -> UploadResponse {
    let scope = identity.family()?;
    let trip_id = req
        .trip_id
        .ok_or_else(|| AppError::bad_request("trip_id обязателен"))?;
    store(&state, &scope, UploadTarget::TripPhoto { trip_id }, &req).await
}

#[axum::debug_handler]
pub async fn upload_family_logo(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UploadRequest>,
) -> UploadResponse {
    let scope = identity.family()?;
    scope.require_manager()?;
    store(&state, &scope, UploadTarget::FamilyLogo, &req).await
}
