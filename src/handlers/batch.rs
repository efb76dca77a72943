//! 批量授权的 HTTP 处理器

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthContext,
    error::AppError,
    middleware::AppState,
    models::batch::{AssignLicenseRequest, UpdateQuantityRequest},
};

pub async fn list_batches(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let batches = state.batch_service.list_batches(&auth.user_id).await?;
    Ok(Json(json!({ "batches": batches, "count": batches.len() })))
}

pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state.batch_service.owned_batch(id, &auth.actor()).await?,
    ))
}

pub async fn delete_batch(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.batch_service.delete_batch(id, &auth.actor()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_licenses(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state.batch_service.list_licenses(id, &auth.actor()).await?,
    ))
}

pub async fn assign_license(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignLicenseRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let assignment = state
        .batch_service
        .assign(id, &auth.actor(), &req.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

pub async fn revoke_license(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, license_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let batch = state
        .batch_service
        .revoke(id, license_id, &auth.actor())
        .await?;
    Ok(Json(batch))
}

pub async fn update_quantity(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let batch = state
        .batch_service
        .update_quantity(id, &auth.actor(), req.quantity)
        .await?;
    Ok(Json(batch))
}

pub async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let batch = state.batch_service.cancel_batch(id, &auth.actor()).await?;
    Ok(Json(batch))
}
