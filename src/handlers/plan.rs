//! 订阅计划的 HTTP 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthContext,
    error::AppError,
    middleware::AppState,
    models::plan::UpsertPlanRequest,
    services::PlanLookup,
};

#[derive(Debug, Default, Deserialize)]
pub struct ListPlansQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct PricingQuery {
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

/// 停用的计划只对管理员可见
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<ListPlansQuery>,
) -> Result<impl IntoResponse, AppError> {
    let include_inactive = query.include_inactive && auth.is_admin();
    let plans = state.plan_catalog.list_plans(include_inactive).await?;
    Ok(Json(json!({ "plans": plans, "count": plans.len() })))
}

pub async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.plan_catalog.get_plan(id).await?))
}

pub async fn create_plan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpsertPlanRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let plan = state.plan_catalog.create_plan(req).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn update_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpsertPlanRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    Ok(Json(state.plan_catalog.update_plan(id, req).await?))
}

pub async fn deactivate_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.plan_catalog.deactivate_plan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 阶梯价格预览
pub async fn pricing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<PricingQuery>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state.plan_catalog.price_preview(id, query.quantity).await?,
    ))
}
