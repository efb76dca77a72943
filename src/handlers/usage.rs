//! 用量与能力查询的 HTTP 处理器

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::{
    auth::AuthContext,
    error::AppError,
    middleware::AppState,
    models::usage::{IncrementUsageRequest, MetricType},
    services::permission_service::METERING_ROLE,
};

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    #[serde(default = "default_increment")]
    pub increment: i64,
}

fn default_increment() -> i64 {
    1
}

pub async fn list_metrics(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let metrics = state.usage_service.list(&auth.user_id).await?;
    Ok(Json(json!({ "metrics": metrics, "count": metrics.len() })))
}

pub async fn check_limit(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(metric): Path<String>,
    Query(query): Query<CheckQuery>,
) -> Result<impl IntoResponse, AppError> {
    let metric = metric.parse::<MetricType>()?;
    let check = state
        .usage_service
        .check(&auth.user_id, metric, query.increment)
        .await?;
    Ok(Json(check))
}

/// 计量方上报用量；超限返回 LIMIT_EXCEEDED
///
/// 只接受计量服务或管理员，负数 delta 用于释放并发类资源。
pub async fn increment(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(req): Json<IncrementUsageRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !auth.is_admin() && !auth.has_role(METERING_ROLE) {
        return Err(AppError::forbidden("Usage can only be reported by a metering service"));
    }
    if req.delta == 0 {
        return Err(AppError::validation("delta must not be zero"));
    }
    let user_id = match req.user_id.as_deref().map(str::trim) {
        Some("") => return Err(AppError::validation("user_id must not be blank")),
        Some(user_id) => user_id.to_string(),
        None => auth.user_id.clone(),
    };

    let metric = state
        .usage_service
        .increment(&user_id, req.metric_type, req.delta)
        .await?;
    Ok(Json(metric))
}

/// 合并个人订阅与组织订阅后的能力
pub async fn my_features(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.resolver.effective_features(&auth.user_id).await?))
}
