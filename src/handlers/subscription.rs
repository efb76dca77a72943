//! 个人订阅的 HTTP 处理器

use axum::{
    body::Bytes,
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
    models::{
        batch::BulkPurchaseRequest,
        subscription::{CancelRequest, CheckoutOutcome, CheckoutRequest, UpgradeRequest},
    },
    services::subscription_service::CheckoutUrls,
};

/// 当前用户的全部订阅（含历史）
pub async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let subscriptions = state
        .subscription_service
        .list_user_subscriptions(&auth.user_id)
        .await?;
    Ok(Json(json!({
        "subscriptions": subscriptions,
        "count": subscriptions.len()
    })))
}

pub async fn checkout(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .subscription_service
        .checkout(
            &auth.user_id,
            &auth.roles,
            req.plan_id,
            CheckoutUrls {
                success_url: req.success_url,
                cancel_url: req.cancel_url,
            },
        )
        .await?;
    if let CheckoutOutcome::PendingPayment { checkout_url, .. } = &outcome {
        tracing::debug!(user_id = %auth.user_id, %checkout_url, "Checkout pending payment");
    }
    Ok(Json(outcome))
}

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(req): Json<UpgradeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .subscription_service
        .upgrade(
            &auth.user_id,
            &auth.roles,
            req.new_plan_id,
            req.proration_behavior,
        )
        .await?;
    Ok(Json(subscription))
}

/// 请求体可以省略，缺省在周期末取消
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let req: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))?
    };
    let subscription = state
        .subscription_service
        .cancel(&auth.user_id, id, req.immediate, auth.is_admin())
        .await?;
    Ok(Json(subscription))
}

pub async fn reactivate(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .subscription_service
        .reactivate(&auth.user_id, id, auth.is_admin())
        .await?;
    Ok(Json(subscription))
}

/// 主订阅
pub async fn current(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let (subscription, plan) = state
        .subscription_service
        .get_primary_user_subscription(&auth.user_id)
        .await?
        .ok_or_else(|| AppError::not_found("active subscription"))?;
    Ok(Json(json!({ "subscription": subscription, "plan": plan })))
}

/// 全部有效订阅及能力并集
pub async fn all_active(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let service = &state.subscription_service;
    let live = service.get_all_active(&auth.user_id).await?;
    let features = service.primary_feature_set(&auth.user_id).await?;
    let subscriptions: Vec<_> = live
        .into_iter()
        .map(|(subscription, plan)| json!({ "subscription": subscription, "plan": plan }))
        .collect();
    Ok(Json(json!({
        "subscriptions": subscriptions,
        "features": features
    })))
}

pub async fn usage(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let metrics = state.usage_service.list(&auth.user_id).await?;
    Ok(Json(json!({ "user_id": auth.user_id, "metrics": metrics })))
}

pub async fn purchase_bulk(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(req): Json<BulkPurchaseRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    state
        .resolver
        .authorize_bulk_purchase(&auth.user_id, &auth.roles)
        .await?
        .into_result()?;
    let purchase = state
        .batch_service
        .purchase_batch(&auth.actor(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(purchase)))
}
