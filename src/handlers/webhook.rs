//! 支付服务回调

use axum::{body::Bytes, extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::{error::AppError, middleware::AppState};

/// 签名校验由前置网关完成，这里只负责解析与分派
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.webhook_service.handle(&body).await?;
    Ok(Json(json!({ "received": true, "outcome": outcome })))
}
