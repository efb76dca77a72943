//! 管理端接口

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

use crate::{error::AppError, middleware::AppState, providers::UserRecord};

/// 身份服务的新用户通知：创建个人组织并开通终端席位
pub async fn onboard_user(
    State(state): State<Arc<AppState>>,
    Json(user): Json<UserRecord>,
) -> Result<impl IntoResponse, AppError> {
    if user.id.trim().is_empty() {
        return Err(AppError::validation("user id is required"));
    }
    let report = state.onboarding_service.on_user_created(&user).await?;
    Ok((StatusCode::CREATED, Json(report)))
}
