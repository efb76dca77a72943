//! 统一错误模型
//! 定义所有错误类型、稳定错误码和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    Unauthorized,

    /// 已认证但无权限，携带可读原因
    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// 名称重复、已是成员、超出容量分配等
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 组织 / 群组 / 订阅上限已满
    #[error("Limit reached: {0}")]
    LimitReached(String),

    /// 实体未激活、已过期或已取消
    #[error("Invalid state: {0}")]
    State(String),

    /// 支付或身份服务错误
    #[error("External service failure: {0}")]
    ExternalFailure(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::LimitReached(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Validation(_) | AppError::InvalidRole(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Conflict(_) | AppError::State(_) => StatusCode::CONFLICT,
            AppError::ExternalFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Unauthorized => "Authentication failed".to_string(),
            AppError::Forbidden(reason) => format!("Permission denied: {}", reason),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::BadRequest(msg)
            | AppError::Validation(msg)
            | AppError::Conflict(msg)
            | AppError::LimitReached(msg)
            | AppError::State(msg) => msg.clone(),
            AppError::InvalidRole(role) => format!("Invalid role: {}", role),
            AppError::ExternalFailure(_) => "External service unavailable".to_string(),
            AppError::Timeout(msg) => format!("Request timeout: {}", msg),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden(_) => "PERMISSION_DENIED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) | AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidRole(_) => "INVALID_ROLE",
            AppError::Conflict(_) => "CONFLICT",
            AppError::LimitReached(_) => "LIMIT_EXCEEDED",
            AppError::State(_) => "INVALID_STATE",
            AppError::ExternalFailure(_) => "EXTERNAL_FAILURE",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn forbidden(reason: &str) -> Self {
        AppError::Forbidden(reason.to_string())
    }

    pub fn conflict(msg: &str) -> Self {
        AppError::Conflict(msg.to_string())
    }

    pub fn limit_reached(msg: &str) -> Self {
        AppError::LimitReached(msg.to_string())
    }

    pub fn state(msg: &str) -> Self {
        AppError::State(msg.to_string())
    }

    pub fn external(msg: &str) -> Self {
        AppError::ExternalFailure(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    pub fn timeout(msg: &str) -> Self {
        AppError::Timeout(msg.to_string())
    }

    /// 成员关系常用错误
    pub fn already_member() -> Self {
        AppError::Conflict("User is already a member".to_string())
    }

    pub fn owner_only(action: &str) -> Self {
        AppError::Forbidden(format!("Only the owner can {}", action))
    }

    pub fn entity_expired(entity: &str) -> Self {
        AppError::State(format!("{} has expired and is read-only", entity))
    }

    pub fn usage_limit_exceeded(current: i64, limit: i64) -> Self {
        AppError::LimitReached(format!(
            "Usage limit exceeded. Current: {}, Limit: {}",
            current, limit
        ))
    }

    /// 是否为需要告警的服务端错误
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        if self.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::debug!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        (status, Json(error_response)).into_response()
    }
}

/// 从 String 转换为 AppError::Config
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Config(s)
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::forbidden("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::conflict("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::limit_reached("x").code(), "LIMIT_EXCEEDED");
        assert_eq!(AppError::InvalidRole("boss".into()).code(), "INVALID_ROLE");
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));

        let error = AppError::external("stripe: sk_live_secret rejected");
        assert!(!error.user_message().contains("sk_live"));
    }

    #[test]
    fn test_usage_limit_message() {
        let error = AppError::usage_limit_exceeded(3, 3);
        assert_eq!(error.user_message(), "Usage limit exceeded. Current: 3, Limit: 3");
    }
}
