//! 认证与授权中间件

use crate::{
    error::AppError,
    middleware::AppState,
    models::Actor,
    services::entitlement_resolver::{AccessFilter, Decision},
};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// 路由前缀，权限规则里的路径不带前缀
pub const API_PREFIX: &str = "/api/v1";

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<String>,
    pub email_verified: bool,
}

impl AuthContext {
    pub fn actor(&self) -> Actor {
        Actor::new(&self.user_id, self.roles.clone())
    }

    pub fn is_admin(&self) -> bool {
        self.actor().is_admin()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

// 在 handler 中直接提取 AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// 集合级读取的过滤条件，未经过滤时为 None
#[derive(Debug, Clone, Default)]
pub struct ListingFilter(pub Option<AccessFilter>);

impl<S> FromRequestParts<S> for ListingFilter
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ListingFilter>()
            .cloned()
            .unwrap_or_default())
    }
}

/// 从 Authorization 头提取令牌（scheme 不区分大小写）
pub fn extract_token(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| {
            let (scheme, token) = s.split_once(' ')?;
            if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
                Some(token.trim().to_string())
            } else {
                None
            }
        })
        .ok_or(AppError::Unauthorized)
}

/// JWT 认证中间件 - 必须认证
pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(req.headers())?;
    let claims = state.jwt_service.validate(&token)?;

    req.extensions_mut().insert(AuthContext {
        user_id: claims.sub,
        roles: claims.roles,
        email_verified: claims.email_verified,
    });

    Ok(next.run(req).await)
}

/// 去掉 API 前缀后的路径
pub fn policy_path(path: &str) -> &str {
    match path.strip_prefix(API_PREFIX) {
        Some("") => "/",
        Some(rest) => rest,
        None => path,
    }
}

/// 权限中间件：按路径和方法询问授权引擎
pub async fn permission_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth = req
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or(AppError::Unauthorized)?;
    let method = req.method().as_str().to_string();
    let path = policy_path(req.uri().path()).to_string();

    let decision = state
        .resolver
        .authorize(&auth.user_id, &auth.roles, &method, &path)
        .await?;

    if let Decision::Deny(reason) = &decision {
        tracing::debug!(
            user_id = %auth.user_id,
            %method,
            %path,
            ?reason,
            "Request denied"
        );
    }
    let filter = decision.into_result()?;
    req.extensions_mut().insert(ListingFilter(filter));

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer test_token_123".parse().unwrap());
        assert_eq!(extract_token(&headers).unwrap(), "test_token_123");

        headers.insert("authorization", "bearer lower_case".parse().unwrap());
        assert_eq!(extract_token(&headers).unwrap(), "lower_case");
    }

    #[test]
    fn test_extract_token_missing() {
        let headers = HeaderMap::new();
        assert!(extract_token(&headers).is_err());
    }

    #[test]
    fn test_extract_token_invalid_format() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "InvalidFormat".parse().unwrap());
        assert!(extract_token(&headers).is_err());

        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(extract_token(&headers).is_err());
    }

    #[test]
    fn test_policy_path() {
        assert_eq!(policy_path("/api/v1/organizations"), "/organizations");
        assert_eq!(policy_path("/api/v1"), "/");
        assert_eq!(policy_path("/health"), "/health");
    }
}
