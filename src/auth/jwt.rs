//! JWT token validation
//! 令牌由身份服务签发，这里只校验并取出用户上下文

use crate::{config::AppConfig, error::AppError};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// User roles
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub email_verified: bool,

    /// Issued at
    pub iat: i64,

    /// Expiration
    pub exp: i64,
}

/// JWT service
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Result<Self, AppError> {
        // HS256 至少 32 字节
        if secret.len() < 32 {
            return Err(AppError::Config("JWT secret too short (min 32 chars)".to_string()));
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(config.security.jwt_secret.expose_secret())
    }

    /// 签发令牌（本地开发和测试使用）
    pub fn issue(
        &self,
        user_id: &str,
        roles: Vec<String>,
        email_verified: bool,
        ttl: Duration,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            roles,
            email_verified,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!("Failed to encode token: {:?}", e);
            AppError::Internal(format!("Failed to encode token: {}", e))
        })
    }

    /// Validate and decode token
    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map_err(|e| {
                tracing::debug!("Token validation failed: {:?}", e);
                AppError::Unauthorized
            })?
            .claims;

        if claims.sub.trim().is_empty() {
            return Err(AppError::Unauthorized);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret_key_32_characters_long!";

    #[test]
    fn test_issue_and_validate() {
        let service = JwtService::new(SECRET).unwrap();
        let token = service
            .issue("user-1", vec!["administrator".to_string()], true, Duration::minutes(5))
            .unwrap();

        let claims = service.validate(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.email_verified);
        assert!(claims.roles.contains(&"administrator".to_string()));
    }

    #[test]
    fn test_expired_token_fails() {
        let service = JwtService::new(SECRET).unwrap();
        let token = service
            .issue("user-1", vec![], false, Duration::minutes(-10))
            .unwrap();
        assert!(service.validate(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let issuer = JwtService::new(SECRET).unwrap();
        let other = JwtService::new("another_secret_key_with_32_characters").unwrap();
        let token = issuer.issue("user-1", vec![], false, Duration::minutes(5)).unwrap();
        assert!(other.validate(&token).is_err());
        assert!(issuer.validate("invalid_token").is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(JwtService::new("short").is_err());
    }
}
