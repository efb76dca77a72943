//! External collaborators
//!
//! 支付、身份、终端服务只以 trait 的形式出现，核心逻辑不依赖具体实现。
//! 开发与测试环境使用 mock 实现。

pub mod mock;

pub use mock::{MockIdentityProvider, MockPaymentProvider, MockSeatProvisioner};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::{
    error::AppError,
    models::subscription::{ProrationBehavior, SubscriptionStatus},
};

/// 外部服务错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::ExternalFailure(err.to_string())
    }
}

/// 托管结账页面
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
}

/// 创建结账页面的参数
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: i32,
    pub trial_days: i32,
    pub success_url: String,
    pub cancel_url: String,
    /// 回调时用于关联账本行
    pub metadata: HashMap<String, String>,
}

/// 支付服务中的订阅
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub subscription_id: String,
    pub customer_id: String,
    /// 数量调整时使用
    pub item_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}

/// 支付服务
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// 创建或复用用户对应的客户
    async fn ensure_customer(&self, user_id: &str, email: &str, name: &str) -> Result<String, ProviderError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError>;

    /// 直接创建带数量的订阅（批量授权）
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: i32,
        metadata: &HashMap<String, String>,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn update_subscription_plan(
        &self,
        subscription_id: &str,
        price_id: &str,
        proration: ProrationBehavior,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn update_quantity(
        &self,
        subscription_id: &str,
        item_id: Option<&str>,
        quantity: i32,
    ) -> Result<(), ProviderError>;

    async fn cancel_subscription(&self, subscription_id: &str, at_period_end: bool) -> Result<(), ProviderError>;

    async fn resume_subscription(&self, subscription_id: &str) -> Result<(), ProviderError>;
}

/// 身份服务中的用户记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// 身份服务
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<UserRecord, ProviderError>;
    async fn find_by_email(&self, email: &str) -> Result<UserRecord, ProviderError>;
}

/// 终端服务：新用户的席位开通
#[async_trait]
pub trait SeatProvisioner: Send + Sync {
    async fn provision_user(&self, user: &UserRecord) -> Result<(), ProviderError>;
}
