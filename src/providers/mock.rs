//! Mock collaborators for development and testing

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    CheckoutSession, CheckoutSessionRequest, IdentityProvider, PaymentProvider, ProviderError,
    ProviderSubscription, SeatProvisioner, UserRecord,
};
use crate::models::subscription::{ProrationBehavior, SubscriptionStatus};

#[derive(Default)]
struct PaymentState {
    failure: Option<ProviderError>,
    delay: Option<std::time::Duration>,
    missing: HashSet<String>,
    customers: HashMap<String, String>,
    calls: Vec<String>,
}

/// Mock payment provider
///
/// 结账页面直接跳转到 success_url；可以注入失败和延迟。
#[derive(Default)]
pub struct MockPaymentProvider {
    state: Mutex<PaymentState>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的每次调用都返回该错误，传 None 恢复
    pub fn fail_with(&self, failure: Option<ProviderError>) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = failure;
        }
    }

    /// 每次调用前等待
    pub fn delay(&self, delay: Option<std::time::Duration>) {
        if let Ok(mut state) = self.state.lock() {
            state.delay = delay;
        }
    }

    /// 该订阅在支付服务中不存在
    pub fn mark_missing(&self, subscription_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.missing.insert(subscription_id.to_string());
        }
    }

    /// 已记录的调用，格式为 "method:argument"
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    async fn enter(&self, call: String, subscription_id: Option<&str>) -> Result<(), ProviderError> {
        let delay = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ProviderError::Unavailable("mock state poisoned".to_string()))?;
            state.calls.push(call);
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self
            .state
            .lock()
            .map_err(|_| ProviderError::Unavailable("mock state poisoned".to_string()))?;
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        if let Some(id) = subscription_id {
            if state.missing.contains(id) {
                return Err(ProviderError::NotFound(format!("subscription {}", id)));
            }
        }
        Ok(())
    }

    fn subscription(id: &str, customer_id: &str) -> ProviderSubscription {
        let now = Utc::now();
        ProviderSubscription {
            subscription_id: id.to_string(),
            customer_id: customer_id.to_string(),
            item_id: Some(format!("si_mock_{}", Uuid::new_v4().simple())),
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now + Duration::days(30),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn ensure_customer(&self, user_id: &str, _email: &str, _name: &str) -> Result<String, ProviderError> {
        self.enter(format!("ensure_customer:{}", user_id), None).await?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProviderError::Unavailable("mock state poisoned".to_string()))?;
        let customer_id = state
            .customers
            .entry(user_id.to_string())
            .or_insert_with(|| format!("cus_mock_{}", Uuid::new_v4().simple()))
            .clone();
        Ok(customer_id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        self.enter(format!("create_checkout_session:{}", request.price_id), None)
            .await?;
        let session_id = format!("cs_mock_{}", Uuid::new_v4().simple());
        let checkout_url = format!("{}?session_id={}", request.success_url, session_id);

        tracing::info!(
            customer_id = %request.customer_id,
            price_id = %request.price_id,
            quantity = request.quantity,
            "Mock checkout session created"
        );

        Ok(CheckoutSession {
            session_id,
            checkout_url,
        })
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: i32,
        _metadata: &HashMap<String, String>,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter(format!("create_subscription:{}:{}", price_id, quantity), None)
            .await?;
        let id = format!("sub_mock_{}", Uuid::new_v4().simple());
        Ok(Self::subscription(&id, customer_id))
    }

    async fn update_subscription_plan(
        &self,
        subscription_id: &str,
        price_id: &str,
        proration: ProrationBehavior,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter(
            format!("update_subscription_plan:{}:{}", subscription_id, price_id),
            Some(subscription_id),
        )
        .await?;
        tracing::info!(subscription_id, price_id, proration = proration.as_str(), "Mock plan updated");
        Ok(Self::subscription(subscription_id, "cus_mock"))
    }

    async fn update_quantity(
        &self,
        subscription_id: &str,
        _item_id: Option<&str>,
        quantity: i32,
    ) -> Result<(), ProviderError> {
        self.enter(
            format!("update_quantity:{}:{}", subscription_id, quantity),
            Some(subscription_id),
        )
        .await
    }

    async fn cancel_subscription(&self, subscription_id: &str, at_period_end: bool) -> Result<(), ProviderError> {
        self.enter(
            format!("cancel_subscription:{}:{}", subscription_id, at_period_end),
            Some(subscription_id),
        )
        .await
    }

    async fn resume_subscription(&self, subscription_id: &str) -> Result<(), ProviderError> {
        self.enter(format!("resume_subscription:{}", subscription_id), Some(subscription_id))
            .await
    }
}

/// Mock identity provider
///
/// 宽松模式下未登记的用户也会被解析，邮箱为 `{id}@localhost`。
pub struct MockIdentityProvider {
    users: Mutex<HashMap<String, UserRecord>>,
    permissive: bool,
}

impl MockIdentityProvider {
    pub fn permissive() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            permissive: true,
        }
    }

    pub fn strict() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            permissive: false,
        }
    }

    pub fn register(&self, user_id: &str, email: &str) {
        if let Ok(mut users) = self.users.lock() {
            users.insert(
                user_id.to_string(),
                UserRecord {
                    id: user_id.to_string(),
                    email: email.to_string(),
                    name: user_id.to_string(),
                },
            );
        }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn get_user(&self, user_id: &str) -> Result<UserRecord, ProviderError> {
        let users = self
            .users
            .lock()
            .map_err(|_| ProviderError::Unavailable("identity state poisoned".to_string()))?;
        match users.get(user_id) {
            Some(user) => Ok(user.clone()),
            None if self.permissive => Ok(UserRecord {
                id: user_id.to_string(),
                email: format!("{}@localhost", user_id),
                name: user_id.to_string(),
            }),
            None => Err(ProviderError::NotFound(format!("user {}", user_id))),
        }
    }

    async fn find_by_email(&self, email: &str) -> Result<UserRecord, ProviderError> {
        let users = self
            .users
            .lock()
            .map_err(|_| ProviderError::Unavailable("identity state poisoned".to_string()))?;
        users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("user with email {}", email)))
    }
}

/// Mock terminal seat provisioner
#[derive(Default)]
pub struct MockSeatProvisioner {
    provisioned: Mutex<Vec<String>>,
    failure: Mutex<Option<ProviderError>>,
}

impl MockSeatProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, failure: Option<ProviderError>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned
            .lock()
            .map(|users| users.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SeatProvisioner for MockSeatProvisioner {
    async fn provision_user(&self, user: &UserRecord) -> Result<(), ProviderError> {
        if let Ok(failure) = self.failure.lock() {
            if let Some(err) = failure.as_ref() {
                return Err(err.clone());
            }
        }
        if let Ok(mut provisioned) = self.provisioned.lock() {
            provisioned.push(user.id.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_customer_is_stable() {
        let provider = MockPaymentProvider::new();
        let first = provider.ensure_customer("u1", "u1@x", "u1").await.unwrap();
        let second = provider.ensure_customer("u1", "u1@x", "u1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_subscription() {
        let provider = MockPaymentProvider::new();
        provider.mark_missing("sub_gone");
        let err = provider.cancel_subscription("sub_gone", false).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(provider.cancel_subscription("sub_other", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_strict_identity() {
        let identity = MockIdentityProvider::strict();
        identity.register("u1", "u1@example.com");
        assert!(identity.get_user("u1").await.is_ok());
        assert!(identity.get_user("u2").await.unwrap_err().is_not_found());
        assert_eq!(identity.find_by_email("U1@example.com").await.unwrap().id, "u1");
    }
}
