//! Subscription ledger models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::SubscriptionPlan;

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    /// 等待支付服务确认
    Incomplete,
}

impl SubscriptionStatus {
    /// active / trialing 计入有效订阅
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    /// 支付服务状态字符串映射
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" => Some(SubscriptionStatus::Cancelled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }
}

/// 订阅来源类型（数据库列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Personal,
    Assigned,
}

/// 订阅来源：个人购买或从批量授权分配
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionSource {
    Personal,
    Assigned { batch_id: Uuid, assignor: String },
}

/// 用户订阅
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSubscription {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: Uuid,
    pub subscription_type: SubscriptionType,
    pub batch_id: Option<Uuid>,
    pub assigned_by: Option<String>,
    /// 免费计划为空
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSubscription {
    /// 按计划价格决定初始状态：免费立即生效，付费等待确认
    pub fn new(user_id: &str, plan: &SubscriptionPlan, source: SubscriptionSource) -> Self {
        let now = Utc::now();
        let (subscription_type, batch_id, assigned_by) = match source {
            SubscriptionSource::Personal => (SubscriptionType::Personal, None, None),
            SubscriptionSource::Assigned { batch_id, assignor } => {
                (SubscriptionType::Assigned, Some(batch_id), Some(assignor))
            }
        };
        let status = if plan.is_free() || subscription_type == SubscriptionType::Assigned {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Incomplete
        };
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            plan_id: plan.id,
            subscription_type,
            batch_id,
            assigned_by,
            provider_subscription_id: None,
            provider_customer_id: None,
            status,
            current_period_start: now,
            // 免费计划按一年周期处理
            current_period_end: now + Duration::days(365),
            trial_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source(&self) -> SubscriptionSource {
        match (self.subscription_type, self.batch_id, &self.assigned_by) {
            (SubscriptionType::Assigned, Some(batch_id), Some(assignor)) => {
                SubscriptionSource::Assigned {
                    batch_id,
                    assignor: assignor.clone(),
                }
            }
            _ => SubscriptionSource::Personal,
        }
    }

    pub fn is_personal(&self) -> bool {
        self.subscription_type == SubscriptionType::Personal
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// 组织订阅
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrganizationSubscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    /// 席位数
    pub quantity: i32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationSubscription {
    pub fn new(organization_id: Uuid, plan: &SubscriptionPlan, quantity: i32, status: SubscriptionStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            plan_id: plan.id,
            provider_subscription_id: None,
            provider_customer_id: None,
            status,
            quantity: quantity.max(1),
            current_period_start: now,
            current_period_end: now + Duration::days(365),
            trial_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 升级时的按比例计费方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    AlwaysInvoice,
    #[default]
    CreateProrations,
    None,
}

impl ProrationBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationBehavior::AlwaysInvoice => "always_invoice",
            ProrationBehavior::CreateProrations => "create_prorations",
            ProrationBehavior::None => "none",
        }
    }
}

/// 计划变更时对支付服务订阅标识的处理
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderBinding {
    #[default]
    Keep,
    /// 免费升级付费时绑定新建的支付订阅
    Bind {
        subscription_id: String,
        customer_id: String,
    },
    /// 降级到免费计划时解除绑定（保留客户标识）
    Detach,
}

impl ProviderBinding {
    /// (是否改写, 订阅标识, 客户标识)
    pub fn columns(&self) -> (bool, Option<&str>, Option<&str>) {
        match self {
            ProviderBinding::Keep => (false, None, None),
            ProviderBinding::Bind {
                subscription_id,
                customer_id,
            } => (true, Some(subscription_id), Some(customer_id)),
            ProviderBinding::Detach => (true, None, None),
        }
    }
}

/// 计划变更：账本行更新与用量上限重写在同一事务中提交
#[derive(Debug, Clone)]
pub struct PlanChange {
    pub subscription_id: Uuid,
    pub user_id: String,
    /// CAS 条件
    pub expected_plan_id: Uuid,
    pub expected_status: SubscriptionStatus,
    pub new_plan_id: Uuid,
    pub new_status: SubscriptionStatus,
    pub provider: ProviderBinding,
    /// 新的计费周期，None 保持不变
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limits: Vec<(super::usage::MetricType, i64)>,
}

/// 结账结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// 免费计划立即生效
    Activated { subscription: UserSubscription },
    /// 付费计划需要跳转支付页面
    PendingPayment {
        subscription: UserSubscription,
        checkout_url: String,
    },
}

/// 结账请求
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckoutRequest {
    pub plan_id: Uuid,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// 升级请求
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpgradeRequest {
    pub new_plan_id: Uuid,
    #[serde(default)]
    pub proration_behavior: ProrationBehavior,
}

/// 取消请求
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

/// 组织订阅请求
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrganizationSubscribeRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub quantity: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(SubscriptionStatus::from_provider("canceled"), Some(SubscriptionStatus::Cancelled));
        assert_eq!(SubscriptionStatus::from_provider("unpaid"), Some(SubscriptionStatus::PastDue));
        assert_eq!(SubscriptionStatus::from_provider("paused"), None);
    }

    #[test]
    fn test_live_statuses() {
        assert!(SubscriptionStatus::Active.is_live());
        assert!(SubscriptionStatus::Trialing.is_live());
        assert!(!SubscriptionStatus::Incomplete.is_live());
        assert!(!SubscriptionStatus::Cancelled.is_live());
    }
}
