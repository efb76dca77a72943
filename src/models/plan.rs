//! Subscription plan models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::cmp::Ordering;
use uuid::Uuid;

use super::usage::MetricType;

/// 计费周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_interval", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

/// 阶梯价格（区间两端闭合，max_quantity = 0 表示无上限）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub min_quantity: i32,
    pub max_quantity: i32,
    /// 单价（分）
    pub unit_amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PricingTier {
    pub fn is_open_ended(&self) -> bool {
        self.max_quantity == 0
    }
}

/// 订阅计划
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// 数值越大计划越丰富
    pub priority: i32,
    /// 单价（分）
    pub price_amount: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub trial_days: i32,
    /// 支付服务中的价格标识
    pub provider_price_id: Option<String>,
    /// 不透明的能力标签
    pub features: Json<Vec<String>>,

    // 数值上限（-1 表示不限）
    pub max_concurrent_terminals: i32,
    pub max_courses: i32,
    pub max_lab_sessions: i32,
    pub max_concurrent_users: i32,
    pub max_session_duration_minutes: i32,
    pub data_persistence_gb: i32,
    pub command_history_retention_days: i32,

    // 开关
    pub network_access_enabled: bool,
    pub data_persistence_enabled: bool,
    pub allowed_machine_sizes: Json<Vec<String>>,

    pub use_tiered_pricing: bool,
    pub pricing_tiers: Json<Vec<PricingTier>>,

    /// 购买此计划需要的角色
    pub required_role: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    pub fn is_free(&self) -> bool {
        self.price_amount == 0
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    /// 指标对应的计划上限
    pub fn cap_for(&self, metric: MetricType) -> i64 {
        i64::from(match metric {
            MetricType::ConcurrentTerminals => self.max_concurrent_terminals,
            MetricType::CoursesCreated => self.max_courses,
            MetricType::LabSessions => self.max_lab_sessions,
            MetricType::ConcurrentUsers => self.max_concurrent_users,
        })
    }

    /// 所有指标的上限，用于重写用量限制
    pub fn metric_limits(&self) -> Vec<(MetricType, i64)> {
        MetricType::ALL
            .iter()
            .map(|metric| (*metric, self.cap_for(*metric)))
            .collect()
    }

    pub fn caps(&self) -> PlanCaps {
        PlanCaps {
            max_concurrent_terminals: self.max_concurrent_terminals,
            max_courses: self.max_courses,
            max_lab_sessions: self.max_lab_sessions,
            max_concurrent_users: self.max_concurrent_users,
            max_session_duration_minutes: self.max_session_duration_minutes,
            data_persistence_gb: self.data_persistence_gb,
            command_history_retention_days: self.command_history_retention_days,
        }
    }

    /// 计划之间的全序：优先级，其次并发终端数，再按名称字母序（靠前者胜）
    pub fn precedence(&self, other: &SubscriptionPlan) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| {
                self.max_concurrent_terminals
                    .cmp(&other.max_concurrent_terminals)
            })
            .then_with(|| other.name.cmp(&self.name))
    }
}

/// 数值上限集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlanCaps {
    pub max_concurrent_terminals: i32,
    pub max_courses: i32,
    pub max_lab_sessions: i32,
    pub max_concurrent_users: i32,
    pub max_session_duration_minutes: i32,
    pub data_persistence_gb: i32,
    pub command_history_retention_days: i32,
}

/// 合并两个上限：-1 优先，否则取大
pub fn merge_cap(a: i32, b: i32) -> i32 {
    if a == -1 || b == -1 {
        -1
    } else {
        a.max(b)
    }
}

impl PlanCaps {
    pub fn merge(&self, other: &PlanCaps) -> PlanCaps {
        PlanCaps {
            max_concurrent_terminals: merge_cap(
                self.max_concurrent_terminals,
                other.max_concurrent_terminals,
            ),
            max_courses: merge_cap(self.max_courses, other.max_courses),
            max_lab_sessions: merge_cap(self.max_lab_sessions, other.max_lab_sessions),
            max_concurrent_users: merge_cap(self.max_concurrent_users, other.max_concurrent_users),
            max_session_duration_minutes: merge_cap(
                self.max_session_duration_minutes,
                other.max_session_duration_minutes,
            ),
            data_persistence_gb: merge_cap(self.data_persistence_gb, other.data_persistence_gb),
            command_history_retention_days: merge_cap(
                self.command_history_retention_days,
                other.command_history_retention_days,
            ),
        }
    }
}

/// 阶梯价格中的一段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierCost {
    /// 例如 "1-5" 或 "16+"
    pub range: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub subtotal: i64,
}

/// 价格明细
#[derive(Debug, Clone, Serialize)]
pub struct PriceBreakdown {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub quantity: i32,
    pub currency: String,
    pub tiers: Vec<TierCost>,
    pub subtotal: i64,
    /// 平均单价（分）
    pub unit_price: i64,
    /// 相对按单价购买节省的金额（分）
    pub savings: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_note: Option<String>,
}

/// 创建/更新计划请求（管理端）
#[derive(Debug, Clone, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct UpsertPlanRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    #[validate(range(min = 0))]
    pub price_amount: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    pub billing_interval: BillingInterval,
    #[serde(default)]
    pub trial_days: i32,
    pub provider_price_id: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    pub max_concurrent_terminals: i32,
    pub max_courses: i32,
    #[serde(default)]
    pub max_lab_sessions: i32,
    #[serde(default)]
    pub max_concurrent_users: i32,
    #[serde(default)]
    pub max_session_duration_minutes: i32,
    #[serde(default)]
    pub data_persistence_gb: i32,
    #[serde(default)]
    pub command_history_retention_days: i32,
    #[serde(default)]
    pub network_access_enabled: bool,
    #[serde(default)]
    pub data_persistence_enabled: bool,
    #[serde(default)]
    pub allowed_machine_sizes: Vec<String>,
    #[serde(default)]
    pub use_tiered_pricing: bool,
    #[serde(default)]
    pub pricing_tiers: Vec<PricingTier>,
    pub required_role: Option<String>,
}

impl UpsertPlanRequest {
    pub fn into_plan(self, id: Uuid) -> SubscriptionPlan {
        let now = Utc::now();
        SubscriptionPlan {
            id,
            name: self.name,
            description: self.description,
            priority: self.priority,
            price_amount: self.price_amount,
            currency: self.currency.to_lowercase(),
            billing_interval: self.billing_interval,
            trial_days: self.trial_days,
            provider_price_id: self.provider_price_id,
            features: Json(self.features),
            max_concurrent_terminals: self.max_concurrent_terminals,
            max_courses: self.max_courses,
            max_lab_sessions: self.max_lab_sessions,
            max_concurrent_users: self.max_concurrent_users,
            max_session_duration_minutes: self.max_session_duration_minutes,
            data_persistence_gb: self.data_persistence_gb,
            command_history_retention_days: self.command_history_retention_days,
            network_access_enabled: self.network_access_enabled,
            data_persistence_enabled: self.data_persistence_enabled,
            allowed_machine_sizes: Json(self.allowed_machine_sizes),
            use_tiered_pricing: self.use_tiered_pricing,
            pricing_tiers: Json(self.pricing_tiers),
            required_role: self.required_role,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_cap_unlimited_dominates() {
        assert_eq!(merge_cap(5, -1), -1);
        assert_eq!(merge_cap(-1, 0), -1);
        assert_eq!(merge_cap(3, 10), 10);
        assert_eq!(merge_cap(0, 0), 0);
    }
}
