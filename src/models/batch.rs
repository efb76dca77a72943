//! Bulk license models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::subscription::UserSubscription;

/// 批次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "batch_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Cancelled,
    Expired,
}

/// 批量授权批次
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionBatch {
    pub id: Uuid,
    pub purchaser_user_id: String,
    pub plan_id: Uuid,
    /// 设置后加入群组的成员自动获得席位
    pub group_id: Option<Uuid>,
    pub provider_subscription_id: Option<String>,
    /// 用于调整数量
    pub provider_item_id: Option<String>,
    pub total_quantity: i32,
    pub assigned_quantity: i32,
    pub status: BatchStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionBatch {
    /// 未分配的席位数
    pub fn pool(&self) -> i32 {
        self.total_quantity - self.assigned_quantity
    }

    pub fn is_active(&self) -> bool {
        self.status == BatchStatus::Active
    }
}

/// 席位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "seat_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SeatStatus {
    Unassigned,
    Assigned,
}

/// 批次中的一个席位
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LicenseSeat {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub status: SeatStatus,
    pub subscription_id: Option<Uuid>,
    pub assignee_user_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LicenseSeat {
    pub fn unassigned(batch_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            status: SeatStatus::Unassigned,
            subscription_id: None,
            assignee_user_id: None,
            assigned_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 席位分配的结果
#[derive(Debug, Clone)]
pub enum SeatOutcome {
    Assigned {
        batch: SubscriptionBatch,
        seat: LicenseSeat,
    },
    PoolExhausted,
    BatchInactive,
    AlreadyAssigned,
}

/// 席位释放的结果
#[derive(Debug, Clone)]
pub enum SeatRelease {
    Released {
        batch: SubscriptionBatch,
        subscription: UserSubscription,
    },
    NotAssigned,
}

/// 席位列表
#[derive(Debug, Clone, Serialize)]
pub struct LicenseListing {
    pub batch: SubscriptionBatch,
    pub seats: Vec<LicenseSeat>,
    pub subscriptions: Vec<UserSubscription>,
    pub total: i32,
    pub assigned: i32,
    pub pool: i32,
}

/// 批量购买请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct BulkPurchaseRequest {
    pub plan_id: Uuid,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
    pub group_id: Option<Uuid>,
}

/// 分配席位请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct AssignLicenseRequest {
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
}

/// 调整数量请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
}

/// 批量购买的逐行报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignmentReport {
    pub assigned: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}
