//! Persistence layer
//!
//! 每个存储都是一个 trait，提供 PostgreSQL 实现和内存实现（测试与本地运行）。
//! 需要原子性的复合写入（计划变更、席位分配）作为单个方法暴露，由实现负责事务。

pub mod batch_repo;
pub mod membership_repo;
pub mod memory;
pub mod plan_repo;
pub mod policy_repo;
pub mod subscription_repo;
pub mod usage_repo;

pub use batch_repo::PgBatchRepository;
pub use membership_repo::PgMembershipRepository;
pub use memory::MemoryStore;
pub use plan_repo::PgPlanRepository;
pub use policy_repo::PgPolicyRepository;
pub use subscription_repo::PgSubscriptionRepository;
pub use usage_repo::PgUsageRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        batch::{LicenseSeat, SeatOutcome, SeatRelease, SubscriptionBatch},
        group::{Group, GroupMember, GroupRole},
        organization::{Organization, OrganizationMember, OrganizationRole},
        plan::SubscriptionPlan,
        policy::{GroupingRule, PolicyRule},
        subscription::{OrganizationSubscription, PlanChange, SubscriptionStatus, UserSubscription},
        usage::{IncrementOutcome, MetricType, UsageMetric},
        Page,
    },
};

/// 权限规则持久化
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn load_all(&self) -> Result<(Vec<PolicyRule>, Vec<GroupingRule>)>;
    /// 已存在时返回 false
    async fn insert_policy(&self, rule: &PolicyRule) -> Result<bool>;
    async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool>;
    /// 按列批量删除，返回删除的规则
    async fn delete_policies_where(&self, field_index: usize, values: &[String]) -> Result<Vec<PolicyRule>>;
    async fn insert_grouping(&self, rule: &GroupingRule) -> Result<bool>;
    async fn delete_grouping(&self, rule: &GroupingRule) -> Result<bool>;
    async fn delete_groupings_where(&self, field_index: usize, values: &[String]) -> Result<Vec<GroupingRule>>;
}

/// 订阅计划存储
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<SubscriptionPlan>>;
    async fn find_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>>;
    async fn list(&self, active_only: bool) -> Result<Vec<SubscriptionPlan>>;
    async fn upsert(&self, plan: &SubscriptionPlan) -> Result<()>;
    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool>;
}

/// 成员关系结果
#[derive(Debug, Clone)]
pub enum MemberInsert<M> {
    Inserted(M),
    AlreadyMember,
    CapacityReached,
}

/// 组织与群组存储
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    // ----- organizations -----
    /// 组织与拥有者成员在同一事务中插入
    async fn insert_organization(&self, org: &Organization, owner: &OrganizationMember) -> Result<()>;
    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>>;
    async fn find_personal_organization(&self, user_id: &str) -> Result<Option<Organization>>;
    async fn find_organization_by_name(&self, owner_user_id: &str, name: &str) -> Result<Option<Organization>>;
    async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>>;
    async fn update_organization(&self, org: &Organization) -> Result<()>;
    async fn set_organization_plan(&self, id: Uuid, plan_id: Option<Uuid>) -> Result<()>;
    async fn soft_delete_organization(&self, id: Uuid) -> Result<bool>;

    async fn get_org_member(&self, org_id: Uuid, user_id: &str) -> Result<Option<OrganizationMember>>;
    async fn list_org_members(&self, org_id: Uuid, page: Page) -> Result<Vec<OrganizationMember>>;
    async fn count_org_members(&self, org_id: Uuid) -> Result<i64>;
    /// 条件插入：容量满或已是活跃成员时不写入
    async fn insert_org_member(
        &self,
        member: &OrganizationMember,
        max_members: i32,
    ) -> Result<MemberInsert<OrganizationMember>>;
    async fn update_org_member_role(&self, org_id: Uuid, user_id: &str, role: OrganizationRole) -> Result<bool>;
    async fn deactivate_org_member(&self, org_id: Uuid, user_id: &str) -> Result<bool>;

    // ----- groups -----
    async fn insert_group(&self, group: &Group, owner: &GroupMember) -> Result<()>;
    async fn get_group(&self, id: Uuid) -> Result<Option<Group>>;
    async fn find_group_by_name(&self, owner_user_id: &str, name: &str) -> Result<Option<Group>>;
    async fn list_user_groups(&self, user_id: &str) -> Result<Vec<Group>>;
    async fn list_org_groups(&self, org_id: Uuid) -> Result<Vec<Group>>;
    async fn count_org_groups(&self, org_id: Uuid) -> Result<i64>;
    async fn update_group(&self, group: &Group) -> Result<()>;
    async fn soft_delete_group(&self, id: Uuid) -> Result<bool>;

    async fn get_group_member(&self, group_id: Uuid, user_id: &str) -> Result<Option<GroupMember>>;
    async fn list_group_members(&self, group_id: Uuid, page: Page) -> Result<Vec<GroupMember>>;
    async fn insert_group_member(
        &self,
        member: &GroupMember,
        max_members: i32,
    ) -> Result<MemberInsert<GroupMember>>;
    async fn update_group_member_role(&self, group_id: Uuid, user_id: &str, role: GroupRole) -> Result<bool>;
    async fn deactivate_group_member(&self, group_id: Uuid, user_id: &str) -> Result<bool>;
}

/// 订阅账本
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn insert_user_subscription(&self, sub: &UserSubscription) -> Result<()>;
    async fn get_user_subscription(&self, id: Uuid) -> Result<Option<UserSubscription>>;
    async fn list_user_subscriptions(&self, user_id: &str, live_only: bool) -> Result<Vec<UserSubscription>>;
    async fn list_batch_subscriptions(&self, batch_id: Uuid) -> Result<Vec<UserSubscription>>;
    async fn find_user_subscription_by_provider_id(&self, provider_id: &str) -> Result<Option<UserSubscription>>;
    async fn update_user_subscription(&self, sub: &UserSubscription) -> Result<()>;
    /// 状态 CAS：当前状态等于 expected 时才写入
    async fn transition_status(
        &self,
        id: Uuid,
        expected: SubscriptionStatus,
        new_status: SubscriptionStatus,
    ) -> Result<bool>;
    /// 计划变更与用量上限重写在同一事务中提交，CAS 失败返回 false
    async fn commit_plan_change(&self, change: &PlanChange) -> Result<bool>;

    async fn insert_org_subscription(&self, sub: &OrganizationSubscription) -> Result<()>;
    async fn get_org_subscription(&self, id: Uuid) -> Result<Option<OrganizationSubscription>>;
    async fn get_live_org_subscription(&self, org_id: Uuid) -> Result<Option<OrganizationSubscription>>;
    async fn list_live_org_subscriptions(&self, org_ids: &[Uuid]) -> Result<Vec<OrganizationSubscription>>;
    async fn find_org_subscription_by_provider_id(&self, provider_id: &str) -> Result<Option<OrganizationSubscription>>;
    async fn update_org_subscription(&self, sub: &OrganizationSubscription) -> Result<()>;

    /// 支付回调幂等：首次记录返回 true
    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> Result<bool>;
    /// 处理失败时撤销记录，允许支付服务重投
    async fn forget_webhook_event(&self, event_id: &str) -> Result<()>;
}

/// 批量授权存储
#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// 批次与其全部空席位在同一事务中插入
    async fn insert_batch(&self, batch: &SubscriptionBatch, seats: &[LicenseSeat]) -> Result<()>;
    async fn get_batch(&self, id: Uuid) -> Result<Option<SubscriptionBatch>>;
    async fn list_by_purchaser(&self, user_id: &str) -> Result<Vec<SubscriptionBatch>>;
    async fn list_by_group(&self, group_id: Uuid) -> Result<Vec<SubscriptionBatch>>;
    async fn find_by_provider_id(&self, provider_id: &str) -> Result<Option<SubscriptionBatch>>;
    async fn list_seats(&self, batch_id: Uuid) -> Result<Vec<LicenseSeat>>;
    async fn get_seat(&self, seat_id: Uuid) -> Result<Option<LicenseSeat>>;
    /// 条件递增 assigned 并写入订阅，同一事务
    async fn assign_seat(&self, batch_id: Uuid, subscription: &UserSubscription) -> Result<SeatOutcome>;
    /// 取消订阅、席位回池、assigned 减一，同一事务
    async fn release_seat(&self, seat_id: Uuid) -> Result<SeatRelease>;
    /// CAS 调整总量：new_total >= assigned 时生效
    async fn resize(&self, batch_id: Uuid, expected_total: i32, new_total: i32) -> Result<bool>;
    async fn update_status(&self, batch_id: Uuid, status: crate::models::batch::BatchStatus) -> Result<()>;
    async fn update_period(&self, batch_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()>;
    /// 仅在 assigned = 0 时删除
    async fn delete_batch(&self, batch_id: Uuid) -> Result<bool>;
}

/// 用量计数存储
#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn get(&self, user_id: &str, metric: MetricType) -> Result<Option<UsageMetric>>;
    async fn list(&self, user_id: &str) -> Result<Vec<UsageMetric>>;
    /// 单条条件语句：不存在则以 default_limit 创建，超限时拒绝
    async fn try_increment(
        &self,
        user_id: &str,
        metric: MetricType,
        delta: i64,
        default_limit: i64,
    ) -> Result<IncrementOutcome>;
    async fn set_limits(&self, user_id: &str, limits: &[(MetricType, i64)]) -> Result<()>;
    async fn reset_period(
        &self,
        user_id: &str,
        metrics: &[MetricType],
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<u64>;
}

/// 唯一约束冲突（并发插入同名实体时出现）
pub fn is_unique_violation(err: &crate::error::AppError) -> bool {
    match err {
        crate::error::AppError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
        _ => false,
    }
}

/// 全部存储的句柄
#[derive(Clone)]
pub struct Stores {
    pub policies: std::sync::Arc<dyn PolicyRepository>,
    pub plans: std::sync::Arc<dyn PlanRepository>,
    pub membership: std::sync::Arc<dyn MembershipRepository>,
    pub subscriptions: std::sync::Arc<dyn SubscriptionRepository>,
    pub batches: std::sync::Arc<dyn BatchRepository>,
    pub usage: std::sync::Arc<dyn UsageRepository>,
}

impl Stores {
    pub fn postgres(db: sqlx::PgPool) -> Self {
        Self {
            policies: std::sync::Arc::new(PgPolicyRepository::new(db.clone())),
            plans: std::sync::Arc::new(PgPlanRepository::new(db.clone())),
            membership: std::sync::Arc::new(PgMembershipRepository::new(db.clone())),
            subscriptions: std::sync::Arc::new(PgSubscriptionRepository::new(db.clone())),
            batches: std::sync::Arc::new(PgBatchRepository::new(db.clone())),
            usage: std::sync::Arc::new(PgUsageRepository::new(db)),
        }
    }

    /// 所有存储共享同一个内存实例
    pub fn memory(store: std::sync::Arc<MemoryStore>) -> Self {
        Self {
            policies: store.clone(),
            plans: store.clone(),
            membership: store.clone(),
            subscriptions: store.clone(),
            batches: store.clone(),
            usage: store,
        }
    }
}
