//! Bulk license batches
//!
//! 购买者持有 N 个席位，每个席位可以分配给一个不同的用户。
//! `assigned <= total` 由存储层的条件更新保证。

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::group_service::GroupService;
use super::plan_catalog::PlanLookup;
use super::usage_service::UsageService;
use super::{PermissionService, Providers};
use crate::{
    concurrency::{Deadline, UserLocks},
    error::{AppError, Result},
    events::{DomainEvent, EventBus},
    models::{
        batch::{
            AssignmentReport, BatchStatus, BulkPurchaseRequest, LicenseListing, LicenseSeat,
            SeatOutcome, SeatRelease, SubscriptionBatch,
        },
        group::GroupAccess,
        subscription::{SubscriptionSource, SubscriptionStatus, UserSubscription},
        Actor, Page,
    },
    repository::{BatchRepository, SubscriptionRepository},
};

use super::subscription_service::{ensure_purchasable, provider_price, ProviderUpdate};

/// 批次购买结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchPurchase {
    pub batch: SubscriptionBatch,
    pub report: AssignmentReport,
}

/// 分配结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct LicenseAssignment {
    pub batch: SubscriptionBatch,
    pub seat: LicenseSeat,
    pub subscription: UserSubscription,
}

/// 批量授权服务
pub struct BatchService {
    batches: Arc<dyn BatchRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    plans: Arc<dyn PlanLookup>,
    groups: Arc<GroupService>,
    permissions: Arc<PermissionService>,
    usage: Arc<UsageService>,
    providers: Providers,
    locks: UserLocks,
    events: EventBus,
    operation_timeout: Duration,
}

impl BatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        plans: Arc<dyn PlanLookup>,
        groups: Arc<GroupService>,
        permissions: Arc<PermissionService>,
        usage: Arc<UsageService>,
        providers: Providers,
        locks: UserLocks,
        events: EventBus,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            batches,
            subscriptions,
            plans,
            groups,
            permissions,
            usage,
            providers,
            locks,
            events,
            operation_timeout,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.operation_timeout)
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<SubscriptionBatch> {
        self.batches
            .get_batch(id)
            .await?
            .ok_or_else(|| AppError::not_found("subscription batch"))
    }

    /// 只有购买者或系统管理员可以管理批次；其他人看不到批次
    pub async fn owned_batch(&self, id: Uuid, actor: &Actor) -> Result<SubscriptionBatch> {
        let batch = self.get_batch(id).await?;
        if batch.purchaser_user_id != actor.user_id && !actor.is_admin() {
            return Err(AppError::not_found("subscription batch"));
        }
        Ok(batch)
    }

    pub async fn list_batches(&self, user_id: &str) -> Result<Vec<SubscriptionBatch>> {
        self.batches.list_by_purchaser(user_id).await
    }

    /// 批量购买
    ///
    /// 付费计划直接在支付服务创建带数量的订阅，批次立即生效。
    /// 设置了群组时，按群组成员预分配席位，逐个记录结果。
    #[instrument(skip(self, actor, request), fields(purchaser = %actor.user_id))]
    pub async fn purchase_batch(&self, actor: &Actor, request: BulkPurchaseRequest) -> Result<BatchPurchase> {
        let plan = self.plans.get_plan(request.plan_id).await?;
        ensure_purchasable(&plan, &actor.roles)?;

        if let Some(group_id) = request.group_id {
            let group = self.groups.get_group(group_id).await?;
            if !actor.is_admin() {
                match self.groups.resolve_group_access(&group, &actor.user_id).await? {
                    GroupAccess::Direct(role) if role.can_manage() => {}
                    GroupAccess::ViaOrgManager(_) => {}
                    GroupAccess::None => return Err(AppError::not_found("group")),
                    GroupAccess::Direct(_) => {
                        return Err(AppError::forbidden(
                            "Only group managers can link a batch to the group",
                        ))
                    }
                }
            }
        }

        let batch_id = Uuid::new_v4();
        let now = Utc::now();
        let mut batch = SubscriptionBatch {
            id: batch_id,
            purchaser_user_id: actor.user_id.clone(),
            plan_id: plan.id,
            group_id: request.group_id,
            provider_subscription_id: None,
            provider_item_id: None,
            total_quantity: request.quantity,
            assigned_quantity: 0,
            status: BatchStatus::Active,
            current_period_start: now,
            current_period_end: now + ChronoDuration::days(365),
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };

        if !plan.is_free() {
            let price_id = provider_price(&plan)?;
            let deadline = self.deadline();
            let account = deadline
                .run_fallible("identity lookup", self.providers.identity.get_user(&actor.user_id))
                .await?;
            let customer_id = deadline
                .run_fallible(
                    "ensure customer",
                    self.providers
                        .payment
                        .ensure_customer(&actor.user_id, &account.email, &account.name),
                )
                .await?;
            let metadata = HashMap::from([
                ("bulk_purchase".to_string(), "true".to_string()),
                ("batch_id".to_string(), batch_id.to_string()),
                ("purchaser_user_id".to_string(), actor.user_id.clone()),
                ("plan_id".to_string(), plan.id.to_string()),
            ]);
            let created = deadline
                .run_fallible(
                    "create subscription",
                    self.providers.payment.create_subscription(
                        &customer_id,
                        &price_id,
                        request.quantity,
                        &metadata,
                    ),
                )
                .await?;
            batch.provider_subscription_id = Some(created.subscription_id);
            batch.provider_item_id = created.item_id;
            batch.current_period_start = created.current_period_start;
            batch.current_period_end = created.current_period_end;
        }

        let seats: Vec<LicenseSeat> = (0..request.quantity)
            .map(|_| LicenseSeat::unassigned(batch_id))
            .collect();
        self.batches.insert_batch(&batch, &seats).await?;
        self.permissions
            .grant_batch_owner(batch_id, &actor.user_id)
            .await?;
        info!(
            batch_id = %batch_id,
            plan = %plan.name,
            quantity = request.quantity,
            "Subscription batch purchased"
        );

        let mut report = AssignmentReport::default();
        if let Some(group_id) = request.group_id {
            self.preassign_group(&batch, group_id, &mut report).await?;
        }

        let batch = self.get_batch(batch_id).await?;
        Ok(BatchPurchase { batch, report })
    }

    /// 给群组现有成员预分配席位，单个失败不中断
    async fn preassign_group(
        &self,
        batch: &SubscriptionBatch,
        group_id: Uuid,
        report: &mut AssignmentReport,
    ) -> Result<()> {
        let system = Actor::system();
        let mut page = Page::first(200);
        let mut remaining = batch.total_quantity;

        'pages: loop {
            let members = self.groups.list_members(group_id, page).await?;
            let done = (members.len() as i64) < page.limit;
            for member in members {
                if member.user_id == batch.purchaser_user_id {
                    continue;
                }
                if remaining == 0 {
                    report.warnings.push(format!(
                        "{}: no license left in the batch",
                        member.user_id
                    ));
                    continue;
                }
                match self.assign(batch.id, &system, &member.user_id).await {
                    Ok(_) => {
                        remaining -= 1;
                        report.assigned.push(member.user_id);
                    }
                    Err(AppError::Conflict(msg)) => {
                        report.warnings.push(format!("{}: {}", member.user_id, msg))
                    }
                    Err(e) => report.errors.push(format!("{}: {}", member.user_id, e.user_message())),
                }
            }
            if done {
                break 'pages;
            }
            page = page.next();
        }

        info!(
            batch_id = %batch.id,
            assigned = report.assigned.len(),
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            "Group members pre-assigned"
        );
        Ok(())
    }

    /// 分配一个席位
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn assign(&self, batch_id: Uuid, actor: &Actor, assignee: &str) -> Result<LicenseAssignment> {
        let batch = self.owned_batch(batch_id, actor).await?;
        if assignee == batch.purchaser_user_id {
            return Err(AppError::validation(
                "The purchaser cannot assign a license to themselves",
            ));
        }

        self.providers.identity.get_user(assignee).await.map_err(|e| {
            if e.is_not_found() {
                AppError::not_found("user")
            } else {
                e.into()
            }
        })?;

        let plan = self.plans.get_plan(batch.plan_id).await?;
        let subscription = UserSubscription::new(
            assignee,
            &plan,
            SubscriptionSource::Assigned {
                batch_id,
                assignor: batch.purchaser_user_id.clone(),
            },
        );

        let _guard = self.locks.acquire(assignee, self.deadline()).await?;
        match self.batches.assign_seat(batch_id, &subscription).await? {
            SeatOutcome::Assigned { batch, seat } => {
                self.usage.sync_limits(assignee).await?;
                self.events.publish(DomainEvent::LicenseAssigned {
                    batch_id,
                    user_id: assignee.to_string(),
                });
                info!(batch_id = %batch_id, assignee, assigned = batch.assigned_quantity, "License assigned");
                let subscription = self
                    .subscriptions
                    .get_user_subscription(subscription.id)
                    .await?
                    .unwrap_or(subscription);
                Ok(LicenseAssignment {
                    batch,
                    seat,
                    subscription,
                })
            }
            SeatOutcome::PoolExhausted => Err(AppError::conflict("No licenses left in this batch")),
            SeatOutcome::BatchInactive => Err(AppError::state("Subscription batch is not active")),
            SeatOutcome::AlreadyAssigned => Err(AppError::conflict(
                "User already holds a license from this batch",
            )),
        }
    }

    /// 撤销席位：订阅取消，席位回到池中；已取消的批次不会重新打开
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn revoke(&self, batch_id: Uuid, seat_id: Uuid, actor: &Actor) -> Result<SubscriptionBatch> {
        self.owned_batch(batch_id, actor).await?;
        let seat = self
            .batches
            .get_seat(seat_id)
            .await?
            .filter(|seat| seat.batch_id == batch_id)
            .ok_or_else(|| AppError::not_found("license"))?;
        let Some(assignee) = seat.assignee_user_id.clone() else {
            return Err(AppError::state("License is not assigned"));
        };

        let _guard = self.locks.acquire(&assignee, self.deadline()).await?;
        match self.batches.release_seat(seat_id).await? {
            SeatRelease::Released { batch, subscription } => {
                self.usage.sync_limits(&subscription.user_id).await?;
                self.events.publish(DomainEvent::LicenseRevoked {
                    batch_id,
                    user_id: subscription.user_id.clone(),
                });
                info!(batch_id = %batch_id, assignee = %subscription.user_id, "License revoked");
                Ok(batch)
            }
            SeatRelease::NotAssigned => Err(AppError::state("License is not assigned")),
        }
    }

    /// 调整席位总数；减少时不得低于已分配数
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn update_quantity(
        &self,
        batch_id: Uuid,
        actor: &Actor,
        new_quantity: i32,
    ) -> Result<SubscriptionBatch> {
        let batch = self.owned_batch(batch_id, actor).await?;
        if !batch.is_active() {
            return Err(AppError::state("Subscription batch is not active"));
        }
        if new_quantity < 1 {
            return Err(AppError::validation("quantity must be at least 1"));
        }
        if new_quantity < batch.assigned_quantity {
            return Err(AppError::Validation(format!(
                "quantity cannot be lower than the assigned licenses ({})",
                batch.assigned_quantity
            )));
        }
        if new_quantity == batch.total_quantity {
            return Ok(batch);
        }

        if let Some(provider_id) = &batch.provider_subscription_id {
            self.deadline()
                .run_fallible(
                    "update quantity",
                    self.providers.payment.update_quantity(
                        provider_id,
                        batch.provider_item_id.as_deref(),
                        new_quantity,
                    ),
                )
                .await?;
        }

        if !self
            .batches
            .resize(batch_id, batch.total_quantity, new_quantity)
            .await?
        {
            error!(batch_id = %batch_id, "Batch resize lost a concurrent update, provider quantity needs reconciliation");
            return Err(AppError::conflict("Batch changed concurrently, retry"));
        }

        info!(batch_id = %batch_id, from = batch.total_quantity, to = new_quantity, "Batch quantity updated");
        self.get_batch(batch_id).await
    }

    /// 席位列表
    pub async fn list_licenses(&self, batch_id: Uuid, actor: &Actor) -> Result<LicenseListing> {
        let batch = self.owned_batch(batch_id, actor).await?;
        let seats = self.batches.list_seats(batch_id).await?;
        let subscriptions = self.subscriptions.list_batch_subscriptions(batch_id).await?;
        Ok(LicenseListing {
            total: batch.total_quantity,
            assigned: batch.assigned_quantity,
            pool: batch.pool(),
            batch,
            seats,
            subscriptions,
        })
    }

    /// 取消批次：分配出的订阅全部取消，席位保持原状
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn cancel_batch(&self, batch_id: Uuid, actor: &Actor) -> Result<SubscriptionBatch> {
        let batch = self.owned_batch(batch_id, actor).await?;
        if batch.status == BatchStatus::Cancelled {
            return Ok(batch);
        }

        if let Some(provider_id) = &batch.provider_subscription_id {
            match self
                .deadline()
                .run(
                    "cancel subscription",
                    self.providers.payment.cancel_subscription(provider_id, false),
                )
                .await?
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(provider_subscription_id = %provider_id, "Provider subscription already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.batches
            .update_status(batch_id, BatchStatus::Cancelled)
            .await?;
        self.cancel_assigned_subscriptions(batch_id).await?;
        info!(batch_id = %batch_id, "Subscription batch cancelled");
        self.get_batch(batch_id).await
    }

    async fn cancel_assigned_subscriptions(&self, batch_id: Uuid) -> Result<()> {
        for sub in self.subscriptions.list_batch_subscriptions(batch_id).await? {
            if !sub.is_live() {
                continue;
            }
            let _guard = self.locks.acquire(&sub.user_id, self.deadline()).await?;
            self.subscriptions
                .transition_status(sub.id, sub.status, SubscriptionStatus::Cancelled)
                .await?;
            self.usage.sync_limits(&sub.user_id).await?;
            self.events.publish(DomainEvent::LicenseRevoked {
                batch_id,
                user_id: sub.user_id.clone(),
            });
        }
        Ok(())
    }

    /// 删除批次；仍有已分配席位时拒绝
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn delete_batch(&self, batch_id: Uuid, actor: &Actor) -> Result<()> {
        let batch = self.owned_batch(batch_id, actor).await?;
        if batch.assigned_quantity > 0 {
            return Err(AppError::State(format!(
                "Cannot delete a batch with {} assigned licenses",
                batch.assigned_quantity
            )));
        }
        if batch.is_active() && batch.provider_subscription_id.is_some() {
            self.cancel_batch(batch_id, actor).await?;
        }
        if !self.batches.delete_batch(batch_id).await? {
            return Err(AppError::state("Batch has assigned licenses"));
        }
        self.permissions.drop_batch(batch_id).await?;
        info!(batch_id = %batch_id, "Subscription batch deleted");
        Ok(())
    }

    /// 加入群组时从关联批次自动分配席位
    pub async fn on_group_member_added(&self, group_id: Uuid, user_id: &str) -> Result<Option<LicenseAssignment>> {
        let system = Actor::system();
        for batch in self.batches.list_by_group(group_id).await? {
            if !batch.is_active() || batch.pool() <= 0 || batch.purchaser_user_id == user_id {
                continue;
            }
            match self.assign(batch.id, &system, user_id).await {
                Ok(assignment) => return Ok(Some(assignment)),
                Err(AppError::Conflict(msg)) => {
                    debug!(batch_id = %batch.id, user_id, reason = %msg, "Auto-assignment skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// 订阅领域事件，处理群组加入
    pub fn spawn_auto_assign(self: Arc<Self>, mut rx: broadcast::Receiver<DomainEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DomainEvent::GroupMemberAdded { group_id, user_id, .. }) => {
                        if let Err(e) = self.on_group_member_added(group_id, &user_id).await {
                            error!(group_id = %group_id, user_id = %user_id, error = %e, "Auto-assignment failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Auto-assignment consumer lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Auto-assignment consumer stopped");
        })
    }

    /// 支付服务推送的批次状态；返回是否找到对应批次
    pub async fn apply_provider_update(&self, update: &ProviderUpdate) -> Result<bool> {
        let Some(batch) = self
            .batches
            .find_by_provider_id(&update.subscription_id)
            .await?
        else {
            return Ok(false);
        };
        if batch.status == BatchStatus::Cancelled {
            debug!(batch_id = %batch.id, incoming = ?update.status, "Cancelled batch ignores provider update");
            return Ok(true);
        }

        if let (Some(start), Some(end)) = (update.current_period_start, update.current_period_end) {
            self.batches.update_period(batch.id, start, end).await?;
        }

        match update.status {
            SubscriptionStatus::Cancelled => {
                self.batches
                    .update_status(batch.id, BatchStatus::Cancelled)
                    .await?;
                self.cancel_assigned_subscriptions(batch.id).await?;
                info!(batch_id = %batch.id, "Batch cancelled by payment provider");
            }
            SubscriptionStatus::PastDue => {
                warn!(batch_id = %batch.id, "Batch payment is past due");
            }
            _ => {}
        }
        Ok(true)
    }
}
