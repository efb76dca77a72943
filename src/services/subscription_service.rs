//! Subscription ledger
//!
//! 用户订阅与组织订阅的生命周期。外部调用在用户锁之外进行，
//! 提交阶段在锁内用状态 CAS 写入账本。

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::plan_catalog::PlanLookup;
use super::policy_store::ADMIN_ROLE;
use super::usage_service::UsageService;
use super::Providers;
use crate::{
    concurrency::{Deadline, UserLocks},
    error::{AppError, Result},
    events::{DomainEvent, EventBus},
    models::{
        plan::SubscriptionPlan,
        subscription::{
            CheckoutOutcome, OrganizationSubscription, PlanChange, ProrationBehavior,
            ProviderBinding, SubscriptionSource, SubscriptionStatus, UserSubscription,
        },
        usage::MetricType,
    },
    providers::{CheckoutSessionRequest, ProviderSubscription},
    repository::{MembershipRepository, SubscriptionRepository},
};

/// 账本服务参数
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// 单个变更操作的截止时间
    pub operation_timeout: Duration,
    /// 单次支付服务调用的超时
    pub provider_timeout: Duration,
    pub default_success_url: String,
    pub default_cancel_url: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(20),
            provider_timeout: Duration::from_secs(15),
            default_success_url: "http://localhost:3000/subscription/success".to_string(),
            default_cancel_url: "http://localhost:3000/subscription/cancel".to_string(),
        }
    }
}

/// 结账跳转地址
#[derive(Debug, Clone, Default)]
pub struct CheckoutUrls {
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// 订阅与其计划
pub type PlannedSubscription = (UserSubscription, SubscriptionPlan);

/// 读取用户全部有效订阅及其计划
pub async fn live_with_plans(
    subscriptions: &dyn SubscriptionRepository,
    plans: &dyn PlanLookup,
    user_id: &str,
) -> Result<Vec<PlannedSubscription>> {
    let mut live = Vec::new();
    for sub in subscriptions.list_user_subscriptions(user_id, true).await? {
        let plan = plans.get_plan(sub.plan_id).await?;
        live.push((sub, plan));
    }
    Ok(live)
}

/// 订阅之间的全序：计划优先，其次个人订阅优先于分配订阅，再按创建时间和标识
fn stack_order(a: &PlannedSubscription, b: &PlannedSubscription) -> Ordering {
    a.1.precedence(&b.1)
        .then_with(|| a.0.is_personal().cmp(&b.0.is_personal()))
        .then_with(|| b.0.created_at.cmp(&a.0.created_at))
        .then_with(|| b.0.id.cmp(&a.0.id))
}

/// 选出主订阅
pub fn select_primary(live: &[PlannedSubscription]) -> Option<&PlannedSubscription> {
    live.iter().max_by(|a, b| stack_order(a, b))
}

/// 主订阅计划决定的用量上限，没有订阅时全部为 0
pub fn primary_limits(live: &[PlannedSubscription]) -> Vec<(MetricType, i64)> {
    match select_primary(live) {
        Some((_, plan)) => plan.metric_limits(),
        None => MetricType::ALL.iter().map(|metric| (*metric, 0)).collect(),
    }
}

/// 全部有效订阅的能力标签并集
pub fn feature_union(live: &[PlannedSubscription]) -> BTreeSet<String> {
    live.iter()
        .flat_map(|(_, plan)| plan.features.iter().cloned())
        .collect()
}

/// 组织订阅结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrganizationCheckout {
    pub subscription: OrganizationSubscription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

/// 支付服务推送的订阅状态
#[derive(Debug, Clone)]
pub struct ProviderUpdate {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<chrono::DateTime<Utc>>,
    pub current_period_end: Option<chrono::DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
}

/// 支付服务状态的应用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderUpdateResult {
    Applied,
    /// 账本行已取消，迟到的事件不再改写
    Stale,
    Unmatched,
}

/// 取消是终态：支付服务不会复活已取消的订阅，只会新建
fn is_stale(current: SubscriptionStatus, incoming: SubscriptionStatus) -> bool {
    current == SubscriptionStatus::Cancelled && incoming != SubscriptionStatus::Cancelled
}

/// 订阅账本服务
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    membership: Arc<dyn MembershipRepository>,
    plans: Arc<dyn PlanLookup>,
    providers: Providers,
    usage: Arc<UsageService>,
    locks: UserLocks,
    events: EventBus,
    settings: LedgerSettings,
}

fn has_role(roles: &[String], role: &str) -> bool {
    roles.iter().any(|r| r == role)
}

/// 计划的购买资格
pub(crate) fn ensure_purchasable(plan: &SubscriptionPlan, roles: &[String]) -> Result<()> {
    if !plan.is_active {
        return Err(AppError::state("Subscription plan is not available"));
    }
    if let Some(required) = &plan.required_role {
        if !has_role(roles, required) && !has_role(roles, ADMIN_ROLE) {
            return Err(AppError::Forbidden(format!(
                "Plan {} requires role {}",
                plan.name, required
            )));
        }
    }
    Ok(())
}

pub(crate) fn provider_price(plan: &SubscriptionPlan) -> Result<String> {
    plan.provider_price_id
        .clone()
        .ok_or_else(|| AppError::State(format!("Plan {} has no provider price", plan.name)))
}

impl SubscriptionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        membership: Arc<dyn MembershipRepository>,
        plans: Arc<dyn PlanLookup>,
        providers: Providers,
        usage: Arc<UsageService>,
        locks: UserLocks,
        events: EventBus,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            subscriptions,
            membership,
            plans,
            providers,
            usage,
            locks,
            events,
            settings,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.settings.operation_timeout)
    }

    fn provider_deadline(&self, deadline: &Deadline) -> Deadline {
        deadline.capped(self.settings.provider_timeout)
    }

    fn publish_change(&self, sub: &UserSubscription) {
        self.events.publish(DomainEvent::SubscriptionChanged {
            user_id: sub.user_id.clone(),
            subscription_id: sub.id,
            status: format!("{:?}", sub.status).to_lowercase(),
        });
    }

    async fn load(&self, id: Uuid) -> Result<UserSubscription> {
        self.subscriptions
            .get_user_subscription(id)
            .await?
            .ok_or_else(|| AppError::not_found("subscription"))
    }

    /// 支付服务客户（用户资料来自身份服务）
    async fn ensure_customer(&self, user_id: &str, deadline: &Deadline) -> Result<String> {
        let account = self
            .provider_deadline(deadline)
            .run_fallible("identity lookup", self.providers.identity.get_user(user_id))
            .await?;
        self.provider_deadline(deadline)
            .run_fallible(
                "ensure customer",
                self.providers
                    .payment
                    .ensure_customer(user_id, &account.email, &account.name),
            )
            .await
    }

    // ==================== Queries ====================

    pub async fn get_all_active(&self, user_id: &str) -> Result<Vec<PlannedSubscription>> {
        live_with_plans(self.subscriptions.as_ref(), self.plans.as_ref(), user_id).await
    }

    /// 主订阅：计划优先级最高者，同级时个人订阅优先
    pub async fn get_primary_user_subscription(&self, user_id: &str) -> Result<Option<PlannedSubscription>> {
        let live = self.get_all_active(user_id).await?;
        Ok(select_primary(&live).cloned())
    }

    /// 主订阅能力与分配订阅能力的并集
    pub async fn primary_feature_set(&self, user_id: &str) -> Result<BTreeSet<String>> {
        let live = self.get_all_active(user_id).await?;
        Ok(feature_union(&live))
    }

    /// 用户全部订阅（含历史）
    pub async fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<UserSubscription>> {
        self.subscriptions.list_user_subscriptions(user_id, false).await
    }

    pub async fn get_owned(&self, user_id: &str, id: Uuid, is_admin: bool) -> Result<UserSubscription> {
        let sub = self.load(id).await?;
        if sub.user_id != user_id && !is_admin {
            return Err(AppError::not_found("subscription"));
        }
        Ok(sub)
    }

    // ==================== Creation ====================

    /// 创建账本行：免费计划立即生效，付费计划等待支付确认
    #[instrument(skip(self, plan), fields(plan = %plan.name))]
    pub async fn create_user_subscription(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
        source: SubscriptionSource,
    ) -> Result<UserSubscription> {
        let sub = UserSubscription::new(user_id, plan, source);
        let _guard = self.locks.acquire(user_id, self.deadline()).await?;
        self.subscriptions.insert_user_subscription(&sub).await?;
        if sub.is_live() {
            self.usage.sync_limits(user_id).await?;
        }
        info!(subscription_id = %sub.id, status = ?sub.status, "User subscription created");
        self.publish_change(&sub);
        Ok(sub)
    }

    /// 结账入口
    #[instrument(skip(self, roles, urls))]
    pub async fn checkout(
        &self,
        user_id: &str,
        roles: &[String],
        plan_id: Uuid,
        urls: CheckoutUrls,
    ) -> Result<CheckoutOutcome> {
        let plan = self.plans.get_plan(plan_id).await?;
        ensure_purchasable(&plan, roles)?;

        let live = self.get_all_active(user_id).await?;
        match live.iter().find(|(sub, _)| sub.is_personal()) {
            Some((sub, _)) if sub.plan_id == plan.id => {
                Err(AppError::conflict("Already subscribed to this plan"))
            }
            Some((_, current)) if current.is_free() => {
                self.replace_free_with(user_id, roles, plan.id, urls).await
            }
            Some(_) => Err(AppError::conflict(
                "User already has an active subscription, use upgrade instead",
            )),
            None if plan.is_free() => {
                let subscription = self
                    .create_user_subscription(user_id, &plan, SubscriptionSource::Personal)
                    .await?;
                Ok(CheckoutOutcome::Activated { subscription })
            }
            None => self.start_checkout(user_id, &plan, None, urls).await,
        }
    }

    /// 付费计划：插入 incomplete 账本行并创建托管结账页面
    async fn start_checkout(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
        replace: Option<Uuid>,
        urls: CheckoutUrls,
    ) -> Result<CheckoutOutcome> {
        let price_id = provider_price(plan)?;
        let deadline = self.deadline();
        let customer_id = self.ensure_customer(user_id, &deadline).await?;

        let mut sub = UserSubscription::new(user_id, plan, SubscriptionSource::Personal);
        sub.provider_customer_id = Some(customer_id.clone());
        self.subscriptions.insert_user_subscription(&sub).await?;

        let mut metadata = HashMap::from([
            ("user_id".to_string(), user_id.to_string()),
            ("plan_id".to_string(), plan.id.to_string()),
            ("subscription_id".to_string(), sub.id.to_string()),
        ]);
        if let Some(replace) = replace {
            metadata.insert("replace_subscription_id".to_string(), replace.to_string());
        }

        let request = CheckoutSessionRequest {
            customer_id,
            price_id,
            quantity: 1,
            trial_days: plan.trial_days,
            success_url: urls
                .success_url
                .unwrap_or_else(|| self.settings.default_success_url.clone()),
            cancel_url: urls
                .cancel_url
                .unwrap_or_else(|| self.settings.default_cancel_url.clone()),
            metadata,
        };

        let session = match self
            .provider_deadline(&deadline)
            .run_fallible(
                "create checkout session",
                self.providers.payment.create_checkout_session(&request),
            )
            .await
        {
            Ok(session) => session,
            Err(AppError::Timeout(msg)) => {
                // 留给对账任务处理
                warn!(subscription_id = %sub.id, "Checkout session timed out, subscription left incomplete");
                return Err(AppError::Timeout(msg));
            }
            Err(e) => {
                self.subscriptions
                    .transition_status(sub.id, SubscriptionStatus::Incomplete, SubscriptionStatus::Cancelled)
                    .await?;
                return Err(e);
            }
        };

        info!(subscription_id = %sub.id, session_id = %session.session_id, "Checkout session created");
        Ok(CheckoutOutcome::PendingPayment {
            subscription: sub,
            checkout_url: session.checkout_url,
        })
    }

    /// 从免费计划切换：目标免费时原地变更，付费时走结账并在确认后替换
    #[instrument(skip(self, roles, urls))]
    pub async fn replace_free_with(
        &self,
        user_id: &str,
        roles: &[String],
        new_plan_id: Uuid,
        urls: CheckoutUrls,
    ) -> Result<CheckoutOutcome> {
        let plan = self.plans.get_plan(new_plan_id).await?;
        ensure_purchasable(&plan, roles)?;

        let live = self.get_all_active(user_id).await?;
        let (current, current_plan) = live
            .iter()
            .find(|(sub, _)| sub.is_personal())
            .cloned()
            .ok_or_else(|| AppError::not_found("active personal subscription"))?;

        if !current_plan.is_free() {
            return Err(AppError::state(
                "Current plan is not free, an explicit upgrade is required",
            ));
        }
        if current.plan_id == plan.id {
            return Err(AppError::conflict("Already subscribed to this plan"));
        }

        if !plan.is_free() {
            return self.start_checkout(user_id, &plan, Some(current.id), urls).await;
        }

        let subscription = self
            .commit_change(&current, &plan, current.status, ProviderBinding::Keep, None, self.deadline())
            .await?;
        Ok(CheckoutOutcome::Activated { subscription })
    }

    // ==================== Plan changes ====================

    /// 锁内提交计划变更，用量上限在同一事务中重写
    async fn commit_change(
        &self,
        current: &UserSubscription,
        new_plan: &SubscriptionPlan,
        new_status: SubscriptionStatus,
        provider: ProviderBinding,
        period: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
        deadline: Deadline,
    ) -> Result<UserSubscription> {
        let _guard = self.locks.acquire(&current.user_id, deadline).await?;

        let mut live = self.get_all_active(&current.user_id).await?;
        live.retain(|(sub, _)| sub.id != current.id);
        if new_status.is_live() {
            let mut projected = current.clone();
            projected.plan_id = new_plan.id;
            projected.status = new_status;
            live.push((projected, new_plan.clone()));
        }

        let change = PlanChange {
            subscription_id: current.id,
            user_id: current.user_id.clone(),
            expected_plan_id: current.plan_id,
            expected_status: current.status,
            new_plan_id: new_plan.id,
            new_status,
            provider,
            period,
            limits: primary_limits(&live),
        };

        if !self.subscriptions.commit_plan_change(&change).await? {
            error!(
                subscription_id = %current.id,
                new_plan_id = %new_plan.id,
                "Plan change lost a concurrent update, provider state needs reconciliation"
            );
            return Err(AppError::conflict("Subscription changed concurrently, retry"));
        }

        let updated = self.load(current.id).await?;
        info!(
            subscription_id = %updated.id,
            plan_id = %new_plan.id,
            status = ?updated.status,
            "Subscription plan changed"
        );
        self.publish_change(&updated);
        Ok(updated)
    }

    /// 升级或降级个人订阅
    ///
    /// 顺序固定为支付服务、账本、用量上限。支付服务失败或超时时账本不变。
    #[instrument(skip(self, roles))]
    pub async fn upgrade(
        &self,
        user_id: &str,
        roles: &[String],
        new_plan_id: Uuid,
        proration: ProrationBehavior,
    ) -> Result<UserSubscription> {
        let new_plan = self.plans.get_plan(new_plan_id).await?;
        ensure_purchasable(&new_plan, roles)?;

        let live = self.get_all_active(user_id).await?;
        let (current, _) = live
            .iter()
            .find(|(sub, _)| sub.is_personal())
            .cloned()
            .ok_or_else(|| AppError::not_found("active personal subscription"))?;
        if current.plan_id == new_plan.id {
            return Err(AppError::conflict("Already subscribed to this plan"));
        }

        let deadline = self.deadline();
        let provider_id = current.provider_subscription_id.clone();

        let (binding, period, status) = match (new_plan.is_free(), provider_id) {
            (true, Some(provider_id)) => {
                // 降级到免费：先在支付服务取消
                match self
                    .provider_deadline(&deadline)
                    .run(
                        "cancel subscription",
                        self.providers.payment.cancel_subscription(&provider_id, false),
                    )
                    .await?
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        warn!(provider_subscription_id = %provider_id, "Provider subscription already gone");
                    }
                    Err(e) => return Err(e.into()),
                }
                let now = Utc::now();
                (
                    ProviderBinding::Detach,
                    Some((now, now + chrono::Duration::days(365))),
                    SubscriptionStatus::Active,
                )
            }
            (true, None) => (ProviderBinding::Keep, None, current.status),
            (false, Some(provider_id)) => {
                let price_id = provider_price(&new_plan)?;
                let updated = self
                    .provider_deadline(&deadline)
                    .run_fallible(
                        "update subscription plan",
                        self.providers
                            .payment
                            .update_subscription_plan(&provider_id, &price_id, proration),
                    )
                    .await?;
                let status = if updated.status.is_live() {
                    updated.status
                } else {
                    current.status
                };
                (
                    ProviderBinding::Keep,
                    Some((updated.current_period_start, updated.current_period_end)),
                    status,
                )
            }
            (false, None) => {
                // 免费升级付费：直接创建支付订阅
                let price_id = provider_price(&new_plan)?;
                let customer_id = self.ensure_customer(user_id, &deadline).await?;
                let metadata = HashMap::from([
                    ("user_id".to_string(), user_id.to_string()),
                    ("plan_id".to_string(), new_plan.id.to_string()),
                    ("subscription_id".to_string(), current.id.to_string()),
                ]);
                let created: ProviderSubscription = self
                    .provider_deadline(&deadline)
                    .run_fallible(
                        "create subscription",
                        self.providers
                            .payment
                            .create_subscription(&customer_id, &price_id, 1, &metadata),
                    )
                    .await?;
                (
                    ProviderBinding::Bind {
                        subscription_id: created.subscription_id,
                        customer_id: created.customer_id,
                    },
                    Some((created.current_period_start, created.current_period_end)),
                    created.status,
                )
            }
        };

        self.commit_change(&current, &new_plan, status, binding, period, deadline)
            .await
    }

    // ==================== Cancellation ====================

    /// 取消订阅；支付服务返回不存在时视为已取消
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        user_id: &str,
        subscription_id: Uuid,
        immediate: bool,
        is_admin: bool,
    ) -> Result<UserSubscription> {
        let sub = self.get_owned(user_id, subscription_id, is_admin).await?;
        if sub.status == SubscriptionStatus::Cancelled {
            return Ok(sub);
        }
        if !sub.is_personal() {
            return Err(AppError::state(
                "Assigned subscriptions are revoked through their batch",
            ));
        }

        let deadline = self.deadline();
        let mut provider_gone = false;
        if let Some(provider_id) = &sub.provider_subscription_id {
            match self
                .provider_deadline(&deadline)
                .run(
                    "cancel subscription",
                    self.providers.payment.cancel_subscription(provider_id, !immediate),
                )
                .await?
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(provider_subscription_id = %provider_id, "Provider subscription not found, treating as cancelled");
                    provider_gone = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let _guard = self.locks.acquire(&sub.user_id, deadline).await?;
        if immediate || provider_gone || sub.provider_subscription_id.is_none() {
            if !self
                .subscriptions
                .transition_status(sub.id, sub.status, SubscriptionStatus::Cancelled)
                .await?
            {
                let fresh = self.load(sub.id).await?;
                if fresh.status == SubscriptionStatus::Cancelled {
                    return Ok(fresh);
                }
                return Err(AppError::conflict("Subscription changed concurrently, retry"));
            }
            self.usage.sync_limits(&sub.user_id).await?;
        } else {
            let mut scheduled = self.load(sub.id).await?;
            scheduled.cancel_at_period_end = true;
            self.subscriptions.update_user_subscription(&scheduled).await?;
        }

        let updated = self.load(sub.id).await?;
        info!(
            subscription_id = %updated.id,
            status = ?updated.status,
            at_period_end = updated.cancel_at_period_end,
            "Subscription cancelled"
        );
        self.publish_change(&updated);
        Ok(updated)
    }

    /// 撤销期末取消
    #[instrument(skip(self))]
    pub async fn reactivate(&self, user_id: &str, subscription_id: Uuid, is_admin: bool) -> Result<UserSubscription> {
        let sub = self.get_owned(user_id, subscription_id, is_admin).await?;
        if !sub.is_live() || !sub.cancel_at_period_end {
            return Err(AppError::state(
                "Only subscriptions scheduled for cancellation can be reactivated",
            ));
        }

        let deadline = self.deadline();
        if let Some(provider_id) = &sub.provider_subscription_id {
            self.provider_deadline(&deadline)
                .run_fallible(
                    "resume subscription",
                    self.providers.payment.resume_subscription(provider_id),
                )
                .await?;
        }

        let _guard = self.locks.acquire(&sub.user_id, deadline).await?;
        let mut updated = self.load(sub.id).await?;
        updated.cancel_at_period_end = false;
        self.subscriptions.update_user_subscription(&updated).await?;
        info!(subscription_id = %updated.id, "Subscription reactivated");
        self.publish_change(&updated);
        Ok(updated)
    }

    // ==================== Provider confirmations ====================

    /// 结账完成：激活 incomplete 账本行，并取消被替换的免费订阅
    #[instrument(skip(self, provider))]
    pub async fn confirm_checkout(
        &self,
        subscription_id: Uuid,
        provider: &ProviderSubscription,
        replace: Option<Uuid>,
    ) -> Result<UserSubscription> {
        let sub = self.load(subscription_id).await?;
        if sub.provider_subscription_id.as_deref() == Some(provider.subscription_id.as_str())
            && sub.is_live()
        {
            return Ok(sub);
        }

        let _guard = self.locks.acquire(&sub.user_id, self.deadline()).await?;
        let mut updated = self.load(subscription_id).await?;
        updated.provider_subscription_id = Some(provider.subscription_id.clone());
        updated.provider_customer_id = Some(provider.customer_id.clone());
        updated.status = provider.status;
        updated.current_period_start = provider.current_period_start;
        updated.current_period_end = provider.current_period_end;
        self.subscriptions.update_user_subscription(&updated).await?;

        if let Some(replace_id) = replace.filter(|id| *id != subscription_id) {
            if let Some(old) = self.subscriptions.get_user_subscription(replace_id).await? {
                if old.user_id == updated.user_id && old.is_live() {
                    self.subscriptions
                        .transition_status(old.id, old.status, SubscriptionStatus::Cancelled)
                        .await?;
                    info!(replaced = %old.id, "Free subscription replaced");
                }
            }
        }

        self.usage.sync_limits(&updated.user_id).await?;
        info!(subscription_id = %updated.id, status = ?updated.status, "Checkout confirmed");
        self.publish_change(&updated);
        Ok(updated)
    }

    /// 应用支付服务推送的状态
    ///
    /// 计费周期前移时清零按周期计数的指标。已取消的账本行忽略非取消事件。
    #[instrument(skip(self, update), fields(provider_subscription_id = %update.subscription_id))]
    pub async fn apply_provider_update(&self, update: &ProviderUpdate) -> Result<ProviderUpdateResult> {
        if let Some(sub) = self
            .subscriptions
            .find_user_subscription_by_provider_id(&update.subscription_id)
            .await?
        {
            let _guard = self.locks.acquire(&sub.user_id, self.deadline()).await?;
            let mut updated = self.load(sub.id).await?;
            if is_stale(updated.status, update.status) {
                warn!(
                    subscription_id = %updated.id,
                    incoming = ?update.status,
                    "Ignoring provider update for a cancelled subscription"
                );
                return Ok(ProviderUpdateResult::Stale);
            }
            let rolled_over = update
                .current_period_start
                .is_some_and(|start| start > updated.current_period_start);

            updated.status = update.status;
            if let Some(start) = update.current_period_start {
                updated.current_period_start = start;
            }
            if let Some(end) = update.current_period_end {
                updated.current_period_end = end;
            }
            if let Some(flag) = update.cancel_at_period_end {
                updated.cancel_at_period_end = flag;
            }
            if updated.status == SubscriptionStatus::Cancelled && updated.cancelled_at.is_none() {
                updated.cancelled_at = Some(Utc::now());
            }
            self.subscriptions.update_user_subscription(&updated).await?;

            if rolled_over {
                self.usage
                    .reset_period(
                        &updated.user_id,
                        Some((updated.current_period_start, updated.current_period_end)),
                    )
                    .await?;
            }
            self.usage.sync_limits(&updated.user_id).await?;
            self.publish_change(&updated);
            return Ok(ProviderUpdateResult::Applied);
        }

        if let Some(mut org_sub) = self
            .subscriptions
            .find_org_subscription_by_provider_id(&update.subscription_id)
            .await?
        {
            if is_stale(org_sub.status, update.status) {
                warn!(
                    org_id = %org_sub.organization_id,
                    incoming = ?update.status,
                    "Ignoring provider update for a cancelled organization subscription"
                );
                return Ok(ProviderUpdateResult::Stale);
            }
            org_sub.status = update.status;
            if let Some(start) = update.current_period_start {
                org_sub.current_period_start = start;
            }
            if let Some(end) = update.current_period_end {
                org_sub.current_period_end = end;
            }
            if let Some(flag) = update.cancel_at_period_end {
                org_sub.cancel_at_period_end = flag;
            }
            if org_sub.status == SubscriptionStatus::Cancelled {
                org_sub.cancelled_at.get_or_insert_with(Utc::now);
                self.membership
                    .set_organization_plan(org_sub.organization_id, None)
                    .await?;
            }
            self.subscriptions.update_org_subscription(&org_sub).await?;
            info!(org_id = %org_sub.organization_id, status = ?org_sub.status, "Organization subscription updated");
            return Ok(ProviderUpdateResult::Applied);
        }

        Ok(ProviderUpdateResult::Unmatched)
    }

    // ==================== Organization subscriptions ====================

    /// 组织订阅：免费计划或管理员分配时立即生效
    #[instrument(skip(self, roles))]
    pub async fn subscribe_organization(
        &self,
        org_id: Uuid,
        actor: &str,
        roles: &[String],
        plan_id: Uuid,
        quantity: i32,
        urls: CheckoutUrls,
    ) -> Result<OrganizationCheckout> {
        self.membership
            .get_organization(org_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization"))?;
        if self.subscriptions.get_live_org_subscription(org_id).await?.is_some() {
            return Err(AppError::conflict(
                "Organization already has an active subscription",
            ));
        }

        let plan = self.plans.get_plan(plan_id).await?;
        ensure_purchasable(&plan, roles)?;
        let quantity = quantity.max(1);

        if plan.is_free() || has_role(roles, ADMIN_ROLE) {
            let sub = OrganizationSubscription::new(org_id, &plan, quantity, SubscriptionStatus::Active);
            self.subscriptions.insert_org_subscription(&sub).await?;
            self.membership.set_organization_plan(org_id, Some(plan.id)).await?;
            info!(org_id = %org_id, plan = %plan.name, "Organization subscription activated");
            return Ok(OrganizationCheckout {
                subscription: sub,
                checkout_url: None,
            });
        }

        let price_id = provider_price(&plan)?;
        let deadline = self.deadline();
        let customer_id = self.ensure_customer(actor, &deadline).await?;

        let mut sub = OrganizationSubscription::new(org_id, &plan, quantity, SubscriptionStatus::Incomplete);
        sub.provider_customer_id = Some(customer_id.clone());
        self.subscriptions.insert_org_subscription(&sub).await?;

        let request = CheckoutSessionRequest {
            customer_id,
            price_id,
            quantity,
            trial_days: plan.trial_days,
            success_url: urls
                .success_url
                .unwrap_or_else(|| self.settings.default_success_url.clone()),
            cancel_url: urls
                .cancel_url
                .unwrap_or_else(|| self.settings.default_cancel_url.clone()),
            metadata: HashMap::from([
                ("organization_id".to_string(), org_id.to_string()),
                ("organization_subscription_id".to_string(), sub.id.to_string()),
                ("plan_id".to_string(), plan.id.to_string()),
                ("user_id".to_string(), actor.to_string()),
            ]),
        };
        let session = self
            .provider_deadline(&deadline)
            .run_fallible(
                "create checkout session",
                self.providers.payment.create_checkout_session(&request),
            )
            .await?;

        Ok(OrganizationCheckout {
            subscription: sub,
            checkout_url: Some(session.checkout_url),
        })
    }

    /// 组织结账完成
    pub async fn confirm_organization_checkout(
        &self,
        org_subscription_id: Uuid,
        provider: &ProviderSubscription,
    ) -> Result<OrganizationSubscription> {
        let mut sub = self
            .subscriptions
            .get_org_subscription(org_subscription_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization subscription"))?;
        if sub.provider_subscription_id.as_deref() == Some(provider.subscription_id.as_str())
            && sub.status.is_live()
        {
            return Ok(sub);
        }

        sub.provider_subscription_id = Some(provider.subscription_id.clone());
        sub.provider_customer_id = Some(provider.customer_id.clone());
        sub.status = provider.status;
        sub.current_period_start = provider.current_period_start;
        sub.current_period_end = provider.current_period_end;
        self.subscriptions.update_org_subscription(&sub).await?;
        if sub.status.is_live() {
            self.membership
                .set_organization_plan(sub.organization_id, Some(sub.plan_id))
                .await?;
        }
        info!(org_id = %sub.organization_id, "Organization checkout confirmed");
        Ok(sub)
    }

    pub async fn get_organization_subscription(
        &self,
        org_id: Uuid,
    ) -> Result<Option<(OrganizationSubscription, SubscriptionPlan)>> {
        match self.subscriptions.get_live_org_subscription(org_id).await? {
            Some(sub) => {
                let plan = self.plans.get_plan(sub.plan_id).await?;
                Ok(Some((sub, plan)))
            }
            None => Ok(None),
        }
    }

    /// 取消组织订阅
    #[instrument(skip(self))]
    pub async fn cancel_organization_subscription(
        &self,
        org_id: Uuid,
        immediate: bool,
    ) -> Result<OrganizationSubscription> {
        let mut sub = self
            .subscriptions
            .get_live_org_subscription(org_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization subscription"))?;

        let mut provider_gone = false;
        if let Some(provider_id) = &sub.provider_subscription_id {
            match self
                .provider_deadline(&self.deadline())
                .run(
                    "cancel subscription",
                    self.providers.payment.cancel_subscription(provider_id, !immediate),
                )
                .await?
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => provider_gone = true,
                Err(e) => return Err(e.into()),
            }
        }

        if immediate || provider_gone || sub.provider_subscription_id.is_none() {
            sub.status = SubscriptionStatus::Cancelled;
            sub.cancelled_at = Some(Utc::now());
            self.membership.set_organization_plan(org_id, None).await?;
        } else {
            sub.cancel_at_period_end = true;
        }
        self.subscriptions.update_org_subscription(&sub).await?;
        info!(org_id = %org_id, status = ?sub.status, "Organization subscription cancelled");
        Ok(sub)
    }

    /// 变更组织订阅计划
    #[instrument(skip(self, roles))]
    pub async fn change_organization_plan(
        &self,
        org_id: Uuid,
        roles: &[String],
        plan_id: Uuid,
    ) -> Result<OrganizationSubscription> {
        let plan = self.plans.get_plan(plan_id).await?;
        ensure_purchasable(&plan, roles)?;
        let mut sub = self
            .subscriptions
            .get_live_org_subscription(org_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization subscription"))?;

        if let Some(provider_id) = &sub.provider_subscription_id {
            let price_id = provider_price(&plan)?;
            self.provider_deadline(&self.deadline())
                .run_fallible(
                    "update subscription plan",
                    self.providers.payment.update_subscription_plan(
                        provider_id,
                        &price_id,
                        ProrationBehavior::default(),
                    ),
                )
                .await?;
        }

        sub.plan_id = plan.id;
        self.subscriptions.update_org_subscription(&sub).await?;
        self.membership.set_organization_plan(org_id, Some(plan.id)).await?;
        info!(org_id = %org_id, plan = %plan.name, "Organization plan changed");
        Ok(sub)
    }
}
