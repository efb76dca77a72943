//! Subscription plan catalog
//!
//! 计划的只读查询通过 `PlanLookup` 暴露，支付与账本代码只依赖该 trait。

use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::plan::{PriceBreakdown, PricingTier, SubscriptionPlan, TierCost, UpsertPlanRequest},
    repository::PlanRepository,
};

/// 计划只读查询
#[async_trait]
pub trait PlanLookup: Send + Sync {
    async fn get_plan(&self, id: Uuid) -> Result<SubscriptionPlan>;
    async fn find_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>>;
    async fn list_active_plans(&self) -> Result<Vec<SubscriptionPlan>>;
}

/// 计划优先级
pub fn priority(plan: &SubscriptionPlan) -> i32 {
    plan.priority
}

/// 按全序选出最优计划
pub fn highest<'a, I>(plans: I) -> Option<&'a SubscriptionPlan>
where
    I: IntoIterator<Item = &'a SubscriptionPlan>,
{
    plans.into_iter().max_by(|a, b| a.precedence(b))
}

/// 本次实际落在该段的数量区间，如 11-15；开放段写作 16+
fn tier_range(tier: &PricingTier, taken: i32) -> String {
    if tier.is_open_ended() {
        format!("{}+", tier.min_quantity)
    } else {
        format!("{}-{}", tier.min_quantity, tier.min_quantity + taken - 1)
    }
}

/// 阶梯价格计算
///
/// 每一段覆盖 `[min, max]`（两端闭合），最后一段没有上限。
/// 数量依次落入各段，按段单价累加。
pub fn tiered_price(plan: &SubscriptionPlan, quantity: i32) -> Result<PriceBreakdown> {
    if quantity < 1 {
        return Err(AppError::validation("quantity must be at least 1"));
    }

    let flat_total = plan.price_amount * i64::from(quantity);

    if !plan.use_tiered_pricing || plan.pricing_tiers.is_empty() {
        return Ok(PriceBreakdown {
            plan_id: plan.id,
            plan_name: plan.name.clone(),
            quantity,
            currency: plan.currency.clone(),
            tiers: vec![TierCost {
                range: format!("1-{}", quantity),
                quantity,
                unit_price: plan.price_amount,
                subtotal: flat_total,
            }],
            subtotal: flat_total,
            unit_price: plan.price_amount,
            savings: 0,
            discount_note: None,
        });
    }

    let mut tiers: Vec<&PricingTier> = plan.pricing_tiers.iter().collect();
    tiers.sort_by_key(|tier| tier.min_quantity);

    let mut costs = Vec::new();
    let mut remaining = quantity;
    let mut subtotal = 0i64;

    for tier in tiers {
        if remaining <= 0 {
            break;
        }
        let span = if tier.is_open_ended() {
            remaining
        } else {
            (tier.max_quantity - tier.min_quantity + 1).max(0)
        };
        let taken = span.min(remaining);
        if taken == 0 {
            continue;
        }
        let cost = i64::from(taken) * tier.unit_amount;
        subtotal += cost;
        remaining -= taken;
        costs.push(TierCost {
            range: tier_range(tier, taken),
            quantity: taken,
            unit_price: tier.unit_amount,
            subtotal: cost,
        });
    }

    if remaining > 0 {
        return Err(AppError::Validation(format!(
            "quantity {} exceeds the largest pricing tier of plan {}",
            quantity, plan.name
        )));
    }

    let savings = (flat_total - subtotal).max(0);
    let discount_note = (savings > 0).then(|| {
        let percent = savings as f64 * 100.0 / flat_total as f64;
        format!("Volume discount: {:.1}% off the unit price", percent)
    });

    Ok(PriceBreakdown {
        plan_id: plan.id,
        plan_name: plan.name.clone(),
        quantity,
        currency: plan.currency.clone(),
        tiers: costs,
        subtotal,
        unit_price: subtotal / i64::from(quantity),
        savings,
        discount_note,
    })
}

fn validate_tiers(tiers: &[PricingTier]) -> Result<()> {
    let mut sorted: Vec<&PricingTier> = tiers.iter().collect();
    sorted.sort_by_key(|tier| tier.min_quantity);

    let mut expected_min = 1;
    for (index, tier) in sorted.iter().enumerate() {
        let last = index + 1 == sorted.len();
        if tier.min_quantity != expected_min {
            return Err(AppError::Validation(format!(
                "pricing tier must start at {}, got {}",
                expected_min, tier.min_quantity
            )));
        }
        if tier.unit_amount < 0 {
            return Err(AppError::validation("pricing tier amount must not be negative"));
        }
        if tier.is_open_ended() {
            if !last {
                return Err(AppError::validation("only the last pricing tier may be open-ended"));
            }
        } else {
            if tier.max_quantity < tier.min_quantity {
                return Err(AppError::validation("pricing tier max must be >= min"));
            }
            expected_min = tier.max_quantity + 1;
        }
    }
    Ok(())
}

/// 计划目录服务
pub struct PlanCatalog {
    repo: Arc<dyn PlanRepository>,
}

impl PlanCatalog {
    pub fn new(repo: Arc<dyn PlanRepository>) -> Self {
        Self { repo }
    }

    /// 列出计划（管理员可以看到已停用的）
    pub async fn list_plans(&self, include_inactive: bool) -> Result<Vec<SubscriptionPlan>> {
        let mut plans = self.repo.list(!include_inactive).await?;
        plans.sort_by(|a, b| b.precedence(a));
        Ok(plans)
    }

    /// 创建计划
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_plan(&self, request: UpsertPlanRequest) -> Result<SubscriptionPlan> {
        validate_tiers(&request.pricing_tiers)?;
        if self.repo.find_by_name(&request.name).await?.is_some() {
            return Err(AppError::Conflict(format!("Plan {} already exists", request.name)));
        }

        let plan = request.into_plan(Uuid::new_v4());
        self.repo.upsert(&plan).await?;
        info!(plan_id = %plan.id, priority = plan.priority, "Subscription plan created");
        Ok(plan)
    }

    /// 更新计划
    #[instrument(skip(self, request))]
    pub async fn update_plan(&self, id: Uuid, request: UpsertPlanRequest) -> Result<SubscriptionPlan> {
        validate_tiers(&request.pricing_tiers)?;
        let existing = self.get_plan(id).await?;
        if let Some(other) = self.repo.find_by_name(&request.name).await? {
            if other.id != id {
                return Err(AppError::Conflict(format!("Plan {} already exists", request.name)));
            }
        }

        let mut plan = request.into_plan(id);
        plan.created_at = existing.created_at;
        plan.is_active = existing.is_active;
        self.repo.upsert(&plan).await?;
        info!(plan_id = %id, "Subscription plan updated");
        Ok(plan)
    }

    /// 停用计划（已有订阅不受影响）
    pub async fn deactivate_plan(&self, id: Uuid) -> Result<()> {
        if !self.repo.set_active(id, false).await? {
            return Err(AppError::not_found("subscription plan"));
        }
        info!(plan_id = %id, "Subscription plan deactivated");
        Ok(())
    }

    pub async fn price_preview(&self, id: Uuid, quantity: i32) -> Result<PriceBreakdown> {
        let plan = self.get_plan(id).await?;
        tiered_price(&plan, quantity)
    }

    /// 比较两个计划
    pub fn compare(a: &SubscriptionPlan, b: &SubscriptionPlan) -> Ordering {
        a.precedence(b)
    }
}

#[async_trait]
impl PlanLookup for PlanCatalog {
    async fn get_plan(&self, id: Uuid) -> Result<SubscriptionPlan> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("subscription plan"))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>> {
        self.repo.find_by_name(name).await
    }

    async fn list_active_plans(&self) -> Result<Vec<SubscriptionPlan>> {
        self.list_plans(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::BillingInterval;
    use crate::repository::MemoryStore;

    fn request(name: &str, priority: i32, price: i64) -> UpsertPlanRequest {
        UpsertPlanRequest {
            name: name.to_string(),
            description: None,
            priority,
            price_amount: price,
            currency: "EUR".to_string(),
            billing_interval: BillingInterval::Month,
            trial_days: 0,
            provider_price_id: None,
            features: vec![],
            max_concurrent_terminals: 1,
            max_courses: 1,
            max_lab_sessions: 0,
            max_concurrent_users: 0,
            max_session_duration_minutes: 0,
            data_persistence_gb: 0,
            command_history_retention_days: 0,
            network_access_enabled: false,
            data_persistence_enabled: false,
            allowed_machine_sizes: vec![],
            use_tiered_pricing: false,
            pricing_tiers: vec![],
            required_role: None,
        }
    }

    fn tier(min: i32, max: i32, amount: i64) -> PricingTier {
        PricingTier {
            min_quantity: min,
            max_quantity: max,
            unit_amount: amount,
            description: None,
        }
    }

    #[test]
    fn test_tiered_price_spans_tiers() {
        let mut req = request("team", 20, 1000);
        req.use_tiered_pricing = true;
        req.pricing_tiers = vec![tier(1, 5, 1000), tier(6, 15, 800), tier(16, 0, 600)];
        let plan = req.into_plan(Uuid::new_v4());

        let price = tiered_price(&plan, 20).unwrap();
        assert_eq!(price.tiers.len(), 3);
        assert_eq!(price.subtotal, 5 * 1000 + 10 * 800 + 5 * 600);
        assert_eq!(price.savings, 20 * 1000 - price.subtotal);
        assert_eq!(price.tiers[2].range, "16+");
        assert!(price.discount_note.is_some());

        assert_eq!(price.tiers[0].range, "1-5");
        assert_eq!(price.tiers[1].range, "6-15");

        // 只用到第二段的一部分
        let partial = tiered_price(&plan, 8).unwrap();
        assert_eq!(partial.tiers.len(), 2);
        assert_eq!(partial.tiers[1].range, "6-8");
        assert_eq!(partial.tiers[1].quantity, 3);

        let small = tiered_price(&plan, 3).unwrap();
        assert_eq!(small.tiers[0].range, "1-3");
        assert_eq!(small.subtotal, 3000);
        assert_eq!(small.savings, 0);
        assert!(small.discount_note.is_none());
    }

    #[test]
    fn test_flat_price() {
        let plan = request("pro", 10, 1200).into_plan(Uuid::new_v4());
        let price = tiered_price(&plan, 4).unwrap();
        assert_eq!(price.subtotal, 4800);
        assert_eq!(price.unit_price, 1200);
        assert!(tiered_price(&plan, 0).is_err());
    }

    #[test]
    fn test_tier_validation() {
        assert!(validate_tiers(&[tier(1, 5, 10), tier(6, 0, 5)]).is_ok());
        assert!(validate_tiers(&[tier(2, 5, 10)]).is_err());
        assert!(validate_tiers(&[tier(1, 0, 10), tier(2, 3, 5)]).is_err());
        assert!(validate_tiers(&[tier(1, 5, 10), tier(7, 0, 5)]).is_err());
    }

    #[test]
    fn test_precedence_tie_breaks() {
        let mut a = request("alpha", 10, 0).into_plan(Uuid::new_v4());
        let mut b = request("beta", 10, 0).into_plan(Uuid::new_v4());
        assert_eq!(highest([&a, &b]).map(|p| p.name.as_str()), Some("alpha"));

        b.max_concurrent_terminals = 5;
        assert_eq!(highest([&a, &b]).map(|p| p.name.as_str()), Some("beta"));

        a.priority = 11;
        assert_eq!(highest([&a, &b]).map(|p| p.name.as_str()), Some("alpha"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let catalog = PlanCatalog::new(Arc::new(MemoryStore::new()));
        catalog.create_plan(request("pro", 10, 1200)).await.unwrap();
        let err = catalog.create_plan(request("pro", 11, 1300)).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        let plans = catalog.list_active_plans().await.unwrap();
        assert_eq!(plans.len(), 1);
    }
}
