//! Usage meter
//!
//! 每个用户每个指标一个计数器。上限来自主订阅计划，计数通过单条条件语句原子更新。

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::plan_catalog::PlanLookup;
use super::subscription_service::{live_with_plans, select_primary};
use crate::{
    error::{AppError, Result},
    models::{
        plan::SubscriptionPlan,
        usage::{month_bounds, IncrementOutcome, MetricType, UsageCheck, UsageMetric},
    },
    repository::{SubscriptionRepository, UsageRepository},
};

/// 汇总组织用量时并发读取的成员数
const MEMBER_READ_CONCURRENCY: usize = 8;

/// 组织维度的用量汇总
#[derive(Debug, Clone, Serialize)]
pub struct OrganizationUsage {
    pub metric_type: MetricType,
    pub current_usage: i64,
    pub limit: i64,
}

/// 用量服务
pub struct UsageService {
    usage: Arc<dyn UsageRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    plans: Arc<dyn PlanLookup>,
}

fn remaining(current: i64, limit: i64) -> i64 {
    if limit == -1 {
        -1
    } else {
        (limit - current).max(0)
    }
}

impl UsageService {
    pub fn new(
        usage: Arc<dyn UsageRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        plans: Arc<dyn PlanLookup>,
    ) -> Self {
        Self {
            usage,
            subscriptions,
            plans,
        }
    }

    /// 主订阅计划，没有有效订阅时为 None
    async fn primary_plan(&self, user_id: &str) -> Result<Option<SubscriptionPlan>> {
        let live = live_with_plans(self.subscriptions.as_ref(), self.plans.as_ref(), user_id).await?;
        Ok(select_primary(&live).map(|(_, plan)| plan.clone()))
    }

    /// 检查再消耗 increment 个单位是否仍在上限内
    pub async fn check(&self, user_id: &str, metric: MetricType, increment: i64) -> Result<UsageCheck> {
        let (current, limit) = match self.usage.get(user_id, metric).await? {
            Some(row) => (row.current_value, row.limit_value),
            None => {
                let limit = match self.primary_plan(user_id).await? {
                    Some(plan) => plan.cap_for(metric),
                    None => {
                        return Ok(UsageCheck {
                            user_id: user_id.to_string(),
                            metric_type: metric,
                            allowed: false,
                            current_usage: 0,
                            limit: 0,
                            remaining: 0,
                            message: "No active subscription".to_string(),
                        })
                    }
                };
                (0, limit)
            }
        };

        let allowed = increment <= 0 || limit == -1 || current + increment <= limit;
        let message = if allowed {
            String::new()
        } else {
            format!("Usage limit exceeded. Current: {}, Limit: {}", current, limit)
        };

        Ok(UsageCheck {
            user_id: user_id.to_string(),
            metric_type: metric,
            allowed,
            current_usage: current,
            limit,
            remaining: remaining(current, limit),
            message,
        })
    }

    /// 原子递增，超限时返回 LimitReached
    #[instrument(skip(self))]
    pub async fn increment(&self, user_id: &str, metric: MetricType, delta: i64) -> Result<UsageMetric> {
        let default_limit = match self.primary_plan(user_id).await? {
            Some(plan) => plan.cap_for(metric),
            None => 0,
        };

        match self
            .usage
            .try_increment(user_id, metric, delta, default_limit)
            .await?
        {
            IncrementOutcome::Applied(row) => {
                debug!(current = row.current_value, limit = row.limit_value, "Usage incremented");
                Ok(row)
            }
            IncrementOutcome::Rejected(row) => Err(AppError::usage_limit_exceeded(
                row.current_value,
                row.limit_value,
            )),
        }
    }

    /// 计费周期滚动：清零按周期计数的指标
    #[instrument(skip(self))]
    pub async fn reset_period(
        &self,
        user_id: &str,
        period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<u64> {
        let (start, end) = period.unwrap_or_else(|| month_bounds(Utc::now()));
        let scoped: Vec<MetricType> = MetricType::ALL
            .into_iter()
            .filter(MetricType::is_period_scoped)
            .collect();
        let reset = self.usage.reset_period(user_id, &scoped, start, end).await?;
        info!(reset, "Usage period reset");
        Ok(reset)
    }

    /// 按当前主订阅计划重写全部上限，没有订阅时上限为 0
    #[instrument(skip(self))]
    pub async fn sync_limits(&self, user_id: &str) -> Result<Vec<(MetricType, i64)>> {
        let limits = match self.primary_plan(user_id).await? {
            Some(plan) => plan.metric_limits(),
            None => MetricType::ALL.iter().map(|metric| (*metric, 0)).collect(),
        };
        self.usage.set_limits(user_id, &limits).await?;
        debug!(?limits, "Usage limits synchronized");
        Ok(limits)
    }

    /// 直接写入上限（席位分配等已知计划的路径）
    pub async fn write_limits(&self, user_id: &str, limits: &[(MetricType, i64)]) -> Result<()> {
        self.usage.set_limits(user_id, limits).await
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<UsageMetric>> {
        self.usage.list(user_id).await
    }

    /// 组织的计划上限与成员用量之和
    pub async fn organization_usage(
        &self,
        plan: Option<&SubscriptionPlan>,
        member_ids: &[String],
    ) -> Result<Vec<OrganizationUsage>> {
        let mut totals: Vec<OrganizationUsage> = MetricType::ALL
            .iter()
            .map(|metric| OrganizationUsage {
                metric_type: *metric,
                current_usage: 0,
                limit: plan.map(|p| p.cap_for(*metric)).unwrap_or(0),
            })
            .collect();

        let usage = &self.usage;
        let per_member: Vec<Vec<UsageMetric>> = stream::iter(member_ids.iter().cloned())
            .map(|user_id| async move { usage.list(&user_id).await })
            .buffer_unordered(MEMBER_READ_CONCURRENCY)
            .try_collect()
            .await?;

        for row in per_member.into_iter().flatten() {
            if let Some(total) = totals.iter_mut().find(|t| t.metric_type == row.metric_type) {
                total.current_usage += row.current_value;
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::services::plan_catalog::PlanCatalog;

    fn service(store: &Arc<MemoryStore>) -> UsageService {
        UsageService::new(
            store.clone(),
            store.clone(),
            Arc::new(PlanCatalog::new(store.clone())),
        )
    }

    #[tokio::test]
    async fn test_check_without_subscription_denies() {
        let store = Arc::new(MemoryStore::new());
        let check = service(&store)
            .check("u1", MetricType::ConcurrentTerminals, 1)
            .await
            .unwrap();
        assert!(!check.allowed);
        assert_eq!(check.message, "No active subscription");
    }

    #[tokio::test]
    async fn test_increment_respects_limit() {
        let store = Arc::new(MemoryStore::new());
        let usage = service(&store);
        usage
            .write_limits("u1", &[(MetricType::ConcurrentTerminals, 2)])
            .await
            .unwrap();

        usage.increment("u1", MetricType::ConcurrentTerminals, 1).await.unwrap();
        usage.increment("u1", MetricType::ConcurrentTerminals, 1).await.unwrap();
        let err = usage
            .increment("u1", MetricType::ConcurrentTerminals, 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");

        let check = usage.check("u1", MetricType::ConcurrentTerminals, 1).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);

        // 释放一个终端
        usage.increment("u1", MetricType::ConcurrentTerminals, -1).await.unwrap();
        let check = usage.check("u1", MetricType::ConcurrentTerminals, 1).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.current_usage, 1);
    }

    #[tokio::test]
    async fn test_reset_period_only_touches_scoped_metrics() {
        let store = Arc::new(MemoryStore::new());
        let usage = service(&store);
        usage
            .write_limits(
                "u1",
                &[(MetricType::ConcurrentTerminals, -1), (MetricType::CoursesCreated, -1)],
            )
            .await
            .unwrap();
        usage.increment("u1", MetricType::ConcurrentTerminals, 3).await.unwrap();
        usage.increment("u1", MetricType::CoursesCreated, 4).await.unwrap();

        assert_eq!(usage.reset_period("u1", None).await.unwrap(), 1);

        let terminals = usage.check("u1", MetricType::ConcurrentTerminals, 0).await.unwrap();
        let courses = usage.check("u1", MetricType::CoursesCreated, 0).await.unwrap();
        assert_eq!(terminals.current_usage, 3);
        assert_eq!(courses.current_usage, 0);
        assert_eq!(courses.remaining, -1);
    }

    #[tokio::test]
    async fn test_organization_usage_sums_members() {
        let store = Arc::new(MemoryStore::new());
        let usage = service(&store);
        for user in ["u1", "u2", "u3"] {
            usage
                .write_limits(user, &[(MetricType::CoursesCreated, -1)])
                .await
                .unwrap();
        }
        usage.increment("u1", MetricType::CoursesCreated, 2).await.unwrap();
        usage.increment("u2", MetricType::CoursesCreated, 5).await.unwrap();

        let members: Vec<String> = ["u1", "u2", "u3"].iter().map(|s| s.to_string()).collect();
        let totals = usage.organization_usage(None, &members).await.unwrap();
        let courses = totals
            .iter()
            .find(|t| t.metric_type == MetricType::CoursesCreated)
            .unwrap();
        assert_eq!(courses.current_usage, 7);
        assert_eq!(courses.limit, 0);
        assert_eq!(totals.len(), MetricType::ALL.len());
    }
}
