//! Plan repository (订阅计划数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::PlanRepository;
use crate::{error::Result, models::plan::SubscriptionPlan};

pub struct PgPlanRepository {
    db: PgPool,
}

impl PgPlanRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PlanRepository for PgPlanRepository {
    async fn get(&self, id: Uuid) -> Result<Option<SubscriptionPlan>> {
        let plan = sqlx::query_as::<_, SubscriptionPlan>("SELECT * FROM subscription_plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(plan)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>> {
        let plan = sqlx::query_as::<_, SubscriptionPlan>(
            "SELECT * FROM subscription_plans WHERE name = $1 AND is_active = TRUE",
        )
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(plan)
    }

    async fn list(&self, active_only: bool) -> Result<Vec<SubscriptionPlan>> {
        let plans = sqlx::query_as::<_, SubscriptionPlan>(
            r#"
            SELECT * FROM subscription_plans
            WHERE ($1 = FALSE OR is_active = TRUE)
            ORDER BY priority DESC, name
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.db)
        .await?;

        Ok(plans)
    }

    async fn upsert(&self, plan: &SubscriptionPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_plans (
                id, name, description, priority, price_amount, currency, billing_interval,
                trial_days, provider_price_id, features,
                max_concurrent_terminals, max_courses, max_lab_sessions, max_concurrent_users,
                max_session_duration_minutes, data_persistence_gb, command_history_retention_days,
                network_access_enabled, data_persistence_enabled, allowed_machine_sizes,
                use_tiered_pricing, pricing_tiers, required_role, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                priority = EXCLUDED.priority,
                price_amount = EXCLUDED.price_amount,
                currency = EXCLUDED.currency,
                billing_interval = EXCLUDED.billing_interval,
                trial_days = EXCLUDED.trial_days,
                provider_price_id = EXCLUDED.provider_price_id,
                features = EXCLUDED.features,
                max_concurrent_terminals = EXCLUDED.max_concurrent_terminals,
                max_courses = EXCLUDED.max_courses,
                max_lab_sessions = EXCLUDED.max_lab_sessions,
                max_concurrent_users = EXCLUDED.max_concurrent_users,
                max_session_duration_minutes = EXCLUDED.max_session_duration_minutes,
                data_persistence_gb = EXCLUDED.data_persistence_gb,
                command_history_retention_days = EXCLUDED.command_history_retention_days,
                network_access_enabled = EXCLUDED.network_access_enabled,
                data_persistence_enabled = EXCLUDED.data_persistence_enabled,
                allowed_machine_sizes = EXCLUDED.allowed_machine_sizes,
                use_tiered_pricing = EXCLUDED.use_tiered_pricing,
                pricing_tiers = EXCLUDED.pricing_tiers,
                required_role = EXCLUDED.required_role,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.priority)
        .bind(plan.price_amount)
        .bind(&plan.currency)
        .bind(plan.billing_interval)
        .bind(plan.trial_days)
        .bind(&plan.provider_price_id)
        .bind(&plan.features)
        .bind(plan.max_concurrent_terminals)
        .bind(plan.max_courses)
        .bind(plan.max_lab_sessions)
        .bind(plan.max_concurrent_users)
        .bind(plan.max_session_duration_minutes)
        .bind(plan.data_persistence_gb)
        .bind(plan.command_history_retention_days)
        .bind(plan.network_access_enabled)
        .bind(plan.data_persistence_enabled)
        .bind(&plan.allowed_machine_sizes)
        .bind(plan.use_tiered_pricing)
        .bind(&plan.pricing_tiers)
        .bind(&plan.required_role)
        .bind(plan.is_active)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscription_plans SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
