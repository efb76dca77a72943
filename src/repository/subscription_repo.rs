//! Subscription repository (订阅账本数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{usage_repo::write_limits, SubscriptionRepository};
use crate::{
    error::Result,
    models::subscription::{OrganizationSubscription, PlanChange, SubscriptionStatus, UserSubscription},
};

pub struct PgSubscriptionRepository {
    db: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    // ==================== User subscriptions ====================

    async fn insert_user_subscription(&self, sub: &UserSubscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_subscriptions (
                id, user_id, plan_id, subscription_type, batch_id, assigned_by,
                provider_subscription_id, provider_customer_id, status,
                current_period_start, current_period_end, trial_end,
                cancel_at_period_end, cancelled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(sub.id)
        .bind(&sub.user_id)
        .bind(sub.plan_id)
        .bind(sub.subscription_type)
        .bind(sub.batch_id)
        .bind(&sub.assigned_by)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.provider_customer_id)
        .bind(sub.status)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.cancelled_at)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_user_subscription(&self, id: Uuid) -> Result<Option<UserSubscription>> {
        let sub = sqlx::query_as::<_, UserSubscription>("SELECT * FROM user_subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(sub)
    }

    async fn list_user_subscriptions(&self, user_id: &str, live_only: bool) -> Result<Vec<UserSubscription>> {
        let subs = sqlx::query_as::<_, UserSubscription>(
            r#"
            SELECT * FROM user_subscriptions
            WHERE user_id = $1
              AND ($2 = FALSE OR status IN ('active', 'trialing'))
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(live_only)
        .fetch_all(&self.db)
        .await?;

        Ok(subs)
    }

    async fn list_batch_subscriptions(&self, batch_id: Uuid) -> Result<Vec<UserSubscription>> {
        let subs = sqlx::query_as::<_, UserSubscription>(
            "SELECT * FROM user_subscriptions WHERE batch_id = $1 ORDER BY created_at",
        )
        .bind(batch_id)
        .fetch_all(&self.db)
        .await?;

        Ok(subs)
    }

    async fn find_user_subscription_by_provider_id(&self, provider_id: &str) -> Result<Option<UserSubscription>> {
        let sub = sqlx::query_as::<_, UserSubscription>(
            "SELECT * FROM user_subscriptions WHERE provider_subscription_id = $1",
        )
        .bind(provider_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(sub)
    }

    async fn update_user_subscription(&self, sub: &UserSubscription) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET plan_id = $2, provider_subscription_id = $3, provider_customer_id = $4,
                status = $5, current_period_start = $6, current_period_end = $7,
                trial_end = $8, cancel_at_period_end = $9, cancelled_at = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(sub.plan_id)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.provider_customer_id)
        .bind(sub.status)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.cancelled_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        expected: SubscriptionStatus,
        new_status: SubscriptionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = $3,
                cancelled_at = CASE WHEN $3 = 'cancelled'::subscription_status THEN NOW() ELSE cancelled_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(new_status)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_plan_change(&self, change: &PlanChange) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let (rebind, provider_subscription_id, provider_customer_id) = change.provider.columns();
        let (period_start, period_end) = change.period.unzip();

        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET plan_id = $4,
                status = $5,
                cancel_at_period_end = FALSE,
                provider_subscription_id = CASE WHEN $6 THEN $7 ELSE provider_subscription_id END,
                provider_customer_id = CASE WHEN $6 THEN COALESCE($8, provider_customer_id)
                                            ELSE provider_customer_id END,
                current_period_start = COALESCE($9, current_period_start),
                current_period_end = COALESCE($10, current_period_end),
                updated_at = NOW()
            WHERE id = $1 AND plan_id = $2 AND status = $3
            "#,
        )
        .bind(change.subscription_id)
        .bind(change.expected_plan_id)
        .bind(change.expected_status)
        .bind(change.new_plan_id)
        .bind(change.new_status)
        .bind(rebind)
        .bind(provider_subscription_id)
        .bind(provider_customer_id)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        write_limits(&mut tx, &change.user_id, &change.limits).await?;

        tx.commit().await?;
        Ok(true)
    }

    // ==================== Organization subscriptions ====================

    async fn insert_org_subscription(&self, sub: &OrganizationSubscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organization_subscriptions (
                id, organization_id, plan_id, provider_subscription_id, provider_customer_id,
                status, quantity, current_period_start, current_period_end, trial_end,
                cancel_at_period_end, cancelled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(sub.id)
        .bind(sub.organization_id)
        .bind(sub.plan_id)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.provider_customer_id)
        .bind(sub.status)
        .bind(sub.quantity)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.cancelled_at)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_org_subscription(&self, id: Uuid) -> Result<Option<OrganizationSubscription>> {
        let sub = sqlx::query_as::<_, OrganizationSubscription>(
            "SELECT * FROM organization_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(sub)
    }

    async fn get_live_org_subscription(&self, org_id: Uuid) -> Result<Option<OrganizationSubscription>> {
        let sub = sqlx::query_as::<_, OrganizationSubscription>(
            r#"
            SELECT * FROM organization_subscriptions
            WHERE organization_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(sub)
    }

    async fn list_live_org_subscriptions(&self, org_ids: &[Uuid]) -> Result<Vec<OrganizationSubscription>> {
        if org_ids.is_empty() {
            return Ok(Vec::new());
        }

        let subs = sqlx::query_as::<_, OrganizationSubscription>(
            r#"
            SELECT * FROM organization_subscriptions
            WHERE organization_id = ANY($1) AND status IN ('active', 'trialing')
            ORDER BY created_at
            "#,
        )
        .bind(org_ids)
        .fetch_all(&self.db)
        .await?;

        Ok(subs)
    }

    async fn find_org_subscription_by_provider_id(&self, provider_id: &str) -> Result<Option<OrganizationSubscription>> {
        let sub = sqlx::query_as::<_, OrganizationSubscription>(
            "SELECT * FROM organization_subscriptions WHERE provider_subscription_id = $1",
        )
        .bind(provider_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(sub)
    }

    async fn update_org_subscription(&self, sub: &OrganizationSubscription) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE organization_subscriptions
            SET plan_id = $2, provider_subscription_id = $3, provider_customer_id = $4,
                status = $5, quantity = $6, current_period_start = $7, current_period_end = $8,
                trial_end = $9, cancel_at_period_end = $10, cancelled_at = $11, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(sub.plan_id)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.provider_customer_id)
        .bind(sub.status)
        .bind(sub.quantity)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.cancelled_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn forget_webhook_event(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
