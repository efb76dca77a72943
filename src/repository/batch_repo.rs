//! Batch repository (批量授权数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::BatchRepository;
use crate::{
    error::{AppError, Result},
    models::{
        batch::{BatchStatus, LicenseSeat, SeatOutcome, SeatRelease, SubscriptionBatch},
        subscription::UserSubscription,
    },
};

pub struct PgBatchRepository {
    db: PgPool,
}

impl PgBatchRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

async fn insert_seats(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    seats: &[LicenseSeat],
) -> Result<()> {
    for seat in seats {
        sqlx::query(
            r#"
            INSERT INTO license_seats (id, batch_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(seat.id)
        .bind(seat.batch_id)
        .bind(seat.status)
        .bind(seat.created_at)
        .bind(seat.updated_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl BatchRepository for PgBatchRepository {
    async fn insert_batch(&self, batch: &SubscriptionBatch, seats: &[LicenseSeat]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_batches (
                id, purchaser_user_id, plan_id, group_id, provider_subscription_id,
                provider_item_id, total_quantity, assigned_quantity, status,
                current_period_start, current_period_end, cancelled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.purchaser_user_id)
        .bind(batch.plan_id)
        .bind(batch.group_id)
        .bind(&batch.provider_subscription_id)
        .bind(&batch.provider_item_id)
        .bind(batch.total_quantity)
        .bind(batch.assigned_quantity)
        .bind(batch.status)
        .bind(batch.current_period_start)
        .bind(batch.current_period_end)
        .bind(batch.cancelled_at)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_seats(&mut tx, seats).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<SubscriptionBatch>> {
        let batch = sqlx::query_as::<_, SubscriptionBatch>("SELECT * FROM subscription_batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(batch)
    }

    async fn list_by_purchaser(&self, user_id: &str) -> Result<Vec<SubscriptionBatch>> {
        let batches = sqlx::query_as::<_, SubscriptionBatch>(
            "SELECT * FROM subscription_batches WHERE purchaser_user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(batches)
    }

    async fn list_by_group(&self, group_id: Uuid) -> Result<Vec<SubscriptionBatch>> {
        let batches = sqlx::query_as::<_, SubscriptionBatch>(
            "SELECT * FROM subscription_batches WHERE group_id = $1 ORDER BY created_at",
        )
        .bind(group_id)
        .fetch_all(&self.db)
        .await?;

        Ok(batches)
    }

    async fn find_by_provider_id(&self, provider_id: &str) -> Result<Option<SubscriptionBatch>> {
        let batch = sqlx::query_as::<_, SubscriptionBatch>(
            "SELECT * FROM subscription_batches WHERE provider_subscription_id = $1",
        )
        .bind(provider_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(batch)
    }

    async fn list_seats(&self, batch_id: Uuid) -> Result<Vec<LicenseSeat>> {
        let seats = sqlx::query_as::<_, LicenseSeat>(
            "SELECT * FROM license_seats WHERE batch_id = $1 ORDER BY status, created_at",
        )
        .bind(batch_id)
        .fetch_all(&self.db)
        .await?;

        Ok(seats)
    }

    async fn get_seat(&self, seat_id: Uuid) -> Result<Option<LicenseSeat>> {
        let seat = sqlx::query_as::<_, LicenseSeat>("SELECT * FROM license_seats WHERE id = $1")
            .bind(seat_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(seat)
    }

    async fn assign_seat(&self, batch_id: Uuid, subscription: &UserSubscription) -> Result<SeatOutcome> {
        let mut tx = self.db.begin().await?;

        let batch = sqlx::query_as::<_, SubscriptionBatch>(
            "SELECT * FROM subscription_batches WHERE id = $1 FOR UPDATE",
        )
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("subscription batch"))?;

        if !batch.is_active() {
            return Ok(SeatOutcome::BatchInactive);
        }

        let already: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM license_seats
            WHERE batch_id = $1 AND assignee_user_id = $2 AND status = 'assigned'
            "#,
        )
        .bind(batch_id)
        .bind(&subscription.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Ok(SeatOutcome::AlreadyAssigned);
        }

        if batch.pool() <= 0 {
            return Ok(SeatOutcome::PoolExhausted);
        }

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
        .bind(subscription.id)
        .bind(&subscription.user_id)
        .bind(subscription.plan_id)
        .bind(subscription.subscription_type)
        .bind(subscription.batch_id)
        .bind(&subscription.assigned_by)
        .bind(&subscription.provider_subscription_id)
        .bind(&subscription.provider_customer_id)
        .bind(subscription.status)
        .bind(batch.current_period_start)
        .bind(batch.current_period_end)
        .bind(subscription.trial_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.cancelled_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *tx)
        .await?;

        let seat = sqlx::query_as::<_, LicenseSeat>(
            r#"
            UPDATE license_seats
            SET status = 'assigned', subscription_id = $2, assignee_user_id = $3,
                assigned_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM license_seats
                WHERE batch_id = $1 AND status = 'unassigned'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(batch_id)
        .bind(subscription.id)
        .bind(&subscription.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(seat) = seat else {
            tx.rollback().await?;
            return Ok(SeatOutcome::PoolExhausted);
        };

        let batch = sqlx::query_as::<_, SubscriptionBatch>(
            r#"
            UPDATE subscription_batches
            SET assigned_quantity = assigned_quantity + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(batch_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SeatOutcome::Assigned { batch, seat })
    }

    async fn release_seat(&self, seat_id: Uuid) -> Result<SeatRelease> {
        let mut tx = self.db.begin().await?;

        let seat = sqlx::query_as::<_, LicenseSeat>("SELECT * FROM license_seats WHERE id = $1 FOR UPDATE")
            .bind(seat_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("license seat"))?;

        let Some(subscription_id) = seat.subscription_id else {
            return Ok(SeatRelease::NotAssigned);
        };

        let subscription = sqlx::query_as::<_, UserSubscription>(
            r#"
            UPDATE user_subscriptions
            SET status = 'cancelled', cancelled_at = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE license_seats
            SET status = 'unassigned', subscription_id = NULL, assignee_user_id = NULL,
                assigned_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(seat_id)
        .execute(&mut *tx)
        .await?;

        let batch = sqlx::query_as::<_, SubscriptionBatch>(
            r#"
            UPDATE subscription_batches
            SET assigned_quantity = GREATEST(assigned_quantity - 1, 0), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(seat.batch_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SeatRelease::Released { batch, subscription })
    }

    async fn resize(&self, batch_id: Uuid, expected_total: i32, new_total: i32) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE subscription_batches
            SET total_quantity = $3, updated_at = NOW()
            WHERE id = $1 AND total_quantity = $2 AND assigned_quantity <= $3
            "#,
        )
        .bind(batch_id)
        .bind(expected_total)
        .bind(new_total)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if new_total > expected_total {
            let seats: Vec<LicenseSeat> = (0..new_total - expected_total)
                .map(|_| LicenseSeat::unassigned(batch_id))
                .collect();
            insert_seats(&mut tx, &seats).await?;
        } else if new_total < expected_total {
            sqlx::query(
                r#"
                DELETE FROM license_seats
                WHERE id IN (
                    SELECT id FROM license_seats
                    WHERE batch_id = $1 AND status = 'unassigned'
                    ORDER BY created_at DESC
                    LIMIT $2
                )
                "#,
            )
            .bind(batch_id)
            .bind(i64::from(expected_total - new_total))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn update_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscription_batches
            SET status = $2,
                cancelled_at = CASE WHEN $2 = 'cancelled'::batch_status THEN NOW() ELSE cancelled_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(status)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn update_period(&self, batch_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscription_batches
            SET current_period_start = $2, current_period_end = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(start)
        .bind(end)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn delete_batch(&self, batch_id: Uuid) -> Result<bool> {
        // 席位随批次级联删除
        let result = sqlx::query(
            "DELETE FROM subscription_batches WHERE id = $1 AND assigned_quantity = 0",
        )
        .bind(batch_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
