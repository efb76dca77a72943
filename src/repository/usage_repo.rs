//! Usage repository (用量计数数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::UsageRepository;
use crate::{
    error::Result,
    models::usage::{month_bounds, IncrementOutcome, MetricType, UsageMetric},
};

pub struct PgUsageRepository {
    db: PgPool,
}

impl PgUsageRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 在调用方事务中重写用户的全部上限（不存在的指标行会被创建）
pub(super) async fn write_limits(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    limits: &[(MetricType, i64)],
) -> Result<()> {
    let (period_start, period_end) = month_bounds(Utc::now());
    for (metric, limit) in limits {
        sqlx::query(
            r#"
            INSERT INTO usage_metrics (
                id, user_id, metric_type, current_value, limit_value,
                period_start, period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, 0, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (user_id, metric_type) DO UPDATE SET
                limit_value = EXCLUDED.limit_value,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(metric)
        .bind(limit)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl UsageRepository for PgUsageRepository {
    async fn get(&self, user_id: &str, metric: MetricType) -> Result<Option<UsageMetric>> {
        let row = sqlx::query_as::<_, UsageMetric>(
            "SELECT * FROM usage_metrics WHERE user_id = $1 AND metric_type = $2",
        )
        .bind(user_id)
        .bind(metric)
        .fetch_optional(&self.db)
        .await?;

        Ok(row)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<UsageMetric>> {
        let rows = sqlx::query_as::<_, UsageMetric>(
            "SELECT * FROM usage_metrics WHERE user_id = $1 ORDER BY metric_type",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn try_increment(
        &self,
        user_id: &str,
        metric: MetricType,
        delta: i64,
        default_limit: i64,
    ) -> Result<IncrementOutcome> {
        let (period_start, period_end) = month_bounds(Utc::now());

        // 确保行存在
        sqlx::query(
            r#"
            INSERT INTO usage_metrics (
                id, user_id, metric_type, current_value, limit_value,
                period_start, period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, 0, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (user_id, metric_type) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(metric)
        .bind(default_limit)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.db)
        .await?;

        // 单条条件更新，超过上限时不写入
        let applied = sqlx::query_as::<_, UsageMetric>(
            r#"
            UPDATE usage_metrics
            SET current_value = GREATEST(current_value + $3, 0), updated_at = NOW()
            WHERE user_id = $1 AND metric_type = $2
              AND ($3 <= 0 OR limit_value = -1 OR current_value + $3 <= limit_value)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(metric)
        .bind(delta)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = applied {
            return Ok(IncrementOutcome::Applied(row));
        }

        let current = sqlx::query_as::<_, UsageMetric>(
            "SELECT * FROM usage_metrics WHERE user_id = $1 AND metric_type = $2",
        )
        .bind(user_id)
        .bind(metric)
        .fetch_one(&self.db)
        .await?;

        Ok(IncrementOutcome::Rejected(current))
    }

    async fn set_limits(&self, user_id: &str, limits: &[(MetricType, i64)]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        write_limits(&mut tx, user_id, limits).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_period(
        &self,
        user_id: &str,
        metrics: &[MetricType],
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<u64> {
        let mut reset = 0;
        for metric in metrics {
            let result = sqlx::query(
                r#"
                UPDATE usage_metrics
                SET current_value = 0, period_start = $3, period_end = $4,
                    last_reset = NOW(), updated_at = NOW()
                WHERE user_id = $1 AND metric_type = $2
                "#,
            )
            .bind(user_id)
            .bind(metric)
            .bind(period_start)
            .bind(period_end)
            .execute(&self.db)
            .await?;
            reset += result.rows_affected();
        }
        Ok(reset)
    }
}
