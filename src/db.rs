//! 账本存储的 PostgreSQL 连接池
//!
//! 每个连接都带语句超时：授权与账本写入只走短事务，慢查询直接失败而不是拖住请求。

use crate::config::DatabaseConfig;
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use std::time::Duration;

/// 连接标识，便于在 pg_stat_activity 中区分
const APPLICATION_NAME: &str = "entitlement-core";

/// 迁移后必须存在的表
pub const REQUIRED_TABLES: &[&str] = &[
    "subscription_plans",
    "organizations",
    "organization_members",
    "groups",
    "group_members",
    "user_subscriptions",
    "organization_subscriptions",
    "subscription_batches",
    "license_seats",
    "usage_metrics",
    "policies",
    "groupings",
    "processed_webhook_events",
];

/// 每个新连接执行的会话设置
pub fn session_settings(config: &DatabaseConfig) -> String {
    format!(
        "SET application_name = '{}'; SET statement_timeout = {}",
        APPLICATION_NAME, config.statement_timeout_ms
    )
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let settings = session_settings(config);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .after_connect(move |conn, _meta| {
            let settings = settings.clone();
            Box::pin(async move {
                conn.execute(settings.as_str()).await?;
                Ok(())
            })
        })
        .connect(config.url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to ledger database");
            DbError::ConnectionFailed(e.to_string())
        })?;

    tracing::info!(
        max_connections = config.max_connections,
        statement_timeout_ms = config.statement_timeout_ms,
        "Ledger database pool created"
    );
    Ok(pool)
}

/// 按配置执行迁移，然后确认账本表齐全
pub async fn prepare_schema(pool: &PgPool, config: &DatabaseConfig) -> Result<(), DbError> {
    if config.run_migrations {
        sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
            tracing::error!(error = %e, "Migration failed");
            DbError::MigrationFailed(e.to_string())
        })?;
        tracing::info!("Migrations applied");
    } else {
        tracing::info!("Skipping migrations, verifying existing schema");
    }

    let present: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = current_schema()",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

    let missing = missing_tables(&present);
    if !missing.is_empty() {
        return Err(DbError::SchemaIncomplete(missing.join(", ")));
    }
    Ok(())
}

/// REQUIRED_TABLES 中缺失的表
pub fn missing_tables(present: &[String]) -> Vec<&'static str> {
    REQUIRED_TABLES
        .iter()
        .copied()
        .filter(|table| !present.iter().any(|p| p == table))
        .collect()
}

/// 就绪检查：策略表可读即视为可用
pub async fn health_check(pool: &PgPool) -> HealthStatus {
    metrics::gauge!("db_pool_connections").set(pool.size() as f64);
    metrics::gauge!("db_pool_idle_connections").set(pool.num_idle() as f64);

    match sqlx::query_scalar::<_, i64>("SELECT count(*) FROM policies")
        .fetch_one(pool)
        .await
    {
        Ok(_) => HealthStatus::Healthy,
        Err(e) => {
            tracing::warn!(error = %e, "Ledger database health check failed");
            HealthStatus::Unhealthy(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Schema is missing tables: {0}")]
    SchemaIncomplete(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn config(statement_timeout_ms: u64) -> DatabaseConfig {
        DatabaseConfig {
            url: Secret::new("postgresql://localhost/entitlements".to_string()),
            max_connections: 4,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 60,
            max_lifetime_secs: 600,
            statement_timeout_ms,
            run_migrations: true,
        }
    }

    #[test]
    fn test_session_settings() {
        let settings = session_settings(&config(2500));
        assert!(settings.contains("application_name = 'entitlement-core'"));
        assert!(settings.ends_with("statement_timeout = 2500"));
    }

    #[test]
    fn test_missing_tables() {
        let mut present: Vec<String> = REQUIRED_TABLES.iter().map(|t| t.to_string()).collect();
        assert!(missing_tables(&present).is_empty());

        present.retain(|t| t != "license_seats" && t != "groupings");
        assert_eq!(missing_tables(&present), vec!["license_seats", "groupings"]);
    }
}
