//! Usage metric models

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// 用量指标类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "metric_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ConcurrentTerminals,
    CoursesCreated,
    LabSessions,
    ConcurrentUsers,
}

impl MetricType {
    pub const ALL: [MetricType; 4] = [
        MetricType::ConcurrentTerminals,
        MetricType::CoursesCreated,
        MetricType::LabSessions,
        MetricType::ConcurrentUsers,
    ];

    /// 按计费周期清零的指标
    pub fn is_period_scoped(&self) -> bool {
        matches!(self, MetricType::CoursesCreated | MetricType::LabSessions)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::ConcurrentTerminals => "concurrent_terminals",
            MetricType::CoursesCreated => "courses_created",
            MetricType::LabSessions => "lab_sessions",
            MetricType::ConcurrentUsers => "concurrent_users",
        }
    }
}

impl FromStr for MetricType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown metric type: {}", s)))
    }
}

/// 每个用户每个指标一行
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageMetric {
    pub id: Uuid,
    pub user_id: String,
    pub metric_type: MetricType,
    pub current_value: i64,
    /// -1 表示不限
    pub limit_value: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub last_reset: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageMetric {
    pub fn new(user_id: &str, metric_type: MetricType, limit_value: i64) -> Self {
        let now = Utc::now();
        let (period_start, period_end) = month_bounds(now);
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            metric_type,
            current_value: 0,
            limit_value,
            period_start,
            period_end,
            last_reset: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 增加 delta 后是否仍在上限内（减少总是允许）
    pub fn admits(&self, delta: i64) -> bool {
        delta <= 0 || self.limit_value == -1 || self.current_value + delta <= self.limit_value
    }
}

/// 当前自然月的起止时间
pub fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, end)
}

/// 用量检查结果
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UsageCheck {
    pub user_id: String,
    pub metric_type: MetricType,
    pub allowed: bool,
    pub current_usage: i64,
    pub limit: i64,
    /// -1 表示不限
    pub remaining: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// 条件递增的结果
#[derive(Debug, Clone)]
pub enum IncrementOutcome {
    Applied(UsageMetric),
    Rejected(UsageMetric),
}

/// 递增请求（外部协作方调用）
#[derive(Debug, Deserialize)]
pub struct IncrementUsageRequest {
    /// 被计量的用户，缺省为调用方
    #[serde(default)]
    pub user_id: Option<String>,
    pub metric_type: MetricType,
    #[serde(default = "default_delta")]
    pub delta: i64,
}

fn default_delta() -> i64 {
    1
}
