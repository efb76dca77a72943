//! 健康检查处理器
//! 提供 /health、/ready 和 /version 端点

use axum::{extract::State, http::StatusCode, Json};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::{db, middleware::AppState};

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 版本信息
#[derive(Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub environment: String,
}

static START_TIME: OnceCell<Instant> = OnceCell::new();

/// 记录启动时间（main 中调用一次）
pub fn set_start_time() {
    let _ = START_TIME.set(Instant::now());
}

/// 获取应用运行时间（秒）
pub fn get_uptime() -> u64 {
    START_TIME.get().map_or(0, |start| start.elapsed().as_secs())
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime(),
    })
}

/// 就绪探针
/// 检查数据库和权限索引
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let mut checks = Vec::new();

    match &state.db {
        Some(pool) => {
            let db_health = db::health_check(pool).await;
            checks.push(HealthCheck {
                name: "database".to_string(),
                status: if db_health.is_healthy() { "healthy" } else { "unhealthy" }.to_string(),
                message: match db_health {
                    db::HealthStatus::Healthy => None,
                    db::HealthStatus::Unhealthy(msg) => Some(msg),
                },
            });
        }
        None => checks.push(HealthCheck {
            name: "database".to_string(),
            status: "healthy".to_string(),
            message: Some("in-memory store".to_string()),
        }),
    }

    let policies = state.policy_store.snapshot().policy_count();
    checks.push(HealthCheck {
        name: "policy_store".to_string(),
        status: if policies > 0 { "healthy" } else { "unhealthy" }.to_string(),
        message: Some(format!("{} rules loaded", policies)),
    });

    let ready = checks.iter().all(|c| c.status == "healthy");
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, checks }))
}

pub async fn version(State(state): State<Arc<AppState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.server.environment.clone(),
    })
}
