//! 日志与追踪系统
//! 初始化结构化日志，并登记授权相关指标

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 授权决策计数器名称
pub const AUTHZ_DECISIONS: &str = "authz_decisions_total";
/// 非关键权限写入失败计数器名称
pub const POLICY_WRITE_FAILURES: &str = "policy_write_failures_total";
/// 支付回调处理计数器名称
pub const WEBHOOK_EVENTS: &str = "payment_webhook_events_total";

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    // RUST_LOG 优先，其次为配置中的级别
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(config.server.is_development())
            .boxed(),
    };

    // 测试中可能被多次调用，忽略重复初始化
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.server.environment,
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 登记指标描述
pub fn init_metrics() {
    metrics::describe_counter!(AUTHZ_DECISIONS, "Authorization decisions by outcome");
    metrics::describe_counter!(
        POLICY_WRITE_FAILURES,
        "Policy rule writes that failed in warn-only mode"
    );
    metrics::describe_counter!(WEBHOOK_EVENTS, "Payment provider events by outcome");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds"
    );
    tracing::debug!("Metrics initialized");
}
