//! HTTP 中间件
//! 应用状态、请求追踪、跨域

use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    auth::jwt::JwtService,
    concurrency::UserLocks,
    config::AppConfig,
    error::Result,
    events::EventBus,
    repository::Stores,
    services::{
        subscription_service::LedgerSettings, BatchService, EntitlementResolver, GroupService,
        OnboardingService, OrganizationService, PermissionService, PlanCatalog, PlanLookup,
        PolicyStore, Providers, SubscriptionService, UsageService, WebhookService,
    },
};

/// 应用状态
///
/// 服务之间共享存储句柄、用户锁和事件总线，Clone 只复制指针。
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// 使用内存存储运行时为 None
    pub db: Option<sqlx::PgPool>,
    pub jwt_service: Arc<JwtService>,
    pub policy_store: Arc<PolicyStore>,
    pub permission_service: Arc<PermissionService>,
    pub plan_catalog: Arc<PlanCatalog>,
    pub subscription_service: Arc<SubscriptionService>,
    pub usage_service: Arc<UsageService>,
    pub organization_service: Arc<OrganizationService>,
    pub group_service: Arc<GroupService>,
    pub batch_service: Arc<BatchService>,
    pub resolver: Arc<EntitlementResolver>,
    pub webhook_service: Arc<WebhookService>,
    pub onboarding_service: Arc<OnboardingService>,
    pub event_bus: EventBus,
}

impl AppState {
    /// 加载权限规则并装配全部服务
    pub async fn build(
        config: AppConfig,
        stores: Stores,
        providers: Providers,
        db: Option<sqlx::PgPool>,
    ) -> Result<Self> {
        let entitlements = &config.entitlements;
        let deadline = Duration::from_secs(entitlements.operation_deadline_secs);
        let jwt_service = Arc::new(JwtService::from_config(&config)?);

        let policy_store = Arc::new(PolicyStore::load(stores.policies.clone()).await?);
        let permission_service = Arc::new(PermissionService::new(
            policy_store.clone(),
            entitlements.policy_warn_only,
        ));
        permission_service.seed_base_policies().await?;

        let plan_catalog = Arc::new(PlanCatalog::new(stores.plans.clone()));
        let plans: Arc<dyn PlanLookup> = plan_catalog.clone();
        let locks = UserLocks::new();
        let event_bus = EventBus::new(entitlements.event_bus_capacity);

        let usage_service = Arc::new(UsageService::new(
            stores.usage.clone(),
            stores.subscriptions.clone(),
            plans.clone(),
        ));
        let settings = LedgerSettings {
            operation_timeout: deadline,
            provider_timeout: Duration::from_secs(config.payment.request_timeout_secs),
            ..LedgerSettings::default()
        };
        let settings = match &config.security.frontend_url {
            Some(frontend) => LedgerSettings {
                default_success_url: format!("{}/subscription/success", frontend.trim_end_matches('/')),
                default_cancel_url: format!("{}/subscription/cancel", frontend.trim_end_matches('/')),
                ..settings
            },
            None => settings,
        };
        let subscription_service = Arc::new(SubscriptionService::new(
            stores.subscriptions.clone(),
            stores.membership.clone(),
            plans.clone(),
            providers.clone(),
            usage_service.clone(),
            locks.clone(),
            event_bus.clone(),
            settings,
        ));
        let organization_service = Arc::new(OrganizationService::new(
            stores.membership.clone(),
            permission_service.clone(),
            plans.clone(),
            usage_service.clone(),
            providers.clone(),
            locks.clone(),
            event_bus.clone(),
            entitlements.membership_page_size,
        ));
        let group_service = Arc::new(GroupService::new(
            stores.membership.clone(),
            permission_service.clone(),
            providers.clone(),
            event_bus.clone(),
        ));
        let batch_service = Arc::new(BatchService::new(
            stores.batches.clone(),
            stores.subscriptions.clone(),
            plans.clone(),
            group_service.clone(),
            permission_service.clone(),
            usage_service.clone(),
            providers.clone(),
            locks,
            event_bus.clone(),
            deadline,
        ));
        let resolver = Arc::new(EntitlementResolver::new(
            policy_store.clone(),
            stores.membership.clone(),
            stores.batches.clone(),
            stores.subscriptions.clone(),
            plans,
            group_service.clone(),
            usage_service.clone(),
            deadline,
        ));
        let webhook_service = Arc::new(WebhookService::new(
            stores.subscriptions.clone(),
            subscription_service.clone(),
            batch_service.clone(),
        ));
        let onboarding_service = Arc::new(OnboardingService::new(
            organization_service.clone(),
            providers,
        ));

        Ok(Self {
            config,
            db,
            jwt_service,
            policy_store,
            permission_service,
            plan_catalog,
            subscription_service,
            usage_service,
            organization_service,
            group_service,
            batch_service,
            resolver,
            webhook_service,
            onboarding_service,
            event_bus,
        })
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let uri = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        // 指标标签使用静态字符串
        let status = response.status().as_u16();
        let method_name = match method {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::PATCH => "PATCH",
            _ => "UNKNOWN",
        };
        let status_code = match status {
            200 => "200",
            201 => "201",
            204 => "204",
            400 => "400",
            401 => "401",
            403 => "403",
            404 => "404",
            409 => "409",
            500 => "500",
            502 => "502",
            504 => "504",
            _ => "other",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_code)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            method = %method,
            uri = %uri,
            status = status,
            elapsed_ms = elapsed.as_millis(),
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 跨域配置：开发环境放开，其他环境只允许前台和管理后台
pub fn cors_layer(config: &AppConfig) -> CorsLayer {
    if config.server.is_development() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .security
        .allowed_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers(Any)
        .max_age(Duration::from_secs(3600))
}
