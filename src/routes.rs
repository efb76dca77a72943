//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;

use crate::{
    auth::middleware::{jwt_auth_middleware, permission_middleware},
    handlers,
    middleware::{cors_layer, request_tracking_middleware, AppState},
};

/// 请求体上限
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/version", get(handlers::health::version));

    // 支付服务回调不携带用户令牌
    let webhook_routes = Router::new().route(
        "/api/v1/webhooks/payment",
        post(handlers::webhook::payment_webhook),
    );

    // 需要认证并经过授权判定的路由
    let authenticated_routes = Router::new()
        // 组织
        .route(
            "/api/v1/organizations",
            get(handlers::organization::list_organizations)
                .post(handlers::organization::create_organization),
        )
        .route(
            "/api/v1/organizations/{id}",
            get(handlers::organization::get_organization)
                .patch(handlers::organization::update_organization)
                .delete(handlers::organization::delete_organization),
        )
        .route(
            "/api/v1/organizations/{id}/members",
            get(handlers::organization::list_members).post(handlers::organization::add_member),
        )
        .route(
            "/api/v1/organizations/{id}/members/{user_id}",
            axum::routing::patch(handlers::organization::update_member_role)
                .delete(handlers::organization::remove_member),
        )
        .route(
            "/api/v1/organizations/{id}/groups",
            get(handlers::organization::list_groups),
        )
        .route(
            "/api/v1/organizations/{id}/subscribe",
            post(handlers::organization::subscribe),
        )
        .route(
            "/api/v1/organizations/{id}/subscription",
            get(handlers::organization::get_subscription)
                .patch(handlers::organization::change_subscription_plan)
                .delete(handlers::organization::cancel_subscription),
        )
        .route(
            "/api/v1/organizations/{id}/features",
            get(handlers::organization::get_features),
        )
        .route(
            "/api/v1/organizations/{id}/usage-limits",
            get(handlers::organization::get_usage_limits),
        )
        // 群组
        .route(
            "/api/v1/groups",
            get(handlers::group::list_groups).post(handlers::group::create_group),
        )
        .route(
            "/api/v1/groups/{id}",
            get(handlers::group::get_group)
                .patch(handlers::group::update_group)
                .delete(handlers::group::delete_group),
        )
        .route(
            "/api/v1/groups/{id}/parent",
            axum::routing::put(handlers::group::set_parent),
        )
        .route(
            "/api/v1/groups/{id}/members",
            get(handlers::group::list_members).post(handlers::group::add_member),
        )
        .route(
            "/api/v1/groups/{id}/members/{user_id}",
            axum::routing::patch(handlers::group::update_member_role)
                .delete(handlers::group::remove_member),
        )
        // 个人订阅
        .route(
            "/api/v1/user-subscriptions",
            get(handlers::subscription::list_subscriptions),
        )
        .route(
            "/api/v1/user-subscriptions/checkout",
            post(handlers::subscription::checkout),
        )
        .route(
            "/api/v1/user-subscriptions/upgrade",
            post(handlers::subscription::upgrade),
        )
        .route(
            "/api/v1/user-subscriptions/current",
            get(handlers::subscription::current),
        )
        .route(
            "/api/v1/user-subscriptions/all",
            get(handlers::subscription::all_active),
        )
        .route(
            "/api/v1/user-subscriptions/usage",
            get(handlers::subscription::usage),
        )
        .route(
            "/api/v1/user-subscriptions/purchase-bulk",
            post(handlers::subscription::purchase_bulk),
        )
        .route(
            "/api/v1/user-subscriptions/{id}/cancel",
            post(handlers::subscription::cancel),
        )
        .route(
            "/api/v1/user-subscriptions/{id}/reactivate",
            post(handlers::subscription::reactivate),
        )
        // 批量授权
        .route(
            "/api/v1/subscription-batches",
            get(handlers::batch::list_batches),
        )
        .route(
            "/api/v1/subscription-batches/{id}",
            get(handlers::batch::get_batch).delete(handlers::batch::delete_batch),
        )
        .route(
            "/api/v1/subscription-batches/{id}/licenses",
            get(handlers::batch::list_licenses),
        )
        .route(
            "/api/v1/subscription-batches/{id}/assign",
            post(handlers::batch::assign_license),
        )
        .route(
            "/api/v1/subscription-batches/{id}/licenses/{license_id}/revoke",
            axum::routing::delete(handlers::batch::revoke_license),
        )
        .route(
            "/api/v1/subscription-batches/{id}/quantity",
            axum::routing::patch(handlers::batch::update_quantity),
        )
        .route(
            "/api/v1/subscription-batches/{id}/cancel",
            post(handlers::batch::cancel_batch),
        )
        // 计划目录
        .route(
            "/api/v1/subscription-plans",
            get(handlers::plan::list_plans).post(handlers::plan::create_plan),
        )
        .route(
            "/api/v1/subscription-plans/{id}",
            get(handlers::plan::get_plan)
                .put(handlers::plan::update_plan)
                .delete(handlers::plan::deactivate_plan),
        )
        .route(
            "/api/v1/subscription-plans/{id}/pricing",
            get(handlers::plan::pricing),
        )
        // 能力与用量
        .route("/api/v1/users/me/features", get(handlers::usage::my_features))
        .route("/api/v1/usage/metrics", get(handlers::usage::list_metrics))
        .route(
            "/api/v1/usage/{metric}/check",
            get(handlers::usage::check_limit),
        )
        .route("/api/v1/usage/increment", post(handlers::usage::increment))
        // 管理端
        .route("/api/v1/admin/onboarding", post(handlers::admin::onboard_user))
        // 后添加的层先执行：先认证，再授权
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            permission_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(webhook_routes)
        .merge(authenticated_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(axum::middleware::from_fn(request_tracking_middleware))
        .layer(cors_layer(&state.config))
        .with_state(state)
}
