//! 组织的 HTTP 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{AuthContext, ListingFilter},
    error::AppError,
    middleware::AppState,
    models::{
        organization::{
            AddMemberRequest, CreateOrganizationRequest, OrganizationRole,
            UpdateMemberRoleRequest, UpdateOrganizationRequest,
        },
        subscription::{CancelRequest, OrganizationSubscribeRequest},
        Page,
    },
    services::subscription_service::CheckoutUrls,
};

/// 组织订阅的可选跳转地址
#[derive(Debug, Default, Deserialize)]
pub struct RedirectQuery {
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// 计划变更请求
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeOrganizationPlanRequest {
    pub plan_id: Uuid,
}

/// 列出可见的组织：成员关系加上直接授予规则的组织
pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ListingFilter(filter): ListingFilter,
) -> Result<impl IntoResponse, AppError> {
    let service = &state.organization_service;
    let mut organizations = service.list_user_organizations(&auth.user_id).await?;

    if let Some(filter) = filter {
        let known: HashSet<Uuid> = organizations.iter().map(|o| o.id).collect();
        for id in filter.ids.iter().filter_map(|id| Uuid::parse_str(id).ok()) {
            if known.contains(&id) {
                continue;
            }
            match service.get_organization(id).await {
                Ok(org) => organizations.push(org),
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    Ok(Json(json!({
        "organizations": organizations,
        "count": organizations.len()
    })))
}

pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(req): Json<CreateOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let organization = state
        .organization_service
        .create_organization(&auth.actor(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(organization)))
}

pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.organization_service.get_organization(id).await?))
}

pub async fn update_organization(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let organization = state
        .organization_service
        .update_organization(id, &auth.actor(), req)
        .await?;
    Ok(Json(organization))
}

pub async fn delete_organization(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .organization_service
        .delete_organization(id, &auth.actor())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Members ====================

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, AppError> {
    let page = Page::new(page.offset, page.limit);
    let members = state.organization_service.list_members(id, page).await?;
    Ok(Json(json!({
        "members": members,
        "offset": page.offset,
        "limit": page.limit
    })))
}

pub async fn add_member(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let role = match req.role.as_deref() {
        Some(role) => role.parse::<OrganizationRole>()?,
        None => OrganizationRole::Member,
    };
    let member = state
        .organization_service
        .add_member(id, &auth.actor(), &req.user_id, role)
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn update_member_role(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, user_id)): Path<(Uuid, String)>,
    Json(req): Json<UpdateMemberRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = req.role.parse::<OrganizationRole>()?;
    let member = state
        .organization_service
        .update_member_role(id, &auth.actor(), &user_id, role)
        .await?;
    Ok(Json(member))
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((id, user_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, AppError> {
    state
        .organization_service
        .remove_member(id, &auth.actor(), &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_groups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let groups = state.group_service.list_org_groups(id).await?;
    Ok(Json(json!({
        "groups": groups,
        "count": groups.len()
    })))
}

// ==================== Capabilities ====================

pub async fn get_features(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state.organization_service.organization_features(id).await?,
    ))
}

pub async fn get_usage_limits(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let usage = state.organization_service.usage_limits(id).await?;
    Ok(Json(json!({ "organization_id": id, "usage": usage })))
}

// ==================== Subscription ====================

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Query(redirect): Query<RedirectQuery>,
    Json(req): Json<OrganizationSubscribeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let checkout = state
        .subscription_service
        .subscribe_organization(
            id,
            &auth.user_id,
            &auth.roles,
            req.plan_id,
            req.quantity,
            CheckoutUrls {
                success_url: redirect.success_url,
                cancel_url: redirect.cancel_url,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(checkout)))
}

pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let (subscription, plan) = state
        .subscription_service
        .get_organization_subscription(id)
        .await?
        .ok_or_else(|| AppError::not_found("organization subscription"))?;
    Ok(Json(json!({ "subscription": subscription, "plan": plan })))
}

pub async fn change_subscription_plan(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeOrganizationPlanRequest>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .subscription_service
        .change_organization_plan(id, &auth.roles, req.plan_id)
        .await?;
    Ok(Json(subscription))
}

pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(req): Query<CancelRequest>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .subscription_service
        .cancel_organization_subscription(id, req.immediate)
        .await?;
    Ok(Json(subscription))
}
