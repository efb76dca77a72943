//! 群组的 HTTP 处理器

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
        group::{AddGroupMemberRequest, CreateGroupRequest, GroupRole, UpdateGroupRequest},
        organization::UpdateMemberRoleRequest,
        Page,
    },
};

/// 设置或清除父群组
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetParentRequest {
    pub parent_group_id: Option<Uuid>,
}

pub async fn list_groups(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    ListingFilter(filter): ListingFilter,
) -> Result<impl IntoResponse, AppError> {
    let service = &state.group_service;
    let mut groups = service.list_user_groups(&auth.user_id).await?;

    if let Some(filter) = filter {
        let known: HashSet<Uuid> = groups.iter().map(|g| g.id).collect();
        for id in filter.ids.iter().filter_map(|id| Uuid::parse_str(id).ok()) {
            if known.contains(&id) {
                continue;
            }
            match service.get_group(id).await {
                Ok(group) => groups.push(group),
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    Ok(Json(json!({ "groups": groups, "count": groups.len() })))
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let group = state.group_service.create_group(&auth.actor(), req).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.group_service.get_group(id).await?))
}

pub async fn update_group(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let group = state.group_service.update_group(id, &auth.actor(), req).await?;
    Ok(Json(group))
}

pub async fn set_parent(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<SetParentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let group = state
        .group_service
        .set_parent(id, &auth.actor(), req.parent_group_id)
        .await?;
    Ok(Json(group))
}

pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.group_service.delete_group(id, &auth.actor()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, AppError> {
    let page = Page::new(page.offset, page.limit);
    let members = state.group_service.list_members(id, page).await?;
    Ok(Json(json!({
        "members": members,
        "offset": page.offset,
        "limit": page.limit
    })))
}

/// 添加成员；群组绑定了批量授权时由后台任务自动分配席位
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AddGroupMemberRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let role = match req.role.as_deref() {
        Some(role) => role.parse::<GroupRole>()?,
        None => GroupRole::Member,
    };
    let member = state
        .group_service
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
    let role = req.role.parse::<GroupRole>()?;
    let member = state
        .group_service
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
        .group_service
        .remove_member(id, &auth.actor(), &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
