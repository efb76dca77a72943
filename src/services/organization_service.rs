//! Organization membership graph
//!
//! 组织、组织成员及其权限授予。拥有者始终是活跃成员，个人组织每个用户至多一个。

use chrono::Utc;
use sqlx::types::Json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::plan_catalog::PlanLookup;
use super::usage_service::{OrganizationUsage, UsageService};
use super::{PermissionService, Providers};
use crate::{
    concurrency::{Deadline, UserLocks},
    error::{AppError, Result},
    events::{DomainEvent, EventBus},
    models::{
        organization::{
            CreateOrganizationRequest, Organization, OrganizationMember, OrganizationRole,
            UpdateOrganizationRequest, DEFAULT_ORG_MAX_GROUPS, DEFAULT_ORG_MAX_MEMBERS,
        },
        plan::SubscriptionPlan,
        Actor, Page,
    },
    repository::{is_unique_violation, MemberInsert, MembershipRepository},
};

/// 组织能力
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrganizationFeatures {
    pub organization_id: Uuid,
    pub plan: Option<SubscriptionPlan>,
    pub features: Vec<String>,
}

/// 个人组织默认上限
const PERSONAL_MAX_GROUPS: i32 = -1;
const PERSONAL_MAX_MEMBERS: i32 = 1;

fn cap_or_default(value: Option<i32>, default: i32) -> i32 {
    match value {
        Some(0) | None => default,
        Some(v) => v,
    }
}

fn validate_cap(name: &str, value: i32) -> Result<()> {
    if value < -1 {
        return Err(AppError::Validation(format!(
            "{} must be -1 (unlimited) or positive",
            name
        )));
    }
    Ok(())
}

/// 组织服务
pub struct OrganizationService {
    membership: Arc<dyn MembershipRepository>,
    permissions: Arc<PermissionService>,
    plans: Arc<dyn PlanLookup>,
    usage: Arc<UsageService>,
    providers: Providers,
    locks: UserLocks,
    events: EventBus,
    page_size: i64,
}

impl OrganizationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        membership: Arc<dyn MembershipRepository>,
        permissions: Arc<PermissionService>,
        plans: Arc<dyn PlanLookup>,
        usage: Arc<UsageService>,
        providers: Providers,
        locks: UserLocks,
        events: EventBus,
        page_size: i64,
    ) -> Self {
        Self {
            membership,
            permissions,
            plans,
            usage,
            providers,
            locks,
            events,
            page_size,
        }
    }

    pub async fn get_organization(&self, id: Uuid) -> Result<Organization> {
        self.membership
            .get_organization(id)
            .await?
            .ok_or_else(|| AppError::not_found("organization"))
    }

    pub async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>> {
        self.membership.list_user_organizations(user_id).await
    }

    pub async fn get_member(&self, org_id: Uuid, user_id: &str) -> Result<Option<OrganizationMember>> {
        self.membership.get_org_member(org_id, user_id).await
    }

    /// 操作者可以管理成员与群组
    async fn ensure_manager(&self, org_id: Uuid, actor: &Actor) -> Result<()> {
        if actor.is_admin() {
            return Ok(());
        }
        match self.membership.get_org_member(org_id, &actor.user_id).await? {
            Some(member) if member.role.can_manage() => Ok(()),
            Some(_) => Err(AppError::forbidden(
                "Only organization owners and managers can manage members",
            )),
            None => Err(AppError::not_found("organization")),
        }
    }

    /// 插入组织与拥有者，随后注册作用域规则
    async fn insert_with_owner(&self, org: &Organization) -> Result<()> {
        let owner = OrganizationMember::new(org.id, &org.owner_user_id, OrganizationRole::Owner, None);
        self.membership.insert_organization(org, &owner).await?;

        self.permissions.register_organization(org.id).await?;
        self.permissions
            .grant_organization_role(org.id, &org.owner_user_id, OrganizationRole::Owner)
            .await?;
        self.events.publish(DomainEvent::OrganizationMemberAdded {
            organization_id: org.id,
            user_id: org.owner_user_id.clone(),
            role: OrganizationRole::Owner.as_str().to_string(),
        });
        Ok(())
    }

    /// 个人组织（幂等）
    #[instrument(skip(self))]
    pub async fn create_personal_org(&self, user_id: &str) -> Result<Organization> {
        let deadline = Deadline::after(std::time::Duration::from_secs(10));
        let _guard = self.locks.acquire(user_id, deadline).await?;

        if let Some(existing) = self.membership.find_personal_organization(user_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let org = Organization {
            id: Uuid::new_v4(),
            name: Organization::personal_name(user_id),
            display_name: "Personal".to_string(),
            description: None,
            owner_user_id: user_id.to_string(),
            subscription_plan_id: None,
            is_personal: true,
            max_groups: PERSONAL_MAX_GROUPS,
            max_members: PERSONAL_MAX_MEMBERS,
            is_active: true,
            metadata: Json(serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };

        match self.insert_with_owner(&org).await {
            Ok(()) => {
                info!(org_id = %org.id, "Personal organization created");
                Ok(org)
            }
            // 其他实例已创建
            Err(e) if is_unique_violation(&e) => self
                .membership
                .find_personal_organization(user_id)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// 创建组织
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_organization(
        &self,
        actor: &Actor,
        request: CreateOrganizationRequest,
    ) -> Result<Organization> {
        let max_groups = cap_or_default(request.max_groups, DEFAULT_ORG_MAX_GROUPS);
        let max_members = cap_or_default(request.max_members, DEFAULT_ORG_MAX_MEMBERS);
        validate_cap("max_groups", max_groups)?;
        validate_cap("max_members", max_members)?;

        if self
            .membership
            .find_organization_by_name(&actor.user_id, &request.name)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "Organization {} already exists",
                request.name
            )));
        }

        let now = Utc::now();
        let org = Organization {
            id: Uuid::new_v4(),
            display_name: request.display_name.unwrap_or_else(|| request.name.clone()),
            name: request.name,
            description: request.description,
            owner_user_id: actor.user_id.clone(),
            subscription_plan_id: None,
            is_personal: false,
            max_groups,
            max_members,
            is_active: true,
            metadata: Json(request.metadata.unwrap_or_else(|| serde_json::json!({}))),
            created_at: now,
            updated_at: now,
        };

        match self.insert_with_owner(&org).await {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::Conflict(format!(
                    "Organization {} already exists",
                    org.name
                )))
            }
            Err(e) => return Err(e),
        }

        info!(org_id = %org.id, owner = %org.owner_user_id, "Organization created");
        Ok(org)
    }

    /// 显式补丁更新
    #[instrument(skip(self, request))]
    pub async fn update_organization(
        &self,
        id: Uuid,
        actor: &Actor,
        request: UpdateOrganizationRequest,
    ) -> Result<Organization> {
        self.ensure_manager(id, actor).await?;
        let mut org = self.get_organization(id).await?;

        if let Some(display_name) = request.display_name {
            org.display_name = display_name;
        }
        if let Some(description) = request.description {
            org.description = Some(description);
        }
        if let Some(max_groups) = request.max_groups {
            validate_cap("max_groups", max_groups)?;
            org.max_groups = max_groups;
        }
        if let Some(max_members) = request.max_members {
            validate_cap("max_members", max_members)?;
            let current = self.membership.count_org_members(id).await?;
            if max_members != -1 && i64::from(max_members) < current {
                return Err(AppError::Validation(format!(
                    "max_members cannot be lower than the current member count ({})",
                    current
                )));
            }
            org.max_members = max_members;
        }
        if let Some(metadata) = request.metadata {
            org.metadata = Json(metadata);
        }

        self.membership.update_organization(&org).await?;
        info!(org_id = %id, "Organization updated");
        self.get_organization(id).await
    }

    /// 删除组织并撤销全部成员授权；个人组织不可删除
    #[instrument(skip(self))]
    pub async fn delete_organization(&self, id: Uuid, actor: &Actor) -> Result<()> {
        let org = self.get_organization(id).await?;
        if org.is_personal {
            return Err(AppError::forbidden("Personal organizations cannot be deleted"));
        }
        if org.owner_user_id != actor.user_id && !actor.is_admin() {
            return Err(AppError::owner_only("delete the organization"));
        }

        if !self.membership.soft_delete_organization(id).await? {
            return Err(AppError::not_found("organization"));
        }
        self.permissions.drop_organization(id).await?;
        info!(org_id = %id, "Organization deleted");
        Ok(())
    }

    // ==================== Members ====================

    /// 添加成员
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn add_member(
        &self,
        org_id: Uuid,
        actor: &Actor,
        user_id: &str,
        role: OrganizationRole,
    ) -> Result<OrganizationMember> {
        if role == OrganizationRole::Owner {
            return Err(AppError::InvalidRole(
                "owner can only be assigned by ownership transfer".to_string(),
            ));
        }
        let org = self.get_organization(org_id).await?;
        self.ensure_manager(org_id, actor).await?;

        self.providers
            .identity
            .get_user(user_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    AppError::not_found("user")
                } else {
                    e.into()
                }
            })?;

        let member = OrganizationMember::new(org_id, user_id, role, Some(&actor.user_id));
        match self.membership.insert_org_member(&member, org.max_members).await? {
            MemberInsert::Inserted(member) => {
                self.permissions
                    .grant_organization_role(org_id, user_id, role)
                    .await?;
                self.events.publish(DomainEvent::OrganizationMemberAdded {
                    organization_id: org_id,
                    user_id: user_id.to_string(),
                    role: role.as_str().to_string(),
                });
                info!(org_id = %org_id, user_id, role = role.as_str(), "Organization member added");
                Ok(member)
            }
            MemberInsert::AlreadyMember => Err(AppError::already_member()),
            MemberInsert::CapacityReached => Err(AppError::LimitReached(format!(
                "Organization has reached its member limit ({})",
                org.max_members
            ))),
        }
    }

    /// 修改成员角色；拥有者角色不可变
    #[instrument(skip(self, actor))]
    pub async fn update_member_role(
        &self,
        org_id: Uuid,
        actor: &Actor,
        user_id: &str,
        role: OrganizationRole,
    ) -> Result<OrganizationMember> {
        self.ensure_manager(org_id, actor).await?;
        let member = self
            .membership
            .get_org_member(org_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization member"))?;

        if member.role == OrganizationRole::Owner || role == OrganizationRole::Owner {
            return Err(AppError::forbidden(
                "The owner role can only change through ownership transfer",
            ));
        }
        if member.role == role {
            return Ok(member);
        }

        self.membership
            .update_org_member_role(org_id, user_id, role)
            .await?;
        self.permissions
            .change_organization_role(org_id, user_id, role)
            .await?;
        info!(org_id = %org_id, user_id, role = role.as_str(), "Organization member role changed");

        self.membership
            .get_org_member(org_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization member"))
    }

    /// 移除成员；拥有者不可移除，成员可以自行退出
    #[instrument(skip(self, actor))]
    pub async fn remove_member(&self, org_id: Uuid, actor: &Actor, user_id: &str) -> Result<()> {
        let member = self
            .membership
            .get_org_member(org_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("organization member"))?;
        if member.role == OrganizationRole::Owner {
            return Err(AppError::forbidden("Cannot remove the organization owner"));
        }
        if actor.user_id != user_id {
            self.ensure_manager(org_id, actor).await?;
        }

        self.membership.deactivate_org_member(org_id, user_id).await?;
        self.permissions.revoke_organization_roles(org_id, user_id).await?;
        self.events.publish(DomainEvent::OrganizationMemberRemoved {
            organization_id: org_id,
            user_id: user_id.to_string(),
        });
        info!(org_id = %org_id, user_id, "Organization member removed");
        Ok(())
    }

    pub async fn list_members(&self, org_id: Uuid, page: Page) -> Result<Vec<OrganizationMember>> {
        self.get_organization(org_id).await?;
        self.membership.list_org_members(org_id, page).await
    }

    /// 全部活跃成员（内部分页读取）
    pub async fn all_member_ids(&self, org_id: Uuid) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page = Page::first(self.page_size);
        loop {
            let batch = self.membership.list_org_members(org_id, page).await?;
            let done = (batch.len() as i64) < page.limit;
            ids.extend(batch.into_iter().map(|m| m.user_id));
            if done {
                return Ok(ids);
            }
            page = page.next();
        }
    }

    // ==================== Features ====================

    async fn organization_plan(&self, org: &Organization) -> Result<Option<SubscriptionPlan>> {
        match org.subscription_plan_id {
            Some(plan_id) => match self.plans.get_plan(plan_id).await {
                Ok(plan) => Ok(Some(plan)),
                Err(AppError::NotFound(_)) => {
                    warn!(org_id = %org.id, %plan_id, "Organization references a missing plan");
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    pub async fn organization_features(&self, org_id: Uuid) -> Result<OrganizationFeatures> {
        let org = self.get_organization(org_id).await?;
        let plan = self.organization_plan(&org).await?;
        let features = plan
            .as_ref()
            .map(|p| p.features.0.clone())
            .unwrap_or_default();
        Ok(OrganizationFeatures {
            organization_id: org_id,
            plan,
            features,
        })
    }

    /// 组织计划上限与成员用量之和
    pub async fn usage_limits(&self, org_id: Uuid) -> Result<Vec<OrganizationUsage>> {
        let org = self.get_organization(org_id).await?;
        let plan = self.organization_plan(&org).await?;
        let members = self.all_member_ids(org_id).await?;
        self.usage.organization_usage(plan.as_ref(), &members).await
    }
}
