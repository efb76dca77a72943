//! Group membership graph
//!
//! 群组支持嵌套、过期和成员上限。组织的 manager / owner 对组织内群组有级联访问。

use chrono::Utc;
use sqlx::types::Json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{PermissionService, Providers};
use crate::{
    error::{AppError, Result},
    events::{DomainEvent, EventBus},
    models::{
        group::{
            CreateGroupRequest, Group, GroupAccess, GroupMember, GroupRole, UpdateGroupRequest,
            DEFAULT_GROUP_MAX_MEMBERS,
        },
        within_cap, Actor, Page,
    },
    repository::{is_unique_violation, MemberInsert, MembershipRepository},
};

/// 祖先链的最大深度
const MAX_NESTING_DEPTH: usize = 64;

/// 群组服务
pub struct GroupService {
    membership: Arc<dyn MembershipRepository>,
    permissions: Arc<PermissionService>,
    providers: Providers,
    events: EventBus,
}

impl GroupService {
    pub fn new(
        membership: Arc<dyn MembershipRepository>,
        permissions: Arc<PermissionService>,
        providers: Providers,
        events: EventBus,
    ) -> Self {
        Self {
            membership,
            permissions,
            providers,
            events,
        }
    }

    pub async fn get_group(&self, id: Uuid) -> Result<Group> {
        self.membership
            .get_group(id)
            .await?
            .ok_or_else(|| AppError::not_found("group"))
    }

    pub async fn list_user_groups(&self, user_id: &str) -> Result<Vec<Group>> {
        self.membership.list_user_groups(user_id).await
    }

    pub async fn list_org_groups(&self, org_id: Uuid) -> Result<Vec<Group>> {
        self.membership.list_org_groups(org_id).await
    }

    /// 用户对群组的访问来源
    pub async fn resolve_group_access(&self, group: &Group, user_id: &str) -> Result<GroupAccess> {
        if let Some(member) = self.membership.get_group_member(group.id, user_id).await? {
            return Ok(GroupAccess::Direct(member.role));
        }
        if let Some(org_id) = group.organization_id {
            if let Some(member) = self.membership.get_org_member(org_id, user_id).await? {
                if member.role.can_manage() {
                    return Ok(GroupAccess::ViaOrgManager(member.role));
                }
            }
        }
        Ok(GroupAccess::None)
    }

    /// 可以管理成员：群组 owner / admin、组织级联、系统管理员
    async fn ensure_manager(&self, group: &Group, actor: &Actor) -> Result<()> {
        if actor.is_admin() {
            return Ok(());
        }
        match self.resolve_group_access(group, &actor.user_id).await? {
            GroupAccess::Direct(role) if role.can_manage() => Ok(()),
            GroupAccess::ViaOrgManager(_) => Ok(()),
            GroupAccess::Direct(_) => Err(AppError::forbidden(
                "Only group owners and admins can manage members",
            )),
            GroupAccess::None => Err(AppError::not_found("group")),
        }
    }

    fn ensure_writable(group: &Group) -> Result<()> {
        if group.is_expired() {
            return Err(AppError::entity_expired("Group"));
        }
        Ok(())
    }

    /// 检查 parent 是否可以作为 group_id 的父群组：同一组织且不成环
    async fn validate_parent(
        &self,
        group_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        parent_id: Uuid,
    ) -> Result<()> {
        let parent = self
            .membership
            .get_group(parent_id)
            .await?
            .ok_or_else(|| AppError::not_found("parent group"))?;
        if parent.organization_id != organization_id {
            return Err(AppError::validation(
                "Parent group must belong to the same organization",
            ));
        }

        let Some(group_id) = group_id else {
            return Ok(());
        };

        let mut seen = HashSet::new();
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current.id == group_id {
                return Err(AppError::validation("Group nesting would create a cycle"));
            }
            if !seen.insert(current.id) || seen.len() > MAX_NESTING_DEPTH {
                return Err(AppError::internal_error("group ancestor chain is corrupted"));
            }
            cursor = match current.parent_group_id {
                Some(next) => self.membership.get_group(next).await?,
                None => None,
            };
        }
        Ok(())
    }

    /// 创建群组
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_group(&self, actor: &Actor, request: CreateGroupRequest) -> Result<Group> {
        let max_members = match request.max_members {
            Some(0) | None => DEFAULT_GROUP_MAX_MEMBERS,
            Some(v) if v < -1 => {
                return Err(AppError::validation("max_members must be -1 (unlimited) or positive"))
            }
            Some(v) => v,
        };

        if let Some(org_id) = request.organization_id {
            let org = self
                .membership
                .get_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("organization"))?;
            if !actor.is_admin() {
                match self.membership.get_org_member(org_id, &actor.user_id).await? {
                    Some(member) if member.role.can_manage() => {}
                    Some(_) => {
                        return Err(AppError::forbidden(
                            "Only organization owners and managers can create groups",
                        ))
                    }
                    None => return Err(AppError::not_found("organization")),
                }
            }
            let current = self.membership.count_org_groups(org_id).await?;
            if !within_cap(org.max_groups, current) {
                return Err(AppError::LimitReached(format!(
                    "Organization has reached its group limit ({})",
                    org.max_groups
                )));
            }
        }

        if let Some(parent_id) = request.parent_group_id {
            self.validate_parent(None, request.organization_id, parent_id)
                .await?;
        }

        if self
            .membership
            .find_group_by_name(&actor.user_id, &request.name)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!("Group {} already exists", request.name)));
        }

        let now = Utc::now();
        let group = Group {
            id: Uuid::new_v4(),
            display_name: request.display_name.unwrap_or_else(|| request.name.clone()),
            name: request.name,
            description: request.description,
            owner_user_id: actor.user_id.clone(),
            organization_id: request.organization_id,
            parent_group_id: request.parent_group_id,
            max_members,
            expires_at: request.expires_at,
            is_active: true,
            metadata: Json(request.metadata.unwrap_or_else(|| serde_json::json!({}))),
            created_at: now,
            updated_at: now,
        };
        let owner = GroupMember::new(group.id, &actor.user_id, GroupRole::Owner, None);

        match self.membership.insert_group(&group, &owner).await {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::Conflict(format!("Group {} already exists", group.name)))
            }
            Err(e) => return Err(e),
        }

        self.permissions.register_group(group.id).await?;
        self.permissions
            .grant_group_role(group.id, &actor.user_id, GroupRole::Owner)
            .await?;
        self.events.publish(DomainEvent::GroupMemberAdded {
            group_id: group.id,
            user_id: actor.user_id.clone(),
            role: GroupRole::Owner.as_str().to_string(),
        });

        info!(group_id = %group.id, owner = %group.owner_user_id, "Group created");
        Ok(group)
    }

    /// 显式补丁更新；过期群组只读
    #[instrument(skip(self, request))]
    pub async fn update_group(&self, id: Uuid, actor: &Actor, request: UpdateGroupRequest) -> Result<Group> {
        let mut group = self.get_group(id).await?;
        Self::ensure_writable(&group)?;
        self.ensure_manager(&group, actor).await?;

        if let Some(display_name) = request.display_name {
            group.display_name = display_name;
        }
        if let Some(description) = request.description {
            group.description = Some(description);
        }
        if let Some(max_members) = request.max_members {
            if max_members < -1 || max_members == 0 {
                return Err(AppError::validation("max_members must be -1 (unlimited) or positive"));
            }
            group.max_members = max_members;
        }
        if let Some(expires_at) = request.expires_at {
            group.expires_at = Some(expires_at);
        }
        if let Some(parent_id) = request.parent_group_id {
            self.validate_parent(Some(group.id), group.organization_id, parent_id)
                .await?;
            group.parent_group_id = Some(parent_id);
        }
        if let Some(metadata) = request.metadata {
            group.metadata = Json(metadata);
        }

        self.membership.update_group(&group).await?;
        info!(group_id = %id, "Group updated");
        self.get_group(id).await
    }

    /// 设置父群组
    pub async fn set_parent(&self, id: Uuid, actor: &Actor, parent_id: Option<Uuid>) -> Result<Group> {
        let mut group = self.get_group(id).await?;
        Self::ensure_writable(&group)?;
        self.ensure_manager(&group, actor).await?;

        if let Some(parent_id) = parent_id {
            self.validate_parent(Some(id), group.organization_id, parent_id)
                .await?;
        }
        group.parent_group_id = parent_id;
        self.membership.update_group(&group).await?;
        Ok(group)
    }

    /// 删除群组：只有直接拥有者或系统管理员
    #[instrument(skip(self))]
    pub async fn delete_group(&self, id: Uuid, actor: &Actor) -> Result<()> {
        let group = self.get_group(id).await?;
        if !actor.is_admin() {
            match self.resolve_group_access(&group, &actor.user_id).await? {
                GroupAccess::Direct(GroupRole::Owner) => {}
                GroupAccess::None => return Err(AppError::not_found("group")),
                _ => return Err(AppError::owner_only("delete the group")),
            }
        }

        if !self.membership.soft_delete_group(id).await? {
            return Err(AppError::not_found("group"));
        }
        self.permissions.drop_group(id).await?;
        info!(group_id = %id, "Group deleted");
        Ok(())
    }

    // ==================== Members ====================

    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn add_member(
        &self,
        group_id: Uuid,
        actor: &Actor,
        user_id: &str,
        role: GroupRole,
    ) -> Result<GroupMember> {
        if role == GroupRole::Owner {
            return Err(AppError::InvalidRole(
                "owner can only be assigned by ownership transfer".to_string(),
            ));
        }
        let group = self.get_group(group_id).await?;
        Self::ensure_writable(&group)?;
        self.ensure_manager(&group, actor).await?;

        self.providers.identity.get_user(user_id).await.map_err(|e| {
            if e.is_not_found() {
                AppError::not_found("user")
            } else {
                e.into()
            }
        })?;

        let member = GroupMember::new(group_id, user_id, role, Some(&actor.user_id));
        match self.membership.insert_group_member(&member, group.max_members).await? {
            MemberInsert::Inserted(member) => {
                self.permissions.grant_group_role(group_id, user_id, role).await?;
                self.events.publish(DomainEvent::GroupMemberAdded {
                    group_id,
                    user_id: user_id.to_string(),
                    role: role.as_str().to_string(),
                });
                info!(group_id = %group_id, user_id, role = role.as_str(), "Group member added");
                Ok(member)
            }
            MemberInsert::AlreadyMember => Err(AppError::already_member()),
            MemberInsert::CapacityReached => Err(AppError::LimitReached(format!(
                "Group has reached its member limit ({})",
                group.max_members
            ))),
        }
    }

    #[instrument(skip(self, actor))]
    pub async fn update_member_role(
        &self,
        group_id: Uuid,
        actor: &Actor,
        user_id: &str,
        role: GroupRole,
    ) -> Result<GroupMember> {
        let group = self.get_group(group_id).await?;
        Self::ensure_writable(&group)?;
        self.ensure_manager(&group, actor).await?;

        let member = self
            .membership
            .get_group_member(group_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("group member"))?;
        if member.role == GroupRole::Owner || role == GroupRole::Owner {
            return Err(AppError::forbidden(
                "The owner role can only change through ownership transfer",
            ));
        }
        if member.role == role {
            return Ok(member);
        }

        self.membership
            .update_group_member_role(group_id, user_id, role)
            .await?;
        self.permissions.change_group_role(group_id, user_id, role).await?;
        info!(group_id = %group_id, user_id, role = role.as_str(), "Group member role changed");

        self.membership
            .get_group_member(group_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("group member"))
    }

    #[instrument(skip(self, actor))]
    pub async fn remove_member(&self, group_id: Uuid, actor: &Actor, user_id: &str) -> Result<()> {
        let group = self.get_group(group_id).await?;
        Self::ensure_writable(&group)?;

        let member = self
            .membership
            .get_group_member(group_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("group member"))?;
        if member.role == GroupRole::Owner {
            return Err(AppError::forbidden("Cannot remove the group owner"));
        }
        if actor.user_id != user_id {
            self.ensure_manager(&group, actor).await?;
        }

        self.membership.deactivate_group_member(group_id, user_id).await?;
        self.permissions.revoke_group_roles(group_id, user_id).await?;
        self.events.publish(DomainEvent::GroupMemberRemoved {
            group_id,
            user_id: user_id.to_string(),
        });
        info!(group_id = %group_id, user_id, "Group member removed");
        Ok(())
    }

    /// 成员列表（过期群组仍可读取）
    pub async fn list_members(&self, group_id: Uuid, page: Page) -> Result<Vec<GroupMember>> {
        self.get_group(group_id).await?;
        self.membership.list_group_members(group_id, page).await
    }
}
