//! 权限授予服务
//!
//! 把成员关系翻译为 Policy Store 中的角色规则和用户绑定。
//! 每个组织 / 群组注册三个作用域角色，成员按角色累加绑定。

use std::sync::Arc;
use uuid::Uuid;

use super::policy_store::PolicyStore;
use crate::{
    error::Result,
    models::{group::GroupRole, organization::OrganizationRole},
    telemetry::POLICY_WRITE_FAILURES,
};

/// 所有已认证用户隐含的基础角色
pub const MEMBER_ROLE: &str = "member";

/// 上报用量的协作服务（终端、课程服务）在令牌中携带的角色
pub const METERING_ROLE: &str = "metering";

/// 可批量购买授权的角色
pub const BULK_PURCHASE_ROLES: &[&str] = &["trainer", "organization", "group_manager"];

const READ: &str = "GET";
const READ_WRITE: &str = "GET|PATCH";
const MANAGE: &str = "GET|POST|PATCH|DELETE";

/// 基础角色的规则：集合级入口和个人路由
const BASE_POLICIES: &[(&str, &str)] = &[
    ("/organizations", "GET|POST"),
    ("/groups", "GET|POST"),
    ("/subscription-plans", "GET"),
    ("/subscription-plans/*", "GET"),
    ("/user-subscriptions", "GET"),
    ("/user-subscriptions/*", "GET|POST"),
    ("/subscription-batches", "GET"),
    ("/users/me/*", "GET"),
    ("/usage/*", "GET"),
    // 由终端、课程服务承载的计量入口，此处只做授权和配额判定
    ("/terminals", "GET|POST"),
    ("/courses", "GET|POST"),
];

/// 计量角色的规则：只有协作服务能改写用量
const METERING_POLICIES: &[(&str, &str)] = &[("/usage/*", "GET"), ("/usage/increment", "POST")];

pub fn org_member_role(org_id: Uuid) -> String {
    format!("organization:{}", org_id)
}

pub fn org_manager_role(org_id: Uuid) -> String {
    format!("organization_manager:{}", org_id)
}

pub fn org_owner_role(org_id: Uuid) -> String {
    format!("organization_owner:{}", org_id)
}

pub fn group_member_role(group_id: Uuid) -> String {
    format!("group:{}", group_id)
}

pub fn group_manager_role(group_id: Uuid) -> String {
    format!("group_manager:{}", group_id)
}

pub fn group_owner_role(group_id: Uuid) -> String {
    format!("group_owner:{}", group_id)
}

/// 组织角色对应的累加绑定
fn org_roles_for(org_id: Uuid, role: OrganizationRole) -> Vec<String> {
    let mut roles = vec![org_member_role(org_id)];
    if role.can_manage() {
        roles.push(org_manager_role(org_id));
    }
    if role == OrganizationRole::Owner {
        roles.push(org_owner_role(org_id));
    }
    roles
}

fn group_roles_for(group_id: Uuid, role: GroupRole) -> Vec<String> {
    let mut roles = vec![group_member_role(group_id)];
    if role.can_manage() {
        roles.push(group_manager_role(group_id));
    }
    if role == GroupRole::Owner {
        roles.push(group_owner_role(group_id));
    }
    roles
}

/// 组织作用域角色的规则
fn org_policies(org_id: Uuid) -> Vec<(String, String, &'static str)> {
    let base = format!("/organizations/{}", org_id);
    let member = org_member_role(org_id);
    let manager = org_manager_role(org_id);
    let owner = org_owner_role(org_id);
    vec![
        (member.clone(), base.clone(), READ),
        (member.clone(), format!("{}/members", base), READ),
        (member.clone(), format!("{}/groups", base), READ),
        (member.clone(), format!("{}/features", base), READ),
        (member, format!("{}/usage-limits", base), READ),
        (manager.clone(), base.clone(), READ_WRITE),
        (manager.clone(), format!("{}/members", base), "GET|POST"),
        (manager.clone(), format!("{}/members/*", base), MANAGE),
        (manager.clone(), format!("{}/groups", base), "GET|POST"),
        (manager, format!("{}/groups/*", base), MANAGE),
        (owner.clone(), base.clone(), MANAGE),
        (owner, format!("{}/*", base), MANAGE),
    ]
}

fn group_policies(group_id: Uuid) -> Vec<(String, String, &'static str)> {
    let base = format!("/groups/{}", group_id);
    let member = group_member_role(group_id);
    let manager = group_manager_role(group_id);
    let owner = group_owner_role(group_id);
    vec![
        (member.clone(), base.clone(), READ),
        (member, format!("{}/members", base), READ),
        (manager.clone(), base.clone(), READ_WRITE),
        (manager.clone(), format!("{}/members", base), "GET|POST"),
        (manager, format!("{}/members/*", base), MANAGE),
        (owner.clone(), base.clone(), MANAGE),
        (owner, format!("{}/*", base), MANAGE),
    ]
}

/// 权限授予服务
pub struct PermissionService {
    store: Arc<PolicyStore>,
    warn_only: bool,
}

impl PermissionService {
    pub fn new(store: Arc<PolicyStore>, warn_only: bool) -> Self {
        Self { store, warn_only }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// 非关键写入：warn-only 模式下记录并继续
    fn tolerate(&self, operation: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.warn_only => {
                metrics::counter!(POLICY_WRITE_FAILURES, "operation" => operation.to_string())
                    .increment(1);
                tracing::warn!(operation, error = %e, "Policy write failed, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 启动时注册基础角色规则（幂等）
    pub async fn seed_base_policies(&self) -> Result<()> {
        for (object, action) in BASE_POLICIES {
            self.store.add_policy(MEMBER_ROLE, object, action).await?;
        }
        for (object, action) in METERING_POLICIES {
            self.store.add_policy(METERING_ROLE, object, action).await?;
        }
        Ok(())
    }

    async fn add_all(&self, rules: Vec<(String, String, &'static str)>) -> Result<()> {
        for (subject, object, action) in rules {
            self.store.add_policy(&subject, &object, action).await?;
        }
        Ok(())
    }

    // ==================== Organizations ====================

    /// 注册组织的作用域规则
    pub async fn register_organization(&self, org_id: Uuid) -> Result<()> {
        let result = self.add_all(org_policies(org_id)).await;
        self.tolerate("register_organization", result)
    }

    pub async fn grant_organization_role(&self, org_id: Uuid, user_id: &str, role: OrganizationRole) -> Result<()> {
        let result = async {
            for scoped in org_roles_for(org_id, role) {
                self.store.add_grouping(user_id, &scoped).await?;
            }
            Ok(())
        }
        .await;
        self.tolerate("grant_organization_role", result)
    }

    pub async fn revoke_organization_roles(&self, org_id: Uuid, user_id: &str) -> Result<()> {
        let result = async {
            for scoped in org_roles_for(org_id, OrganizationRole::Owner) {
                self.store.remove_grouping(user_id, &scoped).await?;
            }
            Ok(())
        }
        .await;
        self.tolerate("revoke_organization_roles", result)
    }

    /// 角色变更：撤销后按新角色重新绑定
    pub async fn change_organization_role(&self, org_id: Uuid, user_id: &str, role: OrganizationRole) -> Result<()> {
        self.revoke_organization_roles(org_id, user_id).await?;
        self.grant_organization_role(org_id, user_id, role).await
    }

    /// 删除组织：撤销全部成员绑定和作用域规则
    pub async fn drop_organization(&self, org_id: Uuid) -> Result<()> {
        let roles = [
            org_member_role(org_id),
            org_manager_role(org_id),
            org_owner_role(org_id),
        ];
        let result = async {
            for role in &roles {
                self.store
                    .remove_filtered_grouping(1, std::slice::from_ref(role))
                    .await?;
                self.store
                    .remove_filtered_policy(0, std::slice::from_ref(role))
                    .await?;
            }
            Ok(())
        }
        .await;
        self.tolerate("drop_organization", result)
    }

    // ==================== Groups ====================

    pub async fn register_group(&self, group_id: Uuid) -> Result<()> {
        let result = self.add_all(group_policies(group_id)).await;
        self.tolerate("register_group", result)
    }

    pub async fn grant_group_role(&self, group_id: Uuid, user_id: &str, role: GroupRole) -> Result<()> {
        let result = async {
            for scoped in group_roles_for(group_id, role) {
                self.store.add_grouping(user_id, &scoped).await?;
            }
            Ok(())
        }
        .await;
        self.tolerate("grant_group_role", result)
    }

    pub async fn revoke_group_roles(&self, group_id: Uuid, user_id: &str) -> Result<()> {
        let result = async {
            for scoped in group_roles_for(group_id, GroupRole::Owner) {
                self.store.remove_grouping(user_id, &scoped).await?;
            }
            Ok(())
        }
        .await;
        self.tolerate("revoke_group_roles", result)
    }

    pub async fn change_group_role(&self, group_id: Uuid, user_id: &str, role: GroupRole) -> Result<()> {
        self.revoke_group_roles(group_id, user_id).await?;
        self.grant_group_role(group_id, user_id, role).await
    }

    pub async fn drop_group(&self, group_id: Uuid) -> Result<()> {
        let roles = [
            group_member_role(group_id),
            group_manager_role(group_id),
            group_owner_role(group_id),
        ];
        let result = async {
            for role in &roles {
                self.store
                    .remove_filtered_grouping(1, std::slice::from_ref(role))
                    .await?;
                self.store
                    .remove_filtered_policy(0, std::slice::from_ref(role))
                    .await?;
            }
            Ok(())
        }
        .await;
        self.tolerate("drop_group", result)
    }

    // ==================== Batches ====================

    /// 购买者对批次的管理权限
    pub async fn grant_batch_owner(&self, batch_id: Uuid, user_id: &str) -> Result<()> {
        let base = format!("/subscription-batches/{}", batch_id);
        let result = async {
            self.store.add_policy(user_id, &base, "GET|DELETE").await?;
            self.store.add_policy(user_id, &format!("{}/*", base), MANAGE).await?;
            Ok(())
        }
        .await;
        self.tolerate("grant_batch_owner", result)
    }

    pub async fn drop_batch(&self, batch_id: Uuid) -> Result<()> {
        let base = format!("/subscription-batches/{}", batch_id);
        let result = async {
            self.store
                .remove_filtered_policy(1, std::slice::from_ref(&base))
                .await?;
            self.store
                .remove_filtered_policy(1, &[format!("{}/*", base)])
                .await?;
            Ok(())
        }
        .await;
        self.tolerate("drop_batch", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;

    async fn service(warn_only: bool) -> (PermissionService, Arc<MemoryStore>) {
        let repo = Arc::new(MemoryStore::new());
        let store = Arc::new(PolicyStore::load(repo.clone()).await.unwrap());
        (PermissionService::new(store, warn_only), repo)
    }

    #[tokio::test]
    async fn test_org_role_grants() {
        let (service, _) = service(false).await;
        let org = Uuid::new_v4();
        service.register_organization(org).await.unwrap();
        service.grant_organization_role(org, "member", OrganizationRole::Member).await.unwrap();
        service.grant_organization_role(org, "mgr", OrganizationRole::Manager).await.unwrap();
        service.grant_organization_role(org, "owner", OrganizationRole::Owner).await.unwrap();

        let path = format!("/organizations/{}", org);
        let members = format!("{}/members", path);
        let store = service.store();

        assert!(store.enforce("member", &path, "GET"));
        assert!(!store.enforce("member", &path, "PATCH"));
        assert!(!store.enforce("member", &members, "POST"));

        assert!(store.enforce("mgr", &path, "PATCH"));
        assert!(store.enforce("mgr", &members, "POST"));
        assert!(!store.enforce("mgr", &path, "DELETE"));

        assert!(store.enforce("owner", &path, "DELETE"));
        assert!(store.enforce("owner", &format!("{}/subscribe", path), "POST"));
    }

    #[tokio::test]
    async fn test_drop_organization_revokes_everyone() {
        let (service, _) = service(false).await;
        let org = Uuid::new_v4();
        service.register_organization(org).await.unwrap();
        service.grant_organization_role(org, "owner", OrganizationRole::Owner).await.unwrap();
        service.drop_organization(org).await.unwrap();

        let path = format!("/organizations/{}", org);
        assert!(!service.store().enforce("owner", &path, "GET"));
        assert!(service.store().roles_for("owner").is_empty());
    }

    #[tokio::test]
    async fn test_warn_only_swallows_failures() {
        let (service, repo) = service(true).await;
        repo.fail_policy_writes(true);
        assert!(service.register_organization(Uuid::new_v4()).await.is_ok());

        let (strict, repo) = self::service(false).await;
        repo.fail_policy_writes(true);
        assert!(strict.register_organization(Uuid::new_v4()).await.is_err());
    }
}
