//! Organization domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// 组织默认群组上限
pub const DEFAULT_ORG_MAX_GROUPS: i32 = 10;
/// 组织默认成员上限
pub const DEFAULT_ORG_MAX_MEMBERS: i32 = 50;

/// 组织成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "organization_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrganizationRole {
    Owner,
    Manager,
    Member,
}

impl OrganizationRole {
    /// 角色优先级，数值越大权限越高
    pub fn priority(&self) -> i32 {
        match self {
            OrganizationRole::Owner => 100,
            OrganizationRole::Manager => 50,
            OrganizationRole::Member => 10,
        }
    }

    /// 是否可以管理成员与群组
    pub fn can_manage(&self) -> bool {
        matches!(self, OrganizationRole::Owner | OrganizationRole::Manager)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationRole::Owner => "owner",
            OrganizationRole::Manager => "manager",
            OrganizationRole::Member => "member",
        }
    }
}

impl FromStr for OrganizationRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(OrganizationRole::Owner),
            "manager" => Ok(OrganizationRole::Manager),
            "member" => Ok(OrganizationRole::Member),
            other => Err(AppError::InvalidRole(other.to_string())),
        }
    }
}

/// 组织
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    /// 同一拥有者下唯一
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub owner_user_id: String,
    pub subscription_plan_id: Option<Uuid>,
    /// 每个用户自动创建一个个人组织
    pub is_personal: bool,
    /// -1 表示不限
    pub max_groups: i32,
    /// -1 表示不限
    pub max_members: i32,
    pub is_active: bool,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// 个人组织名称
    pub fn personal_name(user_id: &str) -> String {
        format!("personal_{}", user_id)
    }
}

/// 组织成员
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrganizationMember {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: String,
    pub role: OrganizationRole,
    pub joined_at: DateTime<Utc>,
    pub invited_by: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationMember {
    pub fn new(
        organization_id: Uuid,
        user_id: &str,
        role: OrganizationRole,
        invited_by: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            user_id: user_id.to_string(),
            role,
            joined_at: now,
            invited_by: invited_by.map(str::to_string),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 创建组织请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 255))]
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// 0 或缺省使用默认值
    pub max_groups: Option<i32>,
    pub max_members: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

/// 更新组织请求（显式补丁，未知字段直接拒绝）
#[derive(Debug, Default, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateOrganizationRequest {
    #[validate(length(min = 1, max = 255))]
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub max_groups: Option<i32>,
    pub max_members: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

/// 添加成员请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct AddMemberRequest {
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
    pub role: Option<String>,
}

/// 修改成员角色请求
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMemberRoleRequest {
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_priority_order() {
        assert!(OrganizationRole::Owner.priority() > OrganizationRole::Manager.priority());
        assert!(OrganizationRole::Manager.priority() > OrganizationRole::Member.priority());
    }

    #[test]
    fn test_parse_role() {
        assert_eq!("manager".parse::<OrganizationRole>().unwrap(), OrganizationRole::Manager);
        let err = "admin".parse::<OrganizationRole>().unwrap_err();
        assert_eq!(err.code(), "INVALID_ROLE");
    }

    #[test]
    fn test_personal_name() {
        assert_eq!(Organization::personal_name("u1"), "personal_u1");
    }
}
