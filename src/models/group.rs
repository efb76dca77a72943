//! Group domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::str::FromStr;
use uuid::Uuid;

use super::organization::OrganizationRole;
use crate::error::AppError;

/// 群组默认成员上限
pub const DEFAULT_GROUP_MAX_MEMBERS: i32 = 50;

/// 群组成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "group_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Owner,
    Admin,
    Assistant,
    Member,
}

impl GroupRole {
    pub fn priority(&self) -> i32 {
        match self {
            GroupRole::Owner => 100,
            GroupRole::Admin => 50,
            GroupRole::Assistant => 20,
            GroupRole::Member => 10,
        }
    }

    /// owner / admin 可以管理成员
    pub fn can_manage(&self) -> bool {
        matches!(self, GroupRole::Owner | GroupRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Owner => "owner",
            GroupRole::Admin => "admin",
            GroupRole::Assistant => "assistant",
            GroupRole::Member => "member",
        }
    }
}

impl FromStr for GroupRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(GroupRole::Owner),
            "admin" => Ok(GroupRole::Admin),
            "assistant" => Ok(GroupRole::Assistant),
            "member" => Ok(GroupRole::Member),
            other => Err(AppError::InvalidRole(other.to_string())),
        }
    }
}

/// 群组
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: Uuid,
    /// 同一拥有者下唯一
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub owner_user_id: String,
    pub organization_id: Option<Uuid>,
    pub parent_group_id: Option<Uuid>,
    /// -1 表示不限
    pub max_members: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    /// 过期后群组只读
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// 群组成员
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupMember {
    pub id: Uuid,
    pub group_id: Uuid,
    pub user_id: String,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
    pub invited_by: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn new(group_id: Uuid, user_id: &str, role: GroupRole, invited_by: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            group_id,
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

/// 用户对群组的访问来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "role", rename_all = "snake_case")]
pub enum GroupAccess {
    /// 群组的直接成员
    Direct(GroupRole),
    /// 通过所属组织的 manager / owner 身份级联获得
    ViaOrgManager(OrganizationRole),
    None,
}

impl GroupAccess {
    pub fn is_none(&self) -> bool {
        matches!(self, GroupAccess::None)
    }
}

/// 创建群组请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 255))]
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub organization_id: Option<Uuid>,
    pub parent_group_id: Option<Uuid>,
    pub max_members: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// 更新群组请求
#[derive(Debug, Default, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateGroupRequest {
    #[validate(length(min = 1, max = 255))]
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub max_members: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_group_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

/// 添加群组成员请求
#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct AddGroupMemberRequest {
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
    pub role: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn group(expires_at: Option<DateTime<Utc>>) -> Group {
        let now = Utc::now();
        Group {
            id: Uuid::new_v4(),
            name: "g".into(),
            display_name: "G".into(),
            description: None,
            owner_user_id: "u".into(),
            organization_id: None,
            parent_group_id: None,
            max_members: 10,
            expires_at,
            is_active: true,
            metadata: Json(serde_json::json!({})),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_expiry() {
        assert!(!group(None).is_expired());
        assert!(group(Some(Utc::now() - Duration::minutes(1))).is_expired());
        assert!(!group(Some(Utc::now() + Duration::days(1))).is_expired());
    }

    #[test]
    fn test_group_role_priority() {
        let mut roles = vec![GroupRole::Member, GroupRole::Owner, GroupRole::Assistant, GroupRole::Admin];
        roles.sort_by_key(|r| -r.priority());
        assert_eq!(roles, vec![GroupRole::Owner, GroupRole::Admin, GroupRole::Assistant, GroupRole::Member]);
    }
}
