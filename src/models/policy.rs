//! Policy rule models

use serde::{Deserialize, Serialize};

/// 访问规则 (subject, object, action_mask)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::FromRow)]
pub struct PolicyRule {
    /// 用户 ID 或角色名
    pub subject: String,
    /// 路径或通配后缀路径，如 /organizations/{id}/*
    pub object: String,
    /// HTTP 方法正则，如 GET|POST
    pub action: String,
}

impl PolicyRule {
    pub fn new(subject: &str, object: &str, action: &str) -> Self {
        Self {
            subject: subject.to_string(),
            object: object.to_string(),
            action: action.to_string(),
        }
    }

    fn field(&self, index: usize) -> Option<&str> {
        match index {
            0 => Some(&self.subject),
            1 => Some(&self.object),
            2 => Some(&self.action),
            _ => None,
        }
    }

    /// 从 field_index 起按列比较，空字符串表示该列不限
    pub fn matches_filter(&self, field_index: usize, values: &[String]) -> bool {
        values.iter().enumerate().all(|(offset, value)| {
            value.is_empty() || self.field(field_index + offset) == Some(value.as_str())
        })
    }
}

/// 用户到角色的绑定
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupingRule {
    pub user_id: String,
    pub role: String,
}

impl GroupingRule {
    pub fn new(user_id: &str, role: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: role.to_string(),
        }
    }

    pub fn matches_filter(&self, field_index: usize, values: &[String]) -> bool {
        values.iter().enumerate().all(|(offset, value)| {
            let field = match field_index + offset {
                0 => Some(self.user_id.as_str()),
                1 => Some(self.role.as_str()),
                _ => None,
            };
            value.is_empty() || field == Some(value.as_str())
        })
    }
}

/// 规则列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyField {
    Subject = 0,
    Object = 1,
    Action = 2,
}

impl PolicyField {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_by_subject() {
        let rule = PolicyRule::new("organization:1", "/organizations/1", "GET");
        assert!(rule.matches_filter(0, &["organization:1".to_string()]));
        assert!(!rule.matches_filter(0, &["organization:2".to_string()]));
        assert!(rule.matches_filter(1, &["/organizations/1".to_string(), String::new()]));
    }
}
