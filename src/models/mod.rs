//! 数据模型模块
//! 组织、群组、订阅计划、订阅账本、批量授权、用量与权限规则

pub mod batch;
pub mod group;
pub mod organization;
pub mod plan;
pub mod policy;
pub mod subscription;
pub mod usage;

use serde::Deserialize;

/// 分页参数（成员扫描等长列表按页读取）
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

fn default_page_limit() -> i64 {
    50
}

impl Page {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self {
            offset: offset.max(0),
            limit: limit.clamp(1, 1000),
        }
    }

    pub fn first(limit: i64) -> Self {
        Self::new(0, limit)
    }

    pub fn next(&self) -> Self {
        Self::new(self.offset + self.limit, self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(default_page_limit())
    }
}

/// 上限判断：负数表示不限
pub fn within_cap(cap: i32, current: i64) -> bool {
    cap < 0 || current < i64::from(cap)
}

/// 发起操作的用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(user_id: &str, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            roles,
        }
    }

    /// 系统内部调用（事件消费、回调）
    pub fn system() -> Self {
        Self::new("system", vec!["administrator".to_string()])
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "administrator")
    }
}
