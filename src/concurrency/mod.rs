//! 并发控制模块
//! 按用户串行化提交阶段，并为变更类操作提供截止时间

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// 按用户的异步锁
///
/// 只保护账本、席位和用量上限的提交阶段。持有期间不得调用外部服务。
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// 用户锁守卫，释放时清理无人等待的条目
pub struct UserLockGuard {
    user_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // 只剩 map 自身持有时移除
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取用户锁，受截止时间约束
    pub async fn acquire(&self, user_id: &str, deadline: Deadline) -> Result<UserLockGuard> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = deadline
            .run("acquire user lock", lock.lock_owned())
            .await?;
        debug!(user_id, "User lock acquired");

        Ok(UserLockGuard {
            user_id: user_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        })
    }

    /// 当前持有或等待中的用户数
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// 操作截止时间
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// 取截止时间与 now + timeout 中较早者（单次外部调用的超时）
    pub fn capped(&self, timeout: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + timeout),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// 在截止时间内执行 future，超时返回 Timeout
    pub async fn run<F, T>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout_at(self.at, future).await {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(operation, "Operation deadline exceeded");
                Err(AppError::timeout(operation))
            }
        }
    }

    /// 与 run 相同，但 future 自身返回 Result
    pub async fn run_fallible<F, T, E>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<AppError>,
    {
        self.run(operation, future).await?.map_err(Into::into)
    }
}
