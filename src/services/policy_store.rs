//! Policy Store
//!
//! 持久化并评估访问规则。内存索引读多写少：读取方拿到一个 `Arc` 快照，
//! 写入方在互斥锁内先落库、再复制并替换索引。

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::{
    error::{AppError, Result},
    models::policy::{GroupingRule, PolicyRule},
    repository::PolicyRepository,
};

/// 管理员角色，命中后无条件放行
pub const ADMIN_ROLE: &str = "administrator";

/// 规范化路径：去掉末尾斜杠，空路径视为 "/"
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{id}` 或 `*`：任意单段
    Any,
}

/// 编译后的路径模式
#[derive(Debug, Clone)]
pub struct PathPattern {
    segments: Vec<Segment>,
    /// 以 `/*` 结尾：匹配至少一段子路径
    wildcard_suffix: bool,
}

impl PathPattern {
    pub fn parse(object: &str) -> Self {
        let normalized = normalize_path(object);
        let mut parts = segments(&normalized);
        let wildcard_suffix = parts.last() == Some(&"*");
        if wildcard_suffix {
            parts.pop();
        }
        let segments = parts
            .into_iter()
            .map(|part| {
                if part == "*" || (part.starts_with('{') && part.ends_with('}')) {
                    Segment::Any
                } else {
                    Segment::Literal(part.to_string())
                }
            })
            .collect();
        Self {
            segments,
            wildcard_suffix,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        let parts = segments(&normalized);

        if self.wildcard_suffix {
            if parts.len() <= self.segments.len() {
                return false;
            }
        } else if parts.len() != self.segments.len() {
            return false;
        }

        self.segments
            .iter()
            .zip(parts.iter())
            .all(|(segment, part)| match segment {
                Segment::Any => true,
                Segment::Literal(literal) => literal == part,
            })
    }

    /// 模式是否覆盖某个实体路径（实体本身或其子路径）
    pub fn covers_entity(&self, entity_path: &str) -> bool {
        let normalized = normalize_path(entity_path);
        let parts = segments(&normalized);
        if self.segments.len() < parts.len() && !self.wildcard_suffix {
            return false;
        }
        parts
            .iter()
            .zip(self.segments.iter())
            .all(|(part, segment)| match segment {
                Segment::Any => true,
                Segment::Literal(literal) => literal == part,
            })
    }
}

/// 编译动作掩码，整体锚定
pub fn compile_action(mask: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", mask))
        .map_err(|e| AppError::Validation(format!("Invalid action mask '{}': {}", mask, e)))
}

#[derive(Debug, Clone)]
struct CompiledPolicy {
    rule: PolicyRule,
    pattern: PathPattern,
    action: Regex,
}

impl CompiledPolicy {
    fn compile(rule: PolicyRule) -> Result<Self> {
        Ok(Self {
            pattern: PathPattern::parse(&rule.object),
            action: compile_action(&rule.action)?,
            rule,
        })
    }
}

/// 规则索引快照
#[derive(Debug, Clone, Default)]
pub struct PolicyIndex {
    by_subject: HashMap<String, Vec<CompiledPolicy>>,
    roles_by_user: HashMap<String, BTreeSet<String>>,
}

impl PolicyIndex {
    fn build(policies: Vec<PolicyRule>, groupings: Vec<GroupingRule>) -> Self {
        let mut index = PolicyIndex::default();
        for rule in policies {
            match CompiledPolicy::compile(rule) {
                Ok(compiled) => index.insert_policy(compiled),
                Err(e) => tracing::warn!(error = %e, "Skipping stored policy with invalid action mask"),
            }
        }
        for grouping in groupings {
            index.insert_grouping(grouping);
        }
        index
    }

    fn insert_policy(&mut self, compiled: CompiledPolicy) {
        let entry = self
            .by_subject
            .entry(compiled.rule.subject.clone())
            .or_default();
        if !entry.iter().any(|p| p.rule == compiled.rule) {
            entry.push(compiled);
        }
    }

    fn remove_policy(&mut self, rule: &PolicyRule) {
        if let Some(entry) = self.by_subject.get_mut(&rule.subject) {
            entry.retain(|p| &p.rule != rule);
            if entry.is_empty() {
                self.by_subject.remove(&rule.subject);
            }
        }
    }

    fn insert_grouping(&mut self, grouping: GroupingRule) {
        self.roles_by_user
            .entry(grouping.user_id)
            .or_default()
            .insert(grouping.role);
    }

    fn remove_grouping(&mut self, grouping: &GroupingRule) {
        if let Some(roles) = self.roles_by_user.get_mut(&grouping.user_id) {
            roles.remove(&grouping.role);
            if roles.is_empty() {
                self.roles_by_user.remove(&grouping.user_id);
            }
        }
    }

    /// 主体自身加上它直接绑定的角色（单层展开）
    pub fn expand(&self, subject: &str) -> Vec<String> {
        let mut subjects = vec![subject.to_string()];
        if let Some(roles) = self.roles_by_user.get(subject) {
            subjects.extend(roles.iter().cloned());
        }
        subjects
    }

    fn policies_of<'a>(&'a self, subjects: &'a [String]) -> impl Iterator<Item = &'a CompiledPolicy> + 'a {
        subjects
            .iter()
            .filter_map(move |s| self.by_subject.get(s))
            .flatten()
    }

    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
        self.enforce_subjects(&self.expand(subject), object, action)
    }

    /// 以已展开的主体集合评估
    pub fn enforce_subjects(&self, subjects: &[String], object: &str, action: &str) -> bool {
        self.policies_of(subjects)
            .any(|p| p.pattern.matches(object) && p.action.is_match(action))
    }

    /// 是否存在覆盖该实体（或其子路径）的任意动作规则
    pub fn touches_entity(&self, subjects: &[String], entity_path: &str) -> bool {
        self.policies_of(subjects)
            .any(|p| p.pattern.covers_entity(entity_path))
    }

    pub fn roles_for(&self, user: &str) -> Vec<String> {
        self.roles_by_user
            .get(user)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 主体在某个集合下有规则的实体 id，如 collection = "organizations"
    pub fn entity_ids(&self, subjects: &[String], collection: &str) -> BTreeSet<String> {
        self.policies_of(subjects)
            .filter_map(|p| {
                let object = normalize_path(&p.rule.object);
                let parts = segments(&object);
                match parts.as_slice() {
                    [head, id, ..] if *head == collection && *id != "*" && !id.starts_with('{') => {
                        Some(id.to_string())
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub fn policy_count(&self) -> usize {
        self.by_subject.values().map(Vec::len).sum()
    }

    fn rules(&self) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = self
            .by_subject
            .values()
            .flatten()
            .map(|p| p.rule.clone())
            .collect();
        rules.sort();
        rules
    }
}

/// 访问规则存储
pub struct PolicyStore {
    repo: Arc<dyn PolicyRepository>,
    index: RwLock<Arc<PolicyIndex>>,
    writer: Mutex<()>,
}

impl PolicyStore {
    /// 从存储加载全部规则
    pub async fn load(repo: Arc<dyn PolicyRepository>) -> Result<Self> {
        let (policies, groupings) = repo.load_all().await?;
        let index = PolicyIndex::build(policies, groupings);
        tracing::info!(policies = index.policy_count(), "Policy store loaded");
        Ok(Self {
            repo,
            index: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
        })
    }

    /// 当前索引快照
    pub fn snapshot(&self) -> Arc<PolicyIndex> {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap(&self, index: PolicyIndex) {
        let mut guard = self
            .index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(index);
    }

    /// 重新读取全部规则并原子替换索引
    pub async fn reload(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let (policies, groupings) = self.repo.load_all().await?;
        let index = PolicyIndex::build(policies, groupings);
        tracing::info!(policies = index.policy_count(), "Policy store reloaded");
        self.swap(index);
        Ok(())
    }

    /// 幂等添加，返回是否新插入
    pub async fn add_policy(&self, subject: &str, object: &str, action_mask: &str) -> Result<bool> {
        let rule = PolicyRule::new(subject, object, action_mask);
        let compiled = CompiledPolicy::compile(rule.clone())?;

        let _writer = self.writer.lock().await;
        let inserted = self.repo.insert_policy(&rule).await?;
        let mut index = (*self.snapshot()).clone();
        index.insert_policy(compiled);
        self.swap(index);

        if inserted {
            tracing::debug!(subject, object, action = action_mask, "Policy added");
        }
        Ok(inserted)
    }

    pub async fn remove_policy(&self, subject: &str, object: &str, action_mask: &str) -> Result<bool> {
        let rule = PolicyRule::new(subject, object, action_mask);

        let _writer = self.writer.lock().await;
        let removed = self.repo.delete_policy(&rule).await?;
        let mut index = (*self.snapshot()).clone();
        index.remove_policy(&rule);
        self.swap(index);
        Ok(removed)
    }

    /// 按列批量撤销，至少需要一个非空过滤值
    pub async fn remove_filtered_policy(&self, field_index: usize, values: &[String]) -> Result<usize> {
        if field_index > 2 || values.iter().all(String::is_empty) {
            return Err(AppError::validation("Policy filter must name at least one column value"));
        }

        let _writer = self.writer.lock().await;
        let removed = self.repo.delete_policies_where(field_index, values).await?;
        let mut index = (*self.snapshot()).clone();
        for rule in &removed {
            index.remove_policy(rule);
        }
        // 存储与索引不一致时以过滤条件为准
        for rule in index.rules() {
            if rule.matches_filter(field_index, values) {
                index.remove_policy(&rule);
            }
        }
        self.swap(index);

        tracing::debug!(field_index, ?values, removed = removed.len(), "Filtered policies removed");
        Ok(removed.len())
    }

    pub async fn add_grouping(&self, user: &str, role: &str) -> Result<bool> {
        let rule = GroupingRule::new(user, role);

        let _writer = self.writer.lock().await;
        let inserted = self.repo.insert_grouping(&rule).await?;
        let mut index = (*self.snapshot()).clone();
        index.insert_grouping(rule);
        self.swap(index);
        Ok(inserted)
    }

    pub async fn remove_grouping(&self, user: &str, role: &str) -> Result<bool> {
        let rule = GroupingRule::new(user, role);

        let _writer = self.writer.lock().await;
        let removed = self.repo.delete_grouping(&rule).await?;
        let mut index = (*self.snapshot()).clone();
        index.remove_grouping(&rule);
        self.swap(index);
        Ok(removed)
    }

    /// 按列批量删除角色绑定（例如删除组织时撤销 `organization:{id}` 的全部绑定）
    pub async fn remove_filtered_grouping(&self, field_index: usize, values: &[String]) -> Result<usize> {
        if field_index > 1 || values.iter().all(String::is_empty) {
            return Err(AppError::validation("Grouping filter must name at least one column value"));
        }

        let _writer = self.writer.lock().await;
        let removed = self.repo.delete_groupings_where(field_index, values).await?;
        let mut index = (*self.snapshot()).clone();
        for rule in &removed {
            index.remove_grouping(rule);
        }
        self.swap(index);
        Ok(removed.len())
    }

    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
        self.snapshot().enforce(subject, object, action)
    }

    pub fn roles_for(&self, user: &str) -> Vec<String> {
        self.snapshot().roles_for(user)
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.snapshot()
            .roles_by_user
            .get(user)
            .is_some_and(|roles| roles.contains(ADMIN_ROLE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;

    async fn store() -> PolicyStore {
        PolicyStore::load(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[test]
    fn test_path_pattern_placeholder() {
        let pattern = PathPattern::parse("/organizations/{id}/members");
        assert!(pattern.matches("/organizations/abc/members"));
        assert!(pattern.matches("/organizations/abc/members/"));
        assert!(!pattern.matches("/organizations/abc"));
        assert!(!pattern.matches("/organizations/abc/groups"));
    }

    #[test]
    fn test_path_pattern_wildcard_suffix() {
        let pattern = PathPattern::parse("/organizations/o1/*");
        assert!(pattern.matches("/organizations/o1/members"));
        assert!(pattern.matches("/organizations/o1/members/u2"));
        assert!(!pattern.matches("/organizations/o1"));
        assert!(!pattern.matches("/organizations/o2/members"));
    }

    #[test]
    fn test_covers_entity() {
        assert!(PathPattern::parse("/organizations/o1/members").covers_entity("/organizations/o1"));
        assert!(PathPattern::parse("/subscription-plans/*").covers_entity("/subscription-plans/p1"));
        assert!(!PathPattern::parse("/organizations").covers_entity("/organizations/o1"));
        assert!(!PathPattern::parse("/organizations/o2/*").covers_entity("/organizations/o1"));
    }

    #[test]
    fn test_action_mask_is_anchored() {
        let mask = compile_action("GET|POST").unwrap();
        assert!(mask.is_match("GET"));
        assert!(mask.is_match("POST"));
        assert!(!mask.is_match("GETX"));
        assert!(!mask.is_match("DELETE"));
        assert!(compile_action("(GET").is_err());
    }

    #[tokio::test]
    async fn test_add_policy_is_idempotent() {
        let store = store().await;
        assert!(store.add_policy("u1", "/organizations/o1", "GET").await.unwrap());
        assert!(!store.add_policy("u1", "/organizations/o1", "GET").await.unwrap());
        assert_eq!(store.snapshot().policy_count(), 1);
    }

    #[tokio::test]
    async fn test_enforce_expands_grouping_once() {
        let store = store().await;
        store.add_policy("organization:o1", "/organizations/o1", "GET").await.unwrap();
        store.add_grouping("u1", "organization:o1").await.unwrap();
        // 角色之间不递归
        store.add_grouping("organization:o1", "organization_owner:o1").await.unwrap();
        store.add_policy("organization_owner:o1", "/organizations/o1", "DELETE").await.unwrap();

        assert!(store.enforce("u1", "/organizations/o1", "GET"));
        assert!(!store.enforce("u1", "/organizations/o1", "DELETE"));
        assert!(!store.enforce("u2", "/organizations/o1", "GET"));
    }

    #[tokio::test]
    async fn test_remove_filtered_policy() {
        let store = store().await;
        store.add_policy("organization:o1", "/organizations/o1", "GET").await.unwrap();
        store.add_policy("organization:o1", "/organizations/o1/members", "GET").await.unwrap();
        store.add_policy("organization:o2", "/organizations/o2", "GET").await.unwrap();

        let removed = store
            .remove_filtered_policy(0, &["organization:o1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.snapshot().policy_count(), 1);
        assert!(store.remove_filtered_policy(0, &[String::new()]).await.is_err());
    }

    #[tokio::test]
    async fn test_reload_matches_persisted_state() {
        let repo = Arc::new(MemoryStore::new());
        let store = PolicyStore::load(repo.clone()).await.unwrap();
        store.add_policy("u1", "/groups/g1", "GET").await.unwrap();

        let other = PolicyStore::load(repo).await.unwrap();
        assert!(other.enforce("u1", "/groups/g1", "GET"));
        other.reload().await.unwrap();
        assert!(other.enforce("u1", "/groups/g1", "GET"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_index_untouched() {
        let repo = Arc::new(MemoryStore::new());
        let store = PolicyStore::load(repo.clone()).await.unwrap();
        repo.fail_policy_writes(true);
        assert!(store.add_policy("u1", "/groups/g1", "GET").await.is_err());
        assert!(!store.enforce("u1", "/groups/g1", "GET"));
    }

    #[tokio::test]
    async fn test_entity_ids_for_collection() {
        let store = store().await;
        store.add_policy("organization:o1", "/organizations/o1", "GET").await.unwrap();
        store.add_policy("u1", "/organizations/o2/*", "GET").await.unwrap();
        store.add_policy("u1", "/organizations/{id}", "GET").await.unwrap();
        store.add_grouping("u1", "organization:o1").await.unwrap();

        let snapshot = store.snapshot();
        let ids = snapshot.entity_ids(&snapshot.expand("u1"), "organizations");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["o1".to_string(), "o2".to_string()]);
    }
}
