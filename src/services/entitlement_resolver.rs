//! Entitlement resolver
//!
//! 请求级授权判定和用户有效能力汇总。
//! 判定顺序：管理员、实体规则、群组级联、集合过滤、用量配额。

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::group_service::GroupService;
use super::permission_service::{BULK_PURCHASE_ROLES, MEMBER_ROLE};
use super::plan_catalog::{highest, PlanLookup};
use super::policy_store::{normalize_path, PolicyStore, ADMIN_ROLE};
use super::subscription_service::live_with_plans;
use super::usage_service::UsageService;
use crate::{
    concurrency::Deadline,
    error::{AppError, Result},
    models::{
        group::GroupAccess,
        plan::{PlanCaps, SubscriptionPlan},
        usage::MetricType,
    },
    repository::{BatchRepository, MembershipRepository, SubscriptionRepository},
    telemetry::AUTHZ_DECISIONS,
};

/// 带实体 id 的路径所属的实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Organization,
    Group,
    Batch,
}

impl EntityKind {
    fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            "organizations" => Some(EntityKind::Organization),
            "groups" => Some(EntityKind::Group),
            "subscription-batches" => Some(EntityKind::Batch),
            _ => None,
        }
    }
}

/// 解析后的请求目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// 规范化后的完整路径
    pub path: String,
    /// 第一段，如 "organizations"
    pub collection: String,
    /// 第二段是 UUID 时为实体 id
    pub entity_id: Option<Uuid>,
}

impl RequestTarget {
    pub fn parse(path: &str) -> Self {
        let path = normalize_path(path);
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        let collection = parts.next().unwrap_or_default().to_string();
        let entity_id = parts.next().and_then(|s| Uuid::parse_str(s).ok());
        Self {
            path,
            collection,
            entity_id,
        }
    }

    /// 实体根路径，如 /organizations/{id}
    pub fn entity_path(&self) -> Option<String> {
        self.entity_id
            .map(|id| format!("/{}/{}", self.collection, id))
    }

    /// 单段集合路径，如 /organizations
    pub fn is_collection_root(&self) -> bool {
        self.entity_id.is_none() && self.path == format!("/{}", self.collection)
    }
}

/// 放行依据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    Admin,
    Policy,
    /// 组织管理者对组织内群组的级联访问
    OrgManagerCascade,
    /// 平台角色直接授予的能力
    Role,
    /// 订阅计划携带的特性
    Feature,
}

/// 集合级请求的过滤条件：处理方只列出这些实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessFilter {
    pub collection: String,
    pub ids: BTreeSet<String>,
}

impl AccessFilter {
    pub fn permits(&self, id: &Uuid) -> bool {
        self.ids.contains(&id.to_string())
    }
}

/// 拒绝原因，按具体程度区分
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    UnknownEntity,
    NotMember,
    InsufficientRole,
    Expired,
    QuotaExceeded { metric: MetricType, current: i64, limit: i64 },
    MissingFeature(&'static str),
}

impl DenyReason {
    fn label(&self) -> &'static str {
        match self {
            DenyReason::UnknownEntity => "unknown_entity",
            DenyReason::NotMember => "not_member",
            DenyReason::InsufficientRole => "insufficient_role",
            DenyReason::Expired => "expired",
            DenyReason::QuotaExceeded { .. } => "quota_exceeded",
            DenyReason::MissingFeature(_) => "missing_feature",
        }
    }
}

impl From<DenyReason> for AppError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            // 不存在和无权访问对外不可区分
            DenyReason::UnknownEntity | DenyReason::NotMember => AppError::not_found("resource"),
            DenyReason::InsufficientRole => {
                AppError::forbidden("insufficient role for this operation")
            }
            DenyReason::Expired => AppError::entity_expired("Resource"),
            DenyReason::QuotaExceeded { current, limit, .. } => {
                AppError::usage_limit_exceeded(current, limit)
            }
            DenyReason::MissingFeature(feature) => {
                AppError::Forbidden(format!("subscription does not include {}", feature))
            }
        }
    }
}

/// 授权结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    /// 集合级读取：放行并附带过滤条件
    Filtered(AccessFilter),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Deny(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Decision::Allow(_) => "allow",
            Decision::Filtered(_) => "filtered",
            Decision::Deny(reason) => reason.label(),
        }
    }

    /// 拒绝转换为错误，放行时返回过滤条件（如有）
    pub fn into_result(self) -> Result<Option<AccessFilter>> {
        match self {
            Decision::Allow(_) => Ok(None),
            Decision::Filtered(filter) => Ok(Some(filter)),
            Decision::Deny(reason) => Err(reason.into()),
        }
    }
}

/// 用户的有效能力
#[derive(Debug, Clone, Serialize)]
pub struct FeatureBundle {
    pub user_id: String,
    /// 所有来源中优先级最高的计划
    pub plan: Option<SubscriptionPlan>,
    pub features: BTreeSet<String>,
    pub caps: PlanCaps,
    pub network_access_enabled: bool,
    pub data_persistence_enabled: bool,
    pub allowed_machine_sizes: BTreeSet<String>,
    /// 用户所属的全部组织（含个人组织）
    pub organizations: Vec<Uuid>,
    /// 其中贡献了计划的组织
    pub contributing_organizations: Vec<Uuid>,
}

impl FeatureBundle {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// 批量购买授权所需的特性
pub const BULK_PURCHASE_FEATURE: &str = "bulk_purchase";

/// 集合 POST 对应的计量指标
///
/// 终端和课程由外部服务承载，它们在创建前用同样的路径询问授权。
fn metered(collection: &str) -> Option<MetricType> {
    match collection {
        "terminals" => Some(MetricType::ConcurrentTerminals),
        "courses" => Some(MetricType::CoursesCreated),
        _ => None,
    }
}

/// 群组级联允许的方法
fn cascade_allows(method: &str) -> bool {
    matches!(method, "GET" | "POST" | "PATCH")
}

/// 授权判定引擎
pub struct EntitlementResolver {
    policies: Arc<PolicyStore>,
    membership: Arc<dyn MembershipRepository>,
    batches: Arc<dyn BatchRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    plans: Arc<dyn PlanLookup>,
    groups: Arc<GroupService>,
    usage: Arc<UsageService>,
    timeout: Duration,
}

impl EntitlementResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyStore>,
        membership: Arc<dyn MembershipRepository>,
        batches: Arc<dyn BatchRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        plans: Arc<dyn PlanLookup>,
        groups: Arc<GroupService>,
        usage: Arc<UsageService>,
        timeout: Duration,
    ) -> Self {
        Self {
            policies,
            membership,
            batches,
            subscriptions,
            plans,
            groups,
            usage,
            timeout,
        }
    }

    /// 判定一次请求；超过时限返回 Timeout
    #[instrument(skip(self, token_roles))]
    pub async fn authorize(
        &self,
        user_id: &str,
        token_roles: &[String],
        method: &str,
        path: &str,
    ) -> Result<Decision> {
        let decision = Deadline::after(self.timeout)
            .run_fallible("authorize", self.decide(user_id, token_roles, method, path))
            .await?;
        metrics::counter!(AUTHZ_DECISIONS, "outcome" => decision.label()).increment(1);
        debug!(outcome = decision.label(), "Authorization decided");
        Ok(decision)
    }

    async fn decide(
        &self,
        user_id: &str,
        token_roles: &[String],
        method: &str,
        path: &str,
    ) -> Result<Decision> {
        if token_roles.iter().any(|r| r == ADMIN_ROLE) || self.policies.is_admin(user_id) {
            return Ok(Decision::Allow(Grant::Admin));
        }

        let index = self.policies.snapshot();
        let mut subjects = index.expand(user_id);
        subjects.extend(token_roles.iter().cloned());
        subjects.push(MEMBER_ROLE.to_string());

        let target = RequestTarget::parse(path);
        let method = method.to_ascii_uppercase();

        let (Some(entity_id), Some(entity_path)) = (target.entity_id, target.entity_path()) else {
            return self.decide_collection(user_id, &subjects, &method, &target).await;
        };

        let policy_allows = index.enforce_subjects(&subjects, &target.path, &method);

        match EntityKind::from_collection(&target.collection) {
            Some(EntityKind::Organization) => {
                let exists = self
                    .membership
                    .get_organization(entity_id)
                    .await?
                    .is_some_and(|org| org.is_active);
                if !exists {
                    return Ok(Decision::Deny(DenyReason::UnknownEntity));
                }
                if policy_allows {
                    return Ok(Decision::Allow(Grant::Policy));
                }
                let member = self.membership.get_org_member(entity_id, user_id).await?;
                Ok(Decision::Deny(
                    if member.is_some() || index.touches_entity(&subjects, &entity_path) {
                        DenyReason::InsufficientRole
                    } else {
                        DenyReason::NotMember
                    },
                ))
            }
            Some(EntityKind::Group) => {
                let group = match self.membership.get_group(entity_id).await? {
                    Some(group) if group.is_active => group,
                    _ => return Ok(Decision::Deny(DenyReason::UnknownEntity)),
                };
                let access = self.groups.resolve_group_access(&group, user_id).await?;
                if access.is_none() && !index.touches_entity(&subjects, &entity_path) {
                    return Ok(Decision::Deny(DenyReason::NotMember));
                }
                if group.is_expired() && method != "GET" {
                    return Ok(Decision::Deny(DenyReason::Expired));
                }
                if policy_allows {
                    return Ok(Decision::Allow(Grant::Policy));
                }
                match access {
                    GroupAccess::ViaOrgManager(_) if cascade_allows(&method) => {
                        Ok(Decision::Allow(Grant::OrgManagerCascade))
                    }
                    _ => Ok(Decision::Deny(DenyReason::InsufficientRole)),
                }
            }
            Some(EntityKind::Batch) => {
                if self.batches.get_batch(entity_id).await?.is_none() {
                    return Ok(Decision::Deny(DenyReason::UnknownEntity));
                }
                if policy_allows {
                    return Ok(Decision::Allow(Grant::Policy));
                }
                Ok(Decision::Deny(if index.touches_entity(&subjects, &entity_path) {
                    DenyReason::InsufficientRole
                } else {
                    DenyReason::NotMember
                }))
            }
            // 其他带 id 的路径（订阅、计划）只看规则，归属由处理方校验
            None => Ok(if policy_allows {
                Decision::Allow(Grant::Policy)
            } else if index.touches_entity(&subjects, &entity_path) {
                Decision::Deny(DenyReason::InsufficientRole)
            } else {
                Decision::Deny(DenyReason::NotMember)
            }),
        }
    }

    async fn decide_collection(
        &self,
        user_id: &str,
        subjects: &[String],
        method: &str,
        target: &RequestTarget,
    ) -> Result<Decision> {
        let index = self.policies.snapshot();
        if !index.enforce_subjects(subjects, &target.path, method) {
            return Ok(Decision::Deny(DenyReason::InsufficientRole));
        }

        if method == "POST" {
            if let Some(metric) = metered(&target.collection) {
                let check = self.usage.check(user_id, metric, 1).await?;
                if !check.allowed {
                    return Ok(Decision::Deny(DenyReason::QuotaExceeded {
                        metric,
                        current: check.current_usage,
                        limit: check.limit,
                    }));
                }
            }
        }

        if method == "GET" && target.is_collection_root() && EntityKind::from_collection(&target.collection).is_some() {
            let ids = index.entity_ids(subjects, &target.collection);
            return Ok(Decision::Filtered(AccessFilter {
                collection: target.collection.clone(),
                ids,
            }));
        }

        Ok(Decision::Allow(Grant::Policy))
    }

    /// 批量购买资格：管理员、平台角色（令牌或绑定）或订阅带 bulk_purchase 特性
    #[instrument(skip(self, token_roles))]
    pub async fn authorize_bulk_purchase(&self, user_id: &str, token_roles: &[String]) -> Result<Decision> {
        let mut roles = self.policies.roles_for(user_id);
        roles.extend(token_roles.iter().cloned());

        let decision = if roles.iter().any(|r| r == ADMIN_ROLE) {
            Decision::Allow(Grant::Admin)
        } else if roles.iter().any(|r| BULK_PURCHASE_ROLES.contains(&r.as_str())) {
            Decision::Allow(Grant::Role)
        } else if self
            .effective_features(user_id)
            .await?
            .has_feature(BULK_PURCHASE_FEATURE)
        {
            Decision::Allow(Grant::Feature)
        } else {
            Decision::Deny(DenyReason::MissingFeature(BULK_PURCHASE_FEATURE))
        };
        metrics::counter!(AUTHZ_DECISIONS, "outcome" => decision.label()).increment(1);
        Ok(decision)
    }

    /// 汇总用户的个人订阅、分配订阅和所属组织订阅
    #[instrument(skip(self))]
    pub async fn effective_features(&self, user_id: &str) -> Result<FeatureBundle> {
        let mut plans: Vec<SubscriptionPlan> =
            live_with_plans(self.subscriptions.as_ref(), self.plans.as_ref(), user_id)
                .await?
                .into_iter()
                .map(|(_, plan)| plan)
                .collect();

        let orgs = self.membership.list_user_organizations(user_id).await?;
        let org_ids: Vec<Uuid> = orgs.iter().map(|org| org.id).collect();
        let mut contributing = Vec::new();
        let mut covered = HashSet::new();

        for sub in self.subscriptions.list_live_org_subscriptions(&org_ids).await? {
            match self.plans.get_plan(sub.plan_id).await {
                Ok(plan) => {
                    plans.push(plan);
                    if covered.insert(sub.organization_id) {
                        contributing.push(sub.organization_id);
                    }
                }
                Err(AppError::NotFound(_)) => {
                    debug!(org_id = %sub.organization_id, plan_id = %sub.plan_id, "Organization subscription references a missing plan");
                }
                Err(e) => return Err(e),
            }
        }

        // 管理员直接指定给组织的计划
        for org in &orgs {
            let Some(plan_id) = org.subscription_plan_id else {
                continue;
            };
            if covered.contains(&org.id) {
                continue;
            }
            match self.plans.get_plan(plan_id).await {
                Ok(plan) => {
                    plans.push(plan);
                    covered.insert(org.id);
                    contributing.push(org.id);
                }
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut bundle = bundle(user_id, &plans, org_ids);
        bundle.contributing_organizations = contributing;
        Ok(bundle)
    }
}

/// 合并多个计划：特性取并集，上限取大（-1 优先），开关取或
pub fn bundle(user_id: &str, plans: &[SubscriptionPlan], organizations: Vec<Uuid>) -> FeatureBundle {
    let caps = plans
        .iter()
        .map(SubscriptionPlan::caps)
        .reduce(|acc, caps| acc.merge(&caps))
        .unwrap_or_default();
    FeatureBundle {
        user_id: user_id.to_string(),
        plan: highest(plans.iter()).cloned(),
        features: plans
            .iter()
            .flat_map(|plan| plan.features.iter().cloned())
            .collect(),
        caps,
        network_access_enabled: plans.iter().any(|p| p.network_access_enabled),
        data_persistence_enabled: plans.iter().any(|p| p.data_persistence_enabled),
        allowed_machine_sizes: plans
            .iter()
            .flat_map(|plan| plan.allowed_machine_sizes.iter().cloned())
            .collect(),
        organizations,
        contributing_organizations: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_target() {
        let id = Uuid::new_v4();
        let target = RequestTarget::parse(&format!("/groups/{}/members/", id));
        assert_eq!(target.collection, "groups");
        assert_eq!(target.entity_id, Some(id));
        assert_eq!(target.entity_path(), Some(format!("/groups/{}", id)));
        assert!(!target.is_collection_root());
    }

    #[test]
    fn test_parse_collection_target() {
        let target = RequestTarget::parse("/organizations");
        assert!(target.is_collection_root());
        assert_eq!(target.entity_id, None);

        let me = RequestTarget::parse("/users/me/features");
        assert_eq!(me.entity_id, None);
        assert!(!me.is_collection_root());
    }

    #[test]
    fn test_deny_reason_mapping() {
        let err: AppError = DenyReason::NotMember.into();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
        let err: AppError = DenyReason::InsufficientRole.into();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
        let err: AppError = DenyReason::Expired.into();
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
        let err: AppError = DenyReason::QuotaExceeded {
            metric: MetricType::ConcurrentTerminals,
            current: 1,
            limit: 1,
        }
        .into();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
    }

    #[test]
    fn test_cascade_methods() {
        assert!(cascade_allows("GET"));
        assert!(cascade_allows("PATCH"));
        assert!(!cascade_allows("DELETE"));
    }
}
