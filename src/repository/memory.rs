//! In-memory store
//!
//! 实现全部存储 trait，单个互斥锁保护全部状态，复合写入天然原子。
//! 用于测试和无数据库的本地运行。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    BatchRepository, MemberInsert, MembershipRepository, PlanRepository, PolicyRepository,
    SubscriptionRepository, UsageRepository,
};
use crate::{
    error::{AppError, Result},
    models::{
        batch::{BatchStatus, LicenseSeat, SeatOutcome, SeatRelease, SeatStatus, SubscriptionBatch},
        group::{Group, GroupMember, GroupRole},
        organization::{Organization, OrganizationMember, OrganizationRole},
        plan::SubscriptionPlan,
        policy::{GroupingRule, PolicyRule},
        subscription::{OrganizationSubscription, PlanChange, SubscriptionStatus, UserSubscription},
        usage::{IncrementOutcome, MetricType, UsageMetric},
        within_cap, Page,
    },
};

#[derive(Default)]
struct State {
    policies: BTreeSet<PolicyRule>,
    groupings: BTreeSet<GroupingRule>,
    plans: HashMap<Uuid, SubscriptionPlan>,
    organizations: HashMap<Uuid, Organization>,
    org_members: Vec<OrganizationMember>,
    groups: HashMap<Uuid, Group>,
    group_members: Vec<GroupMember>,
    user_subscriptions: HashMap<Uuid, UserSubscription>,
    org_subscriptions: HashMap<Uuid, OrganizationSubscription>,
    webhook_events: HashSet<String>,
    batches: HashMap<Uuid, SubscriptionBatch>,
    seats: HashMap<Uuid, LicenseSeat>,
    usage: HashMap<(String, MetricType), UsageMetric>,
}

impl State {
    fn write_limits(&mut self, user_id: &str, limits: &[(MetricType, i64)]) {
        let now = Utc::now();
        for (metric, limit) in limits {
            let row = self
                .usage
                .entry((user_id.to_string(), *metric))
                .or_insert_with(|| UsageMetric::new(user_id, *metric, *limit));
            row.limit_value = *limit;
            row.updated_at = now;
        }
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_policy_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AppError::internal_error("memory store lock poisoned"))
    }

    /// 让后续的权限规则写入失败（模拟持久化故障）
    pub fn fail_policy_writes(&self, fail: bool) {
        self.fail_policy_writes.store(fail, Ordering::SeqCst);
    }

    fn check_policy_write(&self) -> Result<()> {
        if self.fail_policy_writes.load(Ordering::SeqCst) {
            return Err(AppError::internal_error("policy persistence unavailable"));
        }
        Ok(())
    }
}

fn page_of<T: Clone>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

#[async_trait]
impl PolicyRepository for MemoryStore {
    async fn load_all(&self) -> Result<(Vec<PolicyRule>, Vec<GroupingRule>)> {
        let state = self.state()?;
        Ok((
            state.policies.iter().cloned().collect(),
            state.groupings.iter().cloned().collect(),
        ))
    }

    async fn insert_policy(&self, rule: &PolicyRule) -> Result<bool> {
        self.check_policy_write()?;
        Ok(self.state()?.policies.insert(rule.clone()))
    }

    async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool> {
        self.check_policy_write()?;
        Ok(self.state()?.policies.remove(rule))
    }

    async fn delete_policies_where(&self, field_index: usize, values: &[String]) -> Result<Vec<PolicyRule>> {
        self.check_policy_write()?;
        let mut state = self.state()?;
        let removed: Vec<PolicyRule> = state
            .policies
            .iter()
            .filter(|rule| rule.matches_filter(field_index, values))
            .cloned()
            .collect();
        for rule in &removed {
            state.policies.remove(rule);
        }
        Ok(removed)
    }

    async fn insert_grouping(&self, rule: &GroupingRule) -> Result<bool> {
        self.check_policy_write()?;
        Ok(self.state()?.groupings.insert(rule.clone()))
    }

    async fn delete_grouping(&self, rule: &GroupingRule) -> Result<bool> {
        self.check_policy_write()?;
        Ok(self.state()?.groupings.remove(rule))
    }

    async fn delete_groupings_where(&self, field_index: usize, values: &[String]) -> Result<Vec<GroupingRule>> {
        self.check_policy_write()?;
        let mut state = self.state()?;
        let removed: Vec<GroupingRule> = state
            .groupings
            .iter()
            .filter(|rule| rule.matches_filter(field_index, values))
            .cloned()
            .collect();
        for rule in &removed {
            state.groupings.remove(rule);
        }
        Ok(removed)
    }
}

#[async_trait]
impl PlanRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<SubscriptionPlan>> {
        Ok(self.state()?.plans.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>> {
        Ok(self
            .state()?
            .plans
            .values()
            .find(|plan| plan.name == name && plan.is_active)
            .cloned())
    }

    async fn list(&self, active_only: bool) -> Result<Vec<SubscriptionPlan>> {
        let mut plans: Vec<SubscriptionPlan> = self
            .state()?
            .plans
            .values()
            .filter(|plan| !active_only || plan.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(plans)
    }

    async fn upsert(&self, plan: &SubscriptionPlan) -> Result<()> {
        self.state()?.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let mut state = self.state()?;
        match state.plans.get_mut(&id) {
            Some(plan) => {
                plan.is_active = active;
                plan.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl MembershipRepository for MemoryStore {
    async fn insert_organization(&self, org: &Organization, owner: &OrganizationMember) -> Result<()> {
        let mut state = self.state()?;
        state.organizations.insert(org.id, org.clone());
        state.org_members.push(owner.clone());
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self
            .state()?
            .organizations
            .get(&id)
            .filter(|org| org.is_active)
            .cloned())
    }

    async fn find_personal_organization(&self, user_id: &str) -> Result<Option<Organization>> {
        Ok(self
            .state()?
            .organizations
            .values()
            .find(|org| org.is_active && org.is_personal && org.owner_user_id == user_id)
            .cloned())
    }

    async fn find_organization_by_name(&self, owner_user_id: &str, name: &str) -> Result<Option<Organization>> {
        Ok(self
            .state()?
            .organizations
            .values()
            .find(|org| org.is_active && org.owner_user_id == owner_user_id && org.name == name)
            .cloned())
    }

    async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>> {
        let state = self.state()?;
        let mut orgs: Vec<Organization> = state
            .org_members
            .iter()
            .filter(|m| m.is_active && m.user_id == user_id)
            .filter_map(|m| state.organizations.get(&m.organization_id))
            .filter(|org| org.is_active)
            .cloned()
            .collect();
        orgs.sort_by_key(|org| org.created_at);
        Ok(orgs)
    }

    async fn update_organization(&self, org: &Organization) -> Result<()> {
        let mut state = self.state()?;
        if let Some(existing) = state.organizations.get_mut(&org.id) {
            existing.display_name = org.display_name.clone();
            existing.description = org.description.clone();
            existing.max_groups = org.max_groups;
            existing.max_members = org.max_members;
            existing.metadata = org.metadata.clone();
            existing.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_organization_plan(&self, id: Uuid, plan_id: Option<Uuid>) -> Result<()> {
        if let Some(org) = self.state()?.organizations.get_mut(&id) {
            org.subscription_plan_id = plan_id;
            org.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn soft_delete_organization(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state()?;
        match state.organizations.get_mut(&id) {
            Some(org) if org.is_active => {
                org.is_active = false;
                org.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_org_member(&self, org_id: Uuid, user_id: &str) -> Result<Option<OrganizationMember>> {
        Ok(self
            .state()?
            .org_members
            .iter()
            .find(|m| m.is_active && m.organization_id == org_id && m.user_id == user_id)
            .cloned())
    }

    async fn list_org_members(&self, org_id: Uuid, page: Page) -> Result<Vec<OrganizationMember>> {
        let mut members: Vec<OrganizationMember> = self
            .state()?
            .org_members
            .iter()
            .filter(|m| m.is_active && m.organization_id == org_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(page_of(members, page))
    }

    async fn count_org_members(&self, org_id: Uuid) -> Result<i64> {
        Ok(self
            .state()?
            .org_members
            .iter()
            .filter(|m| m.is_active && m.organization_id == org_id)
            .count() as i64)
    }

    async fn insert_org_member(
        &self,
        member: &OrganizationMember,
        max_members: i32,
    ) -> Result<MemberInsert<OrganizationMember>> {
        let mut state = self.state()?;
        let existing = state
            .org_members
            .iter()
            .position(|m| m.organization_id == member.organization_id && m.user_id == member.user_id);
        if let Some(index) = existing {
            if state.org_members[index].is_active {
                return Ok(MemberInsert::AlreadyMember);
            }
        }

        let count = state
            .org_members
            .iter()
            .filter(|m| m.is_active && m.organization_id == member.organization_id)
            .count() as i64;
        if !within_cap(max_members, count) {
            return Ok(MemberInsert::CapacityReached);
        }

        match existing {
            Some(index) => {
                let row = &mut state.org_members[index];
                row.role = member.role;
                row.joined_at = member.joined_at;
                row.invited_by = member.invited_by.clone();
                row.is_active = true;
                row.updated_at = Utc::now();
                Ok(MemberInsert::Inserted(row.clone()))
            }
            None => {
                state.org_members.push(member.clone());
                Ok(MemberInsert::Inserted(member.clone()))
            }
        }
    }

    async fn update_org_member_role(&self, org_id: Uuid, user_id: &str, role: OrganizationRole) -> Result<bool> {
        let mut state = self.state()?;
        match state
            .org_members
            .iter_mut()
            .find(|m| m.is_active && m.organization_id == org_id && m.user_id == user_id)
        {
            Some(member) => {
                member.role = role;
                member.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate_org_member(&self, org_id: Uuid, user_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        match state
            .org_members
            .iter_mut()
            .find(|m| m.is_active && m.organization_id == org_id && m.user_id == user_id)
        {
            Some(member) => {
                member.is_active = false;
                member.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_group(&self, group: &Group, owner: &GroupMember) -> Result<()> {
        let mut state = self.state()?;
        state.groups.insert(group.id, group.clone());
        state.group_members.push(owner.clone());
        Ok(())
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        Ok(self.state()?.groups.get(&id).filter(|g| g.is_active).cloned())
    }

    async fn find_group_by_name(&self, owner_user_id: &str, name: &str) -> Result<Option<Group>> {
        Ok(self
            .state()?
            .groups
            .values()
            .find(|g| g.is_active && g.owner_user_id == owner_user_id && g.name == name)
            .cloned())
    }

    async fn list_user_groups(&self, user_id: &str) -> Result<Vec<Group>> {
        let state = self.state()?;
        let mut groups: Vec<Group> = state
            .group_members
            .iter()
            .filter(|m| m.is_active && m.user_id == user_id)
            .filter_map(|m| state.groups.get(&m.group_id))
            .filter(|g| g.is_active)
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn list_org_groups(&self, org_id: Uuid) -> Result<Vec<Group>> {
        let mut groups: Vec<Group> = self
            .state()?
            .groups
            .values()
            .filter(|g| g.is_active && g.organization_id == Some(org_id))
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn count_org_groups(&self, org_id: Uuid) -> Result<i64> {
        Ok(self
            .state()?
            .groups
            .values()
            .filter(|g| g.is_active && g.organization_id == Some(org_id))
            .count() as i64)
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let mut state = self.state()?;
        if let Some(existing) = state.groups.get_mut(&group.id) {
            existing.display_name = group.display_name.clone();
            existing.description = group.description.clone();
            existing.max_members = group.max_members;
            existing.expires_at = group.expires_at;
            existing.parent_group_id = group.parent_group_id;
            existing.metadata = group.metadata.clone();
            existing.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn soft_delete_group(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state()?;
        match state.groups.get_mut(&id) {
            Some(group) if group.is_active => {
                group.is_active = false;
                group.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_group_member(&self, group_id: Uuid, user_id: &str) -> Result<Option<GroupMember>> {
        Ok(self
            .state()?
            .group_members
            .iter()
            .find(|m| m.is_active && m.group_id == group_id && m.user_id == user_id)
            .cloned())
    }

    async fn list_group_members(&self, group_id: Uuid, page: Page) -> Result<Vec<GroupMember>> {
        let mut members: Vec<GroupMember> = self
            .state()?
            .group_members
            .iter()
            .filter(|m| m.is_active && m.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(page_of(members, page))
    }

    async fn insert_group_member(
        &self,
        member: &GroupMember,
        max_members: i32,
    ) -> Result<MemberInsert<GroupMember>> {
        let mut state = self.state()?;
        let existing = state
            .group_members
            .iter()
            .position(|m| m.group_id == member.group_id && m.user_id == member.user_id);
        if let Some(index) = existing {
            if state.group_members[index].is_active {
                return Ok(MemberInsert::AlreadyMember);
            }
        }

        let count = state
            .group_members
            .iter()
            .filter(|m| m.is_active && m.group_id == member.group_id)
            .count() as i64;
        if !within_cap(max_members, count) {
            return Ok(MemberInsert::CapacityReached);
        }

        match existing {
            Some(index) => {
                let row = &mut state.group_members[index];
                row.role = member.role;
                row.joined_at = member.joined_at;
                row.invited_by = member.invited_by.clone();
                row.is_active = true;
                row.updated_at = Utc::now();
                Ok(MemberInsert::Inserted(row.clone()))
            }
            None => {
                state.group_members.push(member.clone());
                Ok(MemberInsert::Inserted(member.clone()))
            }
        }
    }

    async fn update_group_member_role(&self, group_id: Uuid, user_id: &str, role: GroupRole) -> Result<bool> {
        let mut state = self.state()?;
        match state
            .group_members
            .iter_mut()
            .find(|m| m.is_active && m.group_id == group_id && m.user_id == user_id)
        {
            Some(member) => {
                member.role = role;
                member.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate_group_member(&self, group_id: Uuid, user_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        match state
            .group_members
            .iter_mut()
            .find(|m| m.is_active && m.group_id == group_id && m.user_id == user_id)
        {
            Some(member) => {
                member.is_active = false;
                member.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn insert_user_subscription(&self, sub: &UserSubscription) -> Result<()> {
        self.state()?.user_subscriptions.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn get_user_subscription(&self, id: Uuid) -> Result<Option<UserSubscription>> {
        Ok(self.state()?.user_subscriptions.get(&id).cloned())
    }

    async fn list_user_subscriptions(&self, user_id: &str, live_only: bool) -> Result<Vec<UserSubscription>> {
        let mut subs: Vec<UserSubscription> = self
            .state()?
            .user_subscriptions
            .values()
            .filter(|s| s.user_id == user_id && (!live_only || s.is_live()))
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn list_batch_subscriptions(&self, batch_id: Uuid) -> Result<Vec<UserSubscription>> {
        let mut subs: Vec<UserSubscription> = self
            .state()?
            .user_subscriptions
            .values()
            .filter(|s| s.batch_id == Some(batch_id))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn find_user_subscription_by_provider_id(&self, provider_id: &str) -> Result<Option<UserSubscription>> {
        Ok(self
            .state()?
            .user_subscriptions
            .values()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_id))
            .cloned())
    }

    async fn update_user_subscription(&self, sub: &UserSubscription) -> Result<()> {
        let mut updated = sub.clone();
        updated.updated_at = Utc::now();
        self.state()?.user_subscriptions.insert(sub.id, updated);
        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        expected: SubscriptionStatus,
        new_status: SubscriptionStatus,
    ) -> Result<bool> {
        let mut state = self.state()?;
        match state.user_subscriptions.get_mut(&id) {
            Some(sub) if sub.status == expected => {
                let now = Utc::now();
                sub.status = new_status;
                if new_status == SubscriptionStatus::Cancelled {
                    sub.cancelled_at = Some(now);
                }
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_plan_change(&self, change: &PlanChange) -> Result<bool> {
        let mut state = self.state()?;
        match state.user_subscriptions.get_mut(&change.subscription_id) {
            Some(sub)
                if sub.plan_id == change.expected_plan_id && sub.status == change.expected_status =>
            {
                sub.plan_id = change.new_plan_id;
                sub.status = change.new_status;
                sub.cancel_at_period_end = false;
                let (rebind, provider_subscription_id, provider_customer_id) =
                    change.provider.columns();
                if rebind {
                    sub.provider_subscription_id = provider_subscription_id.map(str::to_string);
                    if let Some(customer_id) = provider_customer_id {
                        sub.provider_customer_id = Some(customer_id.to_string());
                    }
                }
                if let Some((start, end)) = change.period {
                    sub.current_period_start = start;
                    sub.current_period_end = end;
                }
                sub.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        state.write_limits(&change.user_id, &change.limits);
        Ok(true)
    }

    async fn insert_org_subscription(&self, sub: &OrganizationSubscription) -> Result<()> {
        self.state()?.org_subscriptions.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn get_org_subscription(&self, id: Uuid) -> Result<Option<OrganizationSubscription>> {
        Ok(self.state()?.org_subscriptions.get(&id).cloned())
    }

    async fn get_live_org_subscription(&self, org_id: Uuid) -> Result<Option<OrganizationSubscription>> {
        Ok(self
            .state()?
            .org_subscriptions
            .values()
            .filter(|s| s.organization_id == org_id && s.status.is_live())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn list_live_org_subscriptions(&self, org_ids: &[Uuid]) -> Result<Vec<OrganizationSubscription>> {
        let mut subs: Vec<OrganizationSubscription> = self
            .state()?
            .org_subscriptions
            .values()
            .filter(|s| org_ids.contains(&s.organization_id) && s.status.is_live())
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn find_org_subscription_by_provider_id(&self, provider_id: &str) -> Result<Option<OrganizationSubscription>> {
        Ok(self
            .state()?
            .org_subscriptions
            .values()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_id))
            .cloned())
    }

    async fn update_org_subscription(&self, sub: &OrganizationSubscription) -> Result<()> {
        let mut updated = sub.clone();
        updated.updated_at = Utc::now();
        self.state()?.org_subscriptions.insert(sub.id, updated);
        Ok(())
    }

    async fn record_webhook_event(&self, event_id: &str, _event_type: &str) -> Result<bool> {
        Ok(self.state()?.webhook_events.insert(event_id.to_string()))
    }

    async fn forget_webhook_event(&self, event_id: &str) -> Result<()> {
        self.state()?.webhook_events.remove(event_id);
        Ok(())
    }
}

#[async_trait]
impl BatchRepository for MemoryStore {
    async fn insert_batch(&self, batch: &SubscriptionBatch, seats: &[LicenseSeat]) -> Result<()> {
        let mut state = self.state()?;
        state.batches.insert(batch.id, batch.clone());
        for seat in seats {
            state.seats.insert(seat.id, seat.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<SubscriptionBatch>> {
        Ok(self.state()?.batches.get(&id).cloned())
    }

    async fn list_by_purchaser(&self, user_id: &str) -> Result<Vec<SubscriptionBatch>> {
        let mut batches: Vec<SubscriptionBatch> = self
            .state()?
            .batches
            .values()
            .filter(|b| b.purchaser_user_id == user_id)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn list_by_group(&self, group_id: Uuid) -> Result<Vec<SubscriptionBatch>> {
        let mut batches: Vec<SubscriptionBatch> = self
            .state()?
            .batches
            .values()
            .filter(|b| b.group_id == Some(group_id))
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    async fn find_by_provider_id(&self, provider_id: &str) -> Result<Option<SubscriptionBatch>> {
        Ok(self
            .state()?
            .batches
            .values()
            .find(|b| b.provider_subscription_id.as_deref() == Some(provider_id))
            .cloned())
    }

    async fn list_seats(&self, batch_id: Uuid) -> Result<Vec<LicenseSeat>> {
        let mut seats: Vec<LicenseSeat> = self
            .state()?
            .seats
            .values()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect();
        seats.sort_by_key(|s| (s.status != SeatStatus::Assigned, s.created_at));
        Ok(seats)
    }

    async fn get_seat(&self, seat_id: Uuid) -> Result<Option<LicenseSeat>> {
        Ok(self.state()?.seats.get(&seat_id).cloned())
    }

    async fn assign_seat(&self, batch_id: Uuid, subscription: &UserSubscription) -> Result<SeatOutcome> {
        let mut state = self.state()?;
        let batch = state
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("subscription batch"))?;

        if !batch.is_active() {
            return Ok(SeatOutcome::BatchInactive);
        }
        let already = state.seats.values().any(|s| {
            s.batch_id == batch_id
                && s.status == SeatStatus::Assigned
                && s.assignee_user_id.as_deref() == Some(subscription.user_id.as_str())
        });
        if already {
            return Ok(SeatOutcome::AlreadyAssigned);
        }
        if batch.pool() <= 0 {
            return Ok(SeatOutcome::PoolExhausted);
        }

        let seat_id = state
            .seats
            .values()
            .filter(|s| s.batch_id == batch_id && s.status == SeatStatus::Unassigned)
            .min_by_key(|s| s.created_at)
            .map(|s| s.id);
        let Some(seat_id) = seat_id else {
            return Ok(SeatOutcome::PoolExhausted);
        };

        let now = Utc::now();
        let mut sub = subscription.clone();
        sub.current_period_start = batch.current_period_start;
        sub.current_period_end = batch.current_period_end;
        state.user_subscriptions.insert(sub.id, sub);

        let seat = match state.seats.get_mut(&seat_id) {
            Some(seat) => {
                seat.status = SeatStatus::Assigned;
                seat.subscription_id = Some(subscription.id);
                seat.assignee_user_id = Some(subscription.user_id.clone());
                seat.assigned_at = Some(now);
                seat.updated_at = now;
                seat.clone()
            }
            None => return Ok(SeatOutcome::PoolExhausted),
        };

        let batch = match state.batches.get_mut(&batch_id) {
            Some(batch) => {
                batch.assigned_quantity += 1;
                batch.updated_at = now;
                batch.clone()
            }
            None => return Err(AppError::not_found("subscription batch")),
        };

        Ok(SeatOutcome::Assigned { batch, seat })
    }

    async fn release_seat(&self, seat_id: Uuid) -> Result<SeatRelease> {
        let mut state = self.state()?;
        let seat = state
            .seats
            .get(&seat_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("license seat"))?;

        let Some(subscription_id) = seat.subscription_id else {
            return Ok(SeatRelease::NotAssigned);
        };

        let now = Utc::now();
        let subscription = match state.user_subscriptions.get_mut(&subscription_id) {
            Some(sub) => {
                sub.status = SubscriptionStatus::Cancelled;
                sub.cancelled_at = Some(now);
                sub.updated_at = now;
                sub.clone()
            }
            None => return Err(AppError::not_found("subscription")),
        };

        if let Some(seat) = state.seats.get_mut(&seat_id) {
            seat.status = SeatStatus::Unassigned;
            seat.subscription_id = None;
            seat.assignee_user_id = None;
            seat.assigned_at = None;
            seat.updated_at = now;
        }

        let batch = match state.batches.get_mut(&seat.batch_id) {
            Some(batch) => {
                batch.assigned_quantity = (batch.assigned_quantity - 1).max(0);
                batch.updated_at = now;
                batch.clone()
            }
            None => return Err(AppError::not_found("subscription batch")),
        };

        Ok(SeatRelease::Released { batch, subscription })
    }

    async fn resize(&self, batch_id: Uuid, expected_total: i32, new_total: i32) -> Result<bool> {
        let mut state = self.state()?;
        match state.batches.get_mut(&batch_id) {
            Some(batch)
                if batch.total_quantity == expected_total && batch.assigned_quantity <= new_total =>
            {
                batch.total_quantity = new_total;
                batch.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }

        if new_total > expected_total {
            for _ in 0..new_total - expected_total {
                let seat = LicenseSeat::unassigned(batch_id);
                state.seats.insert(seat.id, seat);
            }
        } else {
            let mut free: Vec<(DateTime<Utc>, Uuid)> = state
                .seats
                .values()
                .filter(|s| s.batch_id == batch_id && s.status == SeatStatus::Unassigned)
                .map(|s| (s.created_at, s.id))
                .collect();
            free.sort();
            free.reverse();
            for (_, id) in free.into_iter().take((expected_total - new_total) as usize) {
                state.seats.remove(&id);
            }
        }
        Ok(true)
    }

    async fn update_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<()> {
        if let Some(batch) = self.state()?.batches.get_mut(&batch_id) {
            let now = Utc::now();
            batch.status = status;
            if status == BatchStatus::Cancelled {
                batch.cancelled_at = Some(now);
            }
            batch.updated_at = now;
        }
        Ok(())
    }

    async fn update_period(&self, batch_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        if let Some(batch) = self.state()?.batches.get_mut(&batch_id) {
            batch.current_period_start = start;
            batch.current_period_end = end;
            batch.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_batch(&self, batch_id: Uuid) -> Result<bool> {
        let mut state = self.state()?;
        match state.batches.get(&batch_id) {
            Some(batch) if batch.assigned_quantity == 0 => {
                state.batches.remove(&batch_id);
                state.seats.retain(|_, seat| seat.batch_id != batch_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn get(&self, user_id: &str, metric: MetricType) -> Result<Option<UsageMetric>> {
        Ok(self
            .state()?
            .usage
            .get(&(user_id.to_string(), metric))
            .cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<UsageMetric>> {
        let mut rows: Vec<UsageMetric> = self
            .state()?
            .usage
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.metric_type.as_str());
        Ok(rows)
    }

    async fn try_increment(
        &self,
        user_id: &str,
        metric: MetricType,
        delta: i64,
        default_limit: i64,
    ) -> Result<IncrementOutcome> {
        let mut state = self.state()?;
        let row = state
            .usage
            .entry((user_id.to_string(), metric))
            .or_insert_with(|| UsageMetric::new(user_id, metric, default_limit));

        if !row.admits(delta) {
            return Ok(IncrementOutcome::Rejected(row.clone()));
        }
        row.current_value = (row.current_value + delta).max(0);
        row.updated_at = Utc::now();
        Ok(IncrementOutcome::Applied(row.clone()))
    }

    async fn set_limits(&self, user_id: &str, limits: &[(MetricType, i64)]) -> Result<()> {
        self.state()?.write_limits(user_id, limits);
        Ok(())
    }

    async fn reset_period(
        &self,
        user_id: &str,
        metrics: &[MetricType],
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut reset = 0;
        for metric in metrics {
            if let Some(row) = state.usage.get_mut(&(user_id.to_string(), *metric)) {
                row.current_value = 0;
                row.period_start = period_start;
                row.period_end = period_end;
                row.last_reset = Some(now);
                row.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
