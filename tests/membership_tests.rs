//! 组织与群组成员关系测试

mod common;

use common::{actor, admin, TestApp};
use entitlement_core::{
    error::AppError,
    models::{
        group::{CreateGroupRequest, GroupRole},
        organization::{CreateOrganizationRequest, OrganizationRole, UpdateOrganizationRequest},
        Page,
    },
    services::permission_service::{org_member_role, org_owner_role},
};
use uuid::Uuid;

fn org_request(name: &str, max_groups: Option<i32>, max_members: Option<i32>) -> CreateOrganizationRequest {
    CreateOrganizationRequest {
        name: name.to_string(),
        display_name: None,
        description: None,
        max_groups,
        max_members,
        metadata: None,
    }
}

fn group_request(name: &str, organization_id: Option<Uuid>, parent_group_id: Option<Uuid>) -> CreateGroupRequest {
    CreateGroupRequest {
        name: name.to_string(),
        display_name: None,
        description: None,
        organization_id,
        parent_group_id,
        max_members: None,
        expires_at: None,
        metadata: None,
    }
}

#[tokio::test]
async fn test_organization_member_cap() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("owner");
    let org = orgs
        .create_organization(&owner, org_request("capped", None, Some(2)))
        .await
        .unwrap();

    orgs.add_member(org.id, &owner, "u2", OrganizationRole::Member)
        .await
        .unwrap();
    let result = orgs.add_member(org.id, &owner, "u3", OrganizationRole::Member).await;
    assert!(matches!(result, Err(AppError::LimitReached(_))));

    // 缩容不能低于当前成员数
    let result = orgs
        .update_organization(
            org.id,
            &owner,
            UpdateOrganizationRequest {
                max_members: Some(1),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_duplicate_member_and_owner_role() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("owner");
    let org = orgs
        .create_organization(&owner, org_request("acme", None, None))
        .await
        .unwrap();

    orgs.add_member(org.id, &owner, "u2", OrganizationRole::Member)
        .await
        .unwrap();
    let result = orgs.add_member(org.id, &owner, "u2", OrganizationRole::Manager).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let result = orgs.add_member(org.id, &owner, "u3", OrganizationRole::Owner).await;
    assert!(matches!(result, Err(AppError::InvalidRole(_))));

    let result = orgs
        .update_member_role(org.id, &owner, "owner", OrganizationRole::Member)
        .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    let result = orgs.remove_member(org.id, &owner, "owner").await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    let promoted = orgs
        .update_member_role(org.id, &owner, "u2", OrganizationRole::Manager)
        .await
        .unwrap();
    assert_eq!(promoted.role, OrganizationRole::Manager);
}

#[tokio::test]
async fn test_members_cannot_manage_membership() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("owner");
    let org = orgs
        .create_organization(&owner, org_request("acme", None, None))
        .await
        .unwrap();
    orgs.add_member(org.id, &owner, "u2", OrganizationRole::Member)
        .await
        .unwrap();

    let result = orgs
        .add_member(org.id, &actor("u2"), "u3", OrganizationRole::Member)
        .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    let result = orgs
        .add_member(org.id, &actor("stranger"), "u3", OrganizationRole::Member)
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));

    // 成员可以自行退出
    orgs.remove_member(org.id, &actor("u2"), "u2").await.unwrap();
    assert!(orgs.get_member(org.id, "u2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_personal_org_is_unique_and_protected() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;

    let (first, second) = tokio::join!(orgs.create_personal_org("u1"), orgs.create_personal_org("u1"));
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.is_personal);

    let owned: Vec<_> = orgs
        .list_user_organizations("u1")
        .await
        .unwrap()
        .into_iter()
        .filter(|org| org.is_personal)
        .collect();
    assert_eq!(owned.len(), 1);

    let result = orgs.delete_organization(first.id, &actor("u1")).await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));
}

#[tokio::test]
async fn test_paginated_member_listing() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("owner");
    let org = orgs
        .create_organization(&owner, org_request("big", None, None))
        .await
        .unwrap();
    for user in ["u2", "u3", "u4", "u5"] {
        orgs.add_member(org.id, &owner, user, OrganizationRole::Member)
            .await
            .unwrap();
    }

    let first = orgs.list_members(org.id, Page::first(2)).await.unwrap();
    assert_eq!(first.len(), 2);

    // 内部按配置页大小 (2) 读取全部成员
    let mut all = orgs.all_member_ids(org.id).await.unwrap();
    all.sort();
    assert_eq!(all, vec!["owner", "u2", "u3", "u4", "u5"]);
}

#[tokio::test]
async fn test_org_deletion_revokes_grants() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("owner");
    let org = orgs
        .create_organization(&owner, org_request("doomed", None, None))
        .await
        .unwrap();
    orgs.add_member(org.id, &owner, "u2", OrganizationRole::Member)
        .await
        .unwrap();

    let policies = app.state.permission_service.store();
    assert!(policies.roles_for("u2").contains(&org_member_role(org.id)));

    let result = orgs.delete_organization(org.id, &actor("u2")).await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    orgs.delete_organization(org.id, &owner).await.unwrap();
    assert!(!policies.roles_for("u2").contains(&org_member_role(org.id)));
    assert!(!policies.roles_for("owner").contains(&org_owner_role(org.id)));
    assert!(matches!(orgs.get_organization(org.id).await, Err(AppError::NotFound(_))));

    let path = format!("/organizations/{}", org.id);
    let decision = app.state.resolver.authorize("u2", &[], "GET", &path).await.unwrap();
    assert!(!decision.is_allowed());
}

#[tokio::test]
async fn test_org_group_cap() {
    let app = TestApp::new().await;
    let owner = actor("owner");
    let org = app
        .state
        .organization_service
        .create_organization(&owner, org_request("small", Some(1), None))
        .await
        .unwrap();
    let groups = &app.state.group_service;

    groups
        .create_group(&owner, group_request("first", Some(org.id), None))
        .await
        .unwrap();
    let result = groups
        .create_group(&owner, group_request("second", Some(org.id), None))
        .await;
    assert!(matches!(result, Err(AppError::LimitReached(_))));

    // 系统管理员同样受上限约束
    let result = groups
        .create_group(&admin("root"), group_request("third", Some(org.id), None))
        .await;
    assert!(matches!(result, Err(AppError::LimitReached(_))));
}

#[tokio::test]
async fn test_group_nesting_rejects_cycles() {
    let app = TestApp::new().await;
    let owner = actor("owner");
    let groups = &app.state.group_service;

    let a = groups.create_group(&owner, group_request("a", None, None)).await.unwrap();
    let b = groups
        .create_group(&owner, group_request("b", None, Some(a.id)))
        .await
        .unwrap();
    let c = groups
        .create_group(&owner, group_request("c", None, Some(b.id)))
        .await
        .unwrap();

    let result = groups.set_parent(a.id, &owner, Some(c.id)).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    let result = groups.set_parent(a.id, &owner, Some(a.id)).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let detached = groups.set_parent(c.id, &owner, None).await.unwrap();
    assert!(detached.parent_group_id.is_none());
    let moved = groups.set_parent(a.id, &owner, Some(c.id)).await.unwrap();
    assert_eq!(moved.parent_group_id, Some(c.id));
}

#[tokio::test]
async fn test_parent_must_share_organization() {
    let app = TestApp::new().await;
    let owner = actor("owner");
    let org = app
        .state
        .organization_service
        .create_organization(&owner, org_request("acme", None, None))
        .await
        .unwrap();
    let groups = &app.state.group_service;

    let loose = groups.create_group(&owner, group_request("loose", None, None)).await.unwrap();
    let result = groups
        .create_group(&owner, group_request("inner", Some(org.id), Some(loose.id)))
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_group_member_roles() {
    let app = TestApp::new().await;
    let owner = actor("owner");
    let groups = &app.state.group_service;
    let group = groups.create_group(&owner, group_request("lab", None, None)).await.unwrap();

    groups
        .add_member(group.id, &owner, "assistant", GroupRole::Assistant)
        .await
        .unwrap();
    let result = groups
        .add_member(group.id, &actor("assistant"), "u3", GroupRole::Member)
        .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    groups
        .update_member_role(group.id, &owner, "assistant", GroupRole::Admin)
        .await
        .unwrap();
    groups
        .add_member(group.id, &actor("assistant"), "u3", GroupRole::Member)
        .await
        .unwrap();

    let result = groups.delete_group(group.id, &actor("assistant")).await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));
    groups.delete_group(group.id, &owner).await.unwrap();
    assert!(matches!(groups.get_group(group.id).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_expired_group_is_read_only() {
    let app = TestApp::new().await;
    let owner = actor("owner");
    let groups = &app.state.group_service;
    let mut request = group_request("past", None, None);
    request.expires_at = Some(chrono::Utc::now() - chrono::Duration::days(1));
    let group = groups.create_group(&owner, request).await.unwrap();

    let result = groups.add_member(group.id, &owner, "u2", GroupRole::Member).await;
    assert!(matches!(result, Err(AppError::State(_))));

    let members = groups.list_members(group.id, Page::first(10)).await.unwrap();
    assert_eq!(members.len(), 1);
}
