//! 端到端场景测试

mod common;

use axum::http::StatusCode;
use common::{actor, plan_request, TestApp};
use entitlement_core::{
    error::AppError,
    models::{
        batch::BulkPurchaseRequest,
        group::CreateGroupRequest,
        organization::{CreateOrganizationRequest, OrganizationRole},
        subscription::{ProrationBehavior, SubscriptionStatus, SubscriptionType},
        usage::MetricType,
    },
    providers::{ProviderError, UserRecord},
    services::{
        entitlement_resolver::{Decision, DenyReason, Grant},
        subscription_service::CheckoutUrls,
    },
};
use serde_json::json;

fn org_request(name: &str) -> CreateOrganizationRequest {
    CreateOrganizationRequest {
        name: name.to_string(),
        display_name: None,
        description: None,
        max_groups: None,
        max_members: None,
        metadata: None,
    }
}

fn group_request(name: &str, organization_id: Option<uuid::Uuid>) -> CreateGroupRequest {
    CreateGroupRequest {
        name: name.to_string(),
        display_name: None,
        description: None,
        organization_id,
        parent_group_id: None,
        max_members: None,
        expires_at: None,
        metadata: None,
    }
}

#[tokio::test]
async fn test_free_plan_signup() {
    let app = TestApp::new().await;
    let trial = app.trial_plan().await;
    let token = app.token("u1", &[]);

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/user-subscriptions/checkout",
            Some(&token),
            Some(json!({ "plan_id": trial.id })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "activated");
    assert_eq!(body["subscription"]["status"], "active");

    let (sub, plan) = app
        .state
        .subscription_service
        .get_primary_user_subscription("u1")
        .await
        .unwrap()
        .expect("primary subscription");
    assert_eq!(plan.id, trial.id);
    assert_eq!(sub.status, SubscriptionStatus::Active);

    let metrics = app.state.usage_service.list("u1").await.unwrap();
    for metric in metrics {
        assert_eq!(metric.limit_value, trial.cap_for(metric.metric_type));
    }
    let check = app
        .state
        .usage_service
        .check("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();
    assert!(check.allowed);
    assert_eq!(check.limit, 1);
}

#[tokio::test]
async fn test_personal_org_bootstrap() {
    let app = TestApp::new().await;
    let user = UserRecord {
        id: "u1".to_string(),
        email: "u1@example.com".to_string(),
        name: "User One".to_string(),
    };

    let report = app.state.onboarding_service.on_user_created(&user).await.unwrap();
    assert!(report.organization.is_personal);
    assert!(report.seat_provisioned);
    assert_eq!(app.provisioner.provisioned(), vec!["u1".to_string()]);

    // 重复通知不会产生第二个个人组织
    let again = app.state.onboarding_service.on_user_created(&user).await.unwrap();
    assert_eq!(again.organization.id, report.organization.id);

    let token = app.token("u1", &[]);
    let (status, body) = app
        .request("GET", "/api/v1/users/me/features", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let orgs = body["organizations"].as_array().unwrap();
    assert_eq!(orgs.len(), 1);
    assert_eq!(orgs[0], report.organization.id.to_string());
}

#[tokio::test]
async fn test_paid_upgrade_resets_limits() {
    let app = TestApp::new().await;
    let trial = app.trial_plan().await;
    let pro = app.pro_plan().await;
    let ledger = &app.state.subscription_service;

    ledger
        .checkout("u1", &[], trial.id, CheckoutUrls::default())
        .await
        .unwrap();

    let upgraded = ledger
        .upgrade("u1", &[], pro.id, ProrationBehavior::default())
        .await
        .unwrap();
    assert_eq!(upgraded.plan_id, pro.id);
    assert!(upgraded.provider_subscription_id.is_some());

    let check = app
        .state
        .usage_service
        .check("u1", MetricType::ConcurrentTerminals, 10)
        .await
        .unwrap();
    assert!(check.allowed);
    assert_eq!(check.limit, 10);
}

#[tokio::test]
async fn test_failed_upgrade_keeps_ledger() {
    let app = TestApp::new().await;
    let trial = app.trial_plan().await;
    let pro = app.pro_plan().await;
    let ledger = &app.state.subscription_service;

    ledger
        .checkout("u1", &[], trial.id, CheckoutUrls::default())
        .await
        .unwrap();

    app.payment
        .fail_with(Some(ProviderError::Unavailable("card network down".to_string())));
    let result = ledger
        .upgrade("u1", &[], pro.id, ProrationBehavior::default())
        .await;
    assert!(matches!(result, Err(AppError::ExternalFailure(_))));

    let (sub, plan) = ledger
        .get_primary_user_subscription("u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.id, trial.id);
    assert!(sub.provider_subscription_id.is_none());

    let check = app
        .state
        .usage_service
        .check("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();
    assert_eq!(check.limit, 1);
}

#[tokio::test]
async fn test_bulk_purchase_and_assign() {
    let app = TestApp::new().await;
    let team = app.team_plan().await;

    let purchase = app
        .state
        .batch_service
        .purchase_batch(
            &actor("u_purchaser"),
            BulkPurchaseRequest {
                plan_id: team.id,
                quantity: 5,
                group_id: None,
            },
        )
        .await
        .unwrap();
    let batch_id = purchase.batch.id;
    let token = app.token("u_purchaser", &[]);

    let (status, body) = app
        .request("GET", "/api/v1/subscription-batches", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let licenses_uri = format!("/api/v1/subscription-batches/{}/licenses", batch_id);
    let (status, body) = app.request("GET", &licenses_uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"], 5);
    assert_eq!(body["assigned"], 0);
    assert_eq!(body["seats"].as_array().unwrap().len(), 5);

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/v1/subscription-batches/{}/assign", batch_id),
            Some(&token),
            Some(json!({ "user_id": "u2" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["batch"]["assigned_quantity"], 1);
    let seat_id = body["seat"]["id"].as_str().unwrap().to_string();

    let live = app.state.subscription_service.get_all_active("u2").await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].0.subscription_type, SubscriptionType::Assigned);
    assert_eq!(live[0].0.batch_id, Some(batch_id));
    let assigned_sub = live[0].0.id;

    let (status, body) = app
        .request(
            "DELETE",
            &format!("/api/v1/subscription-batches/{}/licenses/{}/revoke", batch_id, seat_id),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assigned_quantity"], 0);

    let (_, body) = app.request("GET", &licenses_uri, Some(&token), None).await;
    assert_eq!(body["pool"], 5);

    let cancelled = app
        .state
        .subscription_service
        .get_owned("u2", assigned_sub, false)
        .await
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(app.state.subscription_service.get_all_active("u2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cascading_org_manager_access() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("u_owner");

    let org = orgs.create_organization(&owner, org_request("acme")).await.unwrap();
    orgs.add_member(org.id, &owner, "u_mgr", OrganizationRole::Manager)
        .await
        .unwrap();
    orgs.add_member(org.id, &owner, "u_member", OrganizationRole::Member)
        .await
        .unwrap();
    let group = app
        .state
        .group_service
        .create_group(&owner, group_request("devs", Some(org.id)))
        .await
        .unwrap();

    let resolver = &app.state.resolver;
    let path = format!("/groups/{}", group.id);

    let decision = resolver.authorize("u_mgr", &[], "GET", &path).await.unwrap();
    assert_eq!(decision, Decision::Allow(Grant::OrgManagerCascade));
    let decision = resolver.authorize("u_mgr", &[], "DELETE", &path).await.unwrap();
    assert_eq!(decision, Decision::Deny(DenyReason::InsufficientRole));
    for method in ["GET", "DELETE"] {
        let decision = resolver.authorize("u_member", &[], method, &path).await.unwrap();
        assert!(!decision.is_allowed(), "{} should be denied", method);
    }

    // HTTP 层
    let uri = format!("/api/v1/groups/{}", group.id);
    let mgr = app.token("u_mgr", &[]);
    let member = app.token("u_member", &[]);
    let (status, _) = app.request("GET", &uri, Some(&mgr), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.request("DELETE", &uri, Some(&mgr), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
    let (status, _) = app.request("GET", &uri, Some(&member), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // 直接拥有者可以删除
    let owner_token = app.token("u_owner", &[]);
    let (status, _) = app.request("DELETE", &uri, Some(&owner_token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_policy_denial_precedence() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let owner = actor("u_owner");
    let org_a = orgs.create_organization(&owner, org_request("alpha")).await.unwrap();
    let org_b = orgs.create_organization(&owner, org_request("beta")).await.unwrap();

    app.state
        .policy_store
        .add_policy("u_x", &format!("/organizations/{}", org_a.id), "GET")
        .await
        .unwrap();

    let token = app.token("u_x", &[]);
    let uri_a = format!("/api/v1/organizations/{}", org_a.id);

    let (status, body) = app.request("GET", &uri_a, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "alpha");

    let (status, _) = app.request("DELETE", &uri_a, Some(&token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request("GET", &format!("/api/v1/organizations/{}", org_b.id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    // 不存在的组织与无权访问的组织返回相同结果
    let (status, missing) = app
        .request(
            "GET",
            &format!("/api/v1/organizations/{}", uuid::Uuid::new_v4()),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["error"]["message"], body["error"]["message"]);
}

#[tokio::test]
async fn test_effective_features_merge_personal_org_and_assigned() {
    let app = TestApp::new().await;
    let orgs = &app.state.organization_service;
    let resolver = &app.state.resolver;

    // 个人免费计划：课程不限
    let mut starter = plan_request("starter", 0, 0, 1);
    starter.max_courses = -1;
    starter.features = vec!["starter_labs".to_string()];
    let starter = app.create_plan(starter).await;
    let pro = app.pro_plan().await;
    let team = app.team_plan().await;

    app.state
        .subscription_service
        .checkout("u1", &[], starter.id, CheckoutUrls::default())
        .await
        .unwrap();
    let personal_only = resolver.effective_features("u1").await.unwrap();
    assert_eq!(personal_only.plan.as_ref().map(|p| p.id), Some(starter.id));
    assert!(personal_only.contributing_organizations.is_empty());

    // 组织订阅由管理员分配
    let owner = actor("u_owner");
    let org = orgs.create_organization(&owner, org_request("campus")).await.unwrap();
    orgs.add_member(org.id, &owner, "u1", OrganizationRole::Member)
        .await
        .unwrap();
    app.state
        .subscription_service
        .subscribe_organization(
            org.id,
            "root",
            &["administrator".to_string()],
            pro.id,
            1,
            CheckoutUrls::default(),
        )
        .await
        .unwrap();
    let with_org = resolver.effective_features("u1").await.unwrap();

    // 批量授权分配的席位
    let buyer = actor("u_buyer");
    let purchase = app
        .state
        .batch_service
        .purchase_batch(
            &buyer,
            BulkPurchaseRequest {
                plan_id: team.id,
                quantity: 2,
                group_id: None,
            },
        )
        .await
        .unwrap();
    app.state
        .batch_service
        .assign(purchase.batch.id, &buyer, "u1")
        .await
        .unwrap();
    let bundle = resolver.effective_features("u1").await.unwrap();

    assert_eq!(bundle.plan.as_ref().map(|p| p.id), Some(team.id));
    let features: Vec<&str> = bundle.features.iter().map(String::as_str).collect();
    assert_eq!(features, vec!["advanced_labs", "starter_labs", "team_dashboard"]);
    assert_eq!(bundle.caps.max_concurrent_terminals, 10);
    assert_eq!(bundle.caps.max_courses, -1);
    assert!(bundle.network_access_enabled);
    assert_eq!(bundle.contributing_organizations, vec![org.id]);
    assert!(bundle.organizations.contains(&org.id));

    // 每增加一个订阅来源，已有特性都保留
    for earlier in [&personal_only, &with_org] {
        assert!(earlier.features.is_subset(&bundle.features));
    }
    assert!(personal_only.features.is_subset(&with_org.features));
}
