//! HTTP 层测试：探针、认证、错误格式、计划管理与用量

mod common;

use axum::http::StatusCode;
use common::{plan_request, TestApp};
use entitlement_core::{
    models::usage::MetricType,
    services::entitlement_resolver::{Decision, DenyReason},
};
use serde_json::json;

#[tokio::test]
async fn test_health_endpoints_are_public() {
    let app = TestApp::new().await;

    let (status, body) = app.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.request("GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    let (status, body) = app.request("GET", "/version", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "entitlement-core");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn test_missing_or_invalid_token() {
    let app = TestApp::new().await;

    let (status, body) = app.request("GET", "/api/v1/organizations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = app
        .request("GET", "/api/v1/organizations", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_error_body_shape() {
    let app = TestApp::new().await;
    let token = app.token("u1", &[]);
    let uri = format!("/api/v1/organizations/{}", uuid::Uuid::new_v4());

    let (status, body) = app.request("GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error = &body["error"];
    assert_eq!(error["code"], "NOT_FOUND");
    assert!(error["message"].as_str().is_some_and(|m| !m.is_empty()));
    assert!(error["request_id"].as_str().is_some_and(|id| uuid::Uuid::parse_str(id).is_ok()));
}

fn plan_body(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "priority": 10,
        "price_amount": 0,
        "currency": "usd",
        "billing_interval": "month",
        "provider_price_id": null,
        "max_concurrent_terminals": 2,
        "max_courses": 3,
        "required_role": null
    })
}

#[tokio::test]
async fn test_plan_management_requires_admin() {
    let app = TestApp::new().await;
    let user = app.token("u1", &[]);
    let admin = app.token("root", &["administrator"]);

    let (status, body) = app
        .request("POST", "/api/v1/subscription-plans", Some(&user), Some(plan_body("basic")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "PERMISSION_DENIED");

    let (status, plan) = app
        .request("POST", "/api/v1/subscription-plans", Some(&admin), Some(plan_body("basic")))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let plan_id = plan["id"].as_str().unwrap().to_string();

    let (status, plans) = app.request("GET", "/api/v1/subscription-plans", Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plans["count"], 1);

    let uri = format!("/api/v1/subscription-plans/{}", plan_id);
    let (status, _) = app.request("DELETE", &uri, Some(&user), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app.request("DELETE", &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, plans) = app.request("GET", "/api/v1/subscription-plans", Some(&user), None).await;
    assert_eq!(plans["count"], 0);
}

#[tokio::test]
async fn test_invalid_plan_rejected() {
    let app = TestApp::new().await;
    let admin = app.token("root", &["administrator"]);
    let mut body = plan_body("bad");
    body["currency"] = json!("dollars");

    let (status, body) = app
        .request("POST", "/api/v1/subscription-plans", Some(&admin), Some(body))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_admin_onboarding_endpoint() {
    let app = TestApp::new().await;
    let admin = app.token("root", &["administrator"]);
    let user = app.token("u1", &[]);
    let record = json!({ "id": "u9", "email": "u9@example.com", "name": "U Nine" });

    let (status, _) = app
        .request("POST", "/api/v1/admin/onboarding", Some(&user), Some(record.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request("POST", "/api/v1/admin/onboarding", Some(&admin), Some(record))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["organization"]["is_personal"], true);
    assert_eq!(body["seat_provisioned"], true);

    let (status, _) = app
        .request(
            "POST",
            "/api/v1/admin/onboarding",
            Some(&admin),
            Some(json!({ "id": " ", "email": "x@example.com", "name": "X" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_usage_endpoints() {
    let app = TestApp::new().await;
    let trial = app.trial_plan().await;
    let token = app.token("u1", &[]);

    // 没有订阅时一律拒绝
    let (status, body) = app
        .request("GET", "/api/v1/usage/concurrent_terminals/check", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);

    let (status, _) = app
        .request(
            "POST",
            "/api/v1/user-subscriptions/checkout",
            Some(&token),
            Some(json!({ "plan_id": trial.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // 终端服务代用户上报
    let meter = app.token("terminal-service", &["metering"]);
    let report = json!({ "user_id": "u1", "metric_type": "concurrent_terminals" });
    let (status, body) = app
        .request("POST", "/api/v1/usage/increment", Some(&meter), Some(report.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["current_value"], 1);

    let (status, body) = app
        .request("POST", "/api/v1/usage/increment", Some(&meter), Some(report))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "LIMIT_EXCEEDED");

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/usage/increment",
            Some(&meter),
            Some(json!({ "user_id": "u1", "metric_type": "concurrent_terminals", "delta": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    // 释放终端
    let (status, body) = app
        .request(
            "POST",
            "/api/v1/usage/increment",
            Some(&meter),
            Some(json!({ "user_id": "u1", "metric_type": "concurrent_terminals", "delta": -1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_value"], 0);

    let (status, body) = app
        .request("GET", "/api/v1/usage/bogus_metric/check", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = app.request("GET", "/api/v1/usage/metrics", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["metrics"].as_array().is_some_and(|rows| !rows.is_empty()));
}

#[tokio::test]
async fn test_members_cannot_rewrite_own_usage() {
    let app = TestApp::new().await;
    let trial = app.trial_plan().await;
    app.state
        .subscription_service
        .checkout("u1", &[], trial.id, Default::default())
        .await
        .unwrap();
    app.state
        .usage_service
        .increment("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();

    let token = app.token("u1", &[]);
    for delta in [-1, 1] {
        let (status, body) = app
            .request(
                "POST",
                "/api/v1/usage/increment",
                Some(&token),
                Some(json!({ "metric_type": "concurrent_terminals", "delta": delta })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
    }

    // 计数和上限都没变
    let (status, body) = app
        .request("GET", "/api/v1/usage/concurrent_terminals/check", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["current_usage"], 1);
    assert_eq!(body["limit"], 1);
}

#[tokio::test]
async fn test_bulk_purchase_requires_role_or_feature() {
    let app = TestApp::new().await;
    let team = app.team_plan().await;
    let order = json!({ "plan_id": team.id, "quantity": 3 });

    let member = app.token("u_plain", &[]);
    let (status, body) = app
        .request("POST", "/api/v1/user-subscriptions/purchase-bulk", Some(&member), Some(order.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
    let (_, batches) = app
        .request("GET", "/api/v1/subscription-batches", Some(&member), None)
        .await;
    assert_eq!(batches["count"], 0);

    let trainer = app.token("u_trainer", &["trainer"]);
    let (status, body) = app
        .request("POST", "/api/v1/user-subscriptions/purchase-bulk", Some(&trainer), Some(order.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["batch"]["total_quantity"], 3);

    // 计划带 bulk_purchase 特性也可以
    let mut academy = plan_request("academy", 5, 0, 1);
    academy.features = vec!["bulk_purchase".to_string()];
    let academy = app.create_plan(academy).await;
    app.state
        .subscription_service
        .checkout("u_academy", &[], academy.id, Default::default())
        .await
        .unwrap();
    let entitled = app.token("u_academy", &[]);
    let (status, body) = app
        .request("POST", "/api/v1/user-subscriptions/purchase-bulk", Some(&entitled), Some(order))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["batch"]["purchaser_user_id"], "u_academy");
}

#[tokio::test]
async fn test_metered_collection_quota() {
    let app = TestApp::new().await;
    let trial = app.trial_plan().await;
    app.state
        .subscription_service
        .checkout("u1", &[], trial.id, Default::default())
        .await
        .unwrap();

    let resolver = &app.state.resolver;
    let decision = resolver.authorize("u1", &[], "POST", "/terminals").await.unwrap();
    assert!(decision.is_allowed());

    app.state
        .usage_service
        .increment("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();
    let decision = resolver.authorize("u1", &[], "POST", "/terminals").await.unwrap();
    assert!(matches!(
        decision,
        Decision::Deny(DenyReason::QuotaExceeded { current: 1, limit: 1, .. })
    ));

    // 读取不计量
    let decision = resolver.authorize("u1", &[], "GET", "/terminals").await.unwrap();
    assert!(decision.is_allowed());
}

#[tokio::test]
async fn test_collection_listing_is_filtered() {
    let app = TestApp::new().await;
    let alice = app.token("alice", &[]);
    let bob = app.token("bob", &[]);

    let (status, _) = app
        .request("POST", "/api/v1/organizations", Some(&alice), Some(json!({ "name": "alpha" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app
        .request("POST", "/api/v1/organizations", Some(&bob), Some(json!({ "name": "beta" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.request("GET", "/api/v1/organizations", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["organizations"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|org| org["name"].as_str())
        .collect();
    assert_eq!(names, vec!["alpha"]);
}
