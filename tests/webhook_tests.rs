//! 支付回调测试

mod common;

use axum::http::StatusCode;
use common::{actor, subscription_event, TestApp};
use entitlement_core::{
    error::AppError,
    models::{
        batch::{BatchStatus, BulkPurchaseRequest},
        organization::CreateOrganizationRequest,
        subscription::{CheckoutOutcome, SubscriptionStatus},
        usage::MetricType,
    },
    services::{
        subscription_service::CheckoutUrls,
        webhook_service::{parse_event, PaymentEvent, WebhookOutcome},
    },
};
use serde_json::json;

const WEBHOOK_URI: &str = "/api/v1/webhooks/payment";

/// 付费结账，返回等待确认的账本行 id
async fn pending_checkout(app: &TestApp, user: &str) -> uuid::Uuid {
    let pro = app.pro_plan().await;
    let outcome = app
        .state
        .subscription_service
        .checkout(user, &[], pro.id, CheckoutUrls::default())
        .await
        .unwrap();
    match outcome {
        CheckoutOutcome::PendingPayment { subscription, checkout_url } => {
            assert_eq!(subscription.status, SubscriptionStatus::Incomplete);
            assert!(checkout_url.contains("session_id="));
            subscription.id
        }
        other => panic!("expected pending payment, got {:?}", other),
    }
}

fn invoice_event(event_id: &str, event_type: &str, subscription_id: &str, period_start: i64) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": event_type,
        "data": {
            "object": {
                "id": format!("in_{}", event_id),
                "subscription": subscription_id,
                "period_start": period_start,
                "period_end": period_start + 30 * 24 * 3600
            }
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn test_checkout_confirmed_by_webhook() {
    let app = TestApp::new().await;
    let sub_id = pending_checkout(&app, "u1").await;
    let ledger = &app.state.subscription_service;
    assert!(ledger.get_all_active("u1").await.unwrap().is_empty());

    let payload = subscription_event(
        "evt_1",
        "customer.subscription.created",
        "sub_live_1",
        "active",
        json!({ "subscription_id": sub_id.to_string() }),
    );
    let (status, body) = app.post_raw(WEBHOOK_URI, payload.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "applied");

    let sub = ledger.get_owned("u1", sub_id, false).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.provider_subscription_id.as_deref(), Some("sub_live_1"));

    let check = app
        .state
        .usage_service
        .check("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();
    assert_eq!(check.limit, 10);

    // 重投同一事件
    let outcome = app.state.webhook_service.handle(&payload).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Duplicate);
}

#[tokio::test]
async fn test_subscription_deleted_cancels_ledger_row() {
    let app = TestApp::new().await;
    let sub_id = pending_checkout(&app, "u1").await;
    let webhooks = &app.state.webhook_service;
    webhooks
        .handle(&subscription_event(
            "evt_1",
            "customer.subscription.created",
            "sub_live_1",
            "active",
            json!({ "subscription_id": sub_id.to_string() }),
        ))
        .await
        .unwrap();

    let outcome = webhooks
        .handle(&subscription_event(
            "evt_2",
            "customer.subscription.deleted",
            "sub_live_1",
            "active",
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let sub = app
        .state
        .subscription_service
        .get_owned("u1", sub_id, false)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    assert!(sub.cancelled_at.is_some());

    let check = app
        .state
        .usage_service
        .check("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();
    assert!(!check.allowed);
}

#[tokio::test]
async fn test_late_events_do_not_revive_cancelled_subscription() {
    let app = TestApp::new().await;
    let sub_id = pending_checkout(&app, "u1").await;
    let webhooks = &app.state.webhook_service;
    webhooks
        .handle(&subscription_event(
            "evt_1",
            "customer.subscription.created",
            "sub_live_1",
            "active",
            json!({ "subscription_id": sub_id.to_string() }),
        ))
        .await
        .unwrap();
    webhooks
        .handle(&subscription_event(
            "evt_2",
            "customer.subscription.deleted",
            "sub_live_1",
            "canceled",
            json!({}),
        ))
        .await
        .unwrap();

    // 迟到的账单支付和状态更新
    let next_period = chrono::Utc::now().timestamp() + 31 * 24 * 3600;
    let paid = invoice_event("evt_3", "invoice.paid", "sub_live_1", next_period);
    assert_eq!(webhooks.handle(&paid).await.unwrap(), WebhookOutcome::Ignored);
    let updated = subscription_event(
        "evt_4",
        "customer.subscription.updated",
        "sub_live_1",
        "active",
        json!({}),
    );
    assert_eq!(webhooks.handle(&updated).await.unwrap(), WebhookOutcome::Ignored);

    let sub = app
        .state
        .subscription_service
        .get_owned("u1", sub_id, false)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    assert_ne!(sub.current_period_start.timestamp(), next_period);
    assert!(app.state.subscription_service.get_all_active("u1").await.unwrap().is_empty());

    let check = app
        .state
        .usage_service
        .check("u1", MetricType::ConcurrentTerminals, 1)
        .await
        .unwrap();
    assert!(!check.allowed);
}

#[tokio::test]
async fn test_invoice_events_drive_status_and_period() {
    let app = TestApp::new().await;
    let sub_id = pending_checkout(&app, "u1").await;
    let webhooks = &app.state.webhook_service;
    webhooks
        .handle(&subscription_event(
            "evt_1",
            "customer.subscription.created",
            "sub_live_1",
            "active",
            json!({ "subscription_id": sub_id.to_string() }),
        ))
        .await
        .unwrap();

    let usage = &app.state.usage_service;
    usage.increment("u1", MetricType::LabSessions, 3).await.unwrap();
    usage.increment("u1", MetricType::ConcurrentTerminals, 2).await.unwrap();

    let failed = invoice_event("evt_2", "invoice.payment_failed", "sub_live_1", 0);
    assert_eq!(webhooks.handle(&failed).await.unwrap(), WebhookOutcome::Applied);
    let sub = app
        .state
        .subscription_service
        .get_owned("u1", sub_id, false)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);

    let next_period = chrono::Utc::now().timestamp() + 31 * 24 * 3600;
    let paid = invoice_event("evt_3", "invoice.paid", "sub_live_1", next_period);
    assert_eq!(webhooks.handle(&paid).await.unwrap(), WebhookOutcome::Applied);

    let sub = app
        .state
        .subscription_service
        .get_owned("u1", sub_id, false)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_start.timestamp(), next_period);

    // 周期计数清零，并发计数保留
    let metrics = usage.list("u1").await.unwrap();
    let value = |metric: MetricType| {
        metrics
            .iter()
            .find(|m| m.metric_type == metric)
            .map(|m| m.current_value)
    };
    assert_eq!(value(MetricType::LabSessions), Some(0));
    assert_eq!(value(MetricType::ConcurrentTerminals), Some(2));
}

#[tokio::test]
async fn test_unknown_and_unmatched_events() {
    let app = TestApp::new().await;
    let webhooks = &app.state.webhook_service;

    let payload = json!({
        "id": "evt_other",
        "type": "charge.refunded",
        "data": { "object": { "id": "ch_1" } }
    })
    .to_string()
    .into_bytes();
    assert_eq!(webhooks.handle(&payload).await.unwrap(), WebhookOutcome::Ignored);

    let payload = subscription_event(
        "evt_orphan",
        "customer.subscription.updated",
        "sub_nobody",
        "active",
        json!({}),
    );
    assert_eq!(webhooks.handle(&payload).await.unwrap(), WebhookOutcome::Unmatched);
}

#[tokio::test]
async fn test_malformed_payload_rejected() {
    let app = TestApp::new().await;

    let (status, body) = app.post_raw(WEBHOOK_URI, b"{not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let payload = subscription_event("evt_bad", "customer.subscription.updated", "sub_1", "paused", json!({}));
    let result = app.state.webhook_service.handle(&payload).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[test]
fn test_parse_event_strips_customer_prefix() {
    let payload = subscription_event("evt_1", "customer.subscription.deleted", "sub_1", "active", json!({}));
    let (id, event_type, event) = parse_event(&payload).unwrap();
    assert_eq!(id, "evt_1");
    assert_eq!(event_type, "customer.subscription.deleted");
    match event {
        PaymentEvent::SubscriptionDeleted(payload) => {
            assert_eq!(payload.status, SubscriptionStatus::Cancelled);
            assert_eq!(payload.subscription_id, "sub_1");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_event_can_be_redelivered() {
    let app = TestApp::new().await;
    // 元数据指向尚不存在的组织订阅
    let missing = uuid::Uuid::new_v4();
    let payload = subscription_event(
        "evt_retry",
        "customer.subscription.created",
        "sub_org_1",
        "active",
        json!({ "organization_subscription_id": missing.to_string() }),
    );
    let webhooks = &app.state.webhook_service;
    assert!(matches!(webhooks.handle(&payload).await, Err(AppError::NotFound(_))));
    // 失败的事件不计入已处理集合
    assert!(matches!(webhooks.handle(&payload).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_organization_checkout_confirmed() {
    let app = TestApp::new().await;
    let team = app.team_plan().await;
    let owner = actor("owner");
    let org = app
        .state
        .organization_service
        .create_organization(
            &owner,
            CreateOrganizationRequest {
                name: "acme".to_string(),
                display_name: None,
                description: None,
                max_groups: None,
                max_members: None,
                metadata: None,
            },
        )
        .await
        .unwrap();

    let ledger = &app.state.subscription_service;
    let checkout = ledger
        .subscribe_organization(org.id, "owner", &[], team.id, 3, CheckoutUrls::default())
        .await
        .unwrap();
    assert!(checkout.checkout_url.is_some());
    assert_eq!(checkout.subscription.status, SubscriptionStatus::Incomplete);

    let payload = subscription_event(
        "evt_org",
        "customer.subscription.created",
        "sub_org_live",
        "active",
        json!({ "organization_subscription_id": checkout.subscription.id.to_string() }),
    );
    assert_eq!(
        app.state.webhook_service.handle(&payload).await.unwrap(),
        WebhookOutcome::Applied
    );

    let features = app
        .state
        .organization_service
        .organization_features(org.id)
        .await
        .unwrap();
    assert_eq!(features.plan.map(|p| p.id), Some(team.id));
    assert_eq!(features.features, vec!["team_dashboard".to_string()]);
}

#[tokio::test]
async fn test_provider_cancellation_cancels_batch() {
    let app = TestApp::new().await;
    let team = app.team_plan().await;
    let buyer = actor("buyer");
    let batches = &app.state.batch_service;
    let batch = batches
        .purchase_batch(
            &buyer,
            BulkPurchaseRequest {
                plan_id: team.id,
                quantity: 2,
                group_id: None,
            },
        )
        .await
        .unwrap()
        .batch;
    let assignment = batches.assign(batch.id, &buyer, "u2").await.unwrap();
    let provider_id = batch.provider_subscription_id.clone().unwrap();

    let payload = subscription_event(
        "evt_batch",
        "customer.subscription.deleted",
        &provider_id,
        "canceled",
        json!({ "bulk_purchase": "true" }),
    );
    assert_eq!(
        app.state.webhook_service.handle(&payload).await.unwrap(),
        WebhookOutcome::Applied
    );

    let batch = batches.get_batch(batch.id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    let sub = app
        .state
        .subscription_service
        .get_owned("u2", assignment.subscription.id, false)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);
}
