//! 批量授权测试

mod common;

use common::{actor, TestApp};
use entitlement_core::{
    error::AppError,
    models::{
        batch::{BatchStatus, BulkPurchaseRequest},
        group::{CreateGroupRequest, GroupRole},
        subscription::SubscriptionStatus,
        Actor,
    },
    services::batch_service::BatchPurchase,
};
use std::time::Duration;
use uuid::Uuid;

async fn purchase(app: &TestApp, purchaser: &Actor, quantity: i32, group_id: Option<Uuid>) -> BatchPurchase {
    let team = match app.state.plan_catalog.list_plans(false).await.unwrap().into_iter().find(|p| p.name == "team") {
        Some(plan) => plan,
        None => app.team_plan().await,
    };
    app.state
        .batch_service
        .purchase_batch(
            purchaser,
            BulkPurchaseRequest {
                plan_id: team.id,
                quantity,
                group_id,
            },
        )
        .await
        .unwrap()
}

async fn standalone_group(app: &TestApp, owner: &Actor, name: &str) -> Uuid {
    app.state
        .group_service
        .create_group(
            owner,
            CreateGroupRequest {
                name: name.to_string(),
                display_name: None,
                description: None,
                organization_id: None,
                parent_group_id: None,
                max_members: None,
                expires_at: None,
                metadata: None,
            },
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_seat_conservation_and_pool_exhaustion() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let batch = purchase(&app, &buyer, 2, None).await.batch;
    assert!(batch.provider_subscription_id.is_some());
    let batches = &app.state.batch_service;

    batches.assign(batch.id, &buyer, "u2").await.unwrap();
    let assignment = batches.assign(batch.id, &buyer, "u3").await.unwrap();
    assert_eq!(assignment.batch.assigned_quantity, 2);
    assert_eq!(assignment.batch.pool(), 0);

    let result = batches.assign(batch.id, &buyer, "u4").await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let listing = batches.list_licenses(batch.id, &buyer).await.unwrap();
    assert_eq!(listing.total, listing.assigned + listing.pool);
    assert_eq!(listing.assigned, 2);
}

#[tokio::test]
async fn test_assign_rejects_purchaser_and_duplicates() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let batch = purchase(&app, &buyer, 3, None).await.batch;
    let batches = &app.state.batch_service;

    let result = batches.assign(batch.id, &buyer, "buyer").await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    batches.assign(batch.id, &buyer, "u2").await.unwrap();
    let result = batches.assign(batch.id, &buyer, "u2").await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let batch = batches.get_batch(batch.id).await.unwrap();
    assert_eq!(batch.assigned_quantity, 1);
}

#[tokio::test]
async fn test_batch_hidden_from_other_users() {
    let app = TestApp::new().await;
    let batch = purchase(&app, &actor("buyer"), 1, None).await.batch;

    let result = app.state.batch_service.list_licenses(batch.id, &actor("intruder")).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));

    let result = app.state.batch_service.assign(batch.id, &actor("intruder"), "u2").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_update_quantity() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let batch = purchase(&app, &buyer, 2, None).await.batch;
    let batches = &app.state.batch_service;
    batches.assign(batch.id, &buyer, "u2").await.unwrap();
    batches.assign(batch.id, &buyer, "u3").await.unwrap();

    let result = batches.update_quantity(batch.id, &buyer, 1).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let resized = batches.update_quantity(batch.id, &buyer, 4).await.unwrap();
    assert_eq!(resized.total_quantity, 4);
    assert_eq!(resized.pool(), 2);

    let listing = batches.list_licenses(batch.id, &buyer).await.unwrap();
    assert_eq!(listing.seats.len(), 4);
    assert!(app
        .payment
        .calls()
        .iter()
        .any(|call| call.starts_with("update_quantity:") && call.ends_with(":4")));
}

#[tokio::test]
async fn test_cancel_batch_cancels_assigned_subscriptions() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let batch = purchase(&app, &buyer, 3, None).await.batch;
    let batches = &app.state.batch_service;
    let assignment = batches.assign(batch.id, &buyer, "u2").await.unwrap();

    let cancelled = batches.cancel_batch(batch.id, &buyer).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    // 席位保持原状
    assert_eq!(cancelled.assigned_quantity, 1);

    let sub = app
        .state
        .subscription_service
        .get_owned("u2", assignment.subscription.id, false)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);

    // 幂等
    let again = batches.cancel_batch(batch.id, &buyer).await.unwrap();
    assert_eq!(again.status, BatchStatus::Cancelled);

    let result = batches.assign(batch.id, &buyer, "u3").await;
    assert!(matches!(result, Err(AppError::State(_))));
}

#[tokio::test]
async fn test_delete_batch_requires_no_assignments() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let batches = &app.state.batch_service;

    let busy = purchase(&app, &buyer, 2, None).await.batch;
    batches.assign(busy.id, &buyer, "u2").await.unwrap();
    let result = batches.delete_batch(busy.id, &buyer).await;
    assert!(matches!(result, Err(AppError::State(_))));

    let idle = purchase(&app, &buyer, 2, None).await.batch;
    batches.delete_batch(idle.id, &buyer).await.unwrap();
    assert!(matches!(batches.get_batch(idle.id).await, Err(AppError::NotFound(_))));
    assert_eq!(batches.list_batches("buyer").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_group_preassignment_report() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let group_id = standalone_group(&app, &buyer, "cohort").await;
    for user in ["u6", "u7"] {
        app.state
            .group_service
            .add_member(group_id, &buyer, user, GroupRole::Member)
            .await
            .unwrap();
    }

    let purchase = purchase(&app, &buyer, 1, Some(group_id)).await;
    assert_eq!(purchase.report.assigned.len(), 1);
    assert_eq!(purchase.report.warnings.len(), 1);
    assert!(purchase.report.errors.is_empty());
    assert_eq!(purchase.batch.assigned_quantity, 1);
}

#[tokio::test]
async fn test_group_join_auto_assigns_seat() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let group_id = standalone_group(&app, &buyer, "cohort").await;
    let batch = purchase(&app, &buyer, 2, Some(group_id)).await.batch;

    let consumer = app
        .state
        .batch_service
        .clone()
        .spawn_auto_assign(app.state.event_bus.subscribe());

    app.state
        .group_service
        .add_member(group_id, &buyer, "joiner", GroupRole::Member)
        .await
        .unwrap();

    let mut assigned = false;
    for _ in 0..50 {
        let live = app.state.subscription_service.get_all_active("joiner").await.unwrap();
        if live.iter().any(|(sub, _)| sub.batch_id == Some(batch.id)) {
            assigned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    consumer.abort();

    assert!(assigned, "joiner should receive a seat");
    let batch = app.state.batch_service.get_batch(batch.id).await.unwrap();
    assert_eq!(batch.assigned_quantity, 1);
}

#[tokio::test]
async fn test_direct_member_added_hook_skips_full_batch() {
    let app = TestApp::new().await;
    let buyer = actor("buyer");
    let group_id = standalone_group(&app, &buyer, "cohort").await;
    let batch = purchase(&app, &buyer, 1, Some(group_id)).await.batch;
    let batches = &app.state.batch_service;

    let first = batches.on_group_member_added(group_id, "u2").await.unwrap();
    assert_eq!(first.map(|a| a.batch.id), Some(batch.id));

    let second = batches.on_group_member_added(group_id, "u3").await.unwrap();
    assert!(second.is_none());

    let purchaser = batches.on_group_member_added(group_id, "buyer").await.unwrap();
    assert!(purchaser.is_none());
}
