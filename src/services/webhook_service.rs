//! Payment webhook consumer
//!
//! 把支付服务事件翻译为账本状态变化。按事件 id 幂等，处理失败时撤销记录以便重投。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::batch_service::BatchService;
use super::subscription_service::{ProviderUpdate, ProviderUpdateResult, SubscriptionService};
use crate::{
    error::{AppError, Result},
    models::subscription::SubscriptionStatus,
    providers::ProviderSubscription,
    repository::SubscriptionRepository,
    telemetry::WEBHOOK_EVENTS,
};

/// 事件信封 `{id, type, data: {object}}`
#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// 订阅对象中用到的字段
#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    #[serde(default)]
    customer: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// 账单对象中用到的字段
#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    subscription: Option<String>,
    period_start: Option<i64>,
    period_end: Option<i64>,
}

/// 解析后的支付事件
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    InvoicePaid {
        invoice_id: String,
        subscription_id: Option<String>,
        period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    },
    InvoicePaymentFailed {
        invoice_id: String,
        subscription_id: Option<String>,
    },
    Unknown,
}

/// 订阅事件的载荷
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPayload {
    pub subscription_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub metadata: HashMap<String, String>,
}

impl SubscriptionPayload {
    fn to_update(&self) -> ProviderUpdate {
        ProviderUpdate {
            subscription_id: self.subscription_id.clone(),
            status: self.status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: Some(self.cancel_at_period_end),
        }
    }

    fn to_provider(&self) -> ProviderSubscription {
        let now = Utc::now();
        ProviderSubscription {
            subscription_id: self.subscription_id.clone(),
            customer_id: self.customer_id.clone(),
            item_id: None,
            status: self.status,
            current_period_start: self.current_period_start.unwrap_or(now),
            current_period_end: self.current_period_end.unwrap_or(now),
        }
    }

    fn metadata_id(&self, key: &str) -> Option<Uuid> {
        self.metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
    }
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

fn subscription_payload(object: serde_json::Value) -> Result<SubscriptionPayload> {
    let object: SubscriptionObject = serde_json::from_value(object)
        .map_err(|e| AppError::BadRequest(format!("Invalid subscription object: {}", e)))?;
    let status = SubscriptionStatus::from_provider(&object.status).ok_or_else(|| {
        AppError::BadRequest(format!("Unknown subscription status: {}", object.status))
    })?;
    Ok(SubscriptionPayload {
        subscription_id: object.id,
        customer_id: object.customer,
        status,
        current_period_start: timestamp(object.current_period_start),
        current_period_end: timestamp(object.current_period_end),
        cancel_at_period_end: object.cancel_at_period_end,
        metadata: object.metadata,
    })
}

/// 解析事件；返回 (事件 id, 事件类型, 事件)
pub fn parse_event(payload: &[u8]) -> Result<(String, String, PaymentEvent)> {
    let envelope: Envelope = serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

    let event_type = envelope
        .event_type
        .strip_prefix("customer.")
        .unwrap_or(&envelope.event_type)
        .to_string();
    let event = match event_type.as_str() {
        "subscription.created" => PaymentEvent::SubscriptionCreated(subscription_payload(envelope.data.object)?),
        "subscription.updated" => PaymentEvent::SubscriptionUpdated(subscription_payload(envelope.data.object)?),
        "subscription.deleted" => {
            let mut payload = subscription_payload(envelope.data.object)?;
            payload.status = SubscriptionStatus::Cancelled;
            PaymentEvent::SubscriptionDeleted(payload)
        }
        "invoice.paid" | "invoice.payment_failed" => {
            let invoice: InvoiceObject = serde_json::from_value(envelope.data.object)
                .map_err(|e| AppError::BadRequest(format!("Invalid invoice object: {}", e)))?;
            if event_type == "invoice.paid" {
                PaymentEvent::InvoicePaid {
                    invoice_id: invoice.id,
                    subscription_id: invoice.subscription,
                    period: timestamp(invoice.period_start).zip(timestamp(invoice.period_end)),
                }
            } else {
                PaymentEvent::InvoicePaymentFailed {
                    invoice_id: invoice.id,
                    subscription_id: invoice.subscription,
                }
            }
        }
        _ => PaymentEvent::Unknown,
    };
    Ok((envelope.id, envelope.event_type, event))
}

/// 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    /// 没有对应的账本行
    Unmatched,
    Ignored,
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Unmatched => "unmatched",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

/// 支付回调服务
pub struct WebhookService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    ledger: Arc<SubscriptionService>,
    batches: Arc<BatchService>,
}

impl WebhookService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        ledger: Arc<SubscriptionService>,
        batches: Arc<BatchService>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            batches,
        }
    }

    /// 处理一条原始回调
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn handle(&self, payload: &[u8]) -> Result<WebhookOutcome> {
        let (event_id, event_type, event) = parse_event(payload)?;

        if !self
            .subscriptions
            .record_webhook_event(&event_id, &event_type)
            .await?
        {
            debug!(%event_id, "Duplicate webhook event skipped");
            metrics::counter!(WEBHOOK_EVENTS, "outcome" => "duplicate").increment(1);
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.dispatch(event).await {
            Ok(outcome) => {
                info!(%event_id, %event_type, outcome = outcome.label(), "Webhook event processed");
                metrics::counter!(WEBHOOK_EVENTS, "outcome" => outcome.label()).increment(1);
                Ok(outcome)
            }
            Err(e) => {
                warn!(%event_id, %event_type, error = %e, "Webhook event failed");
                metrics::counter!(WEBHOOK_EVENTS, "outcome" => "failed").increment(1);
                self.subscriptions.forget_webhook_event(&event_id).await?;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: PaymentEvent) -> Result<WebhookOutcome> {
        match event {
            PaymentEvent::SubscriptionCreated(payload) => self.on_created(payload).await,
            PaymentEvent::SubscriptionUpdated(payload) | PaymentEvent::SubscriptionDeleted(payload) => {
                self.apply(&payload.to_update()).await
            }
            PaymentEvent::InvoicePaid {
                invoice_id,
                subscription_id,
                period,
            } => {
                let Some(subscription_id) = subscription_id else {
                    debug!(%invoice_id, "Invoice without subscription ignored");
                    return Ok(WebhookOutcome::Ignored);
                };
                self.apply(&ProviderUpdate {
                    subscription_id,
                    status: SubscriptionStatus::Active,
                    current_period_start: period.map(|(start, _)| start),
                    current_period_end: period.map(|(_, end)| end),
                    cancel_at_period_end: None,
                })
                .await
            }
            PaymentEvent::InvoicePaymentFailed {
                invoice_id,
                subscription_id,
            } => {
                let Some(subscription_id) = subscription_id else {
                    return Ok(WebhookOutcome::Ignored);
                };
                warn!(%invoice_id, %subscription_id, "Invoice payment failed");
                self.apply(&ProviderUpdate {
                    subscription_id,
                    status: SubscriptionStatus::PastDue,
                    current_period_start: None,
                    current_period_end: None,
                    cancel_at_period_end: None,
                })
                .await
            }
            PaymentEvent::Unknown => Ok(WebhookOutcome::Ignored),
        }
    }

    /// 新建订阅按元数据关联到结账时写入的账本行
    async fn on_created(&self, payload: SubscriptionPayload) -> Result<WebhookOutcome> {
        if payload.metadata.get("bulk_purchase").map(String::as_str) == Some("true") {
            return self.apply(&payload.to_update()).await;
        }
        if let Some(org_sub_id) = payload.metadata_id("organization_subscription_id") {
            self.ledger
                .confirm_organization_checkout(org_sub_id, &payload.to_provider())
                .await?;
            return Ok(WebhookOutcome::Applied);
        }
        if let Some(sub_id) = payload.metadata_id("subscription_id") {
            let replace = payload.metadata_id("replace_subscription_id");
            match self
                .ledger
                .confirm_checkout(sub_id, &payload.to_provider(), replace)
                .await
            {
                Ok(_) => return Ok(WebhookOutcome::Applied),
                Err(AppError::NotFound(_)) => {
                    warn!(subscription_id = %sub_id, "Checkout metadata references a missing subscription");
                }
                Err(e) => return Err(e),
            }
        }
        self.apply(&payload.to_update()).await
    }

    async fn apply(&self, update: &ProviderUpdate) -> Result<WebhookOutcome> {
        match self.ledger.apply_provider_update(update).await? {
            ProviderUpdateResult::Applied => return Ok(WebhookOutcome::Applied),
            ProviderUpdateResult::Stale => return Ok(WebhookOutcome::Ignored),
            ProviderUpdateResult::Unmatched => {}
        }
        if self.batches.apply_provider_update(update).await? {
            return Ok(WebhookOutcome::Applied);
        }
        warn!(provider_subscription_id = %update.subscription_id, "Webhook for unknown subscription");
        Ok(WebhookOutcome::Unmatched)
    }
}
