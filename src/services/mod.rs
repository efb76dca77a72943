//! Business logic services layer

pub mod batch_service;
pub mod entitlement_resolver;
pub mod group_service;
pub mod onboarding_service;
pub mod organization_service;
pub mod permission_service;
pub mod plan_catalog;
pub mod policy_store;
pub mod subscription_service;
pub mod usage_service;
pub mod webhook_service;

pub use batch_service::BatchService;
pub use entitlement_resolver::EntitlementResolver;
pub use group_service::GroupService;
pub use onboarding_service::OnboardingService;
pub use organization_service::OrganizationService;
pub use permission_service::PermissionService;
pub use plan_catalog::{PlanCatalog, PlanLookup};
pub use policy_store::PolicyStore;
pub use subscription_service::SubscriptionService;
pub use usage_service::UsageService;
pub use webhook_service::WebhookService;

use std::sync::Arc;

use crate::providers::{IdentityProvider, PaymentProvider, SeatProvisioner};

/// 外部协作方
#[derive(Clone)]
pub struct Providers {
    pub payment: Arc<dyn PaymentProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub provisioner: Arc<dyn SeatProvisioner>,
}
