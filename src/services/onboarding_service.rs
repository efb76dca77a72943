//! 新用户开通：个人组织和终端席位

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::organization_service::OrganizationService;
use super::Providers;
use crate::{error::Result, models::organization::Organization, providers::UserRecord};

/// 开通结果
#[derive(Debug, Clone, Serialize)]
pub struct OnboardingReport {
    pub organization: Organization,
    /// 终端服务开通失败时为 false，不影响用户创建
    pub seat_provisioned: bool,
}

pub struct OnboardingService {
    organizations: Arc<OrganizationService>,
    providers: Providers,
}

impl OnboardingService {
    pub fn new(organizations: Arc<OrganizationService>, providers: Providers) -> Self {
        Self {
            organizations,
            providers,
        }
    }

    /// 用户创建后的钩子，可重复调用
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn on_user_created(&self, user: &UserRecord) -> Result<OnboardingReport> {
        let organization = self.organizations.create_personal_org(&user.id).await?;

        let seat_provisioned = match self.providers.provisioner.provision_user(user).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Terminal seat provisioning failed");
                false
            }
        };

        info!(org_id = %organization.id, seat_provisioned, "User onboarded");
        Ok(OnboardingReport {
            organization,
            seat_provisioned,
        })
    }
}
