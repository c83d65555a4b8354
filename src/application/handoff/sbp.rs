use super::HandoffMethod;
use crate::application::poller::PollingBudget;
use crate::application::scope::CancelToken;
use crate::domain::payment::{BankApp, DeepLinkKind, PaymentId};
use crate::domain::ports::{AcquiringApi, AppResolverRef};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const SBP_POLLING_RETRIES: u32 = 10;
pub const SBP_POLLING_DELAY: Duration = Duration::from_secs(5);

/// SBP bank transfer: the customer picks one of the installed bank apps.
pub struct SbpMethod {
    resolver: AppResolverRef,
    candidates: Vec<BankApp>,
    budget: PollingBudget,
}

impl SbpMethod {
    pub fn new(resolver: AppResolverRef, candidates: Vec<BankApp>) -> Self {
        Self {
            resolver,
            candidates,
            budget: PollingBudget::new(SBP_POLLING_RETRIES, SBP_POLLING_DELAY),
        }
    }

    pub fn with_budget(mut self, budget: PollingBudget) -> Self {
        self.budget = budget;
        self
    }
}

/// SBP link plus the bank apps able to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbpTarget {
    pub deep_link: String,
    pub banks: Vec<BankApp>,
}

#[async_trait]
impl HandoffMethod for SbpMethod {
    type Target = SbpTarget;

    fn name(&self) -> &'static str {
        "sbp"
    }

    fn polling_budget(&self) -> PollingBudget {
        self.budget
    }

    async fn prepare(
        &self,
        api: &dyn AcquiringApi,
        token: &CancelToken,
        payment_id: PaymentId,
    ) -> Result<SbpTarget> {
        let deep_link = token
            .run(api.get_deep_link(payment_id, &DeepLinkKind::Sbp))
            .await?;
        let banks = token
            .run(
                self.resolver
                    .resolve_installed_handlers(&self.candidates, &deep_link),
            )
            .await?;
        debug!(payment_id = %payment_id, banks = banks.len(), "Resolved SBP bank apps");
        Ok(SbpTarget { deep_link, banks })
    }
}
