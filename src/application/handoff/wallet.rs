use super::HandoffMethod;
use crate::application::poller::PollingBudget;
use crate::application::scope::CancelToken;
use crate::domain::payment::{DeepLinkKind, PaymentId};
use crate::domain::ports::AcquiringApi;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub const WALLET_POLLING_RETRIES: u32 = 10;
pub const WALLET_POLLING_DELAY: Duration = Duration::from_secs(3);

/// Wallet reached through a versioned deep link.
pub struct DeepLinkWalletMethod {
    version: String,
    budget: PollingBudget,
}

impl DeepLinkWalletMethod {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            budget: PollingBudget::new(WALLET_POLLING_RETRIES, WALLET_POLLING_DELAY),
        }
    }

    pub fn with_budget(mut self, budget: PollingBudget) -> Self {
        self.budget = budget;
        self
    }
}

#[async_trait]
impl HandoffMethod for DeepLinkWalletMethod {
    type Target = String;

    fn name(&self) -> &'static str {
        "deep_link_wallet"
    }

    fn polling_budget(&self) -> PollingBudget {
        self.budget
    }

    async fn prepare(
        &self,
        api: &dyn AcquiringApi,
        token: &CancelToken,
        payment_id: PaymentId,
    ) -> Result<String> {
        let kind = DeepLinkKind::DeepLinkWallet {
            version: self.version.clone(),
        };
        token.run(api.get_deep_link(payment_id, &kind)).await
    }
}

/// NFC wallet application opened by its own link.
pub struct AppWalletMethod {
    budget: PollingBudget,
}

impl AppWalletMethod {
    pub fn new() -> Self {
        Self {
            budget: PollingBudget::new(WALLET_POLLING_RETRIES, WALLET_POLLING_DELAY),
        }
    }

    pub fn with_budget(mut self, budget: PollingBudget) -> Self {
        self.budget = budget;
        self
    }
}

impl Default for AppWalletMethod {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandoffMethod for AppWalletMethod {
    type Target = String;

    fn name(&self) -> &'static str {
        "app_wallet"
    }

    fn polling_budget(&self) -> PollingBudget {
        self.budget
    }

    async fn prepare(
        &self,
        api: &dyn AcquiringApi,
        token: &CancelToken,
        payment_id: PaymentId,
    ) -> Result<String> {
        token
            .run(api.get_deep_link(payment_id, &DeepLinkKind::AppWallet))
            .await
    }
}
