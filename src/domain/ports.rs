use super::configuration::PaymentConfiguration;
use super::payment::{
    BankApp, ChargeResponse, DeepLinkKind, DeviceData, FinishAuthorizeResponse, InitResponse,
    PaymentId, PaymentSource, ResponseStatus, ThreeDsVersionResponse,
};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Remote acquiring API. Every call is one network round trip.
#[async_trait]
pub trait AcquiringApi: Send + Sync {
    async fn init(&self, config: &PaymentConfiguration) -> Result<InitResponse>;

    async fn check_3ds_version(
        &self,
        payment_id: PaymentId,
        source: &PaymentSource,
        config: &PaymentConfiguration,
    ) -> Result<ThreeDsVersionResponse>;

    async fn finish_authorize(
        &self,
        payment_id: PaymentId,
        source: &PaymentSource,
        config: &PaymentConfiguration,
        device_data: Option<DeviceData>,
    ) -> Result<FinishAuthorizeResponse>;

    /// Fails with `AcquiringError::ChargeRejected` when the card needs re-authorization.
    async fn charge(&self, payment_id: PaymentId, rebill_id: &str) -> Result<ChargeResponse>;

    async fn get_status(&self, payment_id: PaymentId) -> Result<ResponseStatus>;

    async fn get_deep_link(&self, payment_id: PaymentId, kind: &DeepLinkKind) -> Result<String>;

    async fn lookup_card_by_rebill_id(
        &self,
        rebill_id: &str,
        config: &PaymentConfiguration,
    ) -> Result<String>;
}

/// Probes which candidate applications can open a link on this device.
#[async_trait]
pub trait AppResolver: Send + Sync {
    async fn resolve_installed_handlers(
        &self,
        candidates: &[BankApp],
        deep_link: &str,
    ) -> Result<Vec<BankApp>>;
}

/// Collects device fingerprint data for 3-D Secure v2.
#[async_trait]
pub trait ThreeDsDataCollector: Send + Sync {
    async fn collect(&self, version: &ThreeDsVersionResponse) -> Result<DeviceData>;
}

pub type AcquiringApiRef = Arc<dyn AcquiringApi>;
pub type AppResolverRef = Arc<dyn AppResolver>;
pub type ThreeDsDataCollectorRef = Arc<dyn ThreeDsDataCollector>;
