//! Network steps shared by the card-shaped flows.

use super::scope::CancelToken;
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{PaymentId, PaymentResult, PaymentSource, ThreeDsChallenge};
use crate::domain::ports::{AcquiringApi, ThreeDsDataCollector};
use crate::error::{AcquiringError, Result};
use tracing::{debug, error};

/// Result of a finish-authorize round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Completed(PaymentResult),
    Challenge(ThreeDsChallenge),
}

/// Calls init and insists on a payment id.
pub async fn init_payment(
    api: &dyn AcquiringApi,
    token: &CancelToken,
    config: &PaymentConfiguration,
) -> Result<PaymentId> {
    let response = token.run(api.init(config)).await?;
    response.payment_id.ok_or_else(|| {
        error!(order_id = %config.order.order_id, "Init succeeded without a payment id");
        AcquiringError::ContractViolation("init returned no payment id".to_string())
    })
}

/// Runs the 3DS version check, collects device data for v2, then finishes
/// authorization.
pub async fn check_and_authorize(
    api: &dyn AcquiringApi,
    collector: &dyn ThreeDsDataCollector,
    token: &CancelToken,
    payment_id: PaymentId,
    source: &PaymentSource,
    config: &PaymentConfiguration,
) -> Result<Authorization> {
    let version = token
        .run(api.check_3ds_version(payment_id, source, config))
        .await?;
    debug!(payment_id = %payment_id, version = %version.version, "3DS version checked");

    let device_data = if version.is_v2() {
        Some(token.run(collector.collect(&version)).await?)
    } else {
        None
    };
    finish_authorize(api, token, payment_id, source, config, device_data).await
}

pub async fn finish_authorize(
    api: &dyn AcquiringApi,
    token: &CancelToken,
    payment_id: PaymentId,
    source: &PaymentSource,
    config: &PaymentConfiguration,
    device_data: Option<crate::domain::payment::DeviceData>,
) -> Result<Authorization> {
    let response = token
        .run(api.finish_authorize(payment_id, source, config, device_data))
        .await?;

    Ok(match response.three_ds {
        Some(challenge) => {
            debug!(payment_id = %payment_id, version = %challenge.version, "Issuer requires a 3DS challenge");
            Authorization::Challenge(challenge)
        }
        None => Authorization::Completed(PaymentResult {
            payment_id: response.payment_id.unwrap_or(payment_id),
            card_id: response.card_id,
            rebill_id: response.rebill_id,
        }),
    })
}
