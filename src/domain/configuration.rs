use super::payment::{PaymentId, RejectionRecord};
use crate::error::{AcquiringError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Additional-data key carrying the id of the declined recurrent payment.
pub const DATA_KEY_FAIL_SESSION: &str = "failMapiSessionId";
/// Additional-data key marking a retried recurrent charge.
pub const DATA_KEY_RECURRING_TYPE: &str = "recurringType";
/// Recurring type sent when a declined charge is re-authorized with a CVC.
pub const RECURRING_TYPE_REAUTHORIZATION: &str = "12";
/// Additional-data key that pins the 3-D Secure protocol version on init.
pub const DATA_KEY_THREE_DS_VERSION: &str = "threeDSVersion";
/// Version sent once the issuer refused 3-D Secure v2.
pub const THREE_DS_VERSION_FALLBACK: &str = "1";

/// Represents a positive order amount.
///
/// Wraps `rust_decimal::Decimal` in major currency units; the acquiring API
/// itself counts in coins (1/100 of a unit).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(AcquiringError::InvalidConfiguration(
                "Amount must be positive".to_string(),
            ))
        }
    }

    /// Builds an amount from minor units.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when `coins` is zero or above `i64::MAX`.
    pub fn from_coins(coins: u64) -> Result<Self> {
        let coins = i64::try_from(coins).map_err(|_| {
            AcquiringError::InvalidConfiguration(format!("Amount of {coins} coins is too large"))
        })?;
        Self::new(Decimal::new(coins, 2))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Amount in coins, the unit the acquiring API expects.
    pub fn coins(&self) -> i64 {
        (self.0 * Decimal::ONE_HUNDRED)
            .round()
            .try_into()
            .unwrap_or(i64::MAX)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AcquiringError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    #[default]
    No,
    Hold,
    #[serde(rename = "3DS")]
    ThreeDs,
    #[serde(rename = "3DSHOLD")]
    ThreeDsHold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub shop_code: String,
    pub amount: Amount,
    pub name: Option<String>,
    pub fee: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderOptions {
    pub order_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recurrent_payment: bool,
    /// Fiscal receipt, passed through to the API untouched.
    #[serde(default)]
    pub receipt: Option<serde_json::Value>,
    #[serde(default)]
    pub shops: Vec<Shop>,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub fail_url: Option<String>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CustomerOptions {
    #[serde(default)]
    pub customer_key: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub check_type: CheckType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeaturesOptions {
    #[serde(default)]
    pub localization: Option<String>,
    #[serde(default)]
    pub card_scanning: bool,
    #[serde(default)]
    pub theme: Option<String>,
}

/// Everything a flow needs to know about one order.
///
/// Flows only read the caller's value. Protocol markers are injected through
/// [`PaymentConfiguration::with_additional_data`], which works on a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfiguration {
    pub order: OrderOptions,
    #[serde(default)]
    pub customer: CustomerOptions,
    #[serde(default)]
    pub features: FeaturesOptions,
}

impl PaymentConfiguration {
    /// Builds a validated configuration.
    pub fn new(order: OrderOptions, customer: CustomerOptions) -> Result<Self> {
        let config = Self {
            order,
            customer,
            features: FeaturesOptions::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_features(mut self, features: FeaturesOptions) -> Self {
        self.features = features;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.order.order_id.trim().is_empty() {
            return Err(AcquiringError::InvalidConfiguration(
                "Order id must not be empty".to_string(),
            ));
        }
        if self.order.recurrent_payment && self.customer.customer_key.is_none() {
            return Err(AcquiringError::InvalidConfiguration(
                "Recurrent payment requires a customer key".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy whose customer email is replaced by `email`, when one is given.
    pub fn with_email(&self, email: Option<&str>) -> Self {
        let mut copy = self.clone();
        if let Some(email) = email {
            copy.customer.email = Some(email.to_string());
        }
        copy
    }

    /// Returns a copy with `entries` merged into the additional data.
    pub fn with_additional_data<I, K, V>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut copy = self.clone();
        copy.order
            .additional_data
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        copy
    }

    /// Copy carrying the markers for re-authorizing a declined recurrent charge.
    pub fn with_retry_markers(&self, rejection: &RejectionRecord) -> Self {
        self.with_retry_markers_for(rejection.rejected_payment_id)
    }

    pub fn with_retry_markers_for(&self, rejected_payment_id: PaymentId) -> Self {
        self.with_additional_data([
            (DATA_KEY_FAIL_SESSION, rejected_payment_id.to_string()),
            (
                DATA_KEY_RECURRING_TYPE,
                RECURRING_TYPE_REAUTHORIZATION.to_string(),
            ),
        ])
    }

    /// Copy that asks the server for a 3-D Secure v1 flow.
    pub fn with_three_ds_fallback(&self) -> Self {
        self.with_additional_data([(DATA_KEY_THREE_DS_VERSION, THREE_DS_VERSION_FALLBACK)])
    }
}
