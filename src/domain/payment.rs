use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Server-assigned identifier of one payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub i64);

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment status as reported by the acquiring server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseStatus {
    New,
    FormShowed,
    Authorizing,
    ThreeDsChecking,
    ThreeDsChecked,
    Authorized,
    Confirming,
    Confirmed,
    Reversing,
    Reversed,
    Refunding,
    PartialRefunded,
    Refunded,
    Rejected,
    DeadlineExpired,
    Canceled,
    Unknown(String),
}

impl ResponseStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "NEW",
            Self::FormShowed => "FORM_SHOWED",
            Self::Authorizing => "AUTHORIZING",
            Self::ThreeDsChecking => "3DS_CHECKING",
            Self::ThreeDsChecked => "3DS_CHECKED",
            Self::Authorized => "AUTHORIZED",
            Self::Confirming => "CONFIRMING",
            Self::Confirmed => "CONFIRMED",
            Self::Reversing => "REVERSING",
            Self::Reversed => "REVERSED",
            Self::Refunding => "REFUNDING",
            Self::PartialRefunded => "PARTIAL_REFUNDED",
            Self::Refunded => "REFUNDED",
            Self::Rejected => "REJECTED",
            Self::DeadlineExpired => "DEADLINE_EXPIRED",
            Self::Canceled => "CANCELED",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Authorized | Self::Confirmed)
    }
}

impl From<String> for ResponseStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "NEW" => Self::New,
            "FORM_SHOWED" => Self::FormShowed,
            "AUTHORIZING" => Self::Authorizing,
            "3DS_CHECKING" => Self::ThreeDsChecking,
            "3DS_CHECKED" => Self::ThreeDsChecked,
            "AUTHORIZED" => Self::Authorized,
            "CONFIRMING" => Self::Confirming,
            "CONFIRMED" => Self::Confirmed,
            "REVERSING" => Self::Reversing,
            "REVERSED" => Self::Reversed,
            "REFUNDING" => Self::Refunding,
            "PARTIAL_REFUNDED" => Self::PartialRefunded,
            "REFUNDED" => Self::Refunded,
            "REJECTED" => Self::Rejected,
            "DEADLINE_EXPIRED" => Self::DeadlineExpired,
            "CANCELED" => Self::Canceled,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<ResponseStatus> for String {
    fn from(status: ResponseStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Card details typed in by the customer.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CardData {
    pub pan: String,
    pub expiry: String,
    pub cvc: String,
}

impl fmt::Debug for CardData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self
            .pan
            .get(self.pan.len().saturating_sub(4)..)
            .unwrap_or_default();
        f.debug_struct("CardData")
            .field("pan", &format_args!("****{tail}"))
            .field("expiry", &self.expiry)
            .field("cvc", &"***")
            .finish()
    }
}

/// A card already bound to the customer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttachedCard {
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub rebill_id: Option<String>,
    #[serde(default)]
    pub cvc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentSource {
    Card(CardData),
    Attached(AttachedCard),
    /// Opaque token issued by a wallet provider.
    WalletToken { token: String },
}

impl PaymentSource {
    /// Rebill id of an attached card, which routes the payment through `charge`.
    pub fn rebill_id(&self) -> Option<&str> {
        match self {
            Self::Attached(card) => card.rebill_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InitResponse {
    pub payment_id: Option<PaymentId>,
    #[serde(default)]
    pub status: Option<ResponseStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeDsVersionResponse {
    pub version: String,
    #[serde(default)]
    pub server_trans_id: Option<String>,
    #[serde(default)]
    pub three_ds_method_url: Option<String>,
    #[serde(default)]
    pub payment_system: Option<String>,
}

impl ThreeDsVersionResponse {
    pub fn is_v2(&self) -> bool {
        self.version.starts_with('2')
    }
}

/// Device data gathered for a 3-D Secure v2 authentication.
pub type DeviceData = HashMap<String, String>;

/// Material for the issuer's 3-D Secure challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeDsChallenge {
    pub payment_id: PaymentId,
    pub acs_url: String,
    pub version: String,
    #[serde(default)]
    pub tds_server_trans_id: Option<String>,
    #[serde(default)]
    pub acs_trans_id: Option<String>,
    #[serde(default)]
    pub pa_req: Option<String>,
    #[serde(default)]
    pub md: Option<String>,
}

impl ThreeDsChallenge {
    pub fn is_v2(&self) -> bool {
        self.version.starts_with('2')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishAuthorizeResponse {
    pub payment_id: Option<PaymentId>,
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub rebill_id: Option<String>,
    #[serde(default)]
    pub status: Option<ResponseStatus>,
    #[serde(default)]
    pub three_ds: Option<ThreeDsChallenge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub payment_id: Option<PaymentId>,
    #[serde(default)]
    pub card_id: Option<String>,
}

/// Kind of hand-off link requested from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeepLinkKind {
    /// SBP (Faster Payments System) payment link.
    Sbp,
    /// Link into the deep-link wallet, for a given protocol version.
    DeepLinkWallet { version: String },
    /// Link into the NFC wallet application.
    AppWallet,
}

/// Outcome of a completed payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResult {
    pub payment_id: PaymentId,
    pub card_id: Option<String>,
    pub rebill_id: Option<String>,
}

/// A recurrent charge declined with the charge-rejected error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub rejected_payment_id: PaymentId,
    pub card_id: Option<String>,
}

/// An external application able to open a hand-off link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BankApp {
    pub name: String,
    pub package_name: String,
    /// URL scheme the app registers for.
    pub scheme: String,
}
