use crate::domain::payment::{PaymentId, ResponseStatus};
use thiserror::Error;

/// API error code returned when a recurrent charge is declined and the card
/// must be re-authorized with a fresh security code.
pub const API_ERROR_CHARGE_REJECTED: &str = "104";

/// API error code returned when the issuer cannot run a 3-D Secure v2 flow.
pub const API_ERROR_THREE_DS_V2_UNSUPPORTED: &str = "106";

#[derive(Error, Debug)]
pub enum AcquiringError {
    #[error("Acquiring API error {code}: {message}")]
    Api {
        code: String,
        message: String,
        details: Option<String>,
    },
    #[error("Recurrent charge rejected for payment {rejected_payment_id}")]
    ChargeRejected {
        rejected_payment_id: PaymentId,
        card_id: Option<String>,
    },
    #[error("3-D Secure v2 is not supported for this card")]
    ThreeDsV2Unsupported,
    #[error("3-D Secure challenge failed: {0}")]
    ThreeDsFailed(String),
    #[error("Payment {payment_id} rejected with status {status}")]
    PaymentRejected {
        payment_id: PaymentId,
        status: ResponseStatus,
    },
    #[error("Status of payment {payment_id} unresolved, last status {last_status:?}")]
    StatusTimeout {
        payment_id: PaymentId,
        last_status: Option<ResponseStatus>,
    },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Protocol contract violated: {0}")]
    ContractViolation(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Scenario error: {0}")]
    Scenario(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl AcquiringError {
    /// Maps a raw API error response to its typed variant.
    ///
    /// `payment_id` and `card_id` are only consulted for the charge-rejected
    /// code, where the server echoes the declined payment.
    pub fn from_api(
        code: impl Into<String>,
        message: impl Into<String>,
        payment_id: Option<PaymentId>,
        card_id: Option<String>,
    ) -> Self {
        let code = code.into();
        match (code.as_str(), payment_id) {
            (API_ERROR_CHARGE_REJECTED, Some(rejected_payment_id)) => Self::ChargeRejected {
                rejected_payment_id,
                card_id,
            },
            (API_ERROR_THREE_DS_V2_UNSUPPORTED, _) => Self::ThreeDsV2Unsupported,
            _ => Self::Api {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    /// The API error code, when the failure came from the server.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            Self::ChargeRejected { .. } => Some(API_ERROR_CHARGE_REJECTED),
            Self::ThreeDsV2Unsupported => Some(API_ERROR_THREE_DS_V2_UNSUPPORTED),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StatusTimeout { .. })
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::ContractViolation(_) | Self::InvalidConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AcquiringError>;
