//! Card payment flow.
//!
//! A fresh or attached card goes through init, the 3-D Secure version check
//! and finish-authorize. The flow also serves a recurrent charge that was
//! declined and needs the card's CVC re-entered.

use super::authorize::{Authorization, check_and_authorize, init_payment};
use super::scope::{CancelToken, TaskScope};
use super::state::{FlowState, StateCell};
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{
    PaymentId, PaymentResult, PaymentSource, RejectionRecord, ThreeDsChallenge,
};
use crate::domain::ports::{AcquiringApiRef, ThreeDsDataCollectorRef};
use crate::error::{AcquiringError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Published states of a [`CardPaymentFlow`].
#[derive(Debug, Clone)]
pub enum CardPaymentState {
    Created,
    Started {
        payment_id: PaymentId,
    },
    ThreeDsUiNeeded {
        challenge: ThreeDsChallenge,
    },
    ThreeDsInProcess {
        payment_id: PaymentId,
    },
    /// The flow is reused for a declined recurrent charge and waits for a CVC.
    CvcUiNeeded {
        config: Arc<PaymentConfiguration>,
        rejection: RejectionRecord,
    },
    CvcUiInProcess {
        config: Arc<PaymentConfiguration>,
        rejection: RejectionRecord,
    },
    Success(PaymentResult),
    Error {
        error: Arc<AcquiringError>,
        payment_id: Option<PaymentId>,
    },
}

impl FlowState for CardPaymentState {
    fn payment_id(&self) -> Option<PaymentId> {
        match self {
            Self::Created => None,
            Self::Started { payment_id } | Self::ThreeDsInProcess { payment_id } => {
                Some(*payment_id)
            }
            Self::ThreeDsUiNeeded { challenge } => Some(challenge.payment_id),
            Self::CvcUiNeeded { rejection, .. } | Self::CvcUiInProcess { rejection, .. } => {
                Some(rejection.rejected_payment_id)
            }
            Self::Success(result) => Some(result.payment_id),
            Self::Error { payment_id, .. } => *payment_id,
        }
    }

    fn is_final(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started { .. } => "started",
            Self::ThreeDsUiNeeded { .. } => "three_ds_ui_needed",
            Self::ThreeDsInProcess { .. } => "three_ds_in_process",
            Self::CvcUiNeeded { .. } => "cvc_ui_needed",
            Self::CvcUiInProcess { .. } => "cvc_ui_in_process",
            Self::Success(_) => "success",
            Self::Error { .. } => "error",
        }
    }
}

struct CardInner {
    api: AcquiringApiRef,
    collector: ThreeDsDataCollectorRef,
    state: StateCell<CardPaymentState>,
    scope: TaskScope,
}

/// Card payment: init, 3DS version check, finish-authorize.
///
/// A "3DS v2 not supported" answer ends the flow with `Error`; only the
/// generic process retries it.
#[derive(Clone)]
pub struct CardPaymentFlow {
    inner: Arc<CardInner>,
}

impl CardPaymentFlow {
    pub fn new(api: AcquiringApiRef, collector: ThreeDsDataCollectorRef) -> Self {
        Self {
            inner: Arc::new(CardInner {
                api,
                collector,
                state: StateCell::new("card", CardPaymentState::Created),
                scope: TaskScope::new("card"),
            }),
        }
    }

    /// Latest published state.
    pub fn state(&self) -> CardPaymentState {
        self.inner.state.current()
    }

    /// Receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<CardPaymentState> {
        self.inner.state.subscribe()
    }

    /// Starts paying with `source`.
    ///
    /// Only the first call from `Created` (or from the CVC prompt) runs a
    /// payment; later calls are ignored. When the flow waits for a CVC after
    /// a declined recurrent charge, the retry markers are added to a copy of
    /// `config`.
    ///
    /// # Arguments
    ///
    /// * `source` - Card to pay with.
    /// * `config` - Order and customer data; validated before anything runs.
    /// * `email` - Optional receipt email copied into the customer data.
    pub fn start(
        &self,
        source: PaymentSource,
        config: &PaymentConfiguration,
        email: Option<&str>,
    ) -> Result<()> {
        config.validate()?;
        let mut rejected = None;
        let claimed = self.inner.state.claim(|state| match state {
            CardPaymentState::Created => true,
            CardPaymentState::CvcUiNeeded { rejection, .. }
            | CardPaymentState::CvcUiInProcess { rejection, .. } => {
                rejected = Some(rejection.clone());
                true
            }
            _ => false,
        });
        if !claimed {
            warn!(state = self.inner.state.current().name(), "Card payment already started");
            return Ok(());
        }

        let mut config = config.with_email(email);
        if let Some(rejection) = rejected {
            config = config.with_retry_markers(&rejection);
        }
        info!(order_id = %config.order.order_id, "Starting card payment");
        let inner = self.inner.clone();
        self.inner
            .scope
            .spawn(move |token| async move { inner.run(token, source, config).await });
        Ok(())
    }

    /// Switches a fresh flow to the declined-recurrent variant and asks for a
    /// CVC. Ignored once the flow has left `Created`.
    pub fn request_cvc(&self, config: &PaymentConfiguration, rejection: RejectionRecord) {
        self.inner.state.transition(|state| {
            matches!(state, CardPaymentState::Created).then(|| CardPaymentState::CvcUiNeeded {
                config: Arc::new(config.clone()),
                rejection,
            })
        });
    }

    /// Records that the CVC prompt is on screen.
    pub fn cvc_ui_shown(&self) {
        self.inner.state.transition(|state| match state {
            CardPaymentState::CvcUiNeeded { config, rejection } => {
                Some(CardPaymentState::CvcUiInProcess {
                    config: config.clone(),
                    rejection: rejection.clone(),
                })
            }
            _ => None,
        });
    }

    /// Records that the host is presenting the challenge.
    pub fn go_to_3ds(&self) {
        self.inner.state.transition(|state| match state {
            CardPaymentState::ThreeDsUiNeeded { challenge } => {
                Some(CardPaymentState::ThreeDsInProcess {
                    payment_id: challenge.payment_id,
                })
            }
            _ => None,
        });
    }

    /// Completes the flow from the challenge outcome.
    pub fn set_3ds_result(&self, result: std::result::Result<PaymentResult, AcquiringError>) {
        self.inner.state.transition(|state| {
            let payment_id = match state {
                CardPaymentState::ThreeDsUiNeeded { challenge } => challenge.payment_id,
                CardPaymentState::ThreeDsInProcess { payment_id } => *payment_id,
                _ => return None,
            };
            Some(match result {
                Ok(outcome) => CardPaymentState::Success(outcome),
                Err(error) => CardPaymentState::Error {
                    error: Arc::new(error),
                    payment_id: Some(payment_id),
                },
            })
        });
    }

    /// Cancels in-flight work. Published states stay as they are.
    pub fn stop(&self) {
        info!(payment_id = ?self.inner.state.current().payment_id(), "Stopping card payment");
        self.inner.scope.cancel();
    }
}

impl CardInner {
    async fn run(&self, token: CancelToken, source: PaymentSource, config: PaymentConfiguration) {
        let mut payment_id = None;
        let outcome = self
            .authorize(&token, &source, &config, &mut payment_id)
            .await;

        let next = match outcome {
            Ok(Authorization::Completed(result)) => {
                info!(payment_id = %result.payment_id, "Card payment succeeded");
                CardPaymentState::Success(result)
            }
            Ok(Authorization::Challenge(challenge)) => {
                CardPaymentState::ThreeDsUiNeeded { challenge }
            }
            Err(AcquiringError::Cancelled) => return,
            Err(err) => {
                if err.is_contract_violation() {
                    error!(error = %err, "Card payment aborted");
                } else {
                    warn!(payment_id = ?payment_id, error = %err, "Card payment failed");
                }
                CardPaymentState::Error {
                    error: Arc::new(err),
                    payment_id,
                }
            }
        };
        self.state.publish_from(&token, next);
    }

    async fn authorize(
        &self,
        token: &CancelToken,
        source: &PaymentSource,
        config: &PaymentConfiguration,
        payment_id: &mut Option<PaymentId>,
    ) -> Result<Authorization> {
        let id = init_payment(self.api.as_ref(), token, config).await?;
        *payment_id = Some(id);
        self.state
            .publish_from(token, CardPaymentState::Started { payment_id: id });

        check_and_authorize(
            self.api.as_ref(),
            self.collector.as_ref(),
            token,
            id,
            source,
            config,
        )
        .await
    }
}
