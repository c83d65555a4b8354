//! Recurrent charge by a saved card's rebill id.

use super::authorize::{Authorization, check_and_authorize, init_payment};
use super::scope::{CancelToken, TaskScope};
use super::state::{FlowState, StateCell};
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{
    AttachedCard, PaymentId, PaymentResult, PaymentSource, RejectionRecord, ThreeDsChallenge,
};
use crate::domain::ports::{AcquiringApiRef, ThreeDsDataCollectorRef};
use crate::error::{AcquiringError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Published states of a [`RecurrentChargeFlow`].
#[derive(Debug, Clone)]
pub enum RecurrentPaymentState {
    Created,
    Started {
        config: Arc<PaymentConfiguration>,
        email: Option<String>,
        payment_id: Option<PaymentId>,
    },
    /// The charge was declined; the customer must re-enter the card's CVC.
    CvcUiNeeded {
        config: Arc<PaymentConfiguration>,
        email: Option<String>,
        rejection: RejectionRecord,
    },
    CvcUiInProcess {
        config: Arc<PaymentConfiguration>,
        email: Option<String>,
        rejection: RejectionRecord,
    },
    ThreeDsUiNeeded {
        challenge: ThreeDsChallenge,
    },
    ThreeDsInProcess {
        payment_id: PaymentId,
    },
    Success(PaymentResult),
    Error {
        error: Arc<AcquiringError>,
        payment_id: Option<PaymentId>,
    },
}

impl FlowState for RecurrentPaymentState {
    fn payment_id(&self) -> Option<PaymentId> {
        match self {
            Self::Created => None,
            Self::Started { payment_id, .. } | Self::Error { payment_id, .. } => *payment_id,
            Self::CvcUiNeeded { rejection, .. } | Self::CvcUiInProcess { rejection, .. } => {
                Some(rejection.rejected_payment_id)
            }
            Self::ThreeDsUiNeeded { challenge } => Some(challenge.payment_id),
            Self::ThreeDsInProcess { payment_id } => Some(*payment_id),
            Self::Success(result) => Some(result.payment_id),
        }
    }

    fn is_final(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started { .. } => "started",
            Self::CvcUiNeeded { .. } => "cvc_ui_needed",
            Self::CvcUiInProcess { .. } => "cvc_ui_in_process",
            Self::ThreeDsUiNeeded { .. } => "three_ds_ui_needed",
            Self::ThreeDsInProcess { .. } => "three_ds_in_process",
            Self::Success(_) => "success",
            Self::Error { .. } => "error",
        }
    }
}

struct RecurrentInner {
    api: AcquiringApiRef,
    collector: ThreeDsDataCollectorRef,
    state: StateCell<RecurrentPaymentState>,
    scope: TaskScope,
}

/// Charge by a saved card, with CVC re-authorization when the bank declines.
#[derive(Clone)]
pub struct RecurrentChargeFlow {
    inner: Arc<RecurrentInner>,
}

impl RecurrentChargeFlow {
    pub fn new(api: AcquiringApiRef, collector: ThreeDsDataCollectorRef) -> Self {
        Self {
            inner: Arc::new(RecurrentInner {
                api,
                collector,
                state: StateCell::new("recurrent", RecurrentPaymentState::Created),
                scope: TaskScope::new("recurrent"),
            }),
        }
    }

    /// Latest published state.
    pub fn state(&self) -> RecurrentPaymentState {
        self.inner.state.current()
    }

    /// Receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<RecurrentPaymentState> {
        self.inner.state.subscribe()
    }

    /// Runs init then charge with the card's rebill id.
    ///
    /// # Arguments
    ///
    /// * `card` - Saved card; its rebill id is required.
    /// * `config` - Order and customer data; validated before anything runs.
    /// * `email` - Optional receipt email copied into the customer data.
    pub fn start(
        &self,
        card: AttachedCard,
        config: &PaymentConfiguration,
        email: Option<&str>,
    ) -> Result<()> {
        config.validate()?;
        let rebill_id = card.rebill_id.clone().ok_or_else(|| {
            AcquiringError::InvalidConfiguration("Recurrent charge requires a rebill id".to_string())
        })?;

        let config = Arc::new(config.with_email(email));
        let email = email.map(str::to_string);
        let started = self.inner.state.transition(|state| {
            matches!(state, RecurrentPaymentState::Created).then(|| RecurrentPaymentState::Started {
                config: config.clone(),
                email: email.clone(),
                payment_id: None,
            })
        });
        if !started {
            warn!("Recurrent charge already started");
            return Ok(());
        }

        info!(order_id = %config.order.order_id, "Starting recurrent charge");
        let inner = self.inner.clone();
        self.inner.scope.spawn(move |token| async move {
            inner.charge(token, card, rebill_id, config, email).await
        });
        Ok(())
    }

    /// Records that the CVC prompt is on screen.
    pub fn cvc_ui_shown(&self) {
        self.inner.state.transition(|state| match state {
            RecurrentPaymentState::CvcUiNeeded {
                config,
                email,
                rejection,
            } => Some(RecurrentPaymentState::CvcUiInProcess {
                config: config.clone(),
                email: email.clone(),
                rejection: rejection.clone(),
            }),
            _ => None,
        });
    }

    /// Re-authorizes the declined charge with a freshly entered CVC.
    ///
    /// Only valid while the flow waits for the CVC; a repeated call while the
    /// first one is running is ignored.
    ///
    /// # Arguments
    ///
    /// * `cvc` - Code entered by the customer.
    /// * `rebill_id` - Rebill id used to look the card up.
    /// * `rejected_payment_id` - Declined payment, sent back as a retry marker.
    /// * `config` - Order data for the new attempt; a copy gets the markers.
    /// * `email` - Optional receipt email.
    pub fn start_with_cvc(
        &self,
        cvc: &str,
        rebill_id: &str,
        rejected_payment_id: PaymentId,
        config: &PaymentConfiguration,
        email: Option<&str>,
    ) -> Result<()> {
        let claimed = self.inner.state.claim(|state| {
            matches!(
                state,
                RecurrentPaymentState::CvcUiNeeded { .. }
                    | RecurrentPaymentState::CvcUiInProcess { .. }
            )
        });
        if !claimed {
            return match self.inner.state.current() {
                RecurrentPaymentState::CvcUiNeeded { .. }
                | RecurrentPaymentState::CvcUiInProcess { .. } => {
                    warn!(rejected_payment_id = %rejected_payment_id, "Re-authorization already running");
                    Ok(())
                }
                other => Err(AcquiringError::ContractViolation(format!(
                    "start_with_cvc called in state {}",
                    other.name()
                ))),
            };
        }

        let config = config
            .with_email(email)
            .with_retry_markers_for(rejected_payment_id);
        info!(rejected_payment_id = %rejected_payment_id, "Re-authorizing declined charge");

        let inner = self.inner.clone();
        let cvc = cvc.to_string();
        let rebill_id = rebill_id.to_string();
        self.inner.scope.spawn(move |token| async move {
            inner.reauthorize(token, cvc, rebill_id, config).await
        });
        Ok(())
    }

    /// Records that the host is presenting the challenge.
    pub fn go_to_3ds(&self) {
        self.inner.state.transition(|state| match state {
            RecurrentPaymentState::ThreeDsUiNeeded { challenge } => {
                Some(RecurrentPaymentState::ThreeDsInProcess {
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
                RecurrentPaymentState::ThreeDsUiNeeded { challenge } => challenge.payment_id,
                RecurrentPaymentState::ThreeDsInProcess { payment_id } => *payment_id,
                _ => return None,
            };
            Some(match result {
                Ok(outcome) => RecurrentPaymentState::Success(outcome),
                Err(error) => RecurrentPaymentState::Error {
                    error: Arc::new(error),
                    payment_id: Some(payment_id),
                },
            })
        });
    }

    /// Cancels in-flight work, including a pending charge. Published states
    /// stay as they are.
    pub fn stop(&self) {
        info!(payment_id = ?self.inner.state.current().payment_id(), "Stopping recurrent charge");
        self.inner.scope.cancel();
    }
}

impl RecurrentInner {
    async fn charge(
        &self,
        token: CancelToken,
        card: AttachedCard,
        rebill_id: String,
        config: Arc<PaymentConfiguration>,
        email: Option<String>,
    ) {
        let mut payment_id = None;
        let outcome: Result<PaymentResult> = async {
            let id = init_payment(self.api.as_ref(), &token, &config).await?;
            payment_id = Some(id);
            self.state.publish_from(
                &token,
                RecurrentPaymentState::Started {
                    config: config.clone(),
                    email: email.clone(),
                    payment_id: Some(id),
                },
            );

            let response = token.run(self.api.charge(id, &rebill_id)).await?;
            Ok(PaymentResult {
                payment_id: response.payment_id.unwrap_or(id),
                card_id: response.card_id.or(card.card_id),
                rebill_id: Some(rebill_id.clone()),
            })
        }
        .await;

        let next = match outcome {
            Ok(result) => {
                info!(payment_id = %result.payment_id, "Recurrent charge succeeded");
                RecurrentPaymentState::Success(result)
            }
            Err(AcquiringError::Cancelled) => return,
            Err(AcquiringError::ChargeRejected {
                rejected_payment_id,
                card_id,
            }) => {
                info!(rejected_payment_id = %rejected_payment_id, "Charge rejected, CVC required");
                RecurrentPaymentState::CvcUiNeeded {
                    config,
                    email,
                    rejection: RejectionRecord {
                        rejected_payment_id,
                        card_id,
                    },
                }
            }
            Err(err) => {
                warn!(payment_id = ?payment_id, error = %err, "Recurrent charge failed");
                RecurrentPaymentState::Error {
                    error: Arc::new(err),
                    payment_id,
                }
            }
        };
        self.state.publish_from(&token, next);
    }

    async fn reauthorize(
        &self,
        token: CancelToken,
        cvc: String,
        rebill_id: String,
        config: PaymentConfiguration,
    ) {
        let mut payment_id = None;
        let outcome: Result<Authorization> = async {
            let card_id = token
                .run(self.api.lookup_card_by_rebill_id(&rebill_id, &config))
                .await?;
            let source = PaymentSource::Attached(AttachedCard {
                card_id: Some(card_id),
                rebill_id: None,
                cvc: Some(cvc),
            });

            let id = init_payment(self.api.as_ref(), &token, &config).await?;
            payment_id = Some(id);
            self.state.publish_from(
                &token,
                RecurrentPaymentState::Started {
                    config: Arc::new(config.clone()),
                    email: config.customer.email.clone(),
                    payment_id: Some(id),
                },
            );

            check_and_authorize(
                self.api.as_ref(),
                self.collector.as_ref(),
                &token,
                id,
                &source,
                &config,
            )
            .await
        }
        .await;

        let next = match outcome {
            Ok(Authorization::Completed(result)) => {
                info!(payment_id = %result.payment_id, "Re-authorized charge succeeded");
                RecurrentPaymentState::Success(result)
            }
            Ok(Authorization::Challenge(challenge)) => {
                RecurrentPaymentState::ThreeDsUiNeeded { challenge }
            }
            Err(AcquiringError::Cancelled) => return,
            Err(err) => {
                warn!(payment_id = ?payment_id, error = %err, "Re-authorization failed");
                RecurrentPaymentState::Error {
                    error: Arc::new(err),
                    payment_id,
                }
            }
        };
        self.state.publish_from(&token, next);
    }
}
