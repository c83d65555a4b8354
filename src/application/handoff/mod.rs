//! Flows that hand control to an external application and poll the payment
//! status once the customer comes back.
//!
//! SBP and both wallet methods share one state machine; a [`HandoffMethod`]
//! supplies what differs between them: the hand-off target and the polling
//! budget.

pub mod sbp;
pub mod wallet;

use super::authorize::init_payment;
use super::poller::{PollEvent, PollVerdict, PollingBudget, StatusPoller};
use super::scope::{CancelToken, TaskScope};
use super::state::{FlowState, StateCell};
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{PaymentId, ResponseStatus};
use crate::domain::ports::{AcquiringApi, AcquiringApiRef};
use crate::error::{AcquiringError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use sbp::SbpMethod;
pub use wallet::{AppWalletMethod, DeepLinkWalletMethod};

/// Method-specific part of a hand-off flow.
#[async_trait]
pub trait HandoffMethod: Send + Sync + 'static {
    /// What the host shows the customer before leaving the app.
    type Target: Clone + Debug + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn polling_budget(&self) -> PollingBudget;

    /// Fetches the hand-off artifact for an initialized payment.
    async fn prepare(
        &self,
        api: &dyn AcquiringApi,
        token: &CancelToken,
        payment_id: PaymentId,
    ) -> Result<Self::Target>;
}

#[derive(Debug, Clone)]
pub enum HandoffState<T> {
    Created,
    Started {
        payment_id: PaymentId,
    },
    NeedChooseOnUi {
        payment_id: PaymentId,
        target: T,
    },
    LeaveOnBankApp {
        payment_id: PaymentId,
    },
    CheckingStatus {
        payment_id: PaymentId,
        status: Option<ResponseStatus>,
    },
    Success {
        payment_id: PaymentId,
        card_id: Option<String>,
        rebill_id: Option<String>,
    },
    PaymentFailed {
        payment_id: Option<PaymentId>,
        cause: Arc<AcquiringError>,
        error_code: Option<String>,
    },
    Stopped {
        payment_id: Option<PaymentId>,
    },
}

impl<T> HandoffState<T> {
    fn failed(payment_id: Option<PaymentId>, cause: AcquiringError) -> Self {
        Self::PaymentFailed {
            payment_id,
            error_code: cause.error_code().map(str::to_string),
            cause: Arc::new(cause),
        }
    }
}

impl<T: Clone + Debug + Send + Sync + 'static> FlowState for HandoffState<T> {
    fn payment_id(&self) -> Option<PaymentId> {
        match self {
            Self::Created => None,
            Self::Started { payment_id }
            | Self::NeedChooseOnUi { payment_id, .. }
            | Self::LeaveOnBankApp { payment_id }
            | Self::CheckingStatus { payment_id, .. }
            | Self::Success { payment_id, .. } => Some(*payment_id),
            Self::PaymentFailed { payment_id, .. } | Self::Stopped { payment_id } => *payment_id,
        }
    }

    fn is_final(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::PaymentFailed { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started { .. } => "started",
            Self::NeedChooseOnUi { .. } => "need_choose_on_ui",
            Self::LeaveOnBankApp { .. } => "leave_on_bank_app",
            Self::CheckingStatus { .. } => "checking_status",
            Self::Success { .. } => "success",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::Stopped { .. } => "stopped",
        }
    }
}

struct HandoffInner<M: HandoffMethod> {
    api: AcquiringApiRef,
    method: M,
    state: StateCell<HandoffState<M::Target>>,
    scope: TaskScope,
}

/// One payment attempt through an external application.
pub struct HandoffFlow<M: HandoffMethod> {
    inner: Arc<HandoffInner<M>>,
}

impl<M: HandoffMethod> Clone for HandoffFlow<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub type SbpPaymentFlow = HandoffFlow<SbpMethod>;
pub type DeepLinkWalletFlow = HandoffFlow<DeepLinkWalletMethod>;
pub type AppWalletFlow = HandoffFlow<AppWalletMethod>;

impl<M: HandoffMethod> HandoffFlow<M> {
    pub fn new(api: AcquiringApiRef, method: M) -> Self {
        let name = method.name();
        Self {
            inner: Arc::new(HandoffInner {
                api,
                method,
                state: StateCell::new(name, HandoffState::Created),
                scope: TaskScope::new(name),
            }),
        }
    }

    pub fn method(&self) -> &M {
        &self.inner.method
    }

    pub fn state(&self) -> HandoffState<M::Target> {
        self.inner.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<HandoffState<M::Target>> {
        self.inner.state.subscribe()
    }

    /// Initializes the payment (unless `payment_id` is given) and fetches the
    /// hand-off target.
    ///
    /// Only the first call from `Created` runs; later calls are ignored.
    pub fn start(
        &self,
        config: &PaymentConfiguration,
        payment_id: Option<PaymentId>,
    ) -> Result<()> {
        config.validate()?;
        if !self
            .inner
            .state
            .claim(|state| matches!(state, HandoffState::Created))
        {
            warn!(
                method = self.inner.method.name(),
                state = self.inner.state.current().name(),
                "Hand-off payment already started"
            );
            return Ok(());
        }
        let config = config.clone();
        info!(
            method = self.inner.method.name(),
            order_id = %config.order.order_id,
            payment_id = ?payment_id,
            "Starting hand-off payment"
        );
        let inner = self.inner.clone();
        self.inner
            .scope
            .spawn(move |token| async move { inner.prepare(token, config, payment_id).await });
        Ok(())
    }

    /// Records that control goes to the external application.
    pub fn going_to_bank_app(&self) {
        self.inner.state.transition(|state| match state {
            HandoffState::NeedChooseOnUi { payment_id, .. } => {
                Some(HandoffState::LeaveOnBankApp {
                    payment_id: *payment_id,
                })
            }
            HandoffState::Stopped {
                payment_id: Some(payment_id),
            } => Some(HandoffState::LeaveOnBankApp {
                payment_id: *payment_id,
            }),
            _ => None,
        });
    }

    /// Polls the payment status after the customer returned.
    ///
    /// Only valid from `LeaveOnBankApp`; a running poll is cancelled first.
    pub fn start_checking_status(&self, retries: Option<u32>) {
        let payment_id = match self.inner.state.current() {
            HandoffState::LeaveOnBankApp { payment_id } => payment_id,
            other => {
                debug!(
                    method = self.inner.method.name(),
                    state = other.name(),
                    "Status check ignored"
                );
                return;
            }
        };

        let mut budget = self.inner.method.polling_budget();
        if let Some(retries) = retries {
            budget = budget.with_retries(retries);
        }
        let inner = self.inner.clone();
        self.inner.scope.spawn_replacing(move |token| async move {
            inner.check_status(token, payment_id, budget).await
        });
    }

    /// Whether a status poll is running.
    pub fn is_polling(&self) -> bool {
        self.inner.scope.has_replaceable()
    }

    /// Cancels every task of the flow, then publishes `Stopped`.
    pub fn stop(&self) {
        self.inner.scope.cancel();
        let stopped = self.inner.state.transition(|state| {
            Some(HandoffState::Stopped {
                payment_id: state.payment_id(),
            })
        });
        if stopped {
            info!(
                method = self.inner.method.name(),
                payment_id = ?self.inner.state.current().payment_id(),
                "Hand-off payment stopped"
            );
        }
    }
}

impl<M: HandoffMethod> HandoffInner<M> {
    async fn prepare(
        &self,
        token: CancelToken,
        config: PaymentConfiguration,
        existing: Option<PaymentId>,
    ) {
        let mut payment_id = existing;
        let outcome: Result<HandoffState<M::Target>> = async {
            let id = match existing {
                Some(id) => id,
                None => init_payment(self.api.as_ref(), &token, &config).await?,
            };
            payment_id = Some(id);
            self.state
                .publish_from(&token, HandoffState::Started { payment_id: id });

            let target = self.method.prepare(self.api.as_ref(), &token, id).await?;
            Ok(HandoffState::NeedChooseOnUi {
                payment_id: id,
                target,
            })
        }
        .await;

        let next = match outcome {
            Ok(next) => next,
            Err(AcquiringError::Cancelled) => return,
            Err(err) => {
                warn!(method = self.method.name(), payment_id = ?payment_id, error = %err, "Hand-off preparation failed");
                HandoffState::failed(payment_id, err)
            }
        };
        self.state.publish_from(&token, next);
    }

    async fn check_status(&self, token: CancelToken, payment_id: PaymentId, budget: PollingBudget) {
        let poller = StatusPoller::new(self.api.clone());
        let mut events = Box::pin(poller.poll(payment_id, budget));

        loop {
            let event = match token.run(async { Ok(events.next().await) }).await {
                Ok(Some(event)) => event,
                _ => return,
            };

            let next = match event {
                Ok(PollEvent::Checking(status)) => HandoffState::CheckingStatus {
                    payment_id,
                    status: Some(status),
                },
                Ok(PollEvent::Finished(PollVerdict::Success(_))) => HandoffState::Success {
                    payment_id,
                    card_id: None,
                    rebill_id: None,
                },
                Ok(PollEvent::Finished(PollVerdict::Rejected(status))) => HandoffState::failed(
                    Some(payment_id),
                    AcquiringError::PaymentRejected { payment_id, status },
                ),
                Ok(PollEvent::Finished(PollVerdict::TimedOut { last_status })) => {
                    HandoffState::failed(
                        Some(payment_id),
                        AcquiringError::StatusTimeout {
                            payment_id,
                            last_status,
                        },
                    )
                }
                Err(AcquiringError::Cancelled) => return,
                Err(err) => HandoffState::failed(Some(payment_id), err),
            };

            let done = next.is_final();
            if done {
                info!(method = self.method.name(), payment_id = %payment_id, outcome = next.name(), "Status check finished");
            }
            self.state.publish_from(&token, next);
            if done {
                return;
            }
        }
    }
}
