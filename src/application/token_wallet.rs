//! Payment by an opaque wallet token.
//!
//! The token is sent as the card source of finish-authorize. A declined
//! token moves the flow to `ReauthNeeded`, from where the host supplies a
//! new token.

use super::authorize::{Authorization, finish_authorize, init_payment};
use super::scope::{CancelToken, TaskScope};
use super::state::{FlowState, StateCell};
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{
    PaymentId, PaymentResult, PaymentSource, RejectionRecord, ThreeDsChallenge,
};
use crate::domain::ports::AcquiringApiRef;
use crate::error::{AcquiringError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Published states of a [`TokenWalletFlow`].
#[derive(Debug, Clone)]
pub enum TokenWalletState {
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
    /// The issuer declined the token; a fresh token is needed.
    ReauthNeeded {
        config: Arc<PaymentConfiguration>,
        rejection: RejectionRecord,
    },
    Success(PaymentResult),
    Error {
        error: Arc<AcquiringError>,
        payment_id: Option<PaymentId>,
    },
}

impl FlowState for TokenWalletState {
    fn payment_id(&self) -> Option<PaymentId> {
        match self {
            Self::Created => None,
            Self::Started { payment_id } | Self::ThreeDsInProcess { payment_id } => {
                Some(*payment_id)
            }
            Self::ThreeDsUiNeeded { challenge } => Some(challenge.payment_id),
            Self::ReauthNeeded { rejection, .. } => Some(rejection.rejected_payment_id),
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
            Self::ReauthNeeded { .. } => "reauth_needed",
            Self::Success(_) => "success",
            Self::Error { .. } => "error",
        }
    }
}

struct TokenWalletInner {
    api: AcquiringApiRef,
    config: PaymentConfiguration,
    wallet_token: parking_lot::Mutex<String>,
    state: StateCell<TokenWalletState>,
    scope: TaskScope,
}

/// Payment with an opaque wallet token used directly as the card source.
#[derive(Clone)]
pub struct TokenWalletFlow {
    inner: Arc<TokenWalletInner>,
}

impl TokenWalletFlow {
    /// Validates `config` and stores it with the first wallet token.
    pub fn create(
        api: AcquiringApiRef,
        config: &PaymentConfiguration,
        wallet_token: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(TokenWalletInner {
                api,
                config: config.clone(),
                wallet_token: parking_lot::Mutex::new(wallet_token.into()),
                state: StateCell::new("token_wallet", TokenWalletState::Created),
                scope: TaskScope::new("token_wallet"),
            }),
        })
    }

    /// Latest published state.
    pub fn state(&self) -> TokenWalletState {
        self.inner.state.current()
    }

    /// Receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<TokenWalletState> {
        self.inner.state.subscribe()
    }

    /// Runs init (unless `payment_id` is given) then finish-authorize.
    ///
    /// Only the first call from `Created` runs a payment.
    pub fn start(&self, payment_id: Option<PaymentId>) {
        if !self
            .inner
            .state
            .claim(|state| matches!(state, TokenWalletState::Created))
        {
            warn!(state = self.inner.state.current().name(), "Token wallet payment already started");
            return;
        }
        info!(order_id = %self.inner.config.order.order_id, "Starting token wallet payment");
        let inner = self.inner.clone();
        let config = self.inner.config.clone();
        self.inner
            .scope
            .spawn(move |token| async move { inner.run(token, config, payment_id).await });
    }

    /// Retries a declined payment with a new wallet token.
    ///
    /// Valid only from `ReauthNeeded`; a repeated call while the retry is
    /// running is ignored and keeps the token of the first call.
    pub fn reauthorize(&self, wallet_token: impl Into<String>) -> Result<()> {
        let mut declined = None;
        let claimed = self.inner.state.claim(|state| match state {
            TokenWalletState::ReauthNeeded { config, rejection } => {
                declined = Some(config.with_retry_markers(rejection));
                true
            }
            _ => false,
        });
        let config = match declined {
            Some(config) if claimed => config,
            _ => {
                return match self.inner.state.current() {
                    TokenWalletState::ReauthNeeded { .. } => {
                        warn!("Token wallet re-authorization already running");
                        Ok(())
                    }
                    other => Err(AcquiringError::ContractViolation(format!(
                        "reauthorize called in state {}",
                        other.name()
                    ))),
                };
            }
        };
        *self.inner.wallet_token.lock() = wallet_token.into();
        info!(order_id = %config.order.order_id, "Re-authorizing token wallet payment");

        let inner = self.inner.clone();
        self.inner
            .scope
            .spawn(move |token| async move { inner.run(token, config, None).await });
        Ok(())
    }

    /// Records that the host is presenting the challenge.
    pub fn go_to_3ds(&self) {
        self.inner.state.transition(|state| match state {
            TokenWalletState::ThreeDsUiNeeded { challenge } => {
                Some(TokenWalletState::ThreeDsInProcess {
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
                TokenWalletState::ThreeDsUiNeeded { challenge } => challenge.payment_id,
                TokenWalletState::ThreeDsInProcess { payment_id } => *payment_id,
                _ => return None,
            };
            Some(match result {
                Ok(outcome) => TokenWalletState::Success(outcome),
                Err(error) => TokenWalletState::Error {
                    error: Arc::new(error),
                    payment_id: Some(payment_id),
                },
            })
        });
    }

    /// Cancels in-flight work. Published states stay as they are.
    pub fn stop(&self) {
        info!(payment_id = ?self.inner.state.current().payment_id(), "Stopping token wallet payment");
        self.inner.scope.cancel();
    }
}

impl TokenWalletInner {
    async fn run(
        &self,
        token: CancelToken,
        config: PaymentConfiguration,
        existing: Option<PaymentId>,
    ) {
        let source = PaymentSource::WalletToken {
            token: self.wallet_token.lock().clone(),
        };
        let mut payment_id = existing;
        let outcome: Result<Authorization> = async {
            let id = match existing {
                Some(id) => id,
                None => init_payment(self.api.as_ref(), &token, &config).await?,
            };
            payment_id = Some(id);
            self.state
                .publish_from(&token, TokenWalletState::Started { payment_id: id });
            finish_authorize(self.api.as_ref(), &token, id, &source, &config, None).await
        }
        .await;

        let next = match outcome {
            Ok(Authorization::Completed(result)) => {
                info!(payment_id = %result.payment_id, "Token wallet payment succeeded");
                TokenWalletState::Success(result)
            }
            Ok(Authorization::Challenge(challenge)) => {
                TokenWalletState::ThreeDsUiNeeded { challenge }
            }
            Err(AcquiringError::Cancelled) => return,
            Err(AcquiringError::ChargeRejected {
                rejected_payment_id,
                card_id,
            }) => {
                info!(rejected_payment_id = %rejected_payment_id, "Token declined, re-authorization needed");
                TokenWalletState::ReauthNeeded {
                    config: Arc::new(config),
                    rejection: RejectionRecord {
                        rejected_payment_id,
                        card_id,
                    },
                }
            }
            Err(err) => {
                warn!(payment_id = ?payment_id, error = %err, "Token wallet payment failed");
                TokenWalletState::Error {
                    error: Arc::new(err),
                    payment_id,
                }
            }
        };
        self.state.publish_from(&token, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::configuration::{DATA_KEY_FAIL_SESSION, DATA_KEY_RECURRING_TYPE};
    use crate::domain::payment::{FinishAuthorizeResponse, ResponseStatus};
    use crate::infrastructure::in_memory::{ScriptedAcquiringApi, ScriptedFailure};
    use std::time::Duration;

    async fn wait_for<F>(flow: &TokenWalletFlow, done: F) -> TokenWalletState
    where
        F: Fn(&TokenWalletState) -> bool,
    {
        let mut rx = flow.subscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let state = rx.borrow_and_update().clone();
                if done(&state) {
                    return state;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_token_is_sent_as_source() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.script_payment_id(7);
        let flow =
            TokenWalletFlow::create(api.clone(), &crate::test_support::configuration(), "tok-1")
                .unwrap();
        flow.start(None);

        let state = wait_for(&flow, FlowState::is_final).await;
        assert!(matches!(state, TokenWalletState::Success(ref r) if r.payment_id == PaymentId(7)));
        assert_eq!(api.calls("check_3ds_version"), 0);
        assert_eq!(api.calls("finish_authorize"), 1);
    }

    #[tokio::test]
    async fn test_decline_then_reauthorize_with_markers() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.script_payment_id(10);
        api.script_finish_authorize(Err(ScriptedFailure::Api {
            code: "104".into(),
            message: "declined".into(),
            payment_id: Some(PaymentId(10)),
            card_id: None,
        }));
        let flow =
            TokenWalletFlow::create(api.clone(), &crate::test_support::configuration(), "tok-1")
                .unwrap();
        flow.start(None);

        let declined = wait_for(&flow, |s| matches!(s, TokenWalletState::ReauthNeeded { .. })).await;
        match declined {
            TokenWalletState::ReauthNeeded { rejection, .. } => {
                assert_eq!(rejection.rejected_payment_id, PaymentId(10))
            }
            other => panic!("unexpected state {other:?}"),
        }

        api.script_payment_id(11);
        api.script_finish_authorize(Ok(FinishAuthorizeResponse {
            payment_id: Some(PaymentId(11)),
            card_id: None,
            rebill_id: None,
            status: Some(ResponseStatus::Confirmed),
            three_ds: None,
        }));
        flow.reauthorize("tok-2").unwrap();
        let state = wait_for(&flow, FlowState::is_final).await;
        assert!(matches!(state, TokenWalletState::Success(ref r) if r.payment_id == PaymentId(11)));

        let retried = api.init_requests().pop().unwrap();
        let data = &retried.order.additional_data;
        assert_eq!(data.get(DATA_KEY_FAIL_SESSION).map(String::as_str), Some("10"));
        assert_eq!(data.get(DATA_KEY_RECURRING_TYPE).map(String::as_str), Some("12"));
    }

    fn declined(payment_id: i64) -> ScriptedFailure {
        ScriptedFailure::Api {
            code: "104".into(),
            message: "declined".into(),
            payment_id: Some(PaymentId(payment_id)),
            card_id: None,
        }
    }

    #[tokio::test]
    async fn test_repeated_start_runs_once() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.set_latency(Duration::from_millis(20));
        let flow =
            TokenWalletFlow::create(api.clone(), &crate::test_support::configuration(), "tok-1")
                .unwrap();
        flow.start(None);
        flow.start(None);

        let state = wait_for(&flow, FlowState::is_final).await;
        assert!(matches!(state, TokenWalletState::Success(ref r) if r.payment_id == PaymentId(1)));
        assert_eq!(api.calls("init"), 1);
        assert_eq!(api.calls("finish_authorize"), 1);
    }

    #[tokio::test]
    async fn test_repeated_reauthorize_keeps_first_token() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.script_finish_authorize(Err(declined(1)));
        let flow =
            TokenWalletFlow::create(api.clone(), &crate::test_support::configuration(), "tok-1")
                .unwrap();
        flow.start(None);
        wait_for(&flow, |s| matches!(s, TokenWalletState::ReauthNeeded { .. })).await;

        api.set_latency(Duration::from_millis(20));
        flow.reauthorize("tok-2").unwrap();
        flow.reauthorize("tok-3").unwrap();
        let state = wait_for(&flow, FlowState::is_final).await;

        assert!(matches!(state, TokenWalletState::Success(ref r) if r.payment_id == PaymentId(2)));
        assert_eq!(api.calls("init"), 2);
        assert_eq!(api.calls("finish_authorize"), 2);
        assert_eq!(*flow.inner.wallet_token.lock(), "tok-2");
    }

    #[tokio::test]
    async fn test_challenge_then_result() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.script_payment_id(8);
        api.script_finish_authorize(Ok(FinishAuthorizeResponse {
            payment_id: Some(PaymentId(8)),
            card_id: None,
            rebill_id: None,
            status: Some(ResponseStatus::ThreeDsChecking),
            three_ds: Some(ThreeDsChallenge {
                payment_id: PaymentId(8),
                acs_url: "https://acs.example/challenge".into(),
                version: "2.1.0".into(),
                tds_server_trans_id: None,
                acs_trans_id: None,
                pa_req: None,
                md: None,
            }),
        }));
        let flow =
            TokenWalletFlow::create(api.clone(), &crate::test_support::configuration(), "tok-1")
                .unwrap();
        flow.start(None);

        let needed = wait_for(&flow, |s| matches!(s, TokenWalletState::ThreeDsUiNeeded { .. })).await;
        assert_eq!(needed.payment_id(), Some(PaymentId(8)));
        flow.go_to_3ds();
        assert!(matches!(
            flow.state(),
            TokenWalletState::ThreeDsInProcess { payment_id: PaymentId(8) }
        ));

        flow.set_3ds_result(Err(AcquiringError::ThreeDsFailed("cancelled by user".into())));
        flow.set_3ds_result(Ok(PaymentResult {
            payment_id: PaymentId(8),
            card_id: None,
            rebill_id: None,
        }));
        assert!(matches!(
            flow.state(),
            TokenWalletState::Error { payment_id: Some(PaymentId(8)), ref error }
                if matches!(**error, AcquiringError::ThreeDsFailed(_))
        ));
        assert_eq!(api.calls("finish_authorize"), 1);
    }

    #[tokio::test]
    async fn test_stop_drops_running_authorization() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.set_latency(Duration::from_millis(30));
        let flow =
            TokenWalletFlow::create(api.clone(), &crate::test_support::configuration(), "tok-1")
                .unwrap();
        let mut rx = flow.subscribe();
        flow.start(None);
        wait_for(&flow, |s| matches!(s, TokenWalletState::Started { .. })).await;
        let _ = rx.borrow_and_update();

        flow.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!rx.has_changed().unwrap());
        assert!(matches!(flow.state(), TokenWalletState::Started { payment_id: PaymentId(1) }));
        flow.start(None);
        assert_eq!(api.calls("init"), 1);
    }

    #[tokio::test]
    async fn test_reauthorize_outside_decline_is_rejected() {
        let api = Arc::new(ScriptedAcquiringApi::new());
        let flow =
            TokenWalletFlow::create(api, &crate::test_support::configuration(), "tok").unwrap();
        assert!(flow.reauthorize("tok-2").unwrap_err().is_contract_violation());
    }
}
