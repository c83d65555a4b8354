//! Single-object payment process with a listener callback.
//!
//! The process is configured once through one of the `create_*` modes, then
//! started. Every published snapshot is delivered synchronously to the
//! subscribed listener, if any, in publication order. The listener may call
//! back into the process from its callback.

use super::authorize::{Authorization, check_and_authorize, init_payment};
use super::scope::{CancelToken, TaskScope};
use super::state::{FlowState, StateCell};
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{
    DeepLinkKind, PaymentId, PaymentResult, PaymentSource, RejectionRecord, ThreeDsChallenge,
};
use crate::domain::ports::{AcquiringApiRef, ThreeDsDataCollectorRef};
use crate::error::{AcquiringError, Result};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Started,
    Stopped,
    ThreeDsV2Rejected,
    ThreeDsNeeded,
    BrowseSbpBank,
    ChargeRejected,
    Success,
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::ThreeDsV2Rejected => "THREE_DS_V2_REJECTED",
            Self::ThreeDsNeeded => "THREE_DS_NEEDED",
            Self::BrowseSbpBank => "BROWSE_SBP_BANK",
            Self::ChargeRejected => "CHARGE_REJECTED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }
}

/// Data published together with a [`ProcessState`].
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Success(PaymentResult),
    ThreeDsNeeded(ThreeDsChallenge),
    SbpLink(String),
    ChargeRejected(RejectionRecord),
    Error(Arc<AcquiringError>),
}

#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    pub payment_id: Option<PaymentId>,
    pub outcome: Option<ProcessOutcome>,
}

impl ProcessSnapshot {
    fn bare(state: ProcessState, payment_id: Option<PaymentId>) -> Self {
        Self {
            state,
            payment_id,
            outcome: None,
        }
    }

    fn with(state: ProcessState, payment_id: Option<PaymentId>, outcome: ProcessOutcome) -> Self {
        Self {
            state,
            payment_id,
            outcome: Some(outcome),
        }
    }
}

impl FlowState for ProcessSnapshot {
    fn payment_id(&self) -> Option<PaymentId> {
        self.payment_id
    }

    fn is_final(&self) -> bool {
        matches!(self.state, ProcessState::Success | ProcessState::Error)
    }

    fn name(&self) -> &'static str {
        self.state.as_str()
    }
}

/// Receives every snapshot published by a [`PaymentProcess`].
pub trait PaymentListener: Send + Sync {
    fn on_state_changed(&self, snapshot: &ProcessSnapshot);
}

#[derive(Debug, Clone)]
enum ProcessMode {
    Payment {
        source: PaymentSource,
        config: PaymentConfiguration,
    },
    Finish {
        payment_id: PaymentId,
        source: PaymentSource,
        config: PaymentConfiguration,
    },
    Sbp {
        config: PaymentConfiguration,
    },
}

struct ProcessInner {
    api: AcquiringApiRef,
    collector: ThreeDsDataCollectorRef,
    mode: Mutex<Option<ProcessMode>>,
    /// Held across publish and delivery so the listener sees snapshots in
    /// the order they were published.
    listener: ReentrantMutex<RefCell<Option<Arc<dyn PaymentListener>>>>,
    state: StateCell<ProcessSnapshot>,
    scope: TaskScope,
}

/// Generic payment process driven by a construction mode.
#[derive(Clone)]
pub struct PaymentProcess {
    inner: Arc<ProcessInner>,
}

impl PaymentProcess {
    pub fn new(api: AcquiringApiRef, collector: ThreeDsDataCollectorRef) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                api,
                collector,
                mode: Mutex::new(None),
                listener: ReentrantMutex::new(RefCell::new(None)),
                state: StateCell::new(
                    "process",
                    ProcessSnapshot::bare(ProcessState::Created, None),
                ),
                scope: TaskScope::new("process"),
            }),
        }
    }

    pub fn create_payment_process(
        &self,
        source: PaymentSource,
        config: &PaymentConfiguration,
        email: Option<&str>,
    ) -> Result<()> {
        config.validate()?;
        self.set_mode(ProcessMode::Payment {
            source,
            config: config.with_email(email),
        })
    }

    /// Finishes a payment that was already initialized elsewhere.
    pub fn create_finish_process(
        &self,
        payment_id: PaymentId,
        source: PaymentSource,
        config: &PaymentConfiguration,
        email: Option<&str>,
    ) -> Result<()> {
        config.validate()?;
        self.set_mode(ProcessMode::Finish {
            payment_id,
            source,
            config: config.with_email(email),
        })
    }

    pub fn create_sbp_payment_process(&self, config: &PaymentConfiguration) -> Result<()> {
        config.validate()?;
        self.set_mode(ProcessMode::Sbp {
            config: config.clone(),
        })
    }

    fn set_mode(&self, mode: ProcessMode) -> Result<()> {
        let state = self.inner.state.current().state;
        if state != ProcessState::Created || self.inner.state.is_claimed() {
            return Err(AcquiringError::ContractViolation(format!(
                "process already in state {}",
                state.as_str()
            )));
        }
        *self.inner.mode.lock() = Some(mode);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let mode = self.inner.mode.lock().clone().ok_or_else(|| {
            AcquiringError::ContractViolation(
                "start called before a process mode was created".to_string(),
            )
        })?;
        if !self
            .inner
            .state
            .claim(|snapshot| snapshot.state == ProcessState::Created)
        {
            warn!(state = self.inner.state.current().name(), "Payment process already started");
            return Ok(());
        }

        let inner = self.inner.clone();
        self.inner
            .scope
            .spawn(move |token| async move { inner.run(token, mode).await });
        Ok(())
    }

    pub fn state(&self) -> ProcessSnapshot {
        self.inner.state.current()
    }

    /// Latest-value view of the snapshots, independent of the listener.
    pub fn watch(&self) -> watch::Receiver<ProcessSnapshot> {
        self.inner.state.subscribe()
    }

    /// Registers the single listener, replacing any previous one, and replays
    /// the current snapshot to it.
    pub fn subscribe(&self, listener: Arc<dyn PaymentListener>) {
        let slot = self.inner.listener.lock();
        *slot.borrow_mut() = Some(listener.clone());
        let current = self.inner.state.current();
        listener.on_state_changed(&current);
    }

    /// Drops the listener; nothing is delivered afterwards.
    pub fn unsubscribe(&self) {
        self.inner.listener.lock().borrow_mut().take();
    }

    /// Cancels running work, then publishes `STOPPED` with the latest
    /// payment id.
    pub fn stop(&self) {
        self.inner.scope.cancel();
        self.inner.publish_with(None, |current| {
            Some(ProcessSnapshot::bare(ProcessState::Stopped, current.payment_id))
        });
        info!(payment_id = ?self.inner.state.current().payment_id, "Payment process stopped");
    }
}

impl ProcessInner {
    fn publish(&self, token: Option<&CancelToken>, snapshot: ProcessSnapshot) {
        self.publish_with(token, |_| Some(snapshot));
    }

    /// Publishes and, if the snapshot was accepted, notifies the listener.
    fn publish_with<F>(&self, token: Option<&CancelToken>, f: F)
    where
        F: FnOnce(&ProcessSnapshot) -> Option<ProcessSnapshot>,
    {
        let slot = self.listener.lock();
        let published = match token {
            Some(token) => self.state.transition_from(token, f),
            None => self.state.transition(f),
        };
        if !published {
            return;
        }
        let delivered = self.state.current();
        let listener = slot.borrow().clone();
        if let Some(listener) = listener {
            listener.on_state_changed(&delivered);
        }
    }

    async fn run(&self, token: CancelToken, mode: ProcessMode) {
        let mut payment_id = match &mode {
            ProcessMode::Finish { payment_id, .. } => Some(*payment_id),
            _ => None,
        };
        let outcome = self.drive(&token, &mode, &mut payment_id).await;

        let next = match outcome {
            Ok(snapshot) => snapshot,
            Err(AcquiringError::Cancelled) => return,
            Err(AcquiringError::ChargeRejected {
                rejected_payment_id,
                card_id,
            }) => {
                info!(rejected_payment_id = %rejected_payment_id, "Charge rejected");
                ProcessSnapshot::with(
                    ProcessState::ChargeRejected,
                    Some(rejected_payment_id),
                    ProcessOutcome::ChargeRejected(RejectionRecord {
                        rejected_payment_id,
                        card_id,
                    }),
                )
            }
            Err(err) => {
                warn!(payment_id = ?payment_id, error = %err, "Payment process failed");
                ProcessSnapshot::with(
                    ProcessState::Error,
                    payment_id,
                    ProcessOutcome::Error(Arc::new(err)),
                )
            }
        };
        self.publish(Some(&token), next);
    }

    async fn drive(
        &self,
        token: &CancelToken,
        mode: &ProcessMode,
        payment_id: &mut Option<PaymentId>,
    ) -> Result<ProcessSnapshot> {
        match mode {
            ProcessMode::Sbp { config } => {
                let id = self.init(token, config, payment_id).await?;
                let link = token
                    .run(self.api.get_deep_link(id, &DeepLinkKind::Sbp))
                    .await?;
                Ok(ProcessSnapshot::with(
                    ProcessState::BrowseSbpBank,
                    Some(id),
                    ProcessOutcome::SbpLink(link),
                ))
            }
            ProcessMode::Payment { source, config } => {
                if let Some(rebill_id) = source.rebill_id() {
                    return self.charge(token, rebill_id, config, payment_id).await;
                }
                self.authorize(token, None, source, config, payment_id).await
            }
            ProcessMode::Finish {
                payment_id: existing,
                source,
                config,
            } => {
                if let Some(rebill_id) = source.rebill_id() {
                    return self.charge(token, rebill_id, config, payment_id).await;
                }
                self.authorize(token, Some(*existing), source, config, payment_id)
                    .await
            }
        }
    }

    async fn init(
        &self,
        token: &CancelToken,
        config: &PaymentConfiguration,
        payment_id: &mut Option<PaymentId>,
    ) -> Result<PaymentId> {
        let id = init_payment(self.api.as_ref(), token, config).await?;
        *payment_id = Some(id);
        self.publish(
            Some(token),
            ProcessSnapshot::bare(ProcessState::Started, Some(id)),
        );
        Ok(id)
    }

    async fn charge(
        &self,
        token: &CancelToken,
        rebill_id: &str,
        config: &PaymentConfiguration,
        payment_id: &mut Option<PaymentId>,
    ) -> Result<ProcessSnapshot> {
        let id = match *payment_id {
            Some(id) => id,
            None => self.init(token, config, payment_id).await?,
        };
        let response = token.run(self.api.charge(id, rebill_id)).await?;
        let id = response.payment_id.unwrap_or(id);
        Ok(ProcessSnapshot::with(
            ProcessState::Success,
            Some(id),
            ProcessOutcome::Success(PaymentResult {
                payment_id: id,
                card_id: response.card_id,
                rebill_id: Some(rebill_id.to_string()),
            }),
        ))
    }

    /// Card authorization with one downgrade retry when the issuer refuses
    /// 3-D Secure v2.
    async fn authorize(
        &self,
        token: &CancelToken,
        existing: Option<PaymentId>,
        source: &PaymentSource,
        config: &PaymentConfiguration,
        payment_id: &mut Option<PaymentId>,
    ) -> Result<ProcessSnapshot> {
        let mut config = config.clone();
        let mut existing = existing;
        let mut retried = false;
        loop {
            let id = match existing.take() {
                Some(id) => {
                    self.publish(
                        Some(token),
                        ProcessSnapshot::bare(ProcessState::Started, Some(id)),
                    );
                    id
                }
                None => self.init(token, &config, payment_id).await?,
            };
            let outcome = check_and_authorize(
                self.api.as_ref(),
                self.collector.as_ref(),
                token,
                id,
                source,
                &config,
            )
            .await;

            return match outcome {
                Ok(Authorization::Completed(result)) => {
                    info!(payment_id = %result.payment_id, "Payment process succeeded");
                    Ok(ProcessSnapshot::with(
                        ProcessState::Success,
                        Some(result.payment_id),
                        ProcessOutcome::Success(result),
                    ))
                }
                Ok(Authorization::Challenge(challenge)) => Ok(ProcessSnapshot::with(
                    ProcessState::ThreeDsNeeded,
                    Some(challenge.payment_id),
                    ProcessOutcome::ThreeDsNeeded(challenge),
                )),
                Err(AcquiringError::ThreeDsV2Unsupported) if !retried => {
                    info!(payment_id = %id, "3DS v2 rejected, retrying with v1");
                    self.publish(
                        Some(token),
                        ProcessSnapshot::bare(ProcessState::ThreeDsV2Rejected, Some(id)),
                    );
                    retried = true;
                    config = config.with_three_ds_fallback();
                    continue;
                }
                Err(err) => Err(err),
            };
        }
    }
}
